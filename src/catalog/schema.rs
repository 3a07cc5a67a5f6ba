use crate::catalog::types::NcType;
use crate::error::{CdfError, ObjectKind};
use serde::{Deserialize, Serialize};

pub const FILL_VALUE_ATTR: &str = "_FillValue";
pub const MAX_NAME_LEN: usize = 256;

/// `begin` of a variable that has not been given a byte range yet.
/// Offset zero always belongs to the header, so it never names real data.
pub const UNPLACED: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimId(pub usize);

/// Identity of a variable that survives renames and redefinition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    /// `None` for the unlimited (record) dimension.
    pub size: Option<u64>,
}

impl Dimension {
    pub fn is_unlimited(&self) -> bool {
        self.size.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub nc_type: NcType,
    /// Big-endian encoded values, unpadded.
    pub values: Vec<u8>,
}

impl Attribute {
    pub fn new(
        name: impl Into<String>,
        nc_type: NcType,
        values: Vec<u8>,
    ) -> Result<Self, CdfError> {
        let name = name.into();
        validate_name(&name)?;
        if values.len() as u64 % nc_type.size() != 0 {
            return Err(CdfError::InvalidArgument(format!(
                "attribute '{name}' holds {} bytes, not a whole number of {nc_type} values",
                values.len()
            )));
        }
        Ok(Self {
            name,
            nc_type,
            values,
        })
    }

    pub fn text(name: impl Into<String>, value: &str) -> Result<Self, CdfError> {
        Self::new(name, NcType::Char, value.as_bytes().to_vec())
    }

    pub fn shorts(name: impl Into<String>, values: &[i16]) -> Result<Self, CdfError> {
        Self::new(name, NcType::Short, values.iter().flat_map(|v| v.to_be_bytes()).collect())
    }

    pub fn ints(name: impl Into<String>, values: &[i32]) -> Result<Self, CdfError> {
        Self::new(name, NcType::Int, values.iter().flat_map(|v| v.to_be_bytes()).collect())
    }

    pub fn floats(name: impl Into<String>, values: &[f32]) -> Result<Self, CdfError> {
        Self::new(name, NcType::Float, values.iter().flat_map(|v| v.to_be_bytes()).collect())
    }

    pub fn doubles(name: impl Into<String>, values: &[f64]) -> Result<Self, CdfError> {
        Self::new(name, NcType::Double, values.iter().flat_map(|v| v.to_be_bytes()).collect())
    }

    pub fn len(&self) -> usize {
        self.values.len() / self.nc_type.size() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub(crate) id: VarId,
    pub(crate) name: String,
    pub(crate) nc_type: NcType,
    pub(crate) dims: Vec<DimId>,
    pub(crate) attributes: Vec<Attribute>,
    pub(crate) is_record: bool,
    /// Unpadded bytes of one fixed instance, or of one record's slice.
    pub(crate) instance_bytes: u64,
    /// `instance_bytes` padded to the 4-byte boundary.
    pub(crate) len: u64,
    pub(crate) begin: u64,
}

impl Variable {
    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nc_type(&self) -> NcType {
        self.nc_type
    }

    pub fn dims(&self) -> &[DimId] {
        &self.dims
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn is_record(&self) -> bool {
        self.is_record
    }

    pub fn instance_bytes(&self) -> u64 {
        self.instance_bytes
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn is_placed(&self) -> bool {
        self.begin != UNPLACED
    }

    /// One element's worth of fill bytes.
    ///
    /// A `_FillValue` attribute overrides the type default when it holds
    /// exactly one value of the variable's own type.
    pub fn fill_pattern(&self) -> Vec<u8> {
        match self.attribute(FILL_VALUE_ATTR) {
            Some(attr) if attr.nc_type == self.nc_type && attr.len() == 1 => attr.values.clone(),
            _ => self.nc_type.default_fill(),
        }
    }

    /// Two variables hold byte-compatible data when their element type and
    /// instance shape agree.
    pub(crate) fn same_storage(&self, other: &Variable) -> bool {
        self.nc_type == other.nc_type
            && self.is_record == other.is_record
            && self.instance_bytes == other.instance_bytes
    }
}

/// Dimensions, global attributes and variables of one file, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    dims: Vec<Dimension>,
    attributes: Vec<Attribute>,
    vars: Vec<Variable>,
    next_var_id: u32,
}

pub(crate) fn validate_name(name: &str) -> Result<(), CdfError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('\0') {
        return Err(CdfError::InvalidArgument(format!("bad name '{name}'")));
    }
    Ok(())
}

impl Schema {
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn dimension(&self, id: DimId) -> Option<&Dimension> {
        self.dims.get(id.0)
    }

    pub fn dimension_id(&self, name: &str) -> Option<DimId> {
        self.dims.iter().position(|d| d.name == name).map(DimId)
    }

    pub fn unlimited(&self) -> Option<DimId> {
        self.dims.iter().position(Dimension::is_unlimited).map(DimId)
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn variables(&self) -> &[Variable] {
        &self.vars
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.name == name)
    }

    pub fn variable_by_id(&self, id: VarId) -> Option<(usize, &Variable)> {
        self.vars.iter().enumerate().find(|(_, v)| v.id == id)
    }

    pub fn record_variable_count(&self) -> usize {
        self.vars.iter().filter(|v| v.is_record).count()
    }

    pub fn add_dimension(&mut self, name: &str, size: Option<u64>) -> Result<DimId, CdfError> {
        validate_name(name)?;
        if self.dimension_id(name).is_some() {
            return Err(CdfError::NameInUse {
                kind: ObjectKind::Dimension,
                name: name.into(),
            });
        }
        match size {
            Some(0) => {
                return Err(CdfError::InvalidArgument(format!(
                    "dimension '{name}' must have a positive size"
                )));
            }
            None => {
                if let Some(existing) = self.unlimited() {
                    return Err(CdfError::UnlimitedInUse {
                        existing: self.dims[existing.0].name.clone(),
                    });
                }
            }
            Some(_) => {}
        }
        self.dims.push(Dimension {
            name: name.into(),
            size,
        });
        Ok(DimId(self.dims.len() - 1))
    }

    pub fn add_variable(
        &mut self,
        name: &str,
        nc_type: NcType,
        dim_names: &[&str],
    ) -> Result<usize, CdfError> {
        validate_name(name)?;
        if self.variable(name).is_some() {
            return Err(CdfError::NameInUse {
                kind: ObjectKind::Variable,
                name: name.into(),
            });
        }
        let dims = dim_names
            .iter()
            .map(|d| {
                self.dimension_id(d).ok_or_else(|| CdfError::NotFound {
                    kind: ObjectKind::Dimension,
                    name: (*d).into(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let id = VarId(self.next_var_id);
        let var = self.shape_variable(id, name.into(), nc_type, dims, Vec::new(), UNPLACED)?;
        self.next_var_id += 1;
        self.vars.push(var);
        Ok(self.vars.len() - 1)
    }

    pub fn remove_variable(&mut self, name: &str) -> Result<Variable, CdfError> {
        let idx = self.variable_index(name).ok_or_else(|| CdfError::NotFound {
            kind: ObjectKind::Variable,
            name: name.into(),
        })?;
        Ok(self.vars.remove(idx))
    }

    pub fn rename_variable(&mut self, from: &str, to: &str) -> Result<(), CdfError> {
        validate_name(to)?;
        if self.variable(to).is_some() {
            return Err(CdfError::NameInUse {
                kind: ObjectKind::Variable,
                name: to.into(),
            });
        }
        let idx = self.variable_index(from).ok_or_else(|| CdfError::NotFound {
            kind: ObjectKind::Variable,
            name: from.into(),
        })?;
        self.vars[idx].name = to.into();
        Ok(())
    }

    /// Add or replace an attribute, globally when `variable` is `None`.
    pub fn put_attribute(
        &mut self,
        variable: Option<&str>,
        attr: Attribute,
    ) -> Result<(), CdfError> {
        let list = match variable {
            None => &mut self.attributes,
            Some(name) => {
                let idx = self.variable_index(name).ok_or_else(|| CdfError::NotFound {
                    kind: ObjectKind::Variable,
                    name: name.into(),
                })?;
                &mut self.vars[idx].attributes
            }
        };
        match list.iter_mut().find(|a| a.name == attr.name) {
            Some(existing) => *existing = attr,
            None => list.push(attr),
        }
        Ok(())
    }

    pub fn delete_attribute(&mut self, variable: Option<&str>, name: &str) -> Result<(), CdfError> {
        let list = match variable {
            None => &mut self.attributes,
            Some(var) => {
                let idx = self.variable_index(var).ok_or_else(|| CdfError::NotFound {
                    kind: ObjectKind::Variable,
                    name: var.into(),
                })?;
                &mut self.vars[idx].attributes
            }
        };
        let before = list.len();
        list.retain(|a| a.name != name);
        if list.len() == before {
            return Err(CdfError::NotFound {
                kind: ObjectKind::Attribute,
                name: name.into(),
            });
        }
        Ok(())
    }

    pub(crate) fn set_begin(&mut self, idx: usize, begin: u64) {
        self.vars[idx].begin = begin;
    }

    /// Rebuild a schema from decoded parts. Variable ids follow declaration order.
    pub(crate) fn from_parts(
        dims: Vec<Dimension>,
        attributes: Vec<Attribute>,
        raw_vars: Vec<RawVariable>,
    ) -> Result<Self, CdfError> {
        let mut schema = Schema {
            dims,
            attributes,
            vars: Vec::with_capacity(raw_vars.len()),
            next_var_id: 0,
        };
        for raw in raw_vars {
            if raw.dims.iter().any(|d| d.0 >= schema.dims.len()) {
                return Err(CdfError::CodecFault(format!(
                    "variable '{}' references an unknown dimension",
                    raw.name
                )));
            }
            let id = VarId(schema.next_var_id);
            let var = schema.shape_variable(
                id,
                raw.name,
                raw.nc_type,
                raw.dims,
                raw.attributes,
                raw.begin,
            )?;
            if var.len != raw.len {
                return Err(CdfError::CodecFault(format!(
                    "variable '{}' length {} disagrees with its shape ({})",
                    var.name, raw.len, var.len
                )));
            }
            schema.next_var_id += 1;
            schema.vars.push(var);
        }
        Ok(schema)
    }

    fn shape_variable(
        &self,
        id: VarId,
        name: String,
        nc_type: NcType,
        dims: Vec<DimId>,
        attributes: Vec<Attribute>,
        begin: u64,
    ) -> Result<Variable, CdfError> {
        let mut elements: u64 = 1;
        let mut is_record = false;
        for (pos, dim_id) in dims.iter().enumerate() {
            let dim = &self.dims[dim_id.0];
            match dim.size {
                None if pos == 0 => is_record = true,
                None => {
                    return Err(CdfError::InvalidArgument(format!(
                        "variable '{name}': unlimited dimension '{}' must be outermost",
                        dim.name
                    )));
                }
                Some(size) => {
                    elements = elements.checked_mul(size).ok_or_else(|| {
                        CdfError::InvalidArgument(format!("variable '{name}' is too large"))
                    })?;
                }
            }
        }
        let instance_bytes = elements
            .checked_mul(nc_type.size())
            .ok_or_else(|| CdfError::InvalidArgument(format!("variable '{name}' is too large")))?;
        let len = instance_bytes
            .checked_next_multiple_of(4)
            .ok_or_else(|| CdfError::InvalidArgument(format!("variable '{name}' is too large")))?;
        Ok(Variable {
            id,
            name,
            nc_type,
            dims,
            attributes,
            is_record,
            instance_bytes,
            len,
            begin,
        })
    }
}

/// Variable fields as they appear on disk, before shapes are recomputed.
#[derive(Debug, Clone)]
pub(crate) struct RawVariable {
    pub name: String,
    pub nc_type: NcType,
    pub dims: Vec<DimId>,
    pub attributes: Vec<Attribute>,
    pub len: u64,
    pub begin: u64,
}
