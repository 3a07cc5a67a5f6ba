use crate::catalog::{Schema, Variable};
use crate::codec::{CodecGateway, EncodedStream, FileKind, Header, MAX_RECORDS};
use crate::error::{CdfError, ObjectKind};
use crate::layout::{self, Layout};
use crate::table::FileId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

bitflags! {
    /// Per-handle mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HandleFlags: u8 {
        const WRITE = 1 << 0;
        const NO_FILL = 1 << 1;
        /// Header must be rewritten before the handle goes away.
        const HEADER_DIRTY = 1 << 2;
        /// Only the record counter must be rewritten.
        const NUMRECS_DIRTY = 1 << 3;
    }
}

bitflags! {
    /// Flags accepted by `Session::create` and `Session::open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u8 {
        const WRITE = 1 << 0;
        const CREATE = 1 << 1;
        /// With `CREATE`, fail if the path already exists.
        const NOCLOBBER = 1 << 2;
        /// With `CREATE`, lay the file out as a container with an in-place header.
        const CONTAINER = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    Fill,
    NoFill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefineOrigin {
    /// Freshly created file, nothing on disk beyond an empty header.
    Create,
    /// Flat file redefined through a shadow copy.
    Redefine,
    /// Container file whose header grows in place.
    InPlace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefineState {
    Normal,
    Defining(DefineOrigin),
    Committing,
    Aborting,
}

/// One open file: its schema, layout bookkeeping and the stream it owns.
#[derive(Debug)]
pub struct Handle {
    pub(crate) path: PathBuf,
    pub(crate) flags: HandleFlags,
    pub(crate) kind: FileKind,
    pub(crate) state: DefineState,
    pub(crate) schema: Schema,
    /// Schema as of `enter_define` on a container file, restored on abort.
    pub(crate) saved_schema: Option<Schema>,
    pub(crate) record_size: u64,
    pub(crate) begin_record_region: u64,
    pub(crate) num_records: u64,
    pub(crate) partner: Option<FileId>,
    pub(crate) stream: EncodedStream,
}

impl Handle {
    pub(crate) fn created(path: PathBuf, stream: EncodedStream, kind: FileKind) -> Self {
        Self {
            path,
            flags: HandleFlags::WRITE,
            kind,
            state: DefineState::Defining(DefineOrigin::Create),
            schema: Schema::default(),
            saved_schema: None,
            record_size: 0,
            begin_record_region: 0,
            num_records: 0,
            partner: None,
            stream,
        }
    }

    pub(crate) fn from_header(
        path: PathBuf,
        stream: EncodedStream,
        header: Header,
        writable: bool,
    ) -> Self {
        let mut handle = Self {
            path,
            flags: HandleFlags::empty(),
            kind: header.kind,
            state: DefineState::Normal,
            schema: Schema::default(),
            saved_schema: None,
            record_size: 0,
            begin_record_region: 0,
            num_records: 0,
            partner: None,
            stream,
        };
        handle.flags.set(HandleFlags::WRITE, writable);
        handle.adopt_header(header);
        handle
    }

    /// Shadow for a flat-file redefinition: same schema and fill policy, fresh stream.
    pub(crate) fn shadow(&self, path: PathBuf, stream: EncodedStream, stash: FileId) -> Self {
        Self {
            path,
            flags: self.flags & (HandleFlags::WRITE | HandleFlags::NO_FILL),
            kind: self.kind,
            state: DefineState::Defining(DefineOrigin::Redefine),
            schema: self.schema.clone(),
            saved_schema: None,
            record_size: self.record_size,
            begin_record_region: self.begin_record_region,
            num_records: 0,
            partner: Some(stash),
            stream,
        }
    }

    fn adopt_header(&mut self, header: Header) {
        self.record_size = layout::record_size_of(header.schema.variables());
        self.begin_record_region =
            layout::begin_record_region_of(header.schema.variables(), header.encoded_len);
        self.num_records = header.num_records;
        self.schema = header.schema;
    }

    /// Install freshly computed offsets. The record count starts over at zero.
    pub(crate) fn apply_layout(&mut self, schema: Schema, layout: &Layout) {
        self.schema = schema;
        self.record_size = layout.record_size;
        self.begin_record_region = layout.begin_record_region;
        self.num_records = 0;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn state(&self) -> DefineState {
        self.state
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    pub fn partner(&self) -> Option<FileId> {
        self.partner
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(HandleFlags::WRITE)
    }

    pub fn is_defining(&self) -> bool {
        matches!(self.state, DefineState::Defining(_))
    }

    pub fn fill_mode(&self) -> FillMode {
        if self.flags.contains(HandleFlags::NO_FILL) {
            FillMode::NoFill
        } else {
            FillMode::Fill
        }
    }

    /// An original parked under a spare id while its shadow is being defined.
    pub(crate) fn is_stashed(&self) -> bool {
        self.state == DefineState::Normal && self.partner.is_some()
    }

    /// First byte past the last fixed variable or record.
    pub(crate) fn data_end(&self) -> u64 {
        let fixed_end = self
            .schema
            .variables()
            .iter()
            .filter(|v| !v.is_record() && v.is_placed())
            .map(|v| v.begin().saturating_add(v.len()))
            .max()
            .unwrap_or(0);
        let record_end = self
            .num_records
            .saturating_mul(self.record_size)
            .saturating_add(self.begin_record_region);
        if self.schema.record_variable_count() == 0 {
            fixed_end
        } else {
            fixed_end.max(record_end)
        }
    }

    pub(crate) fn write_header(&mut self, codec: &dyn CodecGateway) -> Result<(), CdfError> {
        let bytes = codec.encode_header(self.kind, &self.schema, self.num_records)?;
        self.stream.seek(0)?;
        self.stream.write_all(&bytes)
    }

    /// Write whatever metadata is pending. Read-only handles have nothing to flush.
    pub(crate) fn flush_metadata(&mut self, codec: &dyn CodecGateway) -> Result<(), CdfError> {
        if !self.is_writable() {
            return Ok(());
        }
        if self.flags.contains(HandleFlags::HEADER_DIRTY) {
            self.write_header(codec)?;
            self.flags
                .remove(HandleFlags::HEADER_DIRTY | HandleFlags::NUMRECS_DIRTY);
        } else if self.flags.contains(HandleFlags::NUMRECS_DIRTY) {
            codec.write_num_records(&mut self.stream, self.num_records)?;
            self.flags.remove(HandleFlags::NUMRECS_DIRTY);
        }
        Ok(())
    }

    /// Re-read the header from disk, picking up changes made by other writers.
    pub(crate) fn refresh(&mut self, codec: &dyn CodecGateway) -> Result<(), CdfError> {
        let header = codec.decode_header(&mut self.stream)?;
        self.kind = header.kind;
        self.adopt_header(header);
        Ok(())
    }

    pub(crate) fn variable(&self, name: &str) -> Result<(usize, &Variable), CdfError> {
        let idx = self
            .schema
            .variable_index(name)
            .ok_or_else(|| CdfError::NotFound {
                kind: ObjectKind::Variable,
                name: name.into(),
            })?;
        Ok((idx, &self.schema.variables()[idx]))
    }

    fn fixed_variable(&self, name: &str) -> Result<Variable, CdfError> {
        let (_, var) = self.variable(name)?;
        if var.is_record() {
            return Err(CdfError::InvalidArgument(format!(
                "'{name}' is a record variable"
            )));
        }
        if !var.is_placed() {
            return Err(CdfError::AlreadyInDefineMode {
                path: self.path.clone(),
            });
        }
        Ok(var.clone())
    }

    fn record_variable(&self, name: &str) -> Result<Variable, CdfError> {
        let (_, var) = self.variable(name)?;
        if !var.is_record() {
            return Err(CdfError::InvalidArgument(format!(
                "'{name}' is not a record variable"
            )));
        }
        Ok(var.clone())
    }

    /// Byte offset of `record` of `var`.
    fn record_offset(var: &Variable, record_size: u64, record: u64) -> Result<u64, CdfError> {
        record_size
            .checked_mul(record)
            .and_then(|skip| skip.checked_add(var.begin()))
            .ok_or_else(|| {
                CdfError::InvalidArgument(format!(
                    "record {record} of '{}' lies past the largest file offset",
                    var.name()
                ))
            })
    }

    fn check_payload(var: &Variable, data: &[u8]) -> Result<(), CdfError> {
        if data.len() as u64 != var.instance_bytes() {
            return Err(CdfError::InvalidArgument(format!(
                "'{}' holds {} bytes, got {}",
                var.name(),
                var.instance_bytes(),
                data.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn read_variable(&mut self, name: &str) -> Result<Vec<u8>, CdfError> {
        let var = self.fixed_variable(name)?;
        let mut buf = vec![0u8; var.instance_bytes() as usize];
        self.stream.seek(var.begin())?;
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn write_variable(&mut self, name: &str, data: &[u8]) -> Result<(), CdfError> {
        let var = self.fixed_variable(name)?;
        Self::check_payload(&var, data)?;
        self.stream.seek(var.begin())?;
        self.stream.write_all(data)
    }

    pub(crate) fn read_record(&mut self, name: &str, record: u64) -> Result<Vec<u8>, CdfError> {
        let var = self.record_variable(name)?;
        if record >= self.num_records {
            return Err(CdfError::InvalidArgument(format!(
                "record {record} is past the last record ({})",
                self.num_records
            )));
        }
        let offset = Self::record_offset(&var, self.record_size, record)?;
        let mut buf = vec![0u8; var.instance_bytes() as usize];
        self.stream.seek(offset)?;
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write one record of `name`. Records between the current end and
    /// `record` are filled first unless the handle is in no-fill mode.
    pub(crate) fn write_record(
        &mut self,
        codec: &dyn CodecGateway,
        name: &str,
        record: u64,
        data: &[u8],
    ) -> Result<(), CdfError> {
        let var = self.record_variable(name)?;
        Self::check_payload(&var, data)?;
        if record >= MAX_RECORDS {
            return Err(CdfError::InvalidArgument(format!(
                "record {record} exceeds the {MAX_RECORDS} record limit"
            )));
        }
        let offset = Self::record_offset(&var, self.record_size, record)?;
        if record >= self.num_records {
            if self.fill_mode() == FillMode::Fill {
                for fresh in self.num_records..=record {
                    self.fill_record(codec, fresh)?;
                }
            }
            self.num_records = record + 1;
            self.flags.insert(HandleFlags::NUMRECS_DIRTY);
        }
        self.stream.seek(offset)?;
        self.stream.write_all(data)
    }

    fn fill_record(&mut self, codec: &dyn CodecGateway, record: u64) -> Result<(), CdfError> {
        let Handle {
            schema,
            stream,
            record_size,
            ..
        } = self;
        for var in schema.variables().iter().filter(|v| v.is_record()) {
            stream.seek(Self::record_offset(var, *record_size, record)?)?;
            codec.write_fill(stream, var, layout::record_span(var, *record_size))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DefineOrigin, DefineState, FillMode, Handle, HandleFlags};
    use crate::catalog::NcType;
    use crate::codec::{ClassicCodec, CodecGateway, EncodedStream, FileKind};
    use crate::layout::compute_layout;
    use tempfile::tempdir;

    fn laid_out(dir: &std::path::Path, codec: &ClassicCodec) -> Handle {
        let path = dir.join("h.cdf");
        let stream = EncodedStream::create(&path, true).expect("create");
        let mut handle = Handle::created(path, stream, FileKind::Flat);
        let mut schema = handle.schema.clone();
        schema.add_dimension("t", None).expect("t");
        schema.add_dimension("x", Some(2)).expect("x");
        schema.add_variable("grid", NcType::Int, &["x"]).expect("grid");
        schema.add_variable("obs", NcType::Short, &["t"]).expect("obs");
        let header_len = codec
            .encode_header(FileKind::Flat, &schema, 0)
            .expect("encode")
            .len() as u64;
        let layout = compute_layout(schema.variables(), header_len).expect("layout");
        for (idx, p) in layout.placements.iter().enumerate() {
            schema.set_begin(idx, p.begin);
        }
        handle.apply_layout(schema, &layout);
        handle.write_header(codec).expect("header");
        handle.state = DefineState::Normal;
        handle
    }

    #[test]
    fn created_handle_starts_in_define_mode() {
        let dir = tempdir().expect("temp");
        let path = dir.path().join("c.cdf");
        let stream = EncodedStream::create(&path, true).expect("create");
        let handle = Handle::created(path, stream, FileKind::Flat);
        assert_eq!(handle.state(), DefineState::Defining(DefineOrigin::Create));
        assert!(handle.is_writable());
        assert_eq!(handle.fill_mode(), FillMode::Fill);
        assert!(!handle.is_stashed());
    }

    #[test]
    fn record_write_past_end_fills_gap_and_marks_counter_dirty() {
        let dir = tempdir().expect("temp");
        let codec = ClassicCodec::default();
        let mut handle = laid_out(dir.path(), &codec);
        assert_eq!(handle.record_size(), 2);

        handle
            .write_record(&codec, "obs", 2, &7i16.to_be_bytes())
            .expect("write");
        assert_eq!(handle.num_records(), 3);
        assert!(handle.flags.contains(HandleFlags::NUMRECS_DIRTY));
        assert_eq!(handle.read_record("obs", 0).expect("r0"), vec![0x80, 0x01]);
        assert_eq!(handle.read_record("obs", 2).expect("r2"), 7i16.to_be_bytes());
        assert!(handle.read_record("obs", 3).is_err());

        handle.flush_metadata(&codec).expect("flush");
        assert!(!handle.flags.contains(HandleFlags::NUMRECS_DIRTY));
        handle.refresh(&codec).expect("refresh");
        assert_eq!(handle.num_records(), 3);
    }

    #[test]
    fn fixed_payload_must_match_shape() {
        let dir = tempdir().expect("temp");
        let codec = ClassicCodec::default();
        let mut handle = laid_out(dir.path(), &codec);
        assert!(handle.write_variable("grid", &[0u8; 4]).is_err());
        assert!(handle.write_variable("obs", &[0u8; 2]).is_err());
        let data: Vec<u8> = [5i32, -5].iter().flat_map(|v| v.to_be_bytes()).collect();
        handle.write_variable("grid", &data).expect("write");
        assert_eq!(handle.read_variable("grid").expect("read"), data);
    }

    #[test]
    fn header_flush_clears_both_dirty_bits() {
        let dir = tempdir().expect("temp");
        let codec = ClassicCodec::default();
        let mut handle = laid_out(dir.path(), &codec);
        handle
            .flags
            .insert(HandleFlags::HEADER_DIRTY | HandleFlags::NUMRECS_DIRTY);
        handle.flush_metadata(&codec).expect("flush");
        assert!(
            !handle
                .flags
                .intersects(HandleFlags::HEADER_DIRTY | HandleFlags::NUMRECS_DIRTY)
        );
    }
}
