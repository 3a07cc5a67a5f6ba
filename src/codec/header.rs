//! Big-endian header encoding.
//!
//! ```text
//! magic[4] numrecs:u32
//! DIMENSION count { name size:u32 }          size 0 = unlimited
//! ATTRIBUTE count { attr }                   global attributes
//! VARIABLE  count { name ndims:u32 dimid:u32* ATTRIBUTE count { attr } type:u32 len:u64 begin:u64 }
//! name = len:u32 bytes padded to 4
//! attr = name type:u32 nelems:u32 values padded to 4
//! ```

use crate::catalog::schema::RawVariable;
use crate::catalog::{Attribute, DimId, Dimension, MAX_NAME_LEN, NcType, Schema, padded_len};
use crate::codec::stream::EncodedStream;
use crate::codec::{FileKind, Header};
use crate::error::CdfError;

pub const FLAT_MAGIC: [u8; 4] = *b"CDF\x02";
pub const CONTAINER_MAGIC: [u8; 4] = *b"CDC\x02";
pub const NUM_RECORDS_OFFSET: u64 = 4;

const TAG_DIMENSION: u32 = 10;
const TAG_VARIABLE: u32 = 11;
const TAG_ATTRIBUTE: u32 = 12;

pub(crate) fn magic_for(kind: FileKind) -> [u8; 4] {
    match kind {
        FileKind::Flat => FLAT_MAGIC,
        FileKind::Container => CONTAINER_MAGIC,
    }
}

fn to_u32(value: u64, what: &str) -> Result<u32, CdfError> {
    u32::try_from(value).map_err(|_| CdfError::CodecFault(format!("{what} {value} exceeds u32")))
}

struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn padded(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
        let pad = padded_len(bytes.len() as u64) as usize - bytes.len();
        self.out.extend(std::iter::repeat_n(0u8, pad));
    }

    fn name(&mut self, name: &str) -> Result<(), CdfError> {
        self.u32(to_u32(name.len() as u64, "name length")?);
        self.padded(name.as_bytes());
        Ok(())
    }

    fn attributes(&mut self, attrs: &[Attribute]) -> Result<(), CdfError> {
        self.u32(TAG_ATTRIBUTE);
        self.u32(to_u32(attrs.len() as u64, "attribute count")?);
        for attr in attrs {
            self.name(&attr.name)?;
            self.u32(attr.nc_type.tag());
            self.u32(to_u32(attr.len() as u64, "attribute length")?);
            self.padded(&attr.values);
        }
        Ok(())
    }
}

pub(crate) fn encode(kind: FileKind, schema: &Schema, num_records: u64) -> Result<Vec<u8>, CdfError> {
    let mut enc = Encoder { out: Vec::new() };
    enc.out.extend_from_slice(&magic_for(kind));
    enc.u32(to_u32(num_records, "record count")?);

    enc.u32(TAG_DIMENSION);
    enc.u32(to_u32(schema.dimensions().len() as u64, "dimension count")?);
    for dim in schema.dimensions() {
        enc.name(&dim.name)?;
        enc.u32(to_u32(dim.size.unwrap_or(0), "dimension size")?);
    }

    enc.attributes(schema.attributes())?;

    enc.u32(TAG_VARIABLE);
    enc.u32(to_u32(schema.variables().len() as u64, "variable count")?);
    for var in schema.variables() {
        enc.name(var.name())?;
        enc.u32(to_u32(var.dims().len() as u64, "rank")?);
        for dim in var.dims() {
            enc.u32(to_u32(dim.0 as u64, "dimension id")?);
        }
        enc.attributes(var.attributes())?;
        enc.u32(var.nc_type().tag());
        enc.u64(var.len());
        enc.u64(var.begin());
    }
    Ok(enc.out)
}

/// Reads header fields straight off a stream, bounding every count by the
/// bytes that remain so a corrupt header cannot request huge allocations.
struct Decoder<'a> {
    stream: &'a mut EncodedStream,
    pos: u64,
    end: u64,
}

impl Decoder<'_> {
    fn bytes(&mut self, n: u64) -> Result<Vec<u8>, CdfError> {
        if n > self.end.saturating_sub(self.pos) {
            return Err(CdfError::CodecFault(format!(
                "header truncated at byte {}",
                self.pos
            )));
        }
        let mut buf = vec![0u8; n as usize];
        self.stream.read_exact(&mut buf)?;
        self.pos += n;
        Ok(buf)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CdfError> {
        let bytes = self.bytes(N as u64)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, CdfError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, CdfError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn count(&mut self, min_item_bytes: u64) -> Result<usize, CdfError> {
        let n = u64::from(self.u32()?);
        if n.saturating_mul(min_item_bytes) > self.end.saturating_sub(self.pos) {
            return Err(CdfError::CodecFault(format!("implausible count {n}")));
        }
        Ok(n as usize)
    }

    fn tagged(&mut self, tag: u32, min_item_bytes: u64) -> Result<usize, CdfError> {
        let found = self.u32()?;
        if found != tag {
            return Err(CdfError::CodecFault(format!(
                "expected list tag {tag}, found {found}"
            )));
        }
        self.count(min_item_bytes)
    }

    fn padded(&mut self, len: u64) -> Result<Vec<u8>, CdfError> {
        let mut bytes = self.bytes(padded_len(len))?;
        bytes.truncate(len as usize);
        Ok(bytes)
    }

    fn name(&mut self) -> Result<String, CdfError> {
        let len = u64::from(self.u32()?);
        if len == 0 || len > MAX_NAME_LEN as u64 {
            return Err(CdfError::CodecFault(format!("bad name length {len}")));
        }
        String::from_utf8(self.padded(len)?)
            .map_err(|_| CdfError::CodecFault("name is not utf-8".into()))
    }

    fn nc_type(&mut self) -> Result<NcType, CdfError> {
        let tag = self.u32()?;
        NcType::from_tag(tag).ok_or_else(|| CdfError::CodecFault(format!("unknown type tag {tag}")))
    }

    fn attributes(&mut self) -> Result<Vec<Attribute>, CdfError> {
        let n = self.tagged(TAG_ATTRIBUTE, 12)?;
        let mut attrs = Vec::with_capacity(n);
        for _ in 0..n {
            let name = self.name()?;
            let nc_type = self.nc_type()?;
            let nelems = u64::from(self.u32()?);
            let values = self.padded(nelems * nc_type.size())?;
            attrs.push(Attribute::new(name, nc_type, values).map_err(|e| {
                CdfError::CodecFault(format!("bad attribute: {e}"))
            })?);
        }
        Ok(attrs)
    }
}

pub(crate) fn decode(stream: &mut EncodedStream) -> Result<Header, CdfError> {
    let end = stream.len()?;
    stream.seek(0)?;
    let mut dec = Decoder {
        stream,
        pos: 0,
        end,
    };
    let magic: [u8; 4] = dec.array()?;
    let kind = match magic {
        FLAT_MAGIC => FileKind::Flat,
        CONTAINER_MAGIC => FileKind::Container,
        other => {
            return Err(CdfError::CodecFault(format!("unrecognized magic {other:02x?}")));
        }
    };
    let num_records = u64::from(dec.u32()?);

    let n_dims = dec.tagged(TAG_DIMENSION, 12)?;
    let mut dims = Vec::with_capacity(n_dims);
    for _ in 0..n_dims {
        let name = dec.name()?;
        let size = dec.u32()?;
        dims.push(Dimension {
            name,
            size: (size != 0).then_some(u64::from(size)),
        });
    }
    if dims.iter().filter(|d| d.is_unlimited()).count() > 1 {
        return Err(CdfError::CodecFault("more than one unlimited dimension".into()));
    }

    let attributes = dec.attributes()?;

    let n_vars = dec.tagged(TAG_VARIABLE, 40)?;
    let mut raw_vars = Vec::with_capacity(n_vars);
    for _ in 0..n_vars {
        let name = dec.name()?;
        let rank = dec.count(4)?;
        let mut var_dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            var_dims.push(DimId(dec.u32()? as usize));
        }
        let var_attrs = dec.attributes()?;
        let nc_type = dec.nc_type()?;
        let len = dec.u64()?;
        let begin = dec.u64()?;
        raw_vars.push(RawVariable {
            name,
            nc_type,
            dims: var_dims,
            attributes: var_attrs,
            len,
            begin,
        });
    }
    let encoded_len = dec.pos;
    let schema = Schema::from_parts(dims, attributes, raw_vars).map_err(|e| match e {
        CdfError::CodecFault(_) => e,
        other => CdfError::CodecFault(format!("bad schema: {other}")),
    })?;
    Ok(Header {
        kind,
        num_records,
        schema,
        encoded_len,
    })
}
