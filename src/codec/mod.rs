pub mod header;
pub mod stream;

use crate::catalog::{Schema, Variable};
use crate::error::CdfError;
use serde::{Deserialize, Serialize};
pub use stream::EncodedStream;

/// How a file's bytes are organized on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Self-contained stream. Schema changes go through a shadow copy.
    Flat,
    /// Header lives in a fixed reserve and grows in place.
    Container,
}

/// Largest record count the header's 32-bit counter can hold.
pub const MAX_RECORDS: u64 = u32::MAX as u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub kind: FileKind,
    pub num_records: u64,
    pub schema: Schema,
    /// Bytes the header occupied on disk.
    pub encoded_len: u64,
}

/// Boundary between the session layer and the on-disk encoding.
pub trait CodecGateway: Send + Sync {
    fn encode_header(
        &self,
        kind: FileKind,
        schema: &Schema,
        num_records: u64,
    ) -> Result<Vec<u8>, CdfError>;

    /// Decode the header at the start of `stream`.
    fn decode_header(&self, stream: &mut EncodedStream) -> Result<Header, CdfError>;

    fn write_num_records(&self, stream: &mut EncodedStream, n: u64) -> Result<(), CdfError>;

    /// Write `span` bytes of `var`'s fill pattern at the stream's current position.
    fn write_fill(
        &self,
        stream: &mut EncodedStream,
        var: &Variable,
        span: u64,
    ) -> Result<(), CdfError>;
}

#[derive(Debug, Clone)]
pub struct ClassicCodec {
    fill_chunk_bytes: usize,
}

impl Default for ClassicCodec {
    fn default() -> Self {
        Self {
            fill_chunk_bytes: 8192,
        }
    }
}

impl ClassicCodec {
    pub fn with_fill_chunk_bytes(fill_chunk_bytes: usize) -> Self {
        Self {
            fill_chunk_bytes: fill_chunk_bytes.max(8),
        }
    }
}

impl CodecGateway for ClassicCodec {
    fn encode_header(
        &self,
        kind: FileKind,
        schema: &Schema,
        num_records: u64,
    ) -> Result<Vec<u8>, CdfError> {
        header::encode(kind, schema, num_records)
    }

    fn decode_header(&self, stream: &mut EncodedStream) -> Result<Header, CdfError> {
        header::decode(stream)
    }

    fn write_num_records(&self, stream: &mut EncodedStream, n: u64) -> Result<(), CdfError> {
        let n = u32::try_from(n)
            .map_err(|_| CdfError::CodecFault(format!("record count {n} exceeds u32")))?;
        stream.seek(header::NUM_RECORDS_OFFSET)?;
        stream.write_all(&n.to_be_bytes())
    }

    fn write_fill(
        &self,
        stream: &mut EncodedStream,
        var: &Variable,
        span: u64,
    ) -> Result<(), CdfError> {
        let pattern = var.fill_pattern();
        let chunk_len = (self.fill_chunk_bytes / pattern.len()).max(1) * pattern.len();
        let chunk: Vec<u8> = pattern.iter().copied().cycle().take(chunk_len).collect();
        let mut remaining = span;
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u64) as usize;
            stream.write_all(&chunk[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ClassicCodec, CodecGateway, FileKind};
    use crate::catalog::{NcType, Schema};
    use crate::codec::stream::EncodedStream;
    use tempfile::tempdir;

    #[test]
    fn fill_repeats_pattern_across_chunks() {
        let dir = tempdir().expect("temp");
        let mut schema = Schema::default();
        schema.add_dimension("n", Some(11)).expect("dim");
        schema.add_variable("v", NcType::Short, &["n"]).expect("var");
        let var = &schema.variables()[0];

        let codec = ClassicCodec::with_fill_chunk_bytes(8);
        let mut stream = EncodedStream::create(&dir.path().join("f"), true).expect("create");
        codec.write_fill(&mut stream, var, var.len()).expect("fill");
        assert_eq!(stream.len().expect("len"), 24);

        let mut buf = vec![0u8; 24];
        stream.seek(0).expect("seek");
        stream.read_exact(&mut buf).expect("read");
        assert!(buf.chunks(2).all(|c| c == [0x80, 0x01]));
    }

    #[test]
    fn num_records_written_at_fixed_offset() {
        let dir = tempdir().expect("temp");
        let codec = ClassicCodec::default();
        let schema = Schema::default();
        let mut stream = EncodedStream::create(&dir.path().join("f"), true).expect("create");
        let bytes = codec
            .encode_header(FileKind::Flat, &schema, 0)
            .expect("encode");
        stream.write_all(&bytes).expect("write");
        codec.write_num_records(&mut stream, 42).expect("numrecs");
        let header = codec.decode_header(&mut stream).expect("decode");
        assert_eq!(header.num_records, 42);
        assert_eq!(header.encoded_len, bytes.len() as u64);
        assert!(codec.write_num_records(&mut stream, u64::from(u32::MAX) + 1).is_err());
    }
}
