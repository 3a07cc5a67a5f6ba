use crate::error::CdfError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// Byte stream owned by exactly one handle.
///
/// A stream created in a scratch location carries its [`TempPath`]; dropping
/// such a stream deletes the file unless [`EncodedStream::keep`] was called.
#[derive(Debug)]
pub struct EncodedStream {
    file: File,
    temp: Option<TempPath>,
}

impl EncodedStream {
    pub fn open(path: &Path, writable: bool) -> Result<Self, CdfError> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        Ok(Self { file, temp: None })
    }

    /// Create (or truncate) a file at `path`. With `no_clobber` an existing file is an error.
    pub fn create(path: &Path, no_clobber: bool) -> Result<Self, CdfError> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if no_clobber {
            opts.create_new(true);
        } else {
            opts.create(true).truncate(true);
        }
        Ok(Self {
            file: opts.open(path)?,
            temp: None,
        })
    }

    /// Create a uniquely named scratch file inside `dir`.
    pub fn temporary_in(dir: &Path, prefix: &str) -> Result<(Self, PathBuf), CdfError> {
        let named = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".tmp")
            .tempfile_in(dir)?;
        let (file, temp) = named.into_parts();
        let path = temp.to_path_buf();
        Ok((
            Self {
                file,
                temp: Some(temp),
            },
            path,
        ))
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Stop deleting the scratch file on drop. Called once it has been renamed into place.
    pub fn keep(&mut self) {
        if let Some(temp) = self.temp.take() {
            // The path was already moved by the rename; nothing is left to remove.
            let _ = temp.keep();
        }
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), CdfError> {
        self.file
            .seek(SeekFrom::Start(pos))
            .map(|_| ())
            .map_err(|e| CdfError::codec("seek", e))
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), CdfError> {
        self.file
            .read_exact(buf)
            .map_err(|e| CdfError::codec("read", e))
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), CdfError> {
        self.file
            .write_all(buf)
            .map_err(|e| CdfError::codec("write", e))
    }

    pub fn sync(&mut self) -> Result<(), CdfError> {
        self.file.flush().map_err(|e| CdfError::codec("flush", e))?;
        self.file
            .sync_all()
            .map_err(|e| CdfError::codec("sync", e))
    }

    pub fn len(&self) -> Result<u64, CdfError> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| CdfError::codec("stat", e))
    }

    pub fn is_empty(&self) -> Result<bool, CdfError> {
        Ok(self.len()? == 0)
    }

    /// Cut the stream back to `len` bytes.
    pub fn truncate(&mut self, len: u64) -> Result<(), CdfError> {
        self.file
            .set_len(len)
            .map_err(|e| CdfError::codec("truncate", e))
    }

    /// Grow the stream to at least `len` bytes. Never shrinks.
    pub fn extend_to(&mut self, len: u64) -> Result<(), CdfError> {
        if self.len()? < len {
            self.file
                .set_len(len)
                .map_err(|e| CdfError::codec("extend", e))?;
        }
        Ok(())
    }
}
