pub mod catalog;
pub mod codec;
pub mod config;
pub mod copy;
pub mod error;
pub mod handle;
pub mod layout;
pub mod platform;
mod redef;
pub mod table;

pub use crate::catalog::{Attribute, DimId, NcType, Schema, VarId};
pub use crate::codec::{ClassicCodec, CodecGateway, FileKind};
pub use crate::config::SessionConfig;
pub use crate::error::{CdfError, CdfErrorCode};
pub use crate::handle::{DefineOrigin, DefineState, FillMode, Handle, HandleFlags, OpenFlags};
pub use crate::platform::{HostPlatform, Platform};
pub use crate::table::FileId;

use crate::codec::EncodedStream;
use crate::redef::Redefiner;
use crate::table::OpenFileTable;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot of one open file, as reported by [`Session::describe`].
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub id: FileId,
    pub path: PathBuf,
    pub kind: FileKind,
    pub state: DefineState,
    pub writable: bool,
    pub fill_mode: FillMode,
    pub num_records: u64,
    pub record_size: u64,
    pub begin_record_region: u64,
    /// Id of the parked original while a flat file is being redefined.
    pub partner: Option<FileId>,
    pub schema: Schema,
}

/// Owner of every open file in the process.
///
/// Files are addressed by small integer ids handed out by [`Session::open`]
/// and [`Session::create`]. An id stays valid across a redefinition and is
/// released by [`Session::close`] or [`Session::abort`].
pub struct Session {
    config: SessionConfig,
    table: OpenFileTable<Handle>,
    codec: Arc<dyn CodecGateway>,
    platform: Arc<dyn Platform>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("open", &self.table.live_count())
            .field("capacity", &self.table.capacity())
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_platform(config, Arc::new(HostPlatform))
    }

    pub fn with_platform(config: SessionConfig, platform: Arc<dyn Platform>) -> Self {
        let codec = Arc::new(ClassicCodec::with_fill_chunk_bytes(config.copy_buffer_bytes));
        Self::with_parts(config, codec, platform)
    }

    pub fn with_parts(
        config: SessionConfig,
        codec: Arc<dyn CodecGateway>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let ceiling = config.system_ceiling(platform.open_file_limit());
        let table = OpenFileTable::new(config.default_max_open, ceiling);
        debug!(
            default_max_open = config.default_max_open,
            system_ceiling = ceiling,
            "session ready"
        );
        Self {
            config,
            table,
            codec,
            platform,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn redefiner(&mut self) -> Redefiner<'_> {
        Redefiner {
            table: &mut self.table,
            codec: self.codec.as_ref(),
            platform: self.platform.as_ref(),
            config: &self.config,
        }
    }

    fn resolve(table: &OpenFileTable<Handle>, id: FileId) -> Result<&Handle, CdfError> {
        table
            .get(id)
            .filter(|h| !h.is_stashed())
            .ok_or(CdfError::BadIdentifier(id.index()))
    }

    fn resolve_mut(table: &mut OpenFileTable<Handle>, id: FileId) -> Result<&mut Handle, CdfError> {
        table
            .get_mut(id)
            .filter(|h| !h.is_stashed())
            .ok_or(CdfError::BadIdentifier(id.index()))
    }

    fn defining_mut(table: &mut OpenFileTable<Handle>, id: FileId) -> Result<&mut Handle, CdfError> {
        let handle = Self::resolve_mut(table, id)?;
        if !handle.is_defining() {
            return Err(CdfError::NotInDefineMode {
                path: handle.path.clone(),
            });
        }
        Ok(handle)
    }

    /// Handle a data read on `id` is served from. While a flat file is being
    /// redefined that is the parked original.
    fn data_id(&self, id: FileId) -> Result<FileId, CdfError> {
        let handle = Self::resolve(&self.table, id)?;
        match handle.state {
            DefineState::Normal | DefineState::Defining(DefineOrigin::InPlace) => Ok(id),
            DefineState::Defining(DefineOrigin::Redefine) => handle
                .partner
                .ok_or(CdfError::BadIdentifier(id.index())),
            DefineState::Defining(DefineOrigin::Create)
            | DefineState::Committing
            | DefineState::Aborting => Err(CdfError::AlreadyInDefineMode {
                path: handle.path.clone(),
            }),
        }
    }

    fn writable_data_mut(
        table: &mut OpenFileTable<Handle>,
        id: FileId,
    ) -> Result<&mut Handle, CdfError> {
        let handle = Self::resolve_mut(table, id)?;
        if handle.is_defining() {
            return Err(CdfError::AlreadyInDefineMode {
                path: handle.path.clone(),
            });
        }
        if !handle.is_writable() {
            return Err(CdfError::PermissionDenied(format!(
                "{} is open read-only",
                handle.path.display()
            )));
        }
        Ok(handle)
    }

    fn validate_path(&self, path: &Path) -> Result<(), CdfError> {
        let len = path.as_os_str().len();
        if len == 0 || len > self.config.max_path_len {
            return Err(CdfError::InvalidArgument(format!(
                "path length {len} outside 1..={}",
                self.config.max_path_len
            )));
        }
        Ok(())
    }

    fn path_in_use(&self, path: &Path) -> bool {
        self.table.iter().any(|(_, h)| h.path == path)
    }

    /// Create a new file and leave it in define mode.
    pub fn create(&mut self, path: impl AsRef<Path>, flags: OpenFlags) -> Result<FileId, CdfError> {
        let path = path.as_ref();
        self.validate_path(path)?;
        if !flags.contains(OpenFlags::CREATE) {
            return Err(CdfError::InvalidArgument(
                "create requires the CREATE flag".into(),
            ));
        }
        let id = self.table.find_free_slot()?;
        let kind = if flags.contains(OpenFlags::CONTAINER) {
            FileKind::Container
        } else {
            FileKind::Flat
        };
        let stream = EncodedStream::create(path, flags.contains(OpenFlags::NOCLOBBER))?;
        let mut handle = Handle::created(path.to_path_buf(), stream, kind);
        if let Err(err) = handle.write_header(self.codec.as_ref()) {
            drop(handle);
            if !self.path_in_use(path) {
                if let Err(cleanup) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %cleanup, "removing half-created file failed");
                }
            }
            return Err(err);
        }
        self.table.install(id, handle)?;
        info!(id = id.index(), path = %path.display(), kind = ?kind, "file created");
        Ok(id)
    }

    /// Open an existing file in data mode.
    pub fn open(&mut self, path: impl AsRef<Path>, flags: OpenFlags) -> Result<FileId, CdfError> {
        let path = path.as_ref();
        self.validate_path(path)?;
        if flags.contains(OpenFlags::CREATE) {
            return Err(CdfError::InvalidArgument(
                "open does not accept the CREATE flag".into(),
            ));
        }
        let id = self.table.find_free_slot()?;
        let writable = flags.contains(OpenFlags::WRITE);
        let mut stream = EncodedStream::open(path, writable)?;
        let header = self.codec.decode_header(&mut stream)?;
        let handle = Handle::from_header(path.to_path_buf(), stream, header, writable);
        info!(
            id = id.index(),
            path = %path.display(),
            writable,
            kind = ?handle.kind,
            num_records = handle.num_records,
            "file opened"
        );
        self.table.install(id, handle)?;
        Ok(id)
    }

    /// Close `id`, committing a pending definition first.
    ///
    /// If that commit fails the definition is aborted, `id` is released and the
    /// commit error is returned.
    pub fn close(&mut self, id: FileId) -> Result<(), CdfError> {
        if Self::resolve(&self.table, id)?.is_defining() {
            if let Err(err) = self.redefiner().commit(id) {
                if let Err(abort_err) = self.redefiner().abort(id) {
                    warn!(id = id.index(), error = %abort_err, "abort after failed commit also failed");
                }
                return Err(err);
            }
        }
        self.redefiner().close_data_mode(id)
    }

    /// Discard any pending definition and release `id`.
    pub fn abort(&mut self, id: FileId) -> Result<(), CdfError> {
        self.redefiner().abort(id)
    }

    /// Push pending metadata to disk, or re-read it for a read-only handle.
    pub fn sync(&mut self, id: FileId) -> Result<(), CdfError> {
        let codec = self.codec.as_ref();
        let handle = Self::resolve_mut(&mut self.table, id)?;
        if handle.is_defining() {
            return Err(CdfError::AlreadyInDefineMode {
                path: handle.path.clone(),
            });
        }
        if handle.is_writable() {
            handle.flush_metadata(codec)?;
            handle.stream.sync()
        } else {
            handle.refresh(codec)
        }
    }

    pub fn enter_define(&mut self, id: FileId) -> Result<(), CdfError> {
        self.redefiner().enter(id)
    }

    pub fn commit_define(&mut self, id: FileId) -> Result<(), CdfError> {
        self.redefiner().commit(id)
    }

    /// Set whether new space is pre-filled, returning the previous mode.
    pub fn set_fill_policy(&mut self, id: FileId, mode: FillMode) -> Result<FillMode, CdfError> {
        let codec = self.codec.as_ref();
        let handle = Self::resolve_mut(&mut self.table, id)?;
        if !handle.is_writable() {
            return Err(CdfError::PermissionDenied(format!(
                "{} is open read-only",
                handle.path.display()
            )));
        }
        let previous = handle.fill_mode();
        match mode {
            FillMode::Fill => {
                if previous == FillMode::NoFill && handle.state == DefineState::Normal {
                    handle.flush_metadata(codec)?;
                }
                handle.flags.remove(HandleFlags::NO_FILL);
            }
            FillMode::NoFill => handle.flags.insert(HandleFlags::NO_FILL),
        }
        Ok(previous)
    }

    /// Negotiate the open-file table capacity. `0` only makes sure a table exists.
    pub fn max_open_files(&mut self, requested: usize) -> Result<usize, CdfError> {
        self.table.allocate(requested)
    }

    pub fn current_open_count(&self) -> usize {
        self.table.live_count()
    }

    pub fn system_limit(&self) -> usize {
        self.table.system_ceiling()
    }

    pub fn negotiated_max_open(&self) -> usize {
        self.table.capacity()
    }

    pub fn is_defining(&self, id: FileId) -> Result<bool, CdfError> {
        Ok(Self::resolve(&self.table, id)?.is_defining())
    }

    pub fn state(&self, id: FileId) -> Result<DefineState, CdfError> {
        Ok(Self::resolve(&self.table, id)?.state)
    }

    pub fn path(&self, id: FileId) -> Result<PathBuf, CdfError> {
        Ok(Self::resolve(&self.table, id)?.path.clone())
    }

    pub fn kind(&self, id: FileId) -> Result<FileKind, CdfError> {
        Ok(Self::resolve(&self.table, id)?.kind)
    }

    /// Records currently stored in the file behind `id`.
    pub fn num_records(&self, id: FileId) -> Result<u64, CdfError> {
        let data = self.data_id(id)?;
        Ok(Self::resolve_any(&self.table, data)?.num_records)
    }

    fn resolve_any(table: &OpenFileTable<Handle>, id: FileId) -> Result<&Handle, CdfError> {
        table.get(id).ok_or(CdfError::BadIdentifier(id.index()))
    }

    pub fn describe(&self, id: FileId) -> Result<FileInfo, CdfError> {
        let handle = Self::resolve(&self.table, id)?;
        Ok(FileInfo {
            id,
            path: handle.path.clone(),
            kind: handle.kind,
            state: handle.state,
            writable: handle.is_writable(),
            fill_mode: handle.fill_mode(),
            num_records: handle.num_records,
            record_size: handle.record_size,
            begin_record_region: handle.begin_record_region,
            partner: handle.partner,
            schema: handle.schema.clone(),
        })
    }

    pub fn add_dimension(
        &mut self,
        id: FileId,
        name: &str,
        size: Option<u64>,
    ) -> Result<DimId, CdfError> {
        Self::defining_mut(&mut self.table, id)?
            .schema
            .add_dimension(name, size)
    }

    pub fn add_variable(
        &mut self,
        id: FileId,
        name: &str,
        nc_type: NcType,
        dims: &[&str],
    ) -> Result<VarId, CdfError> {
        let handle = Self::defining_mut(&mut self.table, id)?;
        let idx = handle.schema.add_variable(name, nc_type, dims)?;
        let (var_id, is_record) = {
            let var = &handle.schema.variables()[idx];
            (var.id(), var.is_record())
        };
        if handle.kind == FileKind::Container && is_record {
            handle.schema.remove_variable(name)?;
            return Err(CdfError::InvalidArgument(format!(
                "container files cannot hold record variable '{name}'"
            )));
        }
        Ok(var_id)
    }

    pub fn remove_variable(&mut self, id: FileId, name: &str) -> Result<(), CdfError> {
        Self::defining_mut(&mut self.table, id)?
            .schema
            .remove_variable(name)
            .map(|_| ())
    }

    /// Rename a variable. Outside define mode the new name may not be longer
    /// than the old one, and the header is rewritten on the next flush.
    pub fn rename_variable(&mut self, id: FileId, from: &str, to: &str) -> Result<(), CdfError> {
        let handle = Self::resolve_mut(&mut self.table, id)?;
        if handle.is_defining() {
            return handle.schema.rename_variable(from, to);
        }
        if !handle.is_writable() {
            return Err(CdfError::PermissionDenied(format!(
                "{} is open read-only",
                handle.path.display()
            )));
        }
        if to.len() > from.len() {
            return Err(CdfError::NotInDefineMode {
                path: handle.path.clone(),
            });
        }
        handle.schema.rename_variable(from, to)?;
        handle.flags.insert(HandleFlags::HEADER_DIRTY);
        Ok(())
    }

    /// Add or replace an attribute on `variable`, or a global one when `None`.
    pub fn put_attribute(
        &mut self,
        id: FileId,
        variable: Option<&str>,
        attr: Attribute,
    ) -> Result<(), CdfError> {
        Self::defining_mut(&mut self.table, id)?
            .schema
            .put_attribute(variable, attr)
    }

    pub fn delete_attribute(
        &mut self,
        id: FileId,
        variable: Option<&str>,
        name: &str,
    ) -> Result<(), CdfError> {
        Self::defining_mut(&mut self.table, id)?
            .schema
            .delete_attribute(variable, name)
    }

    /// Raw encoded bytes of a fixed variable.
    pub fn read_variable(&mut self, id: FileId, name: &str) -> Result<Vec<u8>, CdfError> {
        let data = self.data_id(id)?;
        Self::resolve_any_mut(&mut self.table, data)?.read_variable(name)
    }

    /// Raw encoded bytes of one record of a record variable.
    pub fn read_record(&mut self, id: FileId, name: &str, record: u64) -> Result<Vec<u8>, CdfError> {
        let data = self.data_id(id)?;
        Self::resolve_any_mut(&mut self.table, data)?.read_record(name, record)
    }

    fn resolve_any_mut(
        table: &mut OpenFileTable<Handle>,
        id: FileId,
    ) -> Result<&mut Handle, CdfError> {
        table.get_mut(id).ok_or(CdfError::BadIdentifier(id.index()))
    }

    pub fn write_variable(&mut self, id: FileId, name: &str, data: &[u8]) -> Result<(), CdfError> {
        Self::writable_data_mut(&mut self.table, id)?.write_variable(name, data)
    }

    pub fn write_record(
        &mut self,
        id: FileId,
        name: &str,
        record: u64,
        data: &[u8],
    ) -> Result<(), CdfError> {
        let codec = self.codec.as_ref();
        Self::writable_data_mut(&mut self.table, id)?.write_record(codec, name, record, data)
    }
}
