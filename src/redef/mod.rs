//! Define-mode transitions.
//!
//! A flat file is redefined through a shadow: the caller's id is pointed at a
//! new handle writing to a scratch file next to the original, while the
//! original is parked under a spare id and keeps serving reads. Commit lays
//! the shadow out, copies the data across and renames the scratch file over
//! the original. Any failure on the way puts the original back under the
//! caller's id, untouched.
//!
//! Container files grow their header in place and never need a shadow.

use crate::catalog::Schema;
use crate::codec::{CodecGateway, EncodedStream, FileKind};
use crate::config::SessionConfig;
use crate::copy;
use crate::error::CdfError;
use crate::handle::{DefineOrigin, DefineState, FillMode, Handle, HandleFlags};
use crate::layout::{self, Layout};
use crate::platform::Platform;
use crate::table::{FileId, OpenFileTable};
use std::path::Path;
use tracing::{debug, info, warn};

pub(crate) struct Redefiner<'a> {
    pub table: &'a mut OpenFileTable<Handle>,
    pub codec: &'a dyn CodecGateway,
    pub platform: &'a dyn Platform,
    pub config: &'a SessionConfig,
}

/// Offsets for `schema` as it would be written to a file of `kind`.
pub(crate) fn plan(
    kind: FileKind,
    schema: &Schema,
    codec: &dyn CodecGateway,
    config: &SessionConfig,
) -> Result<(Schema, Layout), CdfError> {
    let layout = match kind {
        FileKind::Flat => {
            let header_len = codec.encode_header(kind, schema, 0)?.len() as u64;
            layout::compute_layout(schema.variables(), header_len)?
        }
        FileKind::Container => {
            layout::append_layout(schema.variables(), config.container_header_reserve)?
        }
    };
    let mut placed = schema.clone();
    for (idx, p) in layout.placements.iter().enumerate() {
        placed.set_begin(idx, p.begin);
    }
    if kind == FileKind::Container {
        let header_len = codec.encode_header(kind, &placed, 0)?.len() as u64;
        if header_len > config.container_header_reserve {
            return Err(CdfError::CodecFault(format!(
                "header of {header_len} bytes exceeds the {} byte reserve",
                config.container_header_reserve
            )));
        }
    }
    Ok((placed, layout))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

impl Redefiner<'_> {
    fn handle(&self, id: FileId) -> Result<&Handle, CdfError> {
        self.table
            .get(id)
            .filter(|h| !h.is_stashed())
            .ok_or(CdfError::BadIdentifier(id.index()))
    }

    fn handle_mut(&mut self, id: FileId) -> Result<&mut Handle, CdfError> {
        self.table
            .get_mut(id)
            .filter(|h| !h.is_stashed())
            .ok_or(CdfError::BadIdentifier(id.index()))
    }

    pub fn enter(&mut self, id: FileId) -> Result<(), CdfError> {
        let handle = self.handle(id)?;
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

        if handle.kind == FileKind::Container {
            let handle = self.handle_mut(id)?;
            handle.saved_schema = Some(handle.schema.clone());
            handle.state = DefineState::Defining(DefineOrigin::InPlace);
            info!(id = id.index(), path = %handle.path.display(), "define mode entered in place");
            return Ok(());
        }

        let stash = self.table.find_free_slot()?;
        let config = self.config;
        let codec = self.codec;
        let original = self.handle_mut(id)?;
        if original.fill_mode() == FillMode::NoFill
            && original.flags.contains(HandleFlags::NUMRECS_DIRTY)
        {
            codec.write_num_records(&mut original.stream, original.num_records)?;
            original.flags.remove(HandleFlags::NUMRECS_DIRTY);
        }
        let (stream, temp_path) =
            EncodedStream::temporary_in(parent_dir(&original.path), &config.temp_prefix)?;
        let shadow = original.shadow(temp_path, stream, stash);
        debug!(id = id.index(), stash = stash.index(), temp = %shadow.path.display(), "shadow created");

        let mut original = self.table.replace(id, shadow)?;
        original.partner = Some(id);
        info!(id = id.index(), path = %original.path.display(), "define mode entered");
        self.table.install(stash, original)
    }

    pub fn commit(&mut self, id: FileId) -> Result<(), CdfError> {
        let handle = self.handle(id)?;
        let origin = match handle.state {
            DefineState::Defining(origin) => origin,
            _ => {
                return Err(CdfError::NotInDefineMode {
                    path: handle.path.clone(),
                });
            }
        };
        match origin {
            DefineOrigin::Create => self.commit_created(id),
            DefineOrigin::InPlace => self.commit_in_place(id),
            DefineOrigin::Redefine => self.commit_shadow(id),
        }
    }

    fn commit_created(&mut self, id: FileId) -> Result<(), CdfError> {
        let codec = self.codec;
        let config = self.config;
        let handle = self.handle_mut(id)?;
        handle.state = DefineState::Committing;
        let result = write_fresh(handle, codec, config);
        match result {
            Ok(()) => {
                handle.state = DefineState::Normal;
                handle
                    .flags
                    .remove(HandleFlags::HEADER_DIRTY | HandleFlags::NUMRECS_DIRTY);
                info!(id = id.index(), path = %handle.path.display(), "new file laid out");
                Ok(())
            }
            Err(err) => {
                handle.state = DefineState::Defining(DefineOrigin::Create);
                warn!(id = id.index(), error = %err, "laying out new file failed");
                Err(err)
            }
        }
    }

    fn commit_in_place(&mut self, id: FileId) -> Result<(), CdfError> {
        let codec = self.codec;
        let config = self.config;
        let handle = self.handle_mut(id)?;
        handle.state = DefineState::Committing;
        match grow_in_place(handle, codec, config) {
            Ok(()) => {
                handle.saved_schema = None;
                handle.state = DefineState::Normal;
                handle
                    .flags
                    .remove(HandleFlags::HEADER_DIRTY | HandleFlags::NUMRECS_DIRTY);
                info!(id = id.index(), path = %handle.path.display(), "header grown in place");
                Ok(())
            }
            Err(err) => {
                handle.state = DefineState::Defining(DefineOrigin::InPlace);
                warn!(id = id.index(), error = %err, "in-place header growth failed");
                Err(err)
            }
        }
    }

    fn commit_shadow(&mut self, id: FileId) -> Result<(), CdfError> {
        let shadow = self.handle_mut(id)?;
        let stash = shadow.partner.ok_or(CdfError::BadIdentifier(id.index()))?;
        shadow.state = DefineState::Committing;

        match self.populate_and_rename(id, stash) {
            Ok(()) => {
                drop(self.table.retire(stash));
                let handle = self.handle_mut(id)?;
                handle.state = DefineState::Normal;
                handle.partner = None;
                info!(id = id.index(), path = %handle.path.display(), "redefinition committed");
                Ok(())
            }
            Err(err) => {
                warn!(id = id.index(), error = %err, "redefinition commit failed, restoring original");
                self.restore_original(id, stash)?;
                Err(err)
            }
        }
    }

    fn populate_and_rename(&mut self, id: FileId, stash: FileId) -> Result<(), CdfError> {
        let codec = self.codec;
        let (shadow, original) = self
            .table
            .get_pair_mut(id, stash)
            .ok_or(CdfError::BadIdentifier(stash.index()))?;

        let (placed, layout) = plan(FileKind::Flat, &shadow.schema, codec, self.config)?;
        shadow.apply_layout(placed, &layout);
        shadow.write_header(codec)?;
        let mut buf = vec![0u8; self.config.copy_buffer_bytes.max(1)];
        copy::populate_from(shadow, original, codec, &mut buf)?;
        shadow.num_records = original.num_records;
        codec.write_num_records(&mut shadow.stream, shadow.num_records)?;
        shadow.stream.extend_to(shadow.data_end())?;
        shadow.stream.sync()?;

        let temp = shadow.path.clone();
        let real = original.path.clone();
        self.platform
            .rename(&temp, &real)
            .map_err(|source| CdfError::RenameFailed {
                from: temp,
                to: real.clone(),
                source,
            })?;
        shadow.stream.keep();
        shadow.path = real;
        shadow
            .flags
            .remove(HandleFlags::HEADER_DIRTY | HandleFlags::NUMRECS_DIRTY);
        Ok(())
    }

    /// Put the parked original back under `id` and drop the shadow with its scratch file.
    fn restore_original(&mut self, id: FileId, stash: FileId) -> Result<(), CdfError> {
        if let Some(shadow) = self.table.get_mut(id) {
            shadow.state = DefineState::Aborting;
        }
        let mut original = self
            .table
            .retire(stash)
            .ok_or(CdfError::BadIdentifier(stash.index()))?;
        original.partner = None;
        original.state = DefineState::Normal;
        let shadow = self.table.replace(id, original)?;
        debug!(id = id.index(), temp = %shadow.path.display(), "shadow discarded");
        drop(shadow);
        Ok(())
    }

    /// Leave define mode without committing and release `id`.
    pub fn abort(&mut self, id: FileId) -> Result<(), CdfError> {
        let state = self.handle(id)?.state;
        match state {
            DefineState::Defining(DefineOrigin::Redefine) => {
                let stash = self
                    .handle(id)?
                    .partner
                    .ok_or(CdfError::BadIdentifier(id.index()))?;
                self.restore_original(id, stash)?;
                info!(id = id.index(), "redefinition aborted");
                self.close_data_mode(id)
            }
            DefineState::Defining(DefineOrigin::Create) => {
                let handle = self
                    .table
                    .retire(id)
                    .ok_or(CdfError::BadIdentifier(id.index()))?;
                let path = handle.path.clone();
                drop(handle);
                info!(id = id.index(), path = %path.display(), "creation aborted, removing file");
                std::fs::remove_file(&path)?;
                Ok(())
            }
            DefineState::Defining(DefineOrigin::InPlace) => {
                let handle = self.handle_mut(id)?;
                if let Some(saved) = handle.saved_schema.take() {
                    handle.schema = saved;
                }
                handle.state = DefineState::Normal;
                info!(id = id.index(), "in-place definition aborted");
                self.close_data_mode(id)
            }
            DefineState::Normal | DefineState::Committing | DefineState::Aborting => {
                self.close_data_mode(id)
            }
        }
    }

    /// Release `id`, then flush whatever metadata the handle still owes.
    pub fn close_data_mode(&mut self, id: FileId) -> Result<(), CdfError> {
        self.handle(id)?;
        let mut handle = self
            .table
            .retire(id)
            .ok_or(CdfError::BadIdentifier(id.index()))?;
        let mut result = handle.flush_metadata(self.codec);
        if result.is_ok() && handle.is_writable() {
            result = handle.stream.sync();
        }
        if let Err(err) = &result {
            warn!(id = id.index(), path = %handle.path.display(), error = %err, "flush on close failed");
        } else {
            debug!(id = id.index(), path = %handle.path.display(), "closed");
        }
        result
    }
}

/// First layout of a newly created file: header, then fill for every fixed variable.
fn write_fresh(
    handle: &mut Handle,
    codec: &dyn CodecGateway,
    config: &SessionConfig,
) -> Result<(), CdfError> {
    let (placed, layout) = plan(handle.kind, &handle.schema, codec, config)?;
    let fill_mask = vec![true; placed.variables().len()];
    let unplaced = std::mem::take(&mut handle.schema);
    handle.apply_layout(placed, &layout);
    let result = write_laid_out(handle, codec, &fill_mask);
    if result.is_err() {
        handle.schema = unplaced;
    }
    result
}

/// Place variables added since the last commit after the existing data and
/// rewrite the header inside its reserve.
///
/// The header is written last. On failure the previous header and file length
/// are put back so the file reads exactly as before.
fn grow_in_place(
    handle: &mut Handle,
    codec: &dyn CodecGateway,
    config: &SessionConfig,
) -> Result<(), CdfError> {
    let (placed, layout) = plan(FileKind::Container, &handle.schema, codec, config)?;
    let fill_mask: Vec<bool> = handle
        .schema
        .variables()
        .iter()
        .map(|v| !v.is_placed())
        .collect();
    let old_len = handle.stream.len()?;
    let previous = std::mem::replace(&mut handle.schema, placed);
    let previous_region = (handle.record_size, handle.begin_record_region);
    handle.record_size = layout.record_size;
    handle.begin_record_region = layout.begin_record_region;
    let result = write_laid_out(handle, codec, &fill_mask);
    if result.is_err() {
        handle.schema = previous;
        (handle.record_size, handle.begin_record_region) = previous_region;
        if let Err(err) = restore_container(handle, codec, old_len) {
            warn!(path = %handle.path.display(), error = %err, "restoring container failed");
        }
    }
    result
}

/// Rewrite the header as of `enter_define` and cut the file back to `len`.
fn restore_container(
    handle: &mut Handle,
    codec: &dyn CodecGateway,
    len: u64,
) -> Result<(), CdfError> {
    let committed = handle.saved_schema.as_ref().unwrap_or(&handle.schema);
    let bytes = codec.encode_header(handle.kind, committed, handle.num_records)?;
    handle.stream.seek(0)?;
    handle.stream.write_all(&bytes)?;
    handle.stream.truncate(len)?;
    handle.stream.sync()
}

/// Fill the variables marked in `fill_mask`, size the file, then write the header.
fn write_laid_out(
    handle: &mut Handle,
    codec: &dyn CodecGateway,
    fill_mask: &[bool],
) -> Result<(), CdfError> {
    if handle.fill_mode() == FillMode::Fill {
        let Handle { schema, stream, .. } = &mut *handle;
        for (var, _) in schema
            .variables()
            .iter()
            .zip(fill_mask)
            .filter(|(var, fresh)| **fresh && !var.is_record())
        {
            stream.seek(var.begin())?;
            codec.write_fill(stream, var, var.len())?;
        }
    }
    let end = handle.data_end();
    handle.stream.extend_to(end)?;
    handle.write_header(codec)?;
    handle.stream.sync()
}
