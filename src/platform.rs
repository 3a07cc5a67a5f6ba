use std::io;
use std::path::Path;

/// Host services the session layer depends on but does not implement itself.
pub trait Platform: Send + Sync {
    /// Soft limit on simultaneously open descriptors for this process.
    fn open_file_limit(&self) -> usize;

    /// Replace `to` with `from`. This is the only commit primitive for redefinition.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HostPlatform;

#[cfg(unix)]
fn host_open_file_limit() -> usize {
    use rustix::process::{Resource, getrlimit};

    getrlimit(Resource::Nofile)
        .current
        .map_or(usize::MAX, |soft| usize::try_from(soft).unwrap_or(usize::MAX))
}

#[cfg(not(unix))]
fn host_open_file_limit() -> usize {
    512
}

impl Platform for HostPlatform {
    fn open_file_limit(&self) -> usize {
        host_open_file_limit()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }
}
