use serde::{Deserialize, Serialize};

/// Hard cap on the open-file table regardless of what the host reports.
pub const MAX_AVAIL_OPEN_FILES: usize = 20_000;

/// Runtime configuration for a [`crate::Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Table capacity used on first allocation, clamped to the system ceiling.
    pub default_max_open: usize,
    pub max_avail_open_files: usize,
    /// Descriptors kept back for stdin, stdout and stderr.
    pub reserved_descriptors: usize,
    pub copy_buffer_bytes: usize,
    pub max_path_len: usize,
    /// Bytes reserved at the front of container files so the header can grow in place.
    pub container_header_reserve: u64,
    pub temp_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_max_open: 32,
            max_avail_open_files: MAX_AVAIL_OPEN_FILES,
            reserved_descriptors: 3,
            copy_buffer_bytes: 8192,
            max_path_len: 4096,
            container_header_reserve: 4096,
            temp_prefix: ".cdf-redef-".into(),
        }
    }
}

impl SessionConfig {
    /// Profile with a tiny initial table, useful for exercising growth paths.
    pub fn small_table() -> Self {
        Self {
            default_max_open: 4,
            copy_buffer_bytes: 64,
            ..Self::default()
        }
    }

    pub fn with_default_max_open(mut self, n: usize) -> Self {
        self.default_max_open = n;
        self
    }

    pub fn with_copy_buffer_bytes(mut self, n: usize) -> Self {
        self.copy_buffer_bytes = n.max(1);
        self
    }

    pub fn with_container_header_reserve(mut self, n: u64) -> Self {
        self.container_header_reserve = n;
        self
    }

    /// Ceiling derived from a host descriptor limit.
    pub fn system_ceiling(&self, host_limit: usize) -> usize {
        host_limit
            .saturating_sub(self.reserved_descriptors)
            .min(self.max_avail_open_files)
    }
}
