use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Dimension,
    Variable,
    Attribute,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Dimension => write!(f, "dimension"),
            ObjectKind::Variable => write!(f, "variable"),
            ObjectKind::Attribute => write!(f, "attribute"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdfErrorCode {
    Io,
    InvalidArgument,
    BadIdentifier,
    NotInDefineMode,
    AlreadyInDefineMode,
    PermissionDenied,
    TooManyOpenFiles,
    CodecFault,
    RenameFailed,
    NameInUse,
    NotFound,
    UnlimitedInUse,
}

impl CdfErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            CdfErrorCode::Io => "io",
            CdfErrorCode::InvalidArgument => "invalid_argument",
            CdfErrorCode::BadIdentifier => "bad_identifier",
            CdfErrorCode::NotInDefineMode => "not_in_define_mode",
            CdfErrorCode::AlreadyInDefineMode => "already_in_define_mode",
            CdfErrorCode::PermissionDenied => "permission_denied",
            CdfErrorCode::TooManyOpenFiles => "too_many_open_files",
            CdfErrorCode::CodecFault => "codec_fault",
            CdfErrorCode::RenameFailed => "rename_failed",
            CdfErrorCode::NameInUse => "name_in_use",
            CdfErrorCode::NotFound => "not_found",
            CdfErrorCode::UnlimitedInUse => "unlimited_in_use",
        }
    }
}

#[derive(Debug, Error)]
pub enum CdfError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} is not a valid file id")]
    BadIdentifier(usize),
    #[error("{}: not in define mode", path.display())]
    NotInDefineMode { path: PathBuf },
    #[error("{}: in define mode already", path.display())]
    AlreadyInDefineMode { path: PathBuf },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("too many open files: limit of {limit} reached")]
    TooManyOpenFiles { limit: usize },
    #[error("codec fault: {0}")]
    CodecFault(String),
    #[error("rename {} -> {} failed: {source}", from.display(), to.display())]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{kind} '{name}' already exists")]
    NameInUse { kind: ObjectKind, name: String },
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ObjectKind, name: String },
    #[error("unlimited dimension already defined as '{existing}'")]
    UnlimitedInUse { existing: String },
}

impl CdfError {
    pub fn code(&self) -> CdfErrorCode {
        match self {
            CdfError::Io(_) => CdfErrorCode::Io,
            CdfError::InvalidArgument(_) => CdfErrorCode::InvalidArgument,
            CdfError::BadIdentifier(_) => CdfErrorCode::BadIdentifier,
            CdfError::NotInDefineMode { .. } => CdfErrorCode::NotInDefineMode,
            CdfError::AlreadyInDefineMode { .. } => CdfErrorCode::AlreadyInDefineMode,
            CdfError::PermissionDenied(_) => CdfErrorCode::PermissionDenied,
            CdfError::TooManyOpenFiles { .. } => CdfErrorCode::TooManyOpenFiles,
            CdfError::CodecFault(_) => CdfErrorCode::CodecFault,
            CdfError::RenameFailed { .. } => CdfErrorCode::RenameFailed,
            CdfError::NameInUse { .. } => CdfErrorCode::NameInUse,
            CdfError::NotFound { .. } => CdfErrorCode::NotFound,
            CdfError::UnlimitedInUse { .. } => CdfErrorCode::UnlimitedInUse,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Wraps a stream-level I/O failure observed at the codec boundary.
    pub(crate) fn codec(context: &str, err: std::io::Error) -> Self {
        CdfError::CodecFault(format!("{context}: {err}"))
    }
}
