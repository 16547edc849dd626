//! Error types shared by every layer of the archive.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ZipError>;

/// Everything that can go wrong while reading, mutating or persisting an archive.
#[derive(Debug, Error)]
pub enum ZipError {
    /// Malformed or inconsistent structure, size mismatch or truncated stream
    #[error("invalid zip structure: {0}")]
    Format(String),

    /// No end of central directory record could be located
    #[error("unable to find end of central directory record ({size} byte archive)")]
    TruncatedArchive { size: u64 },

    /// Compression method other than STORED or DEFLATE
    #[error("unsupported compression method {name} ({method})")]
    UnsupportedMethod { method: u16, name: &'static str },

    /// Entry or parent directory is absent
    #[error("no such entry: {0}")]
    NotFound(String),

    /// Create-new on a path that already exists
    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    /// Removing or overwriting a directory that still has children
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Internal invariant violation, e.g. compress with no source content
    #[error("inconsistent entry state: {0}")]
    Consistency(String),

    /// Logical position outside the addressed buffer
    #[error("range {position}+{len} out of bounds for buffer of {size} bytes")]
    OutOfBounds { position: u64, len: u64, size: u64 },

    /// Name does not fit the requested kind, or names the root
    #[error("invalid entry name: {0}")]
    InvalidName(String),

    /// Mutation attempted on a read-only archive
    #[error("archive is read-only")]
    ReadOnly,

    /// Operation on an archive handle that was already closed
    #[error("archive is closed")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ZipError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        ZipError::Format(msg.into())
    }

    pub(crate) fn not_found(name: &[u8]) -> Self {
        ZipError::NotFound(String::from_utf8_lossy(name).into_owned())
    }

    pub(crate) fn already_exists(name: &[u8]) -> Self {
        ZipError::AlreadyExists(String::from_utf8_lossy(name).into_owned())
    }

    pub(crate) fn not_empty(name: &[u8]) -> Self {
        ZipError::NotEmpty(String::from_utf8_lossy(name).into_owned())
    }

    pub(crate) fn invalid_name(name: &[u8]) -> Self {
        ZipError::InvalidName(String::from_utf8_lossy(name).into_owned())
    }

    /// Whether the EOCD scan may recover from this error by trying an older
    /// candidate record.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ZipError::Format(_) | ZipError::OutOfBounds { .. }
        )
    }
}

/// Entry streams surface library errors through `std::io`.
impl From<ZipError> for std::io::Error {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(e) => e,
            ZipError::NotFound(_) => std::io::Error::new(std::io::ErrorKind::NotFound, err),
            ZipError::OutOfBounds { .. } => std::io::Error::new(std::io::ErrorKind::InvalidInput, err),
            other => std::io::Error::other(other),
        }
    }
}
