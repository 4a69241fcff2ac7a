//! Error types for pool operations
//!
//! All pool errors are represented by the PoolError enum, which carries
//! enough context (file path, byte offset, type ids) to debug a damaged
//! pool or a misuse of the object API.

use std::fmt;
use std::error::Error;
use std::path::PathBuf;

/// Pool error types with detailed context
#[derive(Debug, Clone)]
pub enum PoolError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// The file does not start with the pool magic bytes
    NotAPool {
        /// File that was opened
        path: PathBuf,
        /// Bytes actually found where the magic was expected
        found_bytes: [u8; 8],
    },

    /// The pool was written by an incompatible format version
    UnsupportedVersion {
        path: PathBuf,
        version: u32,
    },

    /// The layout tag stored in the pool differs from the one requested
    LayoutMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// The layout tag does not fit into the pool header
    LayoutTooLong {
        len: usize,
        max: usize,
    },

    /// The root object stored in the pool has a different type
    RootMismatch {
        path: PathBuf,
        expected_type: u32,
        found_type: u32,
    },

    /// Checksum verification failed
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted data
        offset: u64,
    },

    /// The pool file is structurally damaged
    PoolCorrupted {
        path: PathBuf,
        reason: String,
    },

    /// Undo log entry inside the committed range cannot be decoded
    LogCorrupted {
        /// Pool file holding the log
        path: PathBuf,
        /// Byte offset of the bad entry within the pool
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// The undo log cannot hold another snapshot
    LogFull {
        requested_bytes: u64,
        available_bytes: u64,
    },

    /// Requested pool size is below what the layout needs
    PoolTooSmall {
        requested_bytes: u64,
        minimum_bytes: u64,
    },

    /// Pool configuration failed validation
    InvalidConfig {
        reason: String,
    },

    /// No run of free blocks is large enough for the allocation
    OutOfSpace {
        requested_bytes: u64,
        free_blocks: u64,
    },

    /// A persistent pointer does not name a live object
    InvalidPointer {
        offset: u64,
        reason: String,
    },

    /// A persistent pointer names an object of another type
    TypeMismatch {
        offset: u64,
        expected: u32,
        found: u32,
    },

    /// Dereference of a null persistent pointer
    NullPointer,

    /// The object was already freed in this transaction
    DoubleFree {
        offset: u64,
    },

    /// Index past the end of a persistent vector
    IndexOutOfBounds {
        index: usize,
        len: usize,
    },

    /// Stored bytes could not be decoded into the requested type
    Decode {
        type_id: u32,
        reason: String,
    },

    /// A transaction body asked for its changes to be rolled back
    Aborted {
        reason: String,
    },
}

impl PoolError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error, what: &str) -> Self {
        PoolError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// Build an `Aborted` error, the usual way for a body to request rollback.
    pub fn aborted(reason: impl Into<String>) -> Self {
        PoolError::Aborted { reason: reason.into() }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            PoolError::NotAPool { path, found_bytes } => {
                write!(f, "{} is not a pool file: found magic {:02x?}", path.display(), found_bytes)
            }

            PoolError::UnsupportedVersion { path, version } => {
                write!(f, "Pool {} has unsupported format version {}", path.display(), version)
            }

            PoolError::LayoutMismatch { path, expected, found } => {
                write!(f, "Pool {} has layout {:?}, expected {:?}", path.display(), found, expected)
            }

            PoolError::LayoutTooLong { len, max } => {
                write!(f, "Layout tag is {} bytes, limit is {} bytes", len, max)
            }

            PoolError::RootMismatch { path, expected_type, found_type } => {
                write!(f, "Root object in {} has type 0x{:08x}, expected 0x{:08x}",
                       path.display(), found_type, expected_type)
            }

            PoolError::ChecksumMismatch { path, expected, actual, offset } => {
                write!(f, "Checksum mismatch in {} at offset {}: expected 0x{:08x}, got 0x{:08x}",
                       path.display(), offset, expected, actual)
            }

            PoolError::PoolCorrupted { path, reason } => {
                write!(f, "Pool {} is corrupted: {}", path.display(), reason)
            }

            PoolError::LogCorrupted { path, offset, reason } => {
                write!(f, "Undo log corrupted in {} at offset {}: {}", path.display(), offset, reason)
            }

            PoolError::LogFull { requested_bytes, available_bytes } => {
                write!(f, "Undo log full: snapshot needs {} bytes, {} bytes left",
                       requested_bytes, available_bytes)
            }

            PoolError::PoolTooSmall { requested_bytes, minimum_bytes } => {
                write!(f, "Pool size {} bytes is below the minimum of {} bytes",
                       requested_bytes, minimum_bytes)
            }

            PoolError::InvalidConfig { reason } => {
                write!(f, "Invalid pool configuration: {}", reason)
            }

            PoolError::OutOfSpace { requested_bytes, free_blocks } => {
                write!(f, "Out of pool space: cannot allocate {} bytes ({} free blocks)",
                       requested_bytes, free_blocks)
            }

            PoolError::InvalidPointer { offset, reason } => {
                write!(f, "Invalid persistent pointer 0x{:x}: {}", offset, reason)
            }

            PoolError::TypeMismatch { offset, expected, found } => {
                write!(f, "Object at 0x{:x} has type 0x{:08x}, expected 0x{:08x}",
                       offset, found, expected)
            }

            PoolError::NullPointer => write!(f, "Dereference of a null persistent pointer"),

            PoolError::DoubleFree { offset } => {
                write!(f, "Object at 0x{:x} freed twice in one transaction", offset)
            }

            PoolError::IndexOutOfBounds { index, len } => {
                write!(f, "Index {} out of bounds for persistent vector of length {}", index, len)
            }

            PoolError::Decode { type_id, reason } => {
                write!(f, "Cannot decode object of type 0x{:08x}: {}", type_id, reason)
            }

            PoolError::Aborted { reason } => write!(f, "Transaction aborted: {}", reason),
        }
    }
}

impl Error for PoolError {}

/// Convert std::io::Error to PoolError::Io
impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;
