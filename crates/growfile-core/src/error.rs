//! Error types for Growfile operations
//!
//! Every fallible store operation reports a `GrowError`. Variants carry the
//! file path and offset where possible so a failed lookup or a corrupt cell
//! can be traced back to the byte that caused it.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Growfile error types with detailed context
#[derive(Debug, Clone)]
pub enum GrowError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred (the staging path for publish failures)
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// No definition with this name exists in the store
    NotFound {
        /// The requested definition name
        name: String,
    },

    /// A definition with this name already exists with a different type
    NameConflict {
        /// The conflicting definition name
        name: String,
        /// Type recorded in the directory
        existing: String,
        /// Type the caller tried to define
        requested: String,
    },

    /// The stored type descriptor disagrees with the requested one
    TypeMismatch {
        /// The definition name
        name: String,
        /// Type recorded in the directory
        stored: String,
        /// Type the caller asked for
        requested: String,
    },

    /// A type descriptor cannot describe a storable value
    InvalidType {
        /// The offending descriptor, rendered
        desc: String,
        /// Why it was rejected
        reason: String,
    },

    /// A definition name is empty or too long
    InvalidName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Writer configuration failed validation
    InvalidConfig {
        /// The failed check
        reason: String,
    },

    /// The allocator could not extend the file
    CapacityExceeded {
        /// The store file
        path: PathBuf,
        /// File size that would have been required
        requested_bytes: u64,
        /// Configured or filesystem limit
        limit_bytes: u64,
    },

    /// A length was set beyond the value's capacity
    LengthOutOfBounds {
        /// Requested length in elements
        length: u64,
        /// Current capacity in elements
        capacity: u64,
    },

    /// Magic bytes not found in the header
    NoMagicFound {
        /// File being opened
        path: PathBuf,
        /// Bytes actually found
        found_bytes: [u8; 4],
    },

    /// Header carries a format version this build cannot read
    UnsupportedVersion {
        /// File being opened
        path: PathBuf,
        /// Version found in the header
        found: u32,
        /// Version this build writes
        expected: u32,
    },

    /// A structural invariant of the file is violated
    Corruption {
        /// File where corruption was detected
        path: PathBuf,
        /// Byte offset of the offending structure
        offset: u64,
        /// Description of the violation
        reason: String,
    },

    /// The store backing a handle has been closed
    Closed {
        /// The closed store file
        path: PathBuf,
    },
}

impl fmt::Display for GrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrowError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            GrowError::NotFound { name } => {
                write!(f, "No definition named '{}'", name)
            }

            GrowError::NameConflict { name, existing, requested } => {
                write!(f, "Definition '{}' already exists as {}, cannot redefine as {}",
                       name, existing, requested)
            }

            GrowError::TypeMismatch { name, stored, requested } => {
                write!(f, "Type mismatch for '{}': stored as {}, requested {}",
                       name, stored, requested)
            }

            GrowError::InvalidType { desc, reason } => {
                write!(f, "Invalid type {}: {}", desc, reason)
            }

            GrowError::InvalidName { name, reason } => {
                write!(f, "Invalid definition name '{}': {}", name, reason)
            }

            GrowError::InvalidConfig { reason } => {
                write!(f, "Invalid configuration: {}", reason)
            }

            GrowError::CapacityExceeded { path, requested_bytes, limit_bytes } => {
                write!(f, "Cannot extend {} to {} bytes (limit {} bytes)",
                       path.display(), requested_bytes, limit_bytes)
            }

            GrowError::LengthOutOfBounds { length, capacity } => {
                write!(f, "Length {} exceeds capacity {}", length, capacity)
            }

            GrowError::NoMagicFound { path, found_bytes } => {
                write!(
                    f,
                    "Magic bytes not found in {}: found {:02x}{:02x}{:02x}{:02x}",
                    path.display(),
                    found_bytes[0],
                    found_bytes[1],
                    found_bytes[2],
                    found_bytes[3]
                )
            }

            GrowError::UnsupportedVersion { path, found, expected } => {
                write!(f, "Unsupported format version {} in {} (expected {})",
                       found, path.display(), expected)
            }

            GrowError::Corruption { path, offset, reason } => {
                write!(f, "Corruption in {} at offset {}: {}", path.display(), offset, reason)
            }

            GrowError::Closed { path } => {
                write!(f, "Store {} is closed", path.display())
            }
        }
    }
}

impl Error for GrowError {}

/// Convert std::io::Error to GrowError::Io
impl From<std::io::Error> for GrowError {
    fn from(err: std::io::Error) -> Self {
        GrowError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl GrowError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io_at(path: impl Into<PathBuf>, err: std::io::Error, what: &str) -> Self {
        GrowError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// Shorthand for a corruption report.
    pub fn corrupt(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        GrowError::Corruption {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }
}

/// Result type alias for Growfile operations
pub type GrowResult<T> = Result<T, GrowError>;
