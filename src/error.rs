//! Error types for doccache
//!
//! All modules use `CacheResult<T>` as their return type.

use crate::context::ResourceKey;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for doccache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Error reported by a [`DocumentBackend`](crate::backend::DocumentBackend)
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// All errors that can occur in doccache
#[derive(Error, Debug)]
pub enum CacheError {
    // Document lifecycle errors
    #[error("Failed to open document {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: BackendError,
    },

    #[error("Cannot {operation} read-only document {path}")]
    ReadOnly {
        path: PathBuf,
        operation: &'static str,
    },

    #[error("Failed to save document {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: BackendError,
    },

    #[error("Context for {0} has left the cache")]
    Retired(PathBuf),

    #[error("{} of {attempted} documents failed to flush", failures.len())]
    PartialFlush {
        attempted: usize,
        failures: Vec<FlushFailure>,
    },

    // Default cache errors
    #[error("Default cache is bound to backend {installed}, not {requested}")]
    BackendMismatch {
        installed: &'static str,
        requested: &'static str,
    },

    #[error("Default cache is already installed with backend {0}")]
    AlreadyInstalled(&'static str),

    // Configuration errors
    #[error("Invalid cache setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl CacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an open error for a document path
    pub fn open(path: impl Into<PathBuf>, source: impl Into<BackendError>) -> Self {
        Self::Open {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Create a save error for a document path
    pub fn save(path: impl Into<PathBuf>, source: impl Into<BackendError>) -> Self {
        Self::Save {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Create an invalid setting error
    pub fn invalid_setting(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            name,
            reason: reason.into(),
        }
    }

    /// Check if retrying the same operation may succeed
    ///
    /// A failed save leaves the document dirty, so a later flush retries it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Save { .. } | Self::Io { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ReadOnly { .. } => Some("Request the document without read_only to modify it"),
            Self::Retired(_) => Some("Acquire the document through the cache again"),
            Self::BackendMismatch { .. } | Self::AlreadyInstalled(_) => {
                Some("Call global::shutdown() before installing a different backend")
            }
            _ => None,
        }
    }
}

/// A document that could not be flushed while leaving the cache
///
/// The handle was still released; only the unsaved changes were lost.
#[derive(Debug)]
pub struct FlushFailure {
    /// Key of the document whose flush failed
    pub key: ResourceKey,

    /// Why the flush failed
    pub error: CacheError,
}

impl std::fmt::Display for FlushFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.key, self.error)
    }
}
