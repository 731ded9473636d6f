//! Document library seam
//!
//! The cache never parses documents itself. A [`DocumentBackend`] turns a
//! path into a loaded handle and persists it again; everything else in this
//! crate only moves handles between lifecycle states.

use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a document is opened
///
/// Part of the cache key: the same file opened read-only and writable are two
/// separate entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpenMode {
    /// Open without write access; saving or mutating is an error
    pub read_only: bool,

    /// Load computed values instead of formulas
    pub values_only: bool,
}

impl OpenMode {
    /// Writable, formulas preserved
    pub const WRITABLE: Self = Self {
        read_only: false,
        values_only: false,
    };

    /// Read-only, formulas preserved
    pub const READ_ONLY: Self = Self {
        read_only: true,
        values_only: false,
    };
}

/// Loads, persists and releases documents for the cache
///
/// Implementations are shared across threads. `close` consumes the handle, so
/// a handle can never be closed twice.
pub trait DocumentBackend: Send + Sync + 'static {
    /// Loaded document
    type Handle: Send + 'static;

    /// Load an existing document from `path`
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::Handle, BackendError>;

    /// Synthesize a new empty document
    fn create(&self, mode: OpenMode) -> Result<Self::Handle, BackendError>;

    /// Persist `handle` to `path`
    fn save(&self, handle: &Self::Handle, path: &Path) -> Result<(), BackendError>;

    /// Release the resources held by `handle`
    fn close(&self, handle: Self::Handle);
}
