//! Cache keys

use crate::backend::OpenMode;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of a cached document: canonical path plus open mode
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceKey {
    path: PathBuf,
    mode: OpenMode,
}

impl ResourceKey {
    /// Build a key, resolving `path` to an absolute canonical form
    pub fn new(path: impl AsRef<Path>, mode: OpenMode) -> Self {
        Self {
            path: canonical_path(path.as_ref()),
            mode,
        }
    }

    /// Key for a writable document
    pub fn writable(path: impl AsRef<Path>) -> Self {
        Self::new(path, OpenMode::WRITABLE)
    }

    /// Key for a read-only document
    pub fn read_only(path: impl AsRef<Path>) -> Self {
        Self::new(path, OpenMode::READ_ONLY)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.mode.read_only
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.path.display(),
            if self.mode.read_only { "ro" } else { "rw" },
            if self.mode.values_only { "values" } else { "formulas" }
        )
    }
}

/// Resolve `path` the way the filesystem sees it
///
/// Files that do not exist yet keep their name under the canonical parent, so
/// a document created later maps to the same key.
pub fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }

    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        if let Ok(resolved) = parent.canonicalize() {
            return resolved.join(name);
        }
    }

    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
