//! Configuration schema for doccache
//!
//! Configuration is stored at `~/.config/doccache/config.toml`

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache settings
    pub cache: CacheConfig,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Filter directive for doccache's own events ("warn", "info", "debug", ...)
    pub log_level: String,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            log_format: "text".to_string(),
        }
    }
}

/// What happens when a document is requested but cannot be read from disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationPolicy {
    /// Always call the backend's `open`; a missing file is an open error
    MustExist,
    /// Missing or zero-length files become a new empty document
    #[default]
    CreateIfMissing,
    /// Like `CreateIfMissing`, and unreadable files are replaced as well
    RecreateOnError,
}

/// What leaving a scoped acquisition does with the loaded document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Save pending changes, then release the handle
    Close,
    /// Save pending changes and keep the handle loaded for the next caller
    #[default]
    Flush,
    /// Keep the handle and its pending changes resident until the entry
    /// leaves the cache
    Defer,
}

/// What leaving a scoped acquisition does when the body failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Release exactly as on success
    #[default]
    Flush,
    /// Drop the handle without saving; the next caller reloads from disk
    Discard,
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached documents
    pub max_size: usize,

    /// Seconds since last access before an entry expires (0 = never)
    pub max_age_secs: u64,

    /// Handling of missing or unreadable files
    pub creation: CreationPolicy,

    /// Behavior when a scoped acquisition ends normally
    pub release: ReleasePolicy,

    /// Behavior when a scoped acquisition ends with an error
    pub on_error: ErrorPolicy,

    /// Reload clean documents whose file changed on disk since loading
    pub detect_external_changes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_age_secs: 300,
            creation: CreationPolicy::default(),
            release: ReleasePolicy::default(),
            on_error: ErrorPolicy::default(),
            detect_external_changes: true,
        }
    }
}

impl CacheConfig {
    /// Expiration threshold, `None` when expiration is disabled
    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }

    /// Store `age` in whole seconds, rounding a non-zero age up so it never
    /// reads back as disabled
    pub fn set_max_age(&mut self, age: Duration) {
        let secs = age.as_secs();
        self.max_age_secs = if age.subsec_nanos() > 0 { secs + 1 } else { secs };
    }

    /// Reject settings the cache cannot honor
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_size == 0 {
            return Err(CacheError::invalid_setting(
                "max_size",
                "must hold at least one document",
            ));
        }
        Ok(())
    }
}
