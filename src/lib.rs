//! doccache - Lifecycle cache for expensive stateful documents
//!
//! Keeps spreadsheet workbooks (or any document a [`DocumentBackend`] can
//! open and save) loaded between operations, with LRU and idle-time eviction,
//! dirty tracking with deferred saves, and at most one loaded instance per
//! file and open mode.

pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod global;
pub mod telemetry;

pub use backend::{DocumentBackend, OpenMode};
pub use cache::{CacheStats, ContextStats, FlushReport, ResourceCache};
pub use config::{CacheConfig, Config, ConfigManager, CreationPolicy, ErrorPolicy, ReleasePolicy};
pub use context::{ResourceContext, ResourceGuard, ResourceKey, SaveOutcome};
pub use error::{BackendError, CacheError, CacheResult, FlushFailure};
