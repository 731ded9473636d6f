//! Cache statistics snapshots

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

/// Point-in-time view of a cache
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of documents currently cached
    pub size: usize,

    /// Maximum number of documents before LRU eviction
    pub max_size: usize,

    /// Idle time before expiration, `None` when expiration is disabled
    pub max_age_secs: Option<f64>,

    /// Requests served by an existing entry
    pub hits: u64,

    /// Requests that created a new entry
    pub misses: u64,

    /// Entries removed by capacity or expiration
    pub evictions: u64,

    /// Subset of `evictions` caused by expiration
    pub expirations: u64,

    /// All requests, hits and misses alike
    pub total_accesses: u64,

    /// `hits / (hits + misses)`, 0.0 before the first request
    pub hit_rate: f64,

    /// Eviction flush failures not yet drained
    pub pending_flush_failures: usize,

    /// Per-entry details, least recently used first
    pub contexts: Vec<ContextStats>,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate_of(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Find the entry for a path, in any open mode
    pub fn context(&self, path: &std::path::Path) -> Option<&ContextStats> {
        self.contexts.iter().find(|c| c.path == path)
    }
}

/// Point-in-time view of one cached document
#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub id: Uuid,
    pub path: PathBuf,
    pub read_only: bool,
    pub values_only: bool,
    pub access_count: u64,
    pub is_dirty: bool,
    pub is_loaded: bool,
    /// Scoped acquisitions holding or waiting for the document
    pub busy: u32,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub age_secs: f64,
    pub idle_secs: f64,
}
