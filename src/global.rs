//! Process-wide default cache
//!
//! Most hosts need exactly one cache. This module keeps it in process state:
//! created on first use, reconfigurable at any time, torn down by
//! [`shutdown`]. Code that needs isolation (tests, multi-tenant hosts)
//! constructs its own [`ResourceCache`] instead.
//!
//! The instance is bound to one backend type. Settings given through
//! [`configure`] or [`apply_config`] before the first use are kept and applied
//! when the cache is created, and survive a [`shutdown`].

use crate::backend::DocumentBackend;
use crate::cache::{CacheStats, FlushReport, ResourceCache};
use crate::config::{apply_env_overrides, CacheConfig};
use crate::context::{ResourceGuard, ResourceKey};
use crate::error::{CacheError, CacheResult};
use parking_lot::Mutex;
use serde_json::json;
use std::any::{type_name, Any};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Backend-independent operations on the installed cache
trait CacheControl: Send + Sync {
    fn configure(&self, max_size: Option<usize>, max_age: Option<Duration>) -> CacheResult<usize>;
    fn reconfigure(&self, config: CacheConfig) -> CacheResult<usize>;
    fn invalidate(&self, key: &ResourceKey) -> CacheResult<bool>;
    fn invalidate_path(&self, path: &Path) -> FlushReport;
    fn clear(&self) -> FlushReport;
    fn stats(&self) -> CacheStats;
}

impl<B: DocumentBackend> CacheControl for ResourceCache<B> {
    fn configure(&self, max_size: Option<usize>, max_age: Option<Duration>) -> CacheResult<usize> {
        ResourceCache::configure(self, max_size, max_age)
    }

    fn reconfigure(&self, config: CacheConfig) -> CacheResult<usize> {
        ResourceCache::reconfigure(self, config)
    }

    fn invalidate(&self, key: &ResourceKey) -> CacheResult<bool> {
        ResourceCache::invalidate(self, key)
    }

    fn invalidate_path(&self, path: &Path) -> FlushReport {
        ResourceCache::invalidate_path(self, path)
    }

    fn clear(&self) -> FlushReport {
        ResourceCache::clear(self)
    }

    fn stats(&self) -> CacheStats {
        ResourceCache::stats(self)
    }
}

/// The installed cache, viewed both ways
struct Installed {
    control: Arc<dyn CacheControl>,
    any: Arc<dyn Any + Send + Sync>,
    backend: &'static str,
}

struct DefaultState {
    installed: Option<Installed>,
    /// Settings for the next instance; `None` until first read
    settings: Option<CacheConfig>,
    /// Exact expiration from [`configure`]; `settings` holds it in whole seconds
    max_age: Option<Duration>,
}

static DEFAULT: Mutex<DefaultState> = Mutex::new(DefaultState {
    installed: None,
    settings: None,
    max_age: None,
});

impl DefaultState {
    /// Settings for a new instance: defaults plus `DOCCACHE_*` overrides
    fn settings(&mut self) -> CacheResult<&mut CacheConfig> {
        let config = match self.settings.take() {
            Some(config) => config,
            None => {
                let mut config = CacheConfig::default();
                apply_env_overrides(&mut config)?;
                config.validate()?;
                config
            }
        };
        Ok(self.settings.insert(config))
    }

    fn install<B: DocumentBackend>(&mut self, backend: B) -> CacheResult<Arc<ResourceCache<B>>> {
        let config = self.settings()?.clone();
        let cache = Arc::new(ResourceCache::new(backend, config)?);
        if let Some(age) = self.max_age {
            cache.configure(None, Some(age))?;
        }
        self.installed = Some(Installed {
            control: Arc::clone(&cache) as Arc<dyn CacheControl>,
            any: Arc::clone(&cache) as Arc<dyn Any + Send + Sync>,
            backend: type_name::<B>(),
        });
        info!("Installed default document cache ({})", type_name::<B>());
        Ok(cache)
    }
}

fn control() -> Option<Arc<dyn CacheControl>> {
    DEFAULT
        .lock()
        .installed
        .as_ref()
        .map(|installed| Arc::clone(&installed.control))
}

/// Install the default cache with an explicit backend instance
pub fn install<B: DocumentBackend>(backend: B) -> CacheResult<Arc<ResourceCache<B>>> {
    let mut state = DEFAULT.lock();
    if let Some(installed) = &state.installed {
        return Err(CacheError::AlreadyInstalled(installed.backend));
    }
    state.install(backend)
}

/// Get the default cache, creating it with `B::default()` on first use
pub fn default_cache<B: DocumentBackend + Default>() -> CacheResult<Arc<ResourceCache<B>>> {
    let mut state = DEFAULT.lock();
    if let Some(installed) = &state.installed {
        return Arc::clone(&installed.any)
            .downcast::<ResourceCache<B>>()
            .map_err(|_| CacheError::BackendMismatch {
                installed: installed.backend,
                requested: type_name::<B>(),
            });
    }
    state.install(B::default())
}

/// Whether a default cache currently exists
pub fn is_installed() -> bool {
    DEFAULT.lock().installed.is_some()
}

/// Pin, load and lock a document in the default cache
pub fn acquire<B: DocumentBackend + Default>(key: &ResourceKey) -> CacheResult<ResourceGuard<B>> {
    default_cache::<B>()?.acquire(key)
}

/// Run `body` with a document from the default cache
///
/// See [`ResourceCache::with_resource`].
pub fn with_resource<B, T, E, F>(key: &ResourceKey, body: F) -> Result<T, E>
where
    B: DocumentBackend + Default,
    F: FnOnce(&mut ResourceGuard<B>) -> Result<T, E>,
    E: From<CacheError>,
{
    let cache = default_cache::<B>()?;
    cache.with_resource(key, body)
}

/// Remove one entry from the default cache, flushing it
///
/// Returns `false` when the entry or the cache does not exist.
pub fn invalidate(key: &ResourceKey) -> CacheResult<bool> {
    match control() {
        Some(cache) => cache.invalidate(key),
        None => Ok(false),
    }
}

/// Remove every open mode of `path` from the default cache
pub fn invalidate_path(path: impl AsRef<Path>) -> FlushReport {
    match control() {
        Some(cache) => cache.invalidate_path(path.as_ref()),
        None => FlushReport::default(),
    }
}

/// Flush and close every document; the cache stays installed
pub fn clear_all() -> FlushReport {
    match control() {
        Some(cache) => cache.clear(),
        None => FlushReport::default(),
    }
}

/// Flush and close every document and drop the default cache
///
/// The next use creates a fresh instance with the current settings and zeroed
/// counters. Callers still holding an `Arc` to the old instance keep a working
/// but detached cache.
pub fn shutdown() -> FlushReport {
    let installed = DEFAULT.lock().installed.take();
    let Some(installed) = installed else {
        return FlushReport::default();
    };

    let report = installed.control.clear();
    for failure in &report.failures {
        error!("Shutdown lost changes to {}", failure);
    }
    debug!(
        "Default document cache shut down ({} documents closed)",
        report.attempted
    );
    report
}

/// Change capacity and/or expiration of the default cache
///
/// Applies to the installed instance and to any instance created later.
/// Returns the number of entries evicted by a shrink.
pub fn configure(max_size: Option<usize>, max_age: Option<Duration>) -> CacheResult<usize> {
    let cache = {
        let mut state = DEFAULT.lock();
        let mut settings = state.settings()?.clone();
        if let Some(size) = max_size {
            settings.max_size = size;
        }
        if let Some(age) = max_age {
            settings.set_max_age(age);
        }
        settings.validate()?;
        state.settings = Some(settings);
        if max_age.is_some() {
            state.max_age = max_age;
        }
        state
            .installed
            .as_ref()
            .map(|installed| Arc::clone(&installed.control))
    };

    match cache {
        Some(cache) => cache.configure(max_size, max_age),
        None => Ok(0),
    }
}

/// Replace every setting of the default cache, e.g. from a loaded [`Config`]
///
/// [`Config`]: crate::config::Config
pub fn apply_config(config: CacheConfig) -> CacheResult<usize> {
    config.validate()?;
    let cache = {
        let mut state = DEFAULT.lock();
        state.settings = Some(config.clone());
        state.max_age = None;
        state
            .installed
            .as_ref()
            .map(|installed| Arc::clone(&installed.control))
    };

    match cache {
        Some(cache) => cache.reconfigure(config),
        None => Ok(0),
    }
}

/// Statistics of the default cache
///
/// Before the first use this reports an empty cache with the pending
/// settings.
pub fn stats() -> CacheResult<CacheStats> {
    if let Some(cache) = control() {
        return Ok(cache.stats());
    }

    let mut state = DEFAULT.lock();
    let exact = state.max_age;
    let settings = state.settings()?;
    let max_age = match exact {
        Some(age) => (!age.is_zero()).then_some(age),
        None => settings.max_age(),
    };
    Ok(CacheStats {
        max_size: settings.max_size,
        max_age_secs: max_age.map(|age| age.as_secs_f64()),
        ..Default::default()
    })
}

/// JSON snapshot for an operational status endpoint
pub fn status() -> CacheResult<serde_json::Value> {
    let backend = DEFAULT
        .lock()
        .installed
        .as_ref()
        .map(|installed| installed.backend);
    let stats = stats()?;

    Ok(json!({
        "installed": backend.is_some(),
        "backend": backend,
        "cache": serde_json::to_value(&stats)?,
    }))
}
