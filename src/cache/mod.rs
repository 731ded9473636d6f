//! Bounded document cache with LRU and TTL eviction
//!
//! Keeps loaded documents resident between operations so repeated work on
//! the same file skips the open/parse/save cycle.
//!
//! # Locking
//!
//! | Lock | Scope | Held during backend I/O |
//! |------|-------|-------------------------|
//! | cache | entry map, LRU queue, counters | never |
//! | context | one document's handle | yes |
//!
//! Entries are pinned busy under the cache lock before their context lock is
//! taken, and eviction retires only unpinned entries under the same lock, so
//! an entry is never closed while a caller is loading or using it. Evicted
//! entries are flushed and closed after the cache lock is dropped.

pub mod stats;

pub use stats::{CacheStats, ContextStats};

use crate::backend::DocumentBackend;
use crate::config::{CacheConfig, ErrorPolicy, ReleasePolicy};
use crate::context::{canonical_path, run_scoped, ResourceContext, ResourceGuard, ResourceKey};
use crate::error::{CacheError, CacheResult, FlushFailure};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Eviction flush failures kept for [`ResourceCache::drain_flush_failures`]
const MAX_PENDING_FAILURES: usize = 64;

/// Outcome of closing several documents at once
///
/// Every close is attempted; failures are collected instead of stopping the
/// sweep.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Documents closed, including the failed ones
    pub attempted: usize,

    /// Documents whose flush failed before their handle was released
    pub failures: Vec<FlushFailure>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, key: &ResourceKey, outcome: CacheResult<()>) {
        self.attempted += 1;
        if let Err(error) = outcome {
            self.failures.push(FlushFailure {
                key: key.clone(),
                error,
            });
        }
    }

    /// Number of documents closed, or every failure as one error
    pub fn into_result(self) -> CacheResult<usize> {
        if self.failures.is_empty() {
            Ok(self.attempted)
        } else {
            Err(CacheError::PartialFlush {
                attempted: self.attempted,
                failures: self.failures,
            })
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    total_accesses: u64,
}

/// Internal cache state
struct CacheState<B: DocumentBackend> {
    /// Map from key to context
    entries: HashMap<ResourceKey, Arc<ResourceContext<B>>>,

    /// LRU queue (most recently used at back, least recently used at front)
    lru_queue: VecDeque<ResourceKey>,

    config: CacheConfig,

    /// Expiration threshold; finer-grained than `config.max_age_secs`
    max_age: Option<Duration>,

    counters: Counters,

    flush_failures: VecDeque<FlushFailure>,
}

impl<B: DocumentBackend> CacheState<B> {
    /// Move a key to the back of the LRU queue (mark as most recently used)
    fn touch(&mut self, key: &ResourceKey) {
        self.lru_queue.retain(|k| k != key);
        self.lru_queue.push_back(key.clone());
    }

    fn remove_entry(&mut self, key: &ResourceKey) -> Option<Arc<ResourceContext<B>>> {
        let context = self.entries.remove(key)?;
        self.lru_queue.retain(|k| k != key);
        Some(context)
    }

    fn is_expired(&self, context: &ResourceContext<B>, now: Instant) -> bool {
        self.max_age
            .is_some_and(|max_age| context.is_expired(now, max_age))
    }

    /// Evict the least recently used idle entry, skipping `protect`
    fn evict_lru(&mut self, protect: Option<&ResourceKey>) -> Option<Arc<ResourceContext<B>>> {
        let victim = self
            .lru_queue
            .iter()
            .filter(|key| Some(*key) != protect)
            .find(|key| self.entries.get(*key).is_some_and(|ctx| ctx.try_retire()))
            .cloned()?;

        let context = self.remove_entry(&victim)?;
        self.counters.evictions += 1;
        debug!("Evicted LRU context: {}", victim);
        Some(context)
    }

    /// Evict idle entries until `room` more fit under `max_size`
    ///
    /// Busy entries are skipped; when only busy entries remain the cache stays
    /// over capacity until they are released.
    fn evict_to_fit(
        &mut self,
        room: usize,
        protect: Option<&ResourceKey>,
    ) -> Vec<Arc<ResourceContext<B>>> {
        let mut victims = Vec::new();
        while self.entries.len() + room > self.config.max_size {
            match self.evict_lru(protect) {
                Some(context) => victims.push(context),
                None => {
                    debug!(
                        "Cache over capacity ({} > {}), remaining entries are busy",
                        self.entries.len() + room,
                        self.config.max_size
                    );
                    break;
                }
            }
        }
        victims
    }

    /// Remove every idle expired entry
    fn take_expired(&mut self, now: Instant) -> Vec<Arc<ResourceContext<B>>> {
        if self.max_age.is_none() {
            return Vec::new();
        }

        let expired: Vec<ResourceKey> = self
            .entries
            .iter()
            .filter(|(_, ctx)| self.is_expired(ctx, now) && ctx.try_retire())
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .iter()
            .filter_map(|key| {
                let context = self.remove_entry(key)?;
                self.counters.evictions += 1;
                self.counters.expirations += 1;
                debug!("Expired context: {}", key);
                Some(context)
            })
            .collect()
    }

    fn insert(&mut self, key: &ResourceKey, context: Arc<ResourceContext<B>>) {
        self.entries.insert(key.clone(), context);
        self.lru_queue.push_back(key.clone());
    }

    /// Install validated settings and evict down to the new capacity
    fn apply(
        &mut self,
        config: CacheConfig,
        max_age: Option<Duration>,
    ) -> Vec<Arc<ResourceContext<B>>> {
        if config.max_size != self.config.max_size {
            info!(
                "Cache size changed from {} to {}",
                self.config.max_size, config.max_size
            );
        }
        if max_age != self.max_age {
            info!("Cache age changed from {:?} to {:?}", self.max_age, max_age);
        }
        self.config = config;
        self.max_age = max_age;
        self.evict_to_fit(0, None)
    }

    fn record_failure(&mut self, failure: FlushFailure) {
        if self.flush_failures.len() == MAX_PENDING_FAILURES {
            self.flush_failures.pop_front();
        }
        self.flush_failures.push_back(failure);
    }
}

/// Thread-safe cache of document contexts
///
/// # Example
///
/// ```ignore
/// let cache = ResourceCache::new(MyBackend::default(), CacheConfig::default())?;
/// let key = ResourceKey::writable("report.xlsx");
///
/// cache.with_resource(&key, |doc| {
///     doc.handle_mut()?.set("A1", "Total");
///     Ok::<_, CacheError>(())
/// })?;
///
/// println!("Hit rate: {:.2}%", cache.stats().hit_rate * 100.0);
/// ```
pub struct ResourceCache<B: DocumentBackend> {
    backend: Arc<B>,
    state: Mutex<CacheState<B>>,
}

impl<B: DocumentBackend> ResourceCache<B> {
    /// Create an empty cache
    pub fn new(backend: B, config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self {
            backend: Arc::new(backend),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                lru_queue: VecDeque::new(),
                max_age: config.max_age(),
                config,
                counters: Counters::default(),
                flush_failures: VecDeque::new(),
            }),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Current settings
    pub fn config(&self) -> CacheConfig {
        self.state.lock().config.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check for an entry without counting an access
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Get the context for `key`, creating it on a miss
    ///
    /// Counts as an acquisition of the context. The context is not pinned, so
    /// acquiring it later fails with [`CacheError::Retired`] if it was evicted
    /// in between; [`acquire`](Self::acquire) avoids that window.
    pub fn get_or_create(&self, key: &ResourceKey) -> Arc<ResourceContext<B>> {
        let (context, _) = self.lookup(key, false);
        context.touch();
        context
    }

    /// Pin, load and lock the document for `key`
    pub fn acquire(&self, key: &ResourceKey) -> CacheResult<ResourceGuard<B>> {
        let (context, (release, on_error)) = self.lookup(key, true);
        match context.enter_pinned(release, on_error) {
            Ok(guard) => Ok(guard),
            Err(e) => {
                if matches!(e, CacheError::Open { .. }) {
                    self.forget_unloaded(key, &context);
                }
                Err(e)
            }
        }
    }

    /// Run `body` with the document for `key`
    ///
    /// The document is released on every exit path per the configured release
    /// and error policies, then entries held over capacity by busy callers are
    /// evicted.
    pub fn with_resource<T, E, F>(&self, key: &ResourceKey, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut ResourceGuard<B>) -> Result<T, E>,
        E: From<CacheError>,
    {
        let guard = self.acquire(key)?;
        let result = run_scoped(guard, body);
        self.enforce_capacity();
        result
    }

    /// Remove the entry for `key`, flushing and closing it
    ///
    /// A busy entry leaves the cache at once but is closed by its last
    /// holder. Returns whether an entry existed.
    pub fn invalidate(&self, key: &ResourceKey) -> CacheResult<bool> {
        let Some(context) = self.state.lock().remove_entry(key) else {
            return Ok(false);
        };
        debug!("Invalidated cache for {}", key);
        retire(&context)?;
        Ok(true)
    }

    /// Remove the entries for `path` in every open mode
    pub fn invalidate_path(&self, path: impl AsRef<Path>) -> FlushReport {
        let path = canonical_path(path.as_ref());
        let removed: Vec<_> = {
            let mut state = self.state.lock();
            let keys: Vec<ResourceKey> = state
                .entries
                .keys()
                .filter(|key| key.path() == path)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| state.remove_entry(key))
                .collect()
        };

        let mut report = FlushReport::default();
        for context in removed {
            debug!("Invalidated cache for {}", context.key());
            report.record(context.key(), retire(&context));
        }
        report
    }

    /// Flush and close every entry
    pub fn clear(&self) -> FlushReport {
        let removed: Vec<_> = {
            let mut state = self.state.lock();
            state.lru_queue.clear();
            state.entries.drain().map(|(_, ctx)| ctx).collect()
        };

        let mut report = FlushReport::default();
        for context in removed {
            report.record(context.key(), retire(&context));
        }
        if !report.is_clean() {
            error!(
                "Cleared cache with {} of {} flushes failing",
                report.failures.len(),
                report.attempted
            );
        } else {
            debug!("Cleared document cache ({} entries)", report.attempted);
        }
        report
    }

    /// Evict every idle entry not accessed within `max_age` of `now`
    pub fn evict_expired(&self, now: Instant) -> usize {
        let victims = self.state.lock().take_expired(now);
        let count = victims.len();
        self.close_victims(victims);
        count
    }

    /// Evict idle entries until the cache fits its capacity
    pub fn enforce_capacity(&self) -> usize {
        let victims = self.state.lock().evict_to_fit(0, None);
        let count = victims.len();
        self.close_victims(victims);
        count
    }

    /// Change capacity and/or expiration
    ///
    /// A zero `max_age` disables expiration. Shrinking below the current size
    /// evicts idle entries right away; returns how many.
    pub fn configure(
        &self,
        max_size: Option<usize>,
        max_age: Option<Duration>,
    ) -> CacheResult<usize> {
        let victims = {
            let mut state = self.state.lock();
            let mut config = state.config.clone();
            let mut threshold = state.max_age;
            if let Some(size) = max_size {
                config.max_size = size;
            }
            if let Some(age) = max_age {
                config.set_max_age(age);
                threshold = (!age.is_zero()).then_some(age);
            }
            config.validate()?;
            state.apply(config, threshold)
        };

        let count = victims.len();
        self.close_victims(victims);
        Ok(count)
    }

    /// Replace all settings, keeping entries and counters
    pub fn reconfigure(&self, config: CacheConfig) -> CacheResult<usize> {
        config.validate()?;
        let victims = {
            let threshold = config.max_age();
            self.state.lock().apply(config, threshold)
        };

        let count = victims.len();
        self.close_victims(victims);
        Ok(count)
    }

    /// Snapshot of counters and entries
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let state = self.state.lock();
        let counters = state.counters;

        let contexts = state
            .lru_queue
            .iter()
            .filter_map(|key| state.entries.get(key))
            .map(|ctx| ContextStats {
                id: ctx.id(),
                path: ctx.path().to_path_buf(),
                read_only: ctx.key().mode().read_only,
                values_only: ctx.key().mode().values_only,
                access_count: ctx.access_count(),
                is_dirty: ctx.is_dirty(),
                is_loaded: ctx.is_loaded(),
                busy: ctx.busy_count(),
                created_at: ctx.created_at(),
                last_accessed_at: ctx.last_accessed_at(),
                age_secs: ctx.age(now).as_secs_f64(),
                idle_secs: ctx.idle(now).as_secs_f64(),
            })
            .collect();

        CacheStats {
            size: state.entries.len(),
            max_size: state.config.max_size,
            max_age_secs: state.max_age.map(|age| age.as_secs_f64()),
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            expirations: counters.expirations,
            total_accesses: counters.total_accesses,
            hit_rate: CacheStats::hit_rate_of(counters.hits, counters.misses),
            pending_flush_failures: state.flush_failures.len(),
            contexts,
        }
    }

    /// Take the flush failures recorded while evicting entries
    pub fn drain_flush_failures(&self) -> Vec<FlushFailure> {
        self.state.lock().flush_failures.drain(..).collect()
    }

    /// Find or create the entry for `key` and update LRU order and counters
    fn lookup(
        &self,
        key: &ResourceKey,
        pin: bool,
    ) -> (Arc<ResourceContext<B>>, (ReleasePolicy, ErrorPolicy)) {
        let now = Instant::now();
        let mut victims = Vec::new();

        let (context, policies) = {
            let mut state = self.state.lock();
            state.counters.total_accesses += 1;

            let cached = state.entries.get(key).cloned();
            let hit = match cached {
                Some(ctx) if state.is_expired(&ctx, now) && ctx.try_retire() => {
                    state.remove_entry(key);
                    state.counters.evictions += 1;
                    state.counters.expirations += 1;
                    debug!("Expired context: {}", key);
                    victims.push(ctx);
                    None
                }
                // Retired contexts leave the map under this lock
                Some(ctx) if pin && !ctx.try_pin() => {
                    state.remove_entry(key);
                    None
                }
                other => other,
            };

            let context = match hit {
                Some(ctx) => {
                    state.counters.hits += 1;
                    state.touch(key);
                    debug!("Cache hit for {}", key);
                    victims.extend(state.evict_to_fit(0, Some(key)));
                    ctx
                }
                None => {
                    state.counters.misses += 1;
                    debug!("Cache miss for {}", key);
                    victims.extend(state.take_expired(now));
                    victims.extend(state.evict_to_fit(1, None));

                    let ctx = Arc::new(ResourceContext::for_cache(
                        Arc::clone(&self.backend),
                        key.clone(),
                        &state.config,
                    ));
                    if pin {
                        ctx.try_pin();
                    }
                    state.insert(key, Arc::clone(&ctx));
                    ctx
                }
            };

            (context, (state.config.release, state.config.on_error))
        };

        self.close_victims(victims);
        (context, policies)
    }

    /// Drop an entry whose load failed so no unloadable context occupies a slot
    fn forget_unloaded(&self, key: &ResourceKey, context: &Arc<ResourceContext<B>>) {
        let mut state = self.state.lock();
        let same = state
            .entries
            .get(key)
            .is_some_and(|cached| Arc::ptr_eq(cached, context));
        if same && !context.is_loaded() && context.try_retire() {
            state.remove_entry(key);
            debug!("Dropped unloadable entry {}", key);
        }
    }

    /// Flush and close contexts that already left the map
    fn close_victims(&self, victims: Vec<Arc<ResourceContext<B>>>) {
        for context in victims {
            if let Err(e) = context.close(true) {
                error!("Failed to flush evicted {}: {}", context.key(), e);
                self.state.lock().record_failure(FlushFailure {
                    key: context.key().clone(),
                    error: e,
                });
            }
        }
    }
}

impl<B: DocumentBackend> Drop for ResourceCache<B> {
    fn drop(&mut self) {
        let report = self.clear();
        for failure in &report.failures {
            error!("Dropping cache lost changes to {}", failure);
        }
    }
}

/// Close a context that left the map now, or on its last release if busy
fn retire<B: DocumentBackend>(context: &ResourceContext<B>) -> CacheResult<()> {
    context.detach();
    if context.try_retire() {
        context.close(true)
    } else {
        debug!("{} is busy; closing on release", context.key());
        Ok(())
    }
}
