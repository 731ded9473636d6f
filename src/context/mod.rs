//! Per-document lifecycle: lazy load, dirty tracking, save and close
//!
//! A [`ResourceContext`] owns at most one loaded handle for one
//! [`ResourceKey`]. Load, save and close run under the context's own lock, so
//! two callers racing on the same key never open the document twice, while
//! callers on different keys never wait for each other.
//!
//! # Entry States
//!
//! | State | Handle | Description |
//! |-------|--------|-------------|
//! | Absent | none | Created, not yet loaded, or closed |
//! | Loading | none | First acquirer holds the lock and is opening |
//! | Loaded | some | Clean or dirty, reusable by later acquirers |
//! | Closing | some | Flushing before the handle is released |
//!
//! Loading and Closing are only observable as a blocked lock.

mod guard;
mod key;

pub use guard::ResourceGuard;
pub use key::{canonical_path, ResourceKey};

pub(crate) use guard::run_scoped;

use crate::backend::DocumentBackend;
use crate::config::{CacheConfig, CreationPolicy, ErrorPolicy, ReleasePolicy};
use crate::error::{CacheError, CacheResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Busy-count value of a context that has left its cache
const RETIRED: u32 = u32::MAX;

/// Result of a save request that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The backend persisted the document
    Saved,
    /// Nothing to save: the document was never loaded or is closed
    NotLoaded,
    /// Nothing to save: no changes since the last save
    Clean,
}

impl SaveOutcome {
    pub fn is_noop(&self) -> bool {
        !matches!(self, Self::Saved)
    }
}

/// State guarded by the per-entry lock
pub(crate) struct HandleSlot<H> {
    handle: Option<H>,
    loaded_mtime: Option<SystemTime>,
}

#[derive(Clone, Copy)]
struct AccessStamp {
    at: Instant,
    wall: DateTime<Utc>,
}

impl AccessStamp {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// Lifecycle wrapper around one document handle
pub struct ResourceContext<B: DocumentBackend> {
    id: Uuid,
    key: ResourceKey,
    backend: Arc<B>,
    creation: CreationPolicy,
    detect_external_changes: bool,
    slot: Arc<Mutex<HandleSlot<B::Handle>>>,
    loaded: AtomicBool,
    dirty: AtomicBool,
    busy: AtomicU32,
    detached: AtomicBool,
    access_count: AtomicU64,
    created: AccessStamp,
    last_access: Mutex<AccessStamp>,
}

impl<B: DocumentBackend> ResourceContext<B> {
    /// Create an unloaded context using the default cache policies
    pub fn new(backend: Arc<B>, key: ResourceKey) -> Self {
        let defaults = CacheConfig::default();
        let created = AccessStamp::now();
        Self {
            id: Uuid::new_v4(),
            key,
            backend,
            creation: defaults.creation,
            detect_external_changes: defaults.detect_external_changes,
            slot: Arc::new(Mutex::new(HandleSlot {
                handle: None,
                loaded_mtime: None,
            })),
            loaded: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            busy: AtomicU32::new(0),
            detached: AtomicBool::new(false),
            access_count: AtomicU64::new(0),
            created,
            last_access: Mutex::new(created),
        }
    }

    /// Create a context configured like a cache entry
    pub(crate) fn for_cache(backend: Arc<B>, key: ResourceKey, config: &CacheConfig) -> Self {
        Self::new(backend, key)
            .with_creation(config.creation)
            .with_change_detection(config.detect_external_changes)
    }

    /// Set how missing or unreadable files are handled
    pub fn with_creation(mut self, policy: CreationPolicy) -> Self {
        self.creation = policy;
        self
    }

    /// Enable or disable reloading of documents modified on disk
    pub fn with_change_detection(mut self, enabled: bool) -> Self {
        self.detect_external_changes = enabled;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        self.key.path()
    }

    pub fn is_read_only(&self) -> bool {
        self.key.is_read_only()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Acquire)
    }

    /// Number of scoped acquisitions in progress or waiting for the lock
    pub fn busy_count(&self) -> u32 {
        match self.busy.load(Ordering::Acquire) {
            RETIRED => 0,
            n => n,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy_count() > 0
    }

    /// Whether this context has left its cache for good
    pub fn is_retired(&self) -> bool {
        self.busy.load(Ordering::Acquire) == RETIRED
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created.wall
    }

    pub fn last_accessed_at(&self) -> DateTime<Utc> {
        self.last_access.lock().wall
    }

    /// Monotonic time of the last acquisition
    pub fn last_access(&self) -> Instant {
        self.last_access.lock().at
    }

    /// Time since the context was created
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created.at)
    }

    /// Time since the last acquisition
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access())
    }

    /// Whether the last acquisition is more than `max_age` before `now`
    pub fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        self.idle(now) > max_age
    }

    /// Record an acquisition
    pub(crate) fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::AcqRel);
        *self.last_access.lock() = AccessStamp::now();
    }

    /// Flag the document as modified
    pub fn mark_dirty(&self) -> CacheResult<()> {
        if self.is_read_only() {
            return Err(CacheError::ReadOnly {
                path: self.path().to_path_buf(),
                operation: "modify",
            });
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Enter a scoped acquisition, loading the document if needed
    ///
    /// Blocks while another caller holds this context. Acquiring the same
    /// context twice on one thread deadlocks.
    pub fn acquire(self: &Arc<Self>, release: ReleasePolicy) -> CacheResult<ResourceGuard<B>> {
        if !self.try_pin() {
            return Err(CacheError::Retired(self.path().to_path_buf()));
        }
        self.enter_pinned(release, ErrorPolicy::Flush)
    }

    /// Run `body` inside a scoped acquisition
    ///
    /// The guard is released on every exit path, including an `Err` from
    /// `body`.
    pub fn scoped<T, E, F>(self: &Arc<Self>, release: ReleasePolicy, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut ResourceGuard<B>) -> Result<T, E>,
        E: From<CacheError>,
    {
        let guard = self.acquire(release)?;
        run_scoped(guard, body)
    }

    /// Lock and load a context whose pin the caller already holds
    pub(crate) fn enter_pinned(
        self: &Arc<Self>,
        release: ReleasePolicy,
        on_error: ErrorPolicy,
    ) -> CacheResult<ResourceGuard<B>> {
        let mut slot = self.slot.lock_arc();
        if let Err(e) = self.ensure_loaded(&mut slot) {
            drop(slot);
            if let Err(close_err) = self.release_pin() {
                warn!("Closing {} after failed load: {}", self.key, close_err);
            }
            return Err(e);
        }
        self.touch();
        Ok(ResourceGuard::new(Arc::clone(self), slot, release, on_error))
    }

    /// Persist pending changes
    pub fn save(&self) -> CacheResult<SaveOutcome> {
        if self.is_read_only() {
            return Err(self.read_only_save());
        }
        let mut slot = self.slot.lock();
        self.save_locked(&mut slot)
    }

    /// Persist the document to another path
    ///
    /// The context keeps its own path, so pending changes stay pending unless
    /// `path` resolves to it.
    pub fn save_as(&self, path: impl AsRef<Path>) -> CacheResult<SaveOutcome> {
        let mut slot = self.slot.lock();
        self.save_as_locked(&mut slot, path.as_ref())
    }

    /// Release the handle, saving first when `flush_if_dirty` is set
    ///
    /// The handle is released even if the save fails; the save error is
    /// returned afterwards and the unsaved changes are lost.
    pub fn close(&self, flush_if_dirty: bool) -> CacheResult<()> {
        let mut slot = self.slot.lock();
        self.close_locked(&mut slot, flush_if_dirty)
    }

    pub(crate) fn try_pin(&self) -> bool {
        self.busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != RETIRED).then(|| n + 1)
            })
            .is_ok()
    }

    /// Drop one pin; returns the remaining busy count
    fn unpin(&self) -> u32 {
        let previous = self.busy.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0 && previous != RETIRED, "unpin without pin");
        previous - 1
    }

    /// Mark an idle context as out of the cache; fails while it is busy
    pub(crate) fn try_retire(&self) -> bool {
        self.busy
            .compare_exchange(0, RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Request a close with flush once the last pin is released
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Release one pin and finish a deferred close if it was the last
    pub(crate) fn release_pin(&self) -> CacheResult<()> {
        if self.unpin() == 0 && self.is_detached() && self.try_retire() {
            debug!("Closing detached context {}", self.key);
            return self.close(true);
        }
        Ok(())
    }

    fn ensure_loaded(&self, slot: &mut HandleSlot<B::Handle>) -> CacheResult<()> {
        if slot.handle.is_some() {
            if !self.stale_on_disk(slot) {
                return Ok(());
            }
            debug!("{} changed on disk, reloading", self.key);
            self.release_handle(slot);
        }

        // Marks made before loading refer to no document
        self.dirty.store(false, Ordering::Release);
        let handle = self.load()?;
        slot.handle = Some(handle);
        slot.loaded_mtime = modified_time(self.path());
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// A clean document held only by the current acquirer whose file changed
    fn stale_on_disk(&self, slot: &HandleSlot<B::Handle>) -> bool {
        if !self.detect_external_changes || self.is_dirty() || self.busy_count() > 1 {
            return false;
        }
        match (slot.loaded_mtime, modified_time(self.path())) {
            (Some(loaded), Some(current)) => loaded != current,
            _ => false,
        }
    }

    fn load(&self) -> CacheResult<B::Handle> {
        let path = self.path();
        let mode = self.key.mode();

        if self.creation == CreationPolicy::MustExist {
            debug!("Loading document: {}", path.display());
            return self
                .backend
                .open(path, mode)
                .map_err(|e| CacheError::open(path, e));
        }

        let has_content = fs::metadata(path)
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false);
        if !has_content {
            debug!("Creating new document: {}", path.display());
            return self.create();
        }

        debug!("Loading document: {}", path.display());
        match self.backend.open(path, mode) {
            Ok(handle) => Ok(handle),
            Err(e) if self.creation == CreationPolicy::RecreateOnError => {
                warn!("Could not load {}: {}; starting a new document", path.display(), e);
                self.create()
            }
            Err(e) => Err(CacheError::open(path, e)),
        }
    }

    fn create(&self) -> CacheResult<B::Handle> {
        let handle = self
            .backend
            .create(self.key.mode())
            .map_err(|e| CacheError::open(self.path(), e))?;
        // A synthesized document only exists in memory until saved
        if !self.is_read_only() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(handle)
    }

    pub(crate) fn handle_ref<'a>(&self, slot: &'a HandleSlot<B::Handle>) -> &'a B::Handle {
        slot.handle
            .as_ref()
            .expect("guarded context is always loaded")
    }

    pub(crate) fn handle_mut<'a>(
        &self,
        slot: &'a mut HandleSlot<B::Handle>,
    ) -> CacheResult<&'a mut B::Handle> {
        self.mark_dirty()?;
        Ok(slot
            .handle
            .as_mut()
            .expect("guarded context is always loaded"))
    }

    fn read_only_save(&self) -> CacheError {
        CacheError::ReadOnly {
            path: self.path().to_path_buf(),
            operation: "save",
        }
    }

    pub(crate) fn save_locked(&self, slot: &mut HandleSlot<B::Handle>) -> CacheResult<SaveOutcome> {
        if self.is_read_only() {
            return Err(self.read_only_save());
        }
        let Some(handle) = slot.handle.as_ref() else {
            return Ok(SaveOutcome::NotLoaded);
        };
        if !self.is_dirty() {
            return Ok(SaveOutcome::Clean);
        }

        self.persist(handle, self.path())?;
        self.dirty.store(false, Ordering::Release);
        slot.loaded_mtime = modified_time(self.path());
        Ok(SaveOutcome::Saved)
    }

    pub(crate) fn save_as_locked(
        &self,
        slot: &mut HandleSlot<B::Handle>,
        path: &Path,
    ) -> CacheResult<SaveOutcome> {
        if self.is_read_only() {
            return Err(self.read_only_save());
        }
        let target = canonical_path(path);
        if target == self.path() {
            return self.save_locked(slot);
        }
        let Some(handle) = slot.handle.as_ref() else {
            return Ok(SaveOutcome::NotLoaded);
        };
        self.persist(handle, &target)?;
        Ok(SaveOutcome::Saved)
    }

    /// Save pending changes of a writable document; read-only documents have
    /// none
    pub(crate) fn flush_locked(&self, slot: &mut HandleSlot<B::Handle>) -> CacheResult<()> {
        if self.is_read_only() {
            return Ok(());
        }
        self.save_locked(slot).map(|_| ())
    }

    pub(crate) fn close_locked(
        &self,
        slot: &mut HandleSlot<B::Handle>,
        flush_if_dirty: bool,
    ) -> CacheResult<()> {
        let flushed = if flush_if_dirty {
            self.flush_locked(slot)
        } else {
            Ok(())
        };
        if let Err(e) = &flushed {
            warn!("Releasing {} with unsaved changes: {}", self.key, e);
        }
        self.release_handle(slot);
        flushed
    }

    /// Close the handle without saving
    pub(crate) fn release_handle(&self, slot: &mut HandleSlot<B::Handle>) {
        if let Some(handle) = slot.handle.take() {
            self.backend.close(handle);
            debug!("Closed document: {}", self.path().display());
        }
        slot.loaded_mtime = None;
        self.loaded.store(false, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
    }

    fn persist(&self, handle: &B::Handle, path: &Path) -> CacheResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    CacheError::io(format!("creating directory {}", parent.display()), e)
                })?;
            }
        }

        debug!("Saving document: {}", path.display());
        self.backend
            .save(handle, path)
            .map_err(|e| CacheError::save(path, e))
    }
}

impl<B: DocumentBackend> fmt::Debug for ResourceContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceContext")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("loaded", &self.is_loaded())
            .field("dirty", &self.is_dirty())
            .field("busy", &self.busy_count())
            .field("access_count", &self.access_count())
            .finish()
    }
}

impl<B: DocumentBackend> Drop for ResourceContext<B> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.handle.is_some() {
            if let Err(e) = self.close_locked(&mut slot, true) {
                error!("Dropped {} with unsaved changes: {}", self.key, e);
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}
