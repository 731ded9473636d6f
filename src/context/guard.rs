//! Scoped acquisition of a loaded document

use super::{HandleSlot, ResourceContext, ResourceKey, SaveOutcome};
use crate::backend::DocumentBackend;
use crate::config::{ErrorPolicy, ReleasePolicy};
use crate::error::{CacheError, CacheResult};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

/// Exclusive access to a loaded document
///
/// While a guard is alive it holds the context's lock and one busy pin: no
/// other caller can touch the handle and the cache will not evict the entry.
/// Call [`release`](Self::release) to observe flush errors. Dropping the guard
/// releases it as well, but can only log a failure.
pub struct ResourceGuard<B: DocumentBackend> {
    context: Arc<ResourceContext<B>>,
    slot: Option<ArcMutexGuard<RawMutex, HandleSlot<B::Handle>>>,
    release: ReleasePolicy,
    on_error: ErrorPolicy,
}

impl<B: DocumentBackend> ResourceGuard<B> {
    pub(super) fn new(
        context: Arc<ResourceContext<B>>,
        slot: ArcMutexGuard<RawMutex, HandleSlot<B::Handle>>,
        release: ReleasePolicy,
        on_error: ErrorPolicy,
    ) -> Self {
        Self {
            context,
            slot: Some(slot),
            release,
            on_error,
        }
    }

    pub fn context(&self) -> &Arc<ResourceContext<B>> {
        &self.context
    }

    pub fn key(&self) -> &ResourceKey {
        self.context.key()
    }

    /// Read access to the document
    pub fn handle(&self) -> &B::Handle {
        let slot = self.slot.as_ref().expect("guard is live until released");
        self.context.handle_ref(slot)
    }

    /// Write access to the document; marks it dirty
    pub fn handle_mut(&mut self) -> CacheResult<&mut B::Handle> {
        let slot = self.slot.as_mut().expect("guard is live until released");
        self.context.handle_mut(slot)
    }

    /// Flag changes made through interior mutability of the handle
    pub fn mark_dirty(&self) -> CacheResult<()> {
        self.context.mark_dirty()
    }

    pub fn is_dirty(&self) -> bool {
        self.context.is_dirty()
    }

    /// Persist pending changes now instead of on release
    pub fn save(&mut self) -> CacheResult<SaveOutcome> {
        let slot = self.slot.as_mut().expect("guard is live until released");
        self.context.save_locked(slot)
    }

    /// Persist the document to another path
    pub fn save_as(&mut self, path: impl AsRef<Path>) -> CacheResult<SaveOutcome> {
        let slot = self.slot.as_mut().expect("guard is live until released");
        self.context.save_as_locked(slot, path.as_ref())
    }

    /// End the acquisition according to the release policy
    pub fn release(mut self) -> CacheResult<()> {
        self.finish(false)
    }

    /// End the acquisition after the caller's operation failed
    pub fn release_after_error(mut self) -> CacheResult<()> {
        self.finish(true)
    }

    fn finish(&mut self, failed: bool) -> CacheResult<()> {
        let Some(mut slot) = self.slot.take() else {
            return Ok(());
        };
        let context = &self.context;

        let outcome = if failed && self.on_error == ErrorPolicy::Discard {
            debug!("Discarding changes to {} after failed operation", context.key());
            context.release_handle(&mut slot);
            Ok(())
        } else {
            match self.release {
                ReleasePolicy::Defer => Ok(()),
                ReleasePolicy::Flush => context.flush_locked(&mut slot),
                // Others are queued on this handle; closing it would only force a reload
                ReleasePolicy::Close if context.busy_count() > 1 => context.flush_locked(&mut slot),
                ReleasePolicy::Close => context.close_locked(&mut slot, true),
            }
        };

        drop(slot);
        let unpinned = context.release_pin();
        outcome.and(unpinned)
    }
}

impl<B: DocumentBackend> fmt::Debug for ResourceGuard<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("key", self.context.key())
            .field("release", &self.release)
            .field("on_error", &self.on_error)
            .field("live", &self.slot.is_some())
            .finish()
    }
}

impl<B: DocumentBackend> Drop for ResourceGuard<B> {
    fn drop(&mut self) {
        if self.slot.is_none() {
            return;
        }
        let failed = std::thread::panicking();
        if let Err(e) = self.finish(failed) {
            error!("Releasing {} failed: {}", self.context.key(), e);
        }
    }
}

/// Run `body` with `guard`, releasing it on every exit path
///
/// A release failure after a successful body becomes the result. After a
/// failed body the body's error wins and the release failure is logged.
pub(crate) fn run_scoped<B, T, E, F>(mut guard: ResourceGuard<B>, body: F) -> Result<T, E>
where
    B: DocumentBackend,
    F: FnOnce(&mut ResourceGuard<B>) -> Result<T, E>,
    E: From<CacheError>,
{
    match body(&mut guard) {
        Ok(value) => {
            guard.release()?;
            Ok(value)
        }
        Err(e) => {
            let key = guard.key().clone();
            if let Err(release_err) = guard.release_after_error() {
                error!("Releasing {} after failed operation: {}", key, release_err);
            }
            Err(e)
        }
    }
}
