//! Scoped allocation regions
//!
//! A region tracks objects allocated through it and resources registered into
//! it. When the region is closed, or dropped while still open, every tracked
//! item is released exactly once, on both normal and error exits.

use super::{run_guarded, ReleaseOutcome, ResourcePayload, ResourceRegistry};
use crate::error::{BoxError, GovernanceError, GovernanceResult};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type RegionCleanup = Box<dyn FnOnce() -> Result<(), BoxError> + Send>;

enum RegionEntry {
    Object {
        label: String,
        _payload: ResourcePayload,
        cleanup: Option<RegionCleanup>,
    },
    Managed(String),
}

/// Outcome of closing a region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSweep {
    /// Objects and resources released by the sweep
    pub released: usize,
    /// Cleanups that failed or panicked
    pub failed: usize,
}

/// Scope that releases everything allocated through it when it ends
pub struct RegionAllocator {
    id: String,
    active: AtomicBool,
    entries: Mutex<Vec<RegionEntry>>,
    registry: Weak<ResourceRegistry>,
}

impl RegionAllocator {
    pub(crate) fn new(id: String, registry: Weak<ResourceRegistry>) -> Self {
        tracing::debug!("Opened region {}", id);
        Self {
            id,
            active: AtomicBool::new(true),
            entries: Mutex::new(Vec::new()),
            registry,
        }
    }

    /// Region that is not attached to any resource manager
    pub fn detached(id: impl Into<String>) -> Self {
        Self::new(id.into(), Weak::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of items currently tracked
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<RegionEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, entry: RegionEntry) -> GovernanceResult<()> {
        let mut entries = self.lock_entries();
        if !self.is_active() {
            return Err(GovernanceError::RegionInactive(self.id.clone()));
        }
        entries.push(entry);
        Ok(())
    }

    /// Allocate a value owned by the region. It is dropped from the region's
    /// bookkeeping when the region ends.
    pub fn allocate<T: Any + Send + Sync>(&self, value: T) -> GovernanceResult<Arc<T>> {
        let value = Arc::new(value);
        let n = self.len();
        self.push(RegionEntry::Object {
            label: format!("{}/object-{}", self.id, n),
            _payload: value.clone(),
            cleanup: None,
        })?;
        Ok(value)
    }

    /// Allocate a value whose cleanup runs once when the region ends
    pub fn allocate_with_cleanup<T, F>(&self, value: T, cleanup: F) -> GovernanceResult<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(Arc<T>) -> Result<(), BoxError> + Send + 'static,
    {
        let value = Arc::new(value);
        let captured = Arc::clone(&value);
        let n = self.len();
        self.push(RegionEntry::Object {
            label: format!("{}/object-{}", self.id, n),
            _payload: value.clone(),
            cleanup: Some(Box::new(move || cleanup(captured))),
        })?;
        Ok(value)
    }

    /// True if the region was opened by the manager owning `registry`
    pub(crate) fn is_owned_by(&self, registry: &ResourceRegistry) -> bool {
        std::ptr::eq(self.registry.as_ptr(), registry)
    }

    /// Track a resource registered with the owning manager
    pub(crate) fn track_managed(&self, id: String) -> GovernanceResult<()> {
        self.push(RegionEntry::Managed(id))
    }

    /// End the region and release everything it tracks. Calling it again is
    /// a no-op that returns an empty sweep.
    pub fn close(&self) -> RegionSweep {
        let drained = {
            let mut entries = self.lock_entries();
            if !self.active.swap(false, Ordering::SeqCst) {
                return RegionSweep::default();
            }
            std::mem::take(&mut *entries)
        };

        let registry = self.registry.upgrade();
        let mut sweep = RegionSweep::default();

        // Release in reverse allocation order
        for entry in drained.into_iter().rev() {
            match entry {
                RegionEntry::Object { label, _payload, cleanup } => {
                    sweep.released += 1;
                    if let Some(cleanup) = cleanup {
                        if !run_guarded(&label, cleanup) {
                            sweep.failed += 1;
                        }
                    }
                }
                RegionEntry::Managed(id) => {
                    let Some(registry) = registry.as_ref() else {
                        continue;
                    };
                    match registry.release_with_outcome(&id, true) {
                        ReleaseOutcome::Released { cleanup_ok } => {
                            sweep.released += 1;
                            if !cleanup_ok {
                                sweep.failed += 1;
                            }
                        }
                        // Released explicitly before the region ended
                        ReleaseOutcome::NotFound | ReleaseOutcome::Busy => {}
                    }
                }
            }
        }

        if sweep.failed > 0 {
            tracing::warn!(
                "Region {} closed with {} failed cleanups out of {}",
                self.id,
                sweep.failed,
                sweep.released
            );
        } else {
            tracing::debug!("Region {} closed, released {}", self.id, sweep.released);
        }
        sweep
    }
}

impl Drop for RegionAllocator {
    fn drop(&mut self) {
        if self.is_active() {
            self.close();
        }
    }
}

impl std::fmt::Debug for RegionAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionAllocator")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("entries", &self.len())
            .finish()
    }
}
