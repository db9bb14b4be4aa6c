//! Resource governance for a single node
//!
//! The [`ResourceManager`] tracks locally owned resources, enforces per-kind
//! quotas, reclaims resources that have been idle for too long, and hands out
//! [`RegionAllocator`] scopes that release everything allocated through them
//! when the scope ends.

pub mod memory;
pub mod region;

use crate::config::ResourceConfig;
use crate::error::{BoxError, GovernanceError, GovernanceResult};
use crate::log::log_resource_operation;
use crate::metrics::GovernanceMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub use memory::{FixedMemoryProbe, MemoryProbe, ProcessMemoryProbe};
pub use region::{RegionAllocator, RegionSweep};

/// Opaque caller-owned value attached to a resource
pub type ResourcePayload = Arc<dyn Any + Send + Sync>;

/// Callback invoked exactly once with the payload when a resource is released
pub type CleanupFn = Box<dyn FnOnce(ResourcePayload) -> Result<(), BoxError> + Send>;

/// Predicate reporting whether a resource is still in use. A busy resource is
/// only released when forced.
///
/// The check runs while the manager's registry lock is held. It must not call
/// back into the [`ResourceManager`] (register, get, release, ...), which
/// would deadlock; inspect the record it is given instead.
pub type BusyCheck = Arc<dyn Fn(&ResourceRecord) -> bool + Send + Sync>;

/// Kind of tracked resource; each kind has its own quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    DatabaseConnection,
    FileHandle,
    NetworkSocket,
    Thread,
    Custom,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Memory,
        ResourceKind::DatabaseConnection,
        ResourceKind::FileHandle,
        ResourceKind::NetworkSocket,
        ResourceKind::Thread,
        ResourceKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Memory => "memory",
            ResourceKind::DatabaseConnection => "database_connection",
            ResourceKind::FileHandle => "file_handle",
            ResourceKind::NetworkSocket => "network_socket",
            ResourceKind::Thread => "thread",
            ResourceKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked resource
pub struct ResourceRecord {
    id: String,
    kind: ResourceKind,
    payload: ResourcePayload,
    created_at: Instant,
    last_accessed: Instant,
    registered_at: DateTime<Utc>,
    access_count: u64,
    metadata: HashMap<String, String>,
    region: Option<String>,
    cleanup: Option<CleanupFn>,
}

impl ResourceRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn payload(&self) -> &ResourcePayload {
        &self.payload
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Time since the record was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last successful lookup (or registration)
    pub fn idle_time(&self) -> Duration {
        self.last_accessed.elapsed()
    }

    fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id.clone(),
            kind: self.kind,
            registered_at: self.registered_at,
            access_count: self.access_count,
            idle_ms: self.idle_time().as_millis() as u64,
            metadata: self.metadata.clone(),
            region: self.region.clone(),
        }
    }
}

impl fmt::Debug for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("access_count", &self.access_count)
            .field("metadata", &self.metadata)
            .field("region", &self.region)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// Serializable description of a tracked resource (without its payload)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: String,
    pub kind: ResourceKind,
    pub registered_at: DateTime<Utc>,
    pub access_count: u64,
    pub idle_ms: u64,
    pub metadata: HashMap<String, String>,
    pub region: Option<String>,
}

/// Read-only view of current usage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub counts: BTreeMap<ResourceKind, usize>,
    pub limits: BTreeMap<ResourceKind, Option<usize>>,
    pub memory_usage_mb: f64,
    pub memory_limit_mb: u64,
    pub total_resources: usize,
    pub cleanup_failures: u64,
}

/// Arguments for [`ResourceManager::register`]
pub struct Registration<'r> {
    id: Option<String>,
    kind: ResourceKind,
    payload: ResourcePayload,
    cleanup: Option<CleanupFn>,
    metadata: HashMap<String, String>,
    region: Option<&'r RegionAllocator>,
}

impl<'r> Registration<'r> {
    /// Register `payload` as a resource of `kind`
    pub fn new<T: Any + Send + Sync>(kind: ResourceKind, payload: T) -> Self {
        Self::shared(kind, Arc::new(payload))
    }

    /// Register an already shared payload
    pub fn shared(kind: ResourceKind, payload: ResourcePayload) -> Self {
        Self {
            id: None,
            kind,
            payload,
            cleanup: None,
            metadata: HashMap::new(),
            region: None,
        }
    }

    /// Use a caller-supplied id instead of a generated one
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Callback run once with the payload at release time
    pub fn cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce(ResourcePayload) -> Result<(), BoxError> + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Also release the resource when `region` ends
    pub fn in_region(mut self, region: &'r RegionAllocator) -> Self {
        self.region = Some(region);
        self
    }
}

/// Result of an internal release attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseOutcome {
    NotFound,
    Busy,
    Released { cleanup_ok: bool },
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<String, ResourceRecord>,
    counts: HashMap<ResourceKind, usize>,
}

impl RegistryState {
    fn count(&self, kind: ResourceKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    fn remove(&mut self, id: &str) -> Option<ResourceRecord> {
        let record = self.records.remove(id)?;
        if let Some(count) = self.counts.get_mut(&record.kind) {
            *count = count.saturating_sub(1);
        }
        Some(record)
    }
}

/// Run a caller-supplied cleanup, converting errors and panics into `false`
pub(crate) fn run_guarded<F>(label: &str, cleanup: F) -> bool
where
    F: FnOnce() -> Result<(), BoxError>,
{
    match catch_unwind(AssertUnwindSafe(cleanup)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!("Cleanup for {} failed: {}", label, e);
            false
        }
        Err(_) => {
            tracing::warn!("Cleanup for {} panicked", label);
            false
        }
    }
}

/// Fallback period for the reclaimer when a zero interval is configured
const ZERO_INTERVAL_FALLBACK: Duration = Duration::from_secs(1);

/// Shared state behind a [`ResourceManager`]; regions hold a weak reference
pub(crate) struct ResourceRegistry {
    limits: ResourceConfig,
    cleanup_interval: Duration,
    idle_timeout: Duration,
    state: Mutex<RegistryState>,
    memory_probe: Arc<dyn MemoryProbe>,
    busy_check: Option<BusyCheck>,
    metrics: Arc<GovernanceMetrics>,
    next_region: AtomicU64,
}

impl ResourceRegistry {
    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        // A panic while holding the lock cannot leave the maps half-updated:
        // every mutation is a single insert/remove paired with its counter.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn limit_for(&self, kind: ResourceKind) -> Option<usize> {
        match kind {
            ResourceKind::Memory => None,
            ResourceKind::DatabaseConnection => Some(self.limits.max_connections),
            ResourceKind::FileHandle => Some(self.limits.max_file_handles),
            ResourceKind::NetworkSocket => Some(self.limits.max_sockets),
            ResourceKind::Thread => Some(self.limits.max_threads),
            ResourceKind::Custom => self.limits.max_custom,
        }
    }

    fn check_limit(
        &self,
        state: &RegistryState,
        kind: ResourceKind,
        memory_mb: f64,
    ) -> GovernanceResult<()> {
        if kind == ResourceKind::Memory {
            let limit = self.limits.memory_limit_mb as f64;
            if memory_mb >= limit {
                return Err(GovernanceError::ResourceLimit {
                    kind,
                    requested: 1,
                    available: 0,
                });
            }
            return Ok(());
        }

        if let Some(limit) = self.limit_for(kind) {
            let count = state.count(kind);
            if count >= limit {
                return Err(GovernanceError::ResourceLimit {
                    kind,
                    requested: 1,
                    available: limit.saturating_sub(count) as u64,
                });
            }
        }
        Ok(())
    }

    fn register(&self, registration: Registration<'_>) -> GovernanceResult<String> {
        let start = std::time::Instant::now();
        let Registration {
            id,
            kind,
            payload,
            cleanup,
            metadata,
            region,
        } = registration;

        if let Some(region) = region {
            if !region.is_owned_by(self) {
                return Err(GovernanceError::ForeignRegion(region.id().to_string()));
            }
            if !region.is_active() {
                return Err(GovernanceError::RegionInactive(region.id().to_string()));
            }
        }

        let id = id.unwrap_or_else(|| format!("{}-{:016x}", kind.as_str(), rand::random::<u64>()));
        let memory_mb = if kind == ResourceKind::Memory {
            self.memory_probe.current_usage_mb()
        } else {
            0.0
        };

        {
            let mut state = self.lock_state();
            if state.records.contains_key(&id) {
                return Err(GovernanceError::DuplicateResource(id));
            }
            if let Err(e) = self.check_limit(&state, kind, memory_mb) {
                drop(state);
                self.metrics.record_limit_rejection(kind);
                tracing::warn!("Rejected registration of {} ({}): {}", id, kind, e);
                return Err(e);
            }

            let now = Instant::now();
            state.records.insert(
                id.clone(),
                ResourceRecord {
                    id: id.clone(),
                    kind,
                    payload,
                    created_at: now,
                    last_accessed: now,
                    registered_at: Utc::now(),
                    access_count: 0,
                    metadata,
                    region: region.map(|r| r.id().to_string()),
                    cleanup,
                },
            );
            *state.counts.entry(kind).or_insert(0) += 1;
        }

        if let Some(region) = region {
            if let Err(e) = region.track_managed(id.clone()) {
                // Region closed between the activity check and tracking
                self.release(&id, true);
                return Err(e);
            }
        }

        self.metrics.record_resource_registered(kind);
        log_resource_operation("register", &id, kind, true, start.elapsed());
        Ok(id)
    }

    fn get(&self, id: &str) -> GovernanceResult<ResourcePayload> {
        let mut state = self.lock_state();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| GovernanceError::ResourceNotFound(id.to_string()))?;
        record.last_accessed = Instant::now();
        record.access_count += 1;
        Ok(Arc::clone(&record.payload))
    }

    pub(crate) fn release_with_outcome(&self, id: &str, force: bool) -> ReleaseOutcome {
        let start = std::time::Instant::now();
        let record = {
            let mut state = self.lock_state();
            match state.records.get(id) {
                None => return ReleaseOutcome::NotFound,
                Some(record) if !force => {
                    if let Some(busy) = &self.busy_check {
                        if busy(record) {
                            tracing::debug!("Resource {} is busy, not releasing", id);
                            return ReleaseOutcome::Busy;
                        }
                    }
                }
                Some(_) => {}
            }
            match state.remove(id) {
                Some(record) => record,
                None => return ReleaseOutcome::NotFound,
            }
        };

        let kind = record.kind;
        let cleanup_ok = self.finish_release(record);
        self.metrics.record_resource_released(kind);
        log_resource_operation("release", id, kind, cleanup_ok, start.elapsed());
        ReleaseOutcome::Released { cleanup_ok }
    }

    fn release(&self, id: &str, force: bool) -> bool {
        matches!(self.release_with_outcome(id, force), ReleaseOutcome::Released { .. })
    }

    /// Run the cleanup callback of a record already removed from the registry.
    /// Runs outside the lock so callbacks may call back into the manager.
    fn finish_release(&self, mut record: ResourceRecord) -> bool {
        match record.cleanup.take() {
            Some(cleanup) => {
                let payload = Arc::clone(&record.payload);
                let ok = run_guarded(&record.id, move || cleanup(payload));
                if !ok {
                    self.metrics.record_cleanup_failure(record.kind);
                }
                ok
            }
            None => true,
        }
    }

    fn ids(&self) -> Vec<String> {
        self.lock_state().records.keys().cloned().collect()
    }

    fn reclaim_idle(&self) -> usize {
        let now = Instant::now();
        let idle: Vec<ResourceRecord> = {
            let mut state = self.lock_state();
            let expired: Vec<String> = state
                .records
                .values()
                .filter(|record| {
                    now.saturating_duration_since(record.last_accessed) > self.idle_timeout
                })
                .map(|record| record.id.clone())
                .collect();
            expired.iter().filter_map(|id| state.remove(id)).collect()
        };

        let count = idle.len();
        for record in idle {
            let kind = record.kind;
            tracing::debug!("Reclaiming idle resource {} ({})", record.id, kind);
            self.finish_release(record);
            self.metrics.record_resource_released(kind);
        }

        if count > 0 {
            self.metrics.record_resources_reclaimed(count);
            tracing::info!("Reclaimed {} idle resources", count);
        }
        count
    }

    fn usage_snapshot(&self) -> UsageSnapshot {
        let memory_usage_mb = self.memory_probe.current_usage_mb();
        let state = self.lock_state();
        let counts = ResourceKind::ALL
            .iter()
            .map(|kind| (*kind, state.count(*kind)))
            .collect();
        let limits = ResourceKind::ALL
            .iter()
            .map(|kind| (*kind, self.limit_for(*kind)))
            .collect();
        let total_resources = state.records.len();
        drop(state);

        UsageSnapshot {
            counts,
            limits,
            memory_usage_mb,
            memory_limit_mb: self.limits.memory_limit_mb,
            total_resources,
            cleanup_failures: self.metrics.cleanup_failures(),
        }
    }
}

struct ReclaimerHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

/// Builder for [`ResourceManager`]
pub struct ResourceManagerBuilder {
    config: ResourceConfig,
    cleanup_interval: Duration,
    idle_timeout: Duration,
    memory_probe: Arc<dyn MemoryProbe>,
    busy_check: Option<BusyCheck>,
    metrics: Arc<GovernanceMetrics>,
}

impl ResourceManagerBuilder {
    pub fn with_metrics(mut self, metrics: Arc<GovernanceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = probe;
        self
    }

    pub fn with_busy_check(mut self, busy_check: BusyCheck) -> Self {
        self.busy_check = Some(busy_check);
        self
    }

    /// Override the sweep interval and idle threshold with sub-second values
    pub fn with_reclaim_timing(mut self, interval: Duration, idle_timeout: Duration) -> Self {
        self.cleanup_interval = interval;
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn build(self) -> ResourceManager {
        let cleanup_interval = if self.cleanup_interval.is_zero() {
            tracing::warn!(
                "Zero reclaim interval configured, using {:?} instead",
                ZERO_INTERVAL_FALLBACK
            );
            ZERO_INTERVAL_FALLBACK
        } else {
            self.cleanup_interval
        };

        ResourceManager {
            registry: Arc::new(ResourceRegistry {
                limits: self.config,
                cleanup_interval,
                idle_timeout: self.idle_timeout,
                state: Mutex::new(RegistryState::default()),
                memory_probe: self.memory_probe,
                busy_check: self.busy_check,
                metrics: self.metrics,
                next_region: AtomicU64::new(1),
            }),
            reclaimer: Mutex::new(None),
        }
    }
}

/// Busy check treating a resource as in use while its payload is still
/// referenced outside the manager
pub fn shared_payload_busy_check() -> BusyCheck {
    Arc::new(|record: &ResourceRecord| Arc::strong_count(record.payload()) > 1)
}

/// Tracks resources, enforces quotas and reclaims idle resources
pub struct ResourceManager {
    registry: Arc<ResourceRegistry>,
    reclaimer: Mutex<Option<ReclaimerHandle>>,
}

impl ResourceManager {
    /// Create a manager with default probe, metrics and no busy check
    pub fn new(config: ResourceConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ResourceConfig) -> ResourceManagerBuilder {
        ResourceManagerBuilder {
            cleanup_interval: config.cleanup_duration(),
            idle_timeout: config.idle_duration(),
            config,
            memory_probe: Arc::new(ProcessMemoryProbe),
            busy_check: None,
            metrics: Arc::new(GovernanceMetrics::new()),
        }
    }

    /// Register a resource. Fails with `ResourceLimit` when the kind is at
    /// its quota; the registry is left untouched in that case.
    pub fn register(&self, registration: Registration<'_>) -> GovernanceResult<String> {
        self.registry.register(registration)
    }

    /// Look up a payload, refreshing its last-access time and access counter
    pub fn get(&self, id: &str) -> GovernanceResult<ResourcePayload> {
        self.registry.get(id)
    }

    /// Look up a payload and downcast it to `T`
    pub fn get_as<T: Any + Send + Sync>(&self, id: &str) -> GovernanceResult<Arc<T>> {
        self.get(id)?
            .downcast::<T>()
            .map_err(|_| GovernanceError::ResourceNotFound(format!("{} (type mismatch)", id)))
    }

    /// Release a resource. Returns `false` for unknown ids and for busy
    /// resources when not forced. Cleanup failures are logged and counted,
    /// never returned.
    pub fn release(&self, id: &str, force: bool) -> bool {
        self.registry.release(id, force)
    }

    /// Release every tracked resource; returns how many were released
    pub fn cleanup_all(&self, force: bool) -> usize {
        self.registry
            .ids()
            .iter()
            .filter(|id| self.registry.release(id, force))
            .count()
    }

    /// Open a region scope. Everything allocated or registered through it is
    /// released when it is closed or dropped.
    pub fn region_scope(&self) -> RegionAllocator {
        let n = self.registry.next_region.fetch_add(1, Ordering::Relaxed);
        RegionAllocator::new(format!("region-{}", n), Arc::downgrade(&self.registry))
    }

    /// Force-release every resource idle longer than the threshold
    pub fn reclaim_idle(&self) -> usize {
        self.registry.reclaim_idle()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry.lock_state().records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.registry.lock_state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.registry.lock_state().count(kind)
    }

    /// Describe a resource without touching its access time
    pub fn resource_info(&self, id: &str) -> GovernanceResult<ResourceInfo> {
        self.registry
            .lock_state()
            .records
            .get(id)
            .map(ResourceRecord::info)
            .ok_or_else(|| GovernanceError::ResourceNotFound(id.to_string()))
    }

    /// Read-only view of current usage
    pub fn usage_snapshot(&self) -> UsageSnapshot {
        self.registry.usage_snapshot()
    }

    /// Take a usage snapshot and publish it to the live resource gauges
    pub fn publish_usage(&self) -> UsageSnapshot {
        let usage = self.registry.usage_snapshot();
        self.registry
            .metrics
            .update_resource_usage(usage.total_resources, usage.memory_usage_mb);
        usage
    }

    /// Period of the background reclamation loop
    pub fn reclaim_interval(&self) -> Duration {
        self.registry.cleanup_interval
    }

    pub fn metrics(&self) -> &Arc<GovernanceMetrics> {
        &self.registry.metrics
    }

    /// Start the background reclamation loop. Returns `false` if it is
    /// already running. Must be called from within a tokio runtime.
    pub fn start_reclaimer(&self) -> bool {
        let mut reclaimer = self.reclaimer.lock().unwrap_or_else(|p| p.into_inner());
        if reclaimer.is_some() {
            return false;
        }

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let registry = Arc::clone(&self.registry);
        let period = registry.cleanup_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.reclaim_idle();
                        let usage = registry.usage_snapshot();
                        registry
                            .metrics
                            .update_resource_usage(usage.total_resources, usage.memory_usage_mb);
                    }
                    _ = stop_rx.recv() => {
                        tracing::info!("Resource reclaimer stopping");
                        break;
                    }
                }
            }
        });

        tracing::info!(
            "Resource reclaimer started: interval={:?} idle_timeout={:?}",
            period,
            self.registry.idle_timeout
        );
        *reclaimer = Some(ReclaimerHandle { stop_tx, task });
        true
    }

    /// Stop the background reclamation loop and wait for it to exit
    pub async fn stop_reclaimer(&self) {
        let handle = self.reclaimer.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(()).await;
            let _ = handle.task.await;
        }
    }

    pub fn is_reclaimer_running(&self) -> bool {
        self.reclaimer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    /// Stop reclamation and force-release everything
    pub async fn shutdown(&self) -> usize {
        self.stop_reclaimer().await;
        let released = self.cleanup_all(true);
        tracing::info!("Resource manager shut down, released {} resources", released);
        released
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        let handle = self.reclaimer.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            handle.task.abort();
        }
    }
}
