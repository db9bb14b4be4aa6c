//! Lease-based leader election
//!
//! A node becomes leader by writing its id at the election key, bound to a
//! lease, only if no live holder exists. Mutual exclusion comes from the
//! store's create-if-absent semantics; this service only observes it. While
//! leading, a background loop renews the lease and watches the key. Any sign
//! of lost ownership (renewal failure, deletion, a foreign value, or a closed
//! watch) ends leadership.

use crate::config::ElectionConfig;
use crate::error::{GovernanceError, GovernanceResult, StoreError};
use crate::log::log_election_operation;
use crate::metrics::GovernanceMetrics;
use crate::store::{CoordinationStore, LeaseId, WatchEventKind, WatchStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant};

/// Leadership currently held (or recently lost) by this service
struct Leadership {
    node_id: String,
    lease: LeaseId,
    stop_tx: Option<mpsc::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

/// Inputs of the renewal/watch loop
struct LeadershipLoop {
    store: Arc<dyn CoordinationStore>,
    election_key: String,
    node_id: String,
    lease: LeaseId,
    renew_interval: Duration,
    is_leader: Arc<AtomicBool>,
    metrics: Arc<GovernanceMetrics>,
}

/// Clears the leadership flag however the loop exits, including a panic or
/// an abort of its task
struct LeaderFlagGuard(Arc<AtomicBool>);

impl Drop for LeaderFlagGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The lease must be renewed at a non-zero period strictly inside its TTL
fn check_timing(lease_ttl: Duration, renew_interval: Duration) -> GovernanceResult<()> {
    if renew_interval.is_zero() || renew_interval >= lease_ttl {
        return Err(GovernanceError::Config(format!(
            "renew interval {:?} must be non-zero and shorter than the lease TTL {:?}",
            renew_interval, lease_ttl
        )));
    }
    Ok(())
}

/// Election service for one election key
pub struct LeaderElection {
    store: Arc<dyn CoordinationStore>,
    election_key: String,
    lease_ttl: Duration,
    renew_interval: Duration,
    is_leader: Arc<AtomicBool>,
    leadership: Mutex<Option<Leadership>>,
    metrics: Arc<GovernanceMetrics>,
}

impl LeaderElection {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        election_key: impl Into<String>,
        config: &ElectionConfig,
        metrics: Arc<GovernanceMetrics>,
    ) -> GovernanceResult<Self> {
        check_timing(config.lease_duration(), config.renew_duration())?;
        Ok(Self {
            store,
            election_key: election_key.into(),
            lease_ttl: config.lease_duration(),
            renew_interval: config.renew_duration(),
            is_leader: Arc::new(AtomicBool::new(false)),
            leadership: Mutex::new(None),
            metrics,
        })
    }

    /// Override lease TTL and renewal interval
    pub fn with_timing(
        mut self,
        lease_ttl: Duration,
        renew_interval: Duration,
    ) -> GovernanceResult<Self> {
        check_timing(lease_ttl, renew_interval)?;
        self.lease_ttl = lease_ttl;
        self.renew_interval = renew_interval;
        Ok(self)
    }

    pub fn election_key(&self) -> &str {
        &self.election_key
    }

    /// Last known leadership status. This is a hint: ownership may already be
    /// lost in the store while the loop has not noticed yet.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Node id this service last ran for
    pub async fn node_id(&self) -> Option<String> {
        self.leadership.lock().await.as_ref().map(|l| l.node_id.clone())
    }

    /// Point-in-time read of the current holder
    pub async fn current_leader(&self) -> GovernanceResult<Option<String>> {
        Ok(self.store.get(&self.election_key).await?)
    }

    /// Try to become leader. Returns false when another node holds the key;
    /// in that case no lease or watch is kept. There is no automatic retry.
    pub async fn run_for_election(&self, node_id: &str) -> GovernanceResult<bool> {
        let mut leadership = self.leadership.lock().await;

        if let Some(current) = leadership.as_ref() {
            if self.is_leader() && current.node_id == node_id {
                return Ok(true);
            }
        }
        // Clear out a previous term that was lost or held under another id
        if let Some(previous) = leadership.take() {
            self.end_term(previous, true).await;
        }

        let lease = self.store.lease_create(self.lease_ttl).await?;

        // Watch before claiming so no change after the claim is missed
        let watch = match self.store.watch(&self.election_key).await {
            Ok(watch) => watch,
            Err(e) => {
                self.revoke_quietly(lease).await;
                return Err(e.into());
            }
        };

        let claimed = match self
            .store
            .put_if_absent(&self.election_key, node_id, Some(lease))
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.revoke_quietly(lease).await;
                return Err(e.into());
            }
        };

        if !claimed {
            drop(watch);
            self.revoke_quietly(lease).await;
            self.metrics.record_election(false);
            log_election_operation("run_for_election", &self.election_key, node_id, false);
            return Ok(false);
        }

        self.is_leader.store(true, Ordering::SeqCst);
        self.metrics.record_election(true);
        log_election_operation("run_for_election", &self.election_key, node_id, true);

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let ctx = LeadershipLoop {
            store: Arc::clone(&self.store),
            election_key: self.election_key.clone(),
            node_id: node_id.to_string(),
            lease,
            renew_interval: self.renew_interval,
            is_leader: Arc::clone(&self.is_leader),
            metrics: Arc::clone(&self.metrics),
        };
        let task_handle = tokio::spawn(ctx.run(watch, stop_rx));

        *leadership = Some(Leadership {
            node_id: node_id.to_string(),
            lease,
            stop_tx: Some(stop_tx),
            task_handle: Some(task_handle),
        });
        Ok(true)
    }

    /// Give up leadership by revoking the lease. Safe to call repeatedly and
    /// when not leading.
    pub async fn resign(&self) -> GovernanceResult<()> {
        let previous = self.leadership.lock().await.take();
        if let Some(previous) = previous {
            let node_id = previous.node_id.clone();
            self.end_term(previous, true).await;
            log_election_operation("resign", &self.election_key, &node_id, true);
        }
        Ok(())
    }

    /// Stop the renewal loop without revoking; the lease then lapses on its
    /// own after its TTL.
    pub async fn stop(&self) {
        let previous = self.leadership.lock().await.take();
        if let Some(previous) = previous {
            self.end_term(previous, false).await;
        }
    }

    async fn end_term(&self, mut term: Leadership, revoke: bool) {
        // Stop the loop first so our own deletion is not reported as a loss
        if let Some(stop_tx) = term.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }
        if let Some(handle) = term.task_handle.take() {
            let _ = handle.await;
        }
        self.is_leader.store(false, Ordering::SeqCst);
        if revoke {
            self.revoke_quietly(term.lease).await;
        }
    }

    async fn revoke_quietly(&self, lease: LeaseId) {
        match self.store.lease_revoke(lease).await {
            Ok(()) | Err(StoreError::LeaseNotFound(_)) => {}
            Err(e) => tracing::warn!("Failed to revoke lease {}: {}", lease, e),
        }
    }
}

impl Drop for LeaderElection {
    fn drop(&mut self) {
        if let Some(term) = self.leadership.get_mut().as_mut() {
            if let Some(handle) = term.task_handle.take() {
                handle.abort();
            }
        }
    }
}

impl LeadershipLoop {
    async fn run(self, mut watch: WatchStream, mut stop_rx: mpsc::Receiver<()>) {
        let _flag = LeaderFlagGuard(Arc::clone(&self.is_leader));
        let mut renew = interval_at(Instant::now() + self.renew_interval, self.renew_interval);

        let reason = loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    tracing::debug!("Leadership loop for {} stopping", self.election_key);
                    return;
                }
                _ = renew.tick() => {
                    if let Err(e) = self.store.lease_keepalive(self.lease).await {
                        break format!("lease renewal failed: {}", e);
                    }
                }
                event = watch.next() => match event {
                    Some(event) => match event.kind {
                        WatchEventKind::Put(value) if value == self.node_id => {}
                        WatchEventKind::Put(value) => break format!("key now held by {}", value),
                        WatchEventKind::Delete => break "election key deleted".to_string(),
                    },
                    None => break "watch disconnected".to_string(),
                },
            }
        };

        self.is_leader.store(false, Ordering::SeqCst);
        self.metrics.record_leadership_lost();
        tracing::warn!(
            "Node {} lost leadership of {}: {}",
            self.node_id,
            self.election_key,
            reason
        );
        log_election_operation("leadership_lost", &self.election_key, &self.node_id, false);

        match self.store.lease_revoke(self.lease).await {
            Ok(()) | Err(StoreError::LeaseNotFound(_)) => {}
            Err(e) => tracing::debug!("Could not revoke lease {} after loss: {}", self.lease, e),
        }
    }
}

impl std::fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElection")
            .field("election_key", &self.election_key)
            .field("lease_ttl", &self.lease_ttl)
            .field("renew_interval", &self.renew_interval)
            .field("is_leader", &self.is_leader())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn election(store: &Arc<MemoryStore>) -> LeaderElection {
        let store: Arc<dyn CoordinationStore> = store.clone();
        LeaderElection::new(
            store,
            "/election/leader",
            &ElectionConfig::default(),
            Arc::new(GovernanceMetrics::new()),
        )
        .and_then(|e| e.with_timing(Duration::from_millis(200), Duration::from_millis(50)))
        .unwrap()
    }

    #[tokio::test]
    async fn test_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let first = election(&store);
        let second = election(&store);

        assert!(first.run_for_election("n1").await.unwrap());
        assert!(!second.run_for_election("n2").await.unwrap());
        assert!(first.is_leader());
        assert!(!second.is_leader());
        assert_eq!(second.current_leader().await.unwrap(), Some("n1".to_string()));
        // loser keeps no lease
        assert_eq!(store.lease_count().await, 1);
    }

    #[tokio::test]
    async fn test_resign_is_idempotent_and_frees_key() {
        let store = Arc::new(MemoryStore::new());
        let first = election(&store);
        let second = election(&store);

        assert!(first.run_for_election("n1").await.unwrap());
        first.resign().await.unwrap();
        first.resign().await.unwrap();
        assert!(!first.is_leader());
        assert_eq!(first.current_leader().await.unwrap(), None);

        assert!(second.run_for_election("n2").await.unwrap());
        assert_eq!(first.metrics.snapshot().leadership_lost, 0);
    }

    #[tokio::test]
    async fn test_renewal_keeps_leadership() {
        let store = Arc::new(MemoryStore::new());
        let first = election(&store);
        assert!(first.run_for_election("n1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(first.is_leader());
        assert_eq!(first.current_leader().await.unwrap(), Some("n1".to_string()));
        first.resign().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_value_ends_leadership() {
        let store = Arc::new(MemoryStore::new());
        let first = election(&store);
        assert!(first.run_for_election("n1").await.unwrap());

        store.put("/election/leader", "intruder", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!first.is_leader());
        assert_eq!(first.metrics.snapshot().leadership_lost, 1);
    }

    #[tokio::test]
    async fn test_disconnect_ends_leadership() {
        let store = Arc::new(MemoryStore::new());
        let first = election(&store);
        assert!(first.run_for_election("n1").await.unwrap());

        store.disconnect_watchers().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!first.is_leader());
    }

    #[tokio::test]
    async fn test_rerun_while_leading() {
        let store = Arc::new(MemoryStore::new());
        let first = election(&store);
        assert!(first.run_for_election("n1").await.unwrap());
        assert!(first.run_for_election("n1").await.unwrap());
        assert_eq!(first.node_id().await, Some("n1".to_string()));
        assert_eq!(store.lease_count().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_renew_interval_rejected() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let metrics = Arc::new(GovernanceMetrics::new());

        let zero = ElectionConfig {
            lease_ttl: 1,
            renew_interval_ms: 0,
        };
        let err = LeaderElection::new(Arc::clone(&store), "/l", &zero, Arc::clone(&metrics))
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Config(_)));

        let valid = LeaderElection::new(store, "/l", &ElectionConfig::default(), metrics).unwrap();
        assert!(valid
            .with_timing(Duration::from_millis(100), Duration::from_millis(100))
            .is_err());
    }

    #[tokio::test]
    async fn test_loop_termination_clears_leadership() {
        let store = Arc::new(MemoryStore::new());
        let first = election(&store);
        assert!(first.run_for_election("n1").await.unwrap());

        // the task dies without reaching its own exit path
        let handle = first
            .leadership
            .lock()
            .await
            .as_mut()
            .and_then(|term| term.task_handle.take())
            .unwrap();
        handle.abort();
        let _ = handle.await;

        assert!(!first.is_leader());
    }
}
