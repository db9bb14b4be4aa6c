//! In-process coordination store
//!
//! A single-node stand-in for an etcd-like service: linearizable because every
//! operation runs under one lock, with leases that expire and delete their
//! keys, and per-key watch streams.

use super::{CoordinationStore, LeaseId, WatchEvent, WatchEventKind, WatchStream};
use crate::error::{StoreError, StoreResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

#[derive(Debug)]
struct StoredValue {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseState>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<WatchEvent>>>,
    next_lease: i64,
    revision: u64,
}

impl MemoryState {
    fn notify(&mut self, key: &str, kind: WatchEventKind) {
        self.revision += 1;
        let revision = self.revision;
        if let Some(senders) = self.watchers.get_mut(key) {
            senders.retain(|tx| {
                tx.send(WatchEvent {
                    key: key.to_string(),
                    kind: kind.clone(),
                    revision,
                })
                .is_ok()
            });
            if senders.is_empty() {
                self.watchers.remove(key);
            }
        }
    }

    fn remove_key(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(stored) => {
                if let Some(lease) = stored.lease.and_then(|id| self.leases.get_mut(&id)) {
                    lease.keys.remove(key);
                }
                self.notify(key, WatchEventKind::Delete);
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        if let Some(id) = lease {
            let state = self.leases.get_mut(&id).ok_or(StoreError::LeaseNotFound(id))?;
            state.keys.insert(key.to_string());
        }

        let previous = self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                lease,
            },
        );

        // Detach the key from a lease it was previously bound to
        if let Some(old_lease) = previous.and_then(|p| p.lease) {
            if Some(old_lease) != lease {
                if let Some(state) = self.leases.get_mut(&old_lease) {
                    state.keys.remove(key);
                }
            }
        }

        self.notify(key, WatchEventKind::Put(value.to_string()));
        Ok(())
    }

    fn revoke(&mut self, id: LeaseId) -> bool {
        match self.leases.remove(&id) {
            Some(lease) => {
                for key in lease.keys {
                    if self.entries.remove(&key).is_some() {
                        self.notify(&key, WatchEventKind::Delete);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Drop every lease whose deadline has passed
    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            tracing::debug!("Lease {} expired", id);
            self.revoke(*id);
        }
        expired.len()
    }
}

/// In-memory [`CoordinationStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    expiry_task: Option<tokio::task::JoinHandle<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a background sweep so that expired leases delete their keys
    /// (and notify watchers) even when nobody touches the store.
    pub fn with_expiry_sweep(mut self, interval: Duration) -> Self {
        let state = Arc::clone(&self.state);
        self.expiry_task = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                state.lock().await.purge_expired(Instant::now());
            }
        }));
        self
    }

    /// Close every open watch stream, simulating a lost connection
    pub async fn disconnect_watchers(&self) {
        self.state.lock().await.watchers.clear();
    }

    /// Number of live leases
    pub async fn lease_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        state.leases.len()
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        state.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(task) = self.expiry_task.take() {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        state.insert(key, value, lease)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.insert(key, value, lease)?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        Ok(state.entries.get(key).map(|stored| stored.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| (key.clone(), stored.value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        Ok(state.remove_key(key))
    }

    async fn lease_create(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        state.next_lease += 1;
        let id = LeaseId(state.next_lease);
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn lease_keepalive(&self, lease: LeaseId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.purge_expired(now);
        let entry = state.leases.get_mut(&lease).ok_or(StoreError::LeaseNotFound(lease))?;
        entry.expires_at = now + entry.ttl;
        Ok(())
    }

    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        if state.revoke(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn watch(&self, key: &str) -> StoreResult<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.watchers.entry(key.to_string()).or_default().push(tx);
        Ok(WatchStream::new(key, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("/a", "1", None).await.unwrap();
        assert_eq!(store.get("/a").await.unwrap(), Some("1".to_string()));
        assert!(store.delete("/a").await.unwrap());
        assert!(!store.delete("/a").await.unwrap());
        assert_eq!(store.get("/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("/leader", "n1", None).await.unwrap());
        assert!(!store.put_if_absent("/leader", "n2", None).await.unwrap());
        assert_eq!(store.get("/leader").await.unwrap(), Some("n1".to_string()));
    }

    #[tokio::test]
    async fn test_get_prefix_is_sorted_and_bounded() {
        let store = MemoryStore::new();
        store.put("/tx/1/vote/b", "yes", None).await.unwrap();
        store.put("/tx/1/vote/a", "no", None).await.unwrap();
        store.put("/tx/10/vote/a", "yes", None).await.unwrap();

        let votes = store.get_prefix("/tx/1/vote/").await.unwrap();
        assert_eq!(
            votes,
            vec![
                ("/tx/1/vote/a".to_string(), "no".to_string()),
                ("/tx/1/vote/b".to_string(), "yes".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_lease_revoke_deletes_keys_and_notifies() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_secs(30)).await.unwrap();
        let mut watch = store.watch("/leader").await.unwrap();

        store.put("/leader", "n1", Some(lease)).await.unwrap();
        store.lease_revoke(lease).await.unwrap();

        assert_eq!(watch.next().await.unwrap().value(), Some("n1"));
        assert_eq!(watch.next().await.unwrap().kind, WatchEventKind::Delete);
        assert_eq!(store.get("/leader").await.unwrap(), None);
        assert_eq!(
            store.lease_revoke(lease).await.unwrap_err(),
            StoreError::LeaseNotFound(lease)
        );
    }

    #[tokio::test]
    async fn test_lease_expiry() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_millis(50)).await.unwrap();
        store.put("/leader", "n1", Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.get("/leader").await.unwrap(), None);
        assert!(store.lease_keepalive(lease).await.is_err());
        assert_eq!(store.lease_count().await, 0);
    }

    #[tokio::test]
    async fn test_keepalive_extends_lease() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_millis(100)).await.unwrap();
        store.put("/leader", "n1", Some(lease)).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            store.lease_keepalive(lease).await.unwrap();
        }
        assert_eq!(store.get("/leader").await.unwrap(), Some("n1".to_string()));
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        let err = store.put("/k", "v", Some(LeaseId(42))).await.unwrap_err();
        assert_eq!(err, StoreError::LeaseNotFound(LeaseId(42)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_disconnect_ends_watch() {
        let store = MemoryStore::new();
        let mut watch = store.watch("/leader").await.unwrap();
        store.disconnect_watchers().await;
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_expiry_sweep_notifies_watchers() {
        let store = MemoryStore::new().with_expiry_sweep(Duration::from_millis(10));
        let lease = store.lease_create(Duration::from_millis(30)).await.unwrap();
        store.put("/leader", "n1", Some(lease)).await.unwrap();
        let mut watch = store.watch("/leader").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), watch.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, WatchEventKind::Delete);
    }
}
