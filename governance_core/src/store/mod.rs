//! Coordination store client boundary
//!
//! The governance core consumes a consistent, lease- and watch-capable
//! key-value service (an etcd-like system). This module defines the client
//! trait the rest of the crate is written against, plus an in-process
//! implementation used for tests and single-node deployments.

pub mod memory;

use crate::error::StoreResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

pub use memory::MemoryStore;

/// Identifier of a lease issued by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of change observed on a watched key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Key was written with this value
    Put(String),
    /// Key was deleted, either explicitly or because its lease ended
    Delete,
}

/// A single change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: WatchEventKind,
    /// Store revision at which the change happened
    pub revision: u64,
}

impl WatchEvent {
    /// Value written by a put event
    pub fn value(&self) -> Option<&str> {
        match &self.kind {
            WatchEventKind::Put(value) => Some(value),
            WatchEventKind::Delete => None,
        }
    }
}

/// Stream of change events for one key.
///
/// `next` returning `None` means the watch connection ended. Callers must
/// treat that as "state unknown", never as "nothing changed".
#[derive(Debug)]
pub struct WatchStream {
    key: String,
    receiver: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(key: impl Into<String>, receiver: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self {
            key: key.into(),
            receiver,
        }
    }

    /// Key this stream observes
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the next change event
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.receiver.recv().await
    }
}

/// Client interface to the coordination store
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write `value` at `key`, optionally bound to a lease
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()>;

    /// Write `value` only if `key` has no live value. Returns whether the
    /// write happened.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> StoreResult<bool>;

    /// Read the current value of `key`
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Read every live key starting with `prefix`, sorted by key
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>>;

    /// Delete `key`. Returns whether a value was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Create a lease that expires after `ttl` unless renewed
    async fn lease_create(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Renew a lease for another full TTL
    async fn lease_keepalive(&self, lease: LeaseId) -> StoreResult<()>;

    /// Revoke a lease, deleting every key bound to it
    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()>;

    /// Subscribe to changes of `key`
    async fn watch(&self, key: &str) -> StoreResult<WatchStream>;
}
