//! 2PC participant agent
//!
//! Answers PREPARE with a local precommit check and then applies the
//! coordinator's decision. Every step is logged under the participant's `log`
//! key, and commit/rollback are idempotent so a replayed decision is harmless.

use super::{
    Decision, TransactionKeys, Vote, LOG_COMMITTED, LOG_PREPARED, LOG_ROLLED_BACK,
};
use crate::error::{BoxError, GovernanceError, GovernanceResult, StoreError};
use crate::log::log_transaction_operation;
use crate::store::{CoordinationStore, WatchEventKind, WatchStream};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Local side of a transaction
#[async_trait::async_trait]
pub trait LocalTransactionHandler: Send + Sync {
    /// Decide whether this node can commit. Returning `Ok(false)` or an
    /// error votes no.
    async fn precommit(&self, _transaction_id: &str) -> Result<bool, BoxError> {
        Ok(true)
    }

    async fn commit(&self, _transaction_id: &str) -> Result<(), BoxError> {
        Ok(())
    }

    async fn rollback(&self, _transaction_id: &str) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Handler that always votes yes and has no local effects
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

#[async_trait::async_trait]
impl LocalTransactionHandler for NoopHandler {}

/// Where a participant stands in one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Prepared(Vote),
    Committed,
    RolledBack,
}

/// Participant agent for one node
pub struct TransactionParticipant {
    node_id: String,
    key_prefix: String,
    store: Arc<dyn CoordinationStore>,
    handler: Arc<dyn LocalTransactionHandler>,
    states: Mutex<HashMap<String, ParticipantState>>,
}

impl TransactionParticipant {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            key_prefix: key_prefix.into(),
            store,
            handler: Arc::new(NoopHandler),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn LocalTransactionHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn keys(&self, transaction_id: &str) -> TransactionKeys {
        TransactionKeys::new(&self.key_prefix, transaction_id)
    }

    fn violation(&self, transaction_id: &str, reason: impl Into<String>) -> GovernanceError {
        GovernanceError::ParticipantContractViolation {
            transaction_id: transaction_id.to_string(),
            node_id: self.node_id.clone(),
            reason: reason.into(),
        }
    }

    /// Current state for a transaction, as known by this agent
    pub async fn state(&self, transaction_id: &str) -> Option<ParticipantState> {
        self.states.lock().await.get(transaction_id).copied()
    }

    /// Rebuild state from the log and vote keys, for transactions this agent
    /// instance has not seen (e.g. after a restart)
    async fn durable_state(
        &self,
        transaction_id: &str,
    ) -> GovernanceResult<Option<ParticipantState>> {
        let keys = self.keys(transaction_id);
        let state = match self.store.get(&keys.log(&self.node_id)).await?.as_deref() {
            Some(LOG_COMMITTED) => Some(ParticipantState::Committed),
            Some(LOG_ROLLED_BACK) => Some(ParticipantState::RolledBack),
            Some(LOG_PREPARED) => {
                let vote = self
                    .store
                    .get(&keys.vote(&self.node_id))
                    .await?
                    .map(|v| Vote::parse(&v))
                    .unwrap_or(Vote::No);
                Some(ParticipantState::Prepared(vote))
            }
            _ => None,
        };
        Ok(state)
    }

    async fn known_state(
        &self,
        states: &HashMap<String, ParticipantState>,
        transaction_id: &str,
    ) -> GovernanceResult<Option<ParticipantState>> {
        match states.get(transaction_id) {
            Some(state) => Ok(Some(*state)),
            None => self.durable_state(transaction_id).await,
        }
    }

    /// Answer a PREPARE request: log "prepared", run the precommit check and
    /// write the vote. Preparing again returns the recorded vote.
    pub async fn prepare(&self, transaction_id: &str) -> GovernanceResult<Vote> {
        let start = Instant::now();
        let mut states = self.states.lock().await;
        let keys = self.keys(transaction_id);

        match self.known_state(&states, transaction_id).await? {
            Some(ParticipantState::Prepared(vote)) => {
                states.insert(transaction_id.to_string(), ParticipantState::Prepared(vote));
                self.store.put(&keys.vote(&self.node_id), vote.as_str(), None).await?;
                return Ok(vote);
            }
            Some(ParticipantState::Committed) => return Ok(Vote::Yes),
            Some(ParticipantState::RolledBack) => return Ok(Vote::No),
            None => {}
        }

        self.store.put(&keys.log(&self.node_id), LOG_PREPARED, None).await?;

        let vote = match self.handler.precommit(transaction_id).await {
            Ok(true) => Vote::Yes,
            Ok(false) => Vote::No,
            Err(e) => {
                tracing::warn!(
                    "Transaction {}: precommit on {} failed: {}",
                    transaction_id,
                    self.node_id,
                    e
                );
                Vote::No
            }
        };

        self.store.put(&keys.vote(&self.node_id), vote.as_str(), None).await?;
        states.insert(transaction_id.to_string(), ParticipantState::Prepared(vote));

        log_transaction_operation(
            "participant_prepare",
            transaction_id,
            vote.is_yes(),
            start.elapsed(),
            Some(vec![("node_id", self.node_id.clone()), ("vote", vote.to_string())]),
        );
        Ok(vote)
    }

    /// Apply a commit decision. Committing twice is a no-op; committing
    /// without a successful prepare is a contract violation.
    pub async fn commit(&self, transaction_id: &str) -> GovernanceResult<()> {
        let start = Instant::now();
        let mut states = self.states.lock().await;

        match self.known_state(&states, transaction_id).await? {
            Some(ParticipantState::Committed) => {
                states.insert(transaction_id.to_string(), ParticipantState::Committed);
                return Ok(());
            }
            Some(ParticipantState::Prepared(Vote::Yes)) => {}
            Some(ParticipantState::Prepared(vote)) => {
                let reason = format!("commit requested after voting {}", vote);
                let err = self.violation(transaction_id, reason);
                tracing::error!("{}", err);
                return Err(err);
            }
            Some(ParticipantState::RolledBack) => {
                let err = self.violation(transaction_id, "commit requested after rollback");
                tracing::error!("{}", err);
                return Err(err);
            }
            None => {
                let err = self.violation(transaction_id, "commit requested without prepare");
                tracing::error!("{}", err);
                return Err(err);
            }
        }

        self.handler
            .commit(transaction_id)
            .await
            .map_err(|e| GovernanceError::LocalAction {
                transaction_id: transaction_id.to_string(),
                action: "commit",
                reason: e.to_string(),
            })?;

        let keys = self.keys(transaction_id);
        self.store.put(&keys.log(&self.node_id), LOG_COMMITTED, None).await?;
        states.insert(transaction_id.to_string(), ParticipantState::Committed);

        log_transaction_operation(
            "participant_commit",
            transaction_id,
            true,
            start.elapsed(),
            Some(vec![("node_id", self.node_id.clone())]),
        );
        Ok(())
    }

    /// Apply a rollback decision regardless of the vote. Rolling back twice
    /// is a no-op; rolling back a committed transaction is refused.
    pub async fn rollback(&self, transaction_id: &str) -> GovernanceResult<()> {
        let start = Instant::now();
        let mut states = self.states.lock().await;

        match self.known_state(&states, transaction_id).await? {
            Some(ParticipantState::RolledBack) => {
                states.insert(transaction_id.to_string(), ParticipantState::RolledBack);
                return Ok(());
            }
            Some(ParticipantState::Committed) => {
                let err = self.violation(transaction_id, "rollback requested after commit");
                tracing::error!("{}", err);
                return Err(err);
            }
            Some(ParticipantState::Prepared(_)) | None => {}
        }

        self.handler
            .rollback(transaction_id)
            .await
            .map_err(|e| GovernanceError::LocalAction {
                transaction_id: transaction_id.to_string(),
                action: "rollback",
                reason: e.to_string(),
            })?;

        let keys = self.keys(transaction_id);
        self.store.put(&keys.log(&self.node_id), LOG_ROLLED_BACK, None).await?;
        states.insert(transaction_id.to_string(), ParticipantState::RolledBack);

        log_transaction_operation(
            "participant_rollback",
            transaction_id,
            true,
            start.elapsed(),
            Some(vec![("node_id", self.node_id.clone())]),
        );
        Ok(())
    }

    async fn apply(
        &self,
        transaction_id: &str,
        decision: Decision,
    ) -> GovernanceResult<ParticipantState> {
        match decision {
            Decision::Commit => {
                self.commit(transaction_id).await?;
                Ok(ParticipantState::Committed)
            }
            Decision::Rollback => {
                self.rollback(transaction_id).await?;
                Ok(ParticipantState::RolledBack)
            }
        }
    }

    /// Take part in a transaction end to end: wait for PREPARE, vote, then
    /// wait for and apply the decision.
    ///
    /// A rollback that arrives before PREPARE is applied directly. A closed
    /// watch stream fails with `StoreError::Disconnected`; call [`replay`]
    /// after reconnecting.
    ///
    /// [`replay`]: TransactionParticipant::replay
    pub async fn participate(&self, transaction_id: &str) -> GovernanceResult<ParticipantState> {
        let keys = self.keys(transaction_id);
        let prepare_key = keys.prepare(&self.node_id);
        let commit_key = keys.commit(&self.node_id);
        let rollback_key = keys.rollback(&self.node_id);

        // Subscribe to everything first so no write can slip between a read
        // and its watch
        let mut prepare_watch = self.store.watch(&prepare_key).await?;
        let mut commit_watch = self.store.watch(&commit_key).await?;
        let mut rollback_watch = self.store.watch(&rollback_key).await?;

        if self.store.get(&rollback_key).await?.is_some() {
            return self.apply(transaction_id, Decision::Rollback).await;
        }

        if self.store.get(&prepare_key).await?.is_none() {
            tokio::select! {
                result = wait_for_put(&mut prepare_watch) => { result?; }
                result = wait_for_put(&mut rollback_watch) => {
                    result?;
                    return self.apply(transaction_id, Decision::Rollback).await;
                }
            }
        }

        self.prepare(transaction_id).await?;

        if self.store.get(&commit_key).await?.is_some() {
            return self.apply(transaction_id, Decision::Commit).await;
        }
        if self.store.get(&rollback_key).await?.is_some() {
            return self.apply(transaction_id, Decision::Rollback).await;
        }

        let decision = tokio::select! {
            result = wait_for_put(&mut commit_watch) => { result?; Decision::Commit }
            result = wait_for_put(&mut rollback_watch) => { result?; Decision::Rollback }
        };
        self.apply(transaction_id, decision).await
    }

    /// Apply a decision already recorded in the store. Returns `None` when
    /// no instruction for this node exists yet.
    pub async fn replay(&self, transaction_id: &str) -> GovernanceResult<Option<ParticipantState>> {
        let keys = self.keys(transaction_id);
        if self.store.get(&keys.commit(&self.node_id)).await?.is_some() {
            return self.apply(transaction_id, Decision::Commit).await.map(Some);
        }
        if self.store.get(&keys.rollback(&self.node_id)).await?.is_some() {
            return self.apply(transaction_id, Decision::Rollback).await.map(Some);
        }
        Ok(None)
    }
}

impl std::fmt::Debug for TransactionParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionParticipant")
            .field("node_id", &self.node_id)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

/// Wait until the watched key is written
async fn wait_for_put(watch: &mut WatchStream) -> GovernanceResult<String> {
    while let Some(event) = watch.next().await {
        if let WatchEventKind::Put(value) = event.kind {
            return Ok(value);
        }
    }
    Err(StoreError::Disconnected.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        vote_yes: bool,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LocalTransactionHandler for CountingHandler {
        async fn precommit(&self, _transaction_id: &str) -> Result<bool, BoxError> {
            Ok(self.vote_yes)
        }

        async fn commit(&self, _transaction_id: &str) -> Result<(), BoxError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self, _transaction_id: &str) -> Result<(), BoxError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn participant(
        store: &Arc<MemoryStore>,
        handler: Arc<CountingHandler>,
    ) -> TransactionParticipant {
        let store: Arc<dyn CoordinationStore> = store.clone();
        TransactionParticipant::new("a", store, "/tx").with_handler(handler)
    }

    #[tokio::test]
    async fn test_prepare_logs_and_votes() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler {
            vote_yes: true,
            ..Default::default()
        });
        let participant = participant(&store, handler);

        assert_eq!(participant.prepare("t1").await.unwrap(), Vote::Yes);
        assert_eq!(store.get("/tx/t1/log/a").await.unwrap(), Some("prepared".to_string()));
        assert_eq!(store.get("/tx/t1/vote/a").await.unwrap(), Some("yes".to_string()));
        assert_eq!(participant.state("t1").await, Some(ParticipantState::Prepared(Vote::Yes)));
    }

    #[tokio::test]
    async fn test_commit_and_rollback_are_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler {
            vote_yes: true,
            ..Default::default()
        });
        let participant = participant(&store, handler.clone());

        participant.prepare("t1").await.unwrap();
        participant.commit("t1").await.unwrap();
        participant.commit("t1").await.unwrap();
        assert_eq!(handler.commits.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("/tx/t1/log/a").await.unwrap(), Some("committed".to_string()));

        participant.prepare("t2").await.unwrap();
        participant.rollback("t2").await.unwrap();
        participant.rollback("t2").await.unwrap();
        assert_eq!(handler.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("/tx/t2/log/a").await.unwrap(), Some("rolledback".to_string()));
    }

    #[tokio::test]
    async fn test_commit_without_successful_prepare_fails() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler::default());
        let participant = participant(&store, handler.clone());

        let err = participant.commit("t1").await.unwrap_err();
        assert!(matches!(err, GovernanceError::ParticipantContractViolation { .. }));

        assert_eq!(participant.prepare("t2").await.unwrap(), Vote::No);
        assert!(participant.commit("t2").await.is_err());
        participant.rollback("t2").await.unwrap();
        assert_eq!(handler.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler {
            vote_yes: true,
            ..Default::default()
        });
        participant(&store, handler.clone()).prepare("t1").await.unwrap();

        let restarted = participant(&store, handler.clone());
        restarted.commit("t1").await.unwrap();
        assert_eq!(handler.commits.load(Ordering::SeqCst), 1);

        let again = participant(&store, handler.clone());
        again.commit("t1").await.unwrap();
        assert!(again.rollback("t1").await.is_err());
        assert_eq!(handler.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replay_applies_recorded_decision() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler::default());
        let participant = participant(&store, handler.clone());

        assert_eq!(participant.replay("t1").await.unwrap(), None);
        store.put("/tx/t1/rollback/a", "ROLLBACK", None).await.unwrap();
        assert_eq!(participant.replay("t1").await.unwrap(), Some(ParticipantState::RolledBack));
        assert_eq!(participant.replay("t1").await.unwrap(), Some(ParticipantState::RolledBack));
        assert_eq!(handler.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_participate_disconnect() {
        let store = Arc::new(MemoryStore::new());
        let participant = Arc::new(participant(&store, Arc::new(CountingHandler::default())));

        let task = {
            let participant = Arc::clone(&participant);
            tokio::spawn(async move { participant.participate("t1").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        store.disconnect_watchers().await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, GovernanceError::Store(StoreError::Disconnected)));
    }
}
