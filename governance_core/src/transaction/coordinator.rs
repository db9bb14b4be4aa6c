//! 2PC coordinator
//!
//! Drives one transaction through `Prepare -> {Commit | Rollback}`. The
//! coordinator's record and decision are persisted so that a restarted
//! coordinator can be rebuilt with [`TransactionCoordinator::recover`].

use super::{Decision, TransactionKeys, TransactionPhase, Vote, PREPARE_REQUEST};
use crate::config::TransactionConfig;
use crate::error::{GovernanceError, GovernanceResult, StoreError};
use crate::log::log_transaction_operation;
use crate::metrics::GovernanceMetrics;
use crate::store::{CoordinationStore, WatchEventKind};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Durable coordinator state, stored as JSON under the `state` key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub phase: TransactionPhase,
    pub participants: Vec<String>,
    pub votes: BTreeMap<String, Vote>,
    pub prepare_started: bool,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    fn new(transaction_id: &str) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            phase: TransactionPhase::Prepare,
            participants: Vec::new(),
            votes: BTreeMap::new(),
            prepare_started: false,
            updated_at: Utc::now(),
        }
    }

    /// True when there is at least one participant and every participant
    /// voted yes
    pub fn unanimous(&self) -> bool {
        !self.participants.is_empty()
            && self
                .participants
                .iter()
                .all(|p| self.votes.get(p).map(Vote::is_yes).unwrap_or(false))
    }

    /// Participants whose vote was not yes
    pub fn dissenters(&self) -> Vec<(String, Vote)> {
        self.participants
            .iter()
            .filter_map(|p| match self.votes.get(p) {
                Some(Vote::Yes) => None,
                Some(vote) => Some((p.clone(), *vote)),
                None => Some((p.clone(), Vote::No)),
            })
            .collect()
    }
}

/// Coordinator of a single distributed transaction
pub struct TransactionCoordinator {
    record: TransactionRecord,
    keys: TransactionKeys,
    store: Arc<dyn CoordinationStore>,
    vote_timeout: Duration,
    auto_rollback: bool,
    metrics: Arc<GovernanceMetrics>,
}

impl TransactionCoordinator {
    pub fn new(
        transaction_id: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        config: &TransactionConfig,
        metrics: Arc<GovernanceMetrics>,
    ) -> Self {
        let transaction_id = transaction_id.into();
        metrics.record_transaction_started();
        Self::from_record(TransactionRecord::new(&transaction_id), store, config, metrics)
    }

    fn from_record(
        record: TransactionRecord,
        store: Arc<dyn CoordinationStore>,
        config: &TransactionConfig,
        metrics: Arc<GovernanceMetrics>,
    ) -> Self {
        Self {
            keys: TransactionKeys::new(&config.key_prefix, &record.transaction_id),
            record,
            store,
            vote_timeout: config.vote_duration(),
            auto_rollback: config.auto_rollback,
            metrics,
        }
    }

    /// Override the per-participant vote timeout
    pub fn with_vote_timeout(mut self, timeout: Duration) -> Self {
        self.vote_timeout = timeout;
        self
    }

    pub fn transaction_id(&self) -> &str {
        &self.record.transaction_id
    }

    pub fn phase(&self) -> TransactionPhase {
        self.record.phase
    }

    pub fn participants(&self) -> &[String] {
        &self.record.participants
    }

    pub fn votes(&self) -> &BTreeMap<String, Vote> {
        &self.record.votes
    }

    pub fn record(&self) -> &TransactionRecord {
        &self.record
    }

    pub fn keys(&self) -> &TransactionKeys {
        &self.keys
    }

    fn invalid_state(&self, operation: &'static str) -> GovernanceError {
        GovernanceError::InvalidTransactionState {
            transaction_id: self.record.transaction_id.clone(),
            phase: self.record.phase,
            operation,
        }
    }

    /// Add a participant. Only allowed before the prepare phase starts;
    /// adding the same participant twice is a no-op.
    pub fn add_participant(&mut self, node_id: impl Into<String>) -> GovernanceResult<()> {
        if self.record.prepare_started || self.record.phase.is_terminal() {
            return Err(self.invalid_state("add participant"));
        }
        let node_id = node_id.into();
        if !self.record.participants.contains(&node_id) {
            self.record.participants.push(node_id);
        }
        Ok(())
    }

    async fn persist(&mut self) -> GovernanceResult<()> {
        self.record.updated_at = Utc::now();
        let json = serde_json::to_string(&self.record).map_err(StoreError::from)?;
        self.store.put(&self.keys.state(), &json, None).await?;
        Ok(())
    }

    /// Ask one participant to prepare and wait for its vote.
    ///
    /// The watch is opened before the request is written so a fast vote is
    /// never missed. A closed watch or an elapsed timeout yields `Timeout`.
    async fn request_vote(&self, participant: &str) -> GovernanceResult<Vote> {
        let vote_key = self.keys.vote(participant);
        let mut watch = self.store.watch(&vote_key).await?;

        self.store
            .put(&self.keys.prepare(participant), PREPARE_REQUEST, None)
            .await?;

        if let Some(existing) = self.store.get(&vote_key).await? {
            return Ok(Vote::parse(&existing));
        }

        let wait = async {
            while let Some(event) = watch.next().await {
                if let WatchEventKind::Put(value) = event.kind {
                    return Some(Vote::parse(&value));
                }
            }
            None
        };

        match tokio::time::timeout(self.vote_timeout, wait).await {
            Ok(Some(vote)) => Ok(vote),
            Ok(None) => {
                tracing::warn!(
                    "Transaction {}: vote watch for {} closed before a vote arrived",
                    self.record.transaction_id,
                    participant
                );
                Ok(Vote::Timeout)
            }
            Err(_) => {
                tracing::warn!(
                    "Transaction {}: participant {} did not vote within {:?}",
                    self.record.transaction_id,
                    participant,
                    self.vote_timeout
                );
                Ok(Vote::Timeout)
            }
        }
    }

    /// Run the prepare phase. Returns true iff every participant voted yes.
    ///
    /// Votes are collected concurrently, each with its own timeout, and the
    /// result depends only on the complete vote set. This never writes commit
    /// or rollback instructions.
    pub async fn prepare_phase(&mut self) -> GovernanceResult<bool> {
        if self.record.phase.is_terminal() {
            return Err(self.invalid_state("prepare"));
        }
        // Nobody would vote, so nothing could justify a commit
        if self.record.participants.is_empty() {
            return Err(self.invalid_state("prepare without participants"));
        }

        let start = Instant::now();
        self.record.prepare_started = true;
        self.persist().await?;

        let results = {
            let this = &*self;
            join_all(this.record.participants.iter().map(|p| this.request_vote(p))).await
        };

        let mut votes = BTreeMap::new();
        for (participant, result) in self.record.participants.iter().zip(results) {
            let vote = result?;
            self.metrics.record_vote(vote);
            votes.insert(participant.clone(), vote);
        }
        self.record.votes = votes;
        self.persist().await?;

        let unanimous = self.record.unanimous();
        if unanimous {
            log_transaction_operation(
                "prepare",
                &self.record.transaction_id,
                true,
                start.elapsed(),
                Some(vec![("participants", self.record.participants.len().to_string())]),
            );
        } else {
            let failing = self
                .record
                .dissenters()
                .iter()
                .map(|(p, v)| format!("{}:{}", p, v))
                .collect::<Vec<_>>()
                .join(",");
            log_transaction_operation(
                "prepare",
                &self.record.transaction_id,
                false,
                start.elapsed(),
                Some(vec![("failing", failing)]),
            );
        }
        Ok(unanimous)
    }

    async fn write_decision(&mut self, decision: Decision) -> GovernanceResult<()> {
        self.store
            .put(&self.keys.decision(), decision.as_str(), None)
            .await?;
        self.record.phase = decision.phase();
        self.persist().await
    }

    async fn send_instructions(&self, decision: Decision) -> GovernanceResult<()> {
        let writes = self.record.participants.iter().map(|p| {
            let (key, value) = self.keys.instruction(decision, p);
            async move { self.store.put(&key, value, None).await }
        });
        for result in join_all(writes).await {
            result?;
        }
        Ok(())
    }

    /// Record the commit decision and instruct every participant to commit.
    /// Does not wait for acknowledgements.
    ///
    /// Fails with `CommitNotAllowed` unless every participant voted yes.
    /// Calling it again after a commit re-issues the instructions.
    pub async fn commit_phase(&mut self) -> GovernanceResult<()> {
        let start = Instant::now();
        match self.record.phase {
            TransactionPhase::Commit => return self.send_instructions(Decision::Commit).await,
            TransactionPhase::Rollback => return Err(self.invalid_state("commit")),
            TransactionPhase::Prepare => {}
        }

        if !self.record.prepare_started || self.record.participants.is_empty() {
            return Err(self.invalid_state("commit"));
        }
        if let Some((participant, vote)) = self.record.dissenters().into_iter().next() {
            return Err(GovernanceError::CommitNotAllowed {
                transaction_id: self.record.transaction_id.clone(),
                participant,
                vote,
            });
        }

        self.write_decision(Decision::Commit).await?;
        self.send_instructions(Decision::Commit).await?;
        self.metrics.record_transaction_committed();
        log_transaction_operation(
            "commit",
            &self.record.transaction_id,
            true,
            start.elapsed(),
            None,
        );
        Ok(())
    }

    /// Record the rollback decision and instruct every participant to roll
    /// back, whatever it voted. Fails after a commit; calling it again after
    /// a rollback re-issues the instructions.
    pub async fn rollback_phase(&mut self) -> GovernanceResult<()> {
        let start = Instant::now();
        match self.record.phase {
            TransactionPhase::Rollback => return self.send_instructions(Decision::Rollback).await,
            TransactionPhase::Commit => return Err(self.invalid_state("rollback")),
            TransactionPhase::Prepare => {}
        }

        self.write_decision(Decision::Rollback).await?;
        self.send_instructions(Decision::Rollback).await?;
        self.metrics.record_transaction_rolled_back();
        log_transaction_operation(
            "rollback",
            &self.record.transaction_id,
            true,
            start.elapsed(),
            Some(vec![("participants", self.record.participants.join(","))]),
        );
        Ok(())
    }

    /// Run the whole protocol. Returns whether the transaction committed.
    ///
    /// With `auto_rollback` enabled a failed prepare phase is rolled back
    /// here; otherwise the caller decides what to do.
    pub async fn execute(&mut self) -> GovernanceResult<bool> {
        match self.prepare_phase().await {
            Ok(true) => {
                self.commit_phase().await?;
                Ok(true)
            }
            Ok(false) => {
                if self.auto_rollback {
                    self.rollback_phase().await?;
                }
                Ok(false)
            }
            Err(e) => {
                if self.auto_rollback {
                    if let Err(rollback_err) = self.rollback_phase().await {
                        tracing::error!(
                            "Transaction {}: rollback after failed prepare also failed: {}",
                            self.record.transaction_id,
                            rollback_err
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Rebuild a coordinator from the store. Returns `None` if the
    /// transaction was never persisted.
    pub async fn recover(
        store: Arc<dyn CoordinationStore>,
        transaction_id: &str,
        config: &TransactionConfig,
        metrics: Arc<GovernanceMetrics>,
    ) -> GovernanceResult<Option<Self>> {
        let keys = TransactionKeys::new(&config.key_prefix, transaction_id);
        let Some(json) = store.get(&keys.state()).await? else {
            return Ok(None);
        };
        let mut record: TransactionRecord = serde_json::from_str(&json).map_err(StoreError::from)?;

        // The decision is written before the record, so it wins
        let decision = store.get(&keys.decision()).await?;
        if let Some(decision) = decision.as_deref().and_then(Decision::parse) {
            record.phase = decision.phase();
        }

        tracing::info!(
            "Recovered transaction {} in phase {} with {} participants",
            record.transaction_id,
            record.phase,
            record.participants.len()
        );
        Ok(Some(Self::from_record(record, store, config, metrics)))
    }

    /// Finish a recovered transaction: re-issue a recorded decision, or roll
    /// back when no decision was recorded (presumed abort).
    pub async fn resume(&mut self) -> GovernanceResult<TransactionPhase> {
        match self.record.phase {
            TransactionPhase::Commit => self.commit_phase().await?,
            TransactionPhase::Rollback | TransactionPhase::Prepare => self.rollback_phase().await?,
        }
        Ok(self.record.phase)
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("record", &self.record)
            .field("vote_timeout", &self.vote_timeout)
            .field("auto_rollback", &self.auto_rollback)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config() -> TransactionConfig {
        TransactionConfig {
            vote_timeout: 1,
            auto_rollback: true,
            key_prefix: "/tx".to_string(),
        }
    }

    fn coordinator(store: &Arc<MemoryStore>, id: &str) -> TransactionCoordinator {
        let store: Arc<dyn CoordinationStore> = store.clone();
        TransactionCoordinator::new(id, store, &config(), Arc::new(GovernanceMetrics::new()))
            .with_vote_timeout(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_add_participant_after_prepare_fails() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(&store, "t1");
        coordinator.add_participant("a").unwrap();
        coordinator.add_participant("a").unwrap();
        assert_eq!(coordinator.participants().to_vec(), vec!["a".to_string()]);

        store.put("/tx/t1/vote/a", "yes", None).await.unwrap();
        assert!(coordinator.prepare_phase().await.unwrap());

        let err = coordinator.add_participant("b").unwrap_err();
        assert!(matches!(err, GovernanceError::InvalidTransactionState { .. }));
    }

    #[tokio::test]
    async fn test_missing_vote_times_out() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(&store, "t2");
        coordinator.add_participant("a").unwrap();
        coordinator.add_participant("b").unwrap();
        store.put("/tx/t2/vote/a", "yes", None).await.unwrap();

        assert!(!coordinator.prepare_phase().await.unwrap());
        assert_eq!(coordinator.votes()["a"], Vote::Yes);
        assert_eq!(coordinator.votes()["b"], Vote::Timeout);
        assert_eq!(
            store.get("/tx/t2/prepare/b").await.unwrap(),
            Some(PREPARE_REQUEST.to_string())
        );
        // prepare alone never decides
        assert_eq!(store.get("/tx/t2/decision").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_requires_unanimity() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(&store, "t3");
        coordinator.add_participant("a").unwrap();
        coordinator.add_participant("b").unwrap();
        store.put("/tx/t3/vote/a", "yes", None).await.unwrap();
        store.put("/tx/t3/vote/b", "no", None).await.unwrap();

        assert!(!coordinator.prepare_phase().await.unwrap());
        let err = coordinator.commit_phase().await.unwrap_err();
        match err {
            GovernanceError::CommitNotAllowed { participant, vote, .. } => {
                assert_eq!(participant, "b");
                assert_eq!(vote, Vote::No);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.get("/tx/t3/commit/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prepare_without_participants_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(&store, "t-empty");

        let err = coordinator.prepare_phase().await.unwrap_err();
        assert!(matches!(err, GovernanceError::InvalidTransactionState { .. }));
        assert!(coordinator.commit_phase().await.is_err());
        assert_eq!(store.get("/tx/t-empty/decision").await.unwrap(), None);
        assert!(!TransactionRecord::new("t-empty").unanimous());

        // execute never commits it; auto-rollback closes it out instead
        assert!(coordinator.execute().await.is_err());
        assert_eq!(
            store.get("/tx/t-empty/decision").await.unwrap(),
            Some("rollback".to_string())
        );
    }

    #[tokio::test]
    async fn test_commit_before_prepare_fails() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(&store, "t4");
        coordinator.add_participant("a").unwrap();
        assert!(coordinator.commit_phase().await.is_err());
    }

    #[tokio::test]
    async fn test_terminal_phases_are_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(&store, "t5");
        coordinator.add_participant("a").unwrap();
        coordinator.rollback_phase().await.unwrap();
        assert_eq!(coordinator.phase(), TransactionPhase::Rollback);

        assert!(coordinator.commit_phase().await.is_err());
        assert!(coordinator.prepare_phase().await.is_err());
        coordinator.rollback_phase().await.unwrap();
        assert_eq!(
            store.get("/tx/t5/rollback/a").await.unwrap(),
            Some("ROLLBACK".to_string())
        );
    }

    #[tokio::test]
    async fn test_recover_uses_decision() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(&store, "t6");
        coordinator.add_participant("a").unwrap();
        store.put("/tx/t6/vote/a", "yes", None).await.unwrap();
        assert!(coordinator.prepare_phase().await.unwrap());

        // Crash after the decision but before the record was updated
        store.put("/tx/t6/decision", "commit", None).await.unwrap();
        drop(coordinator);

        let dyn_store: Arc<dyn CoordinationStore> = store.clone();
        let mut recovered = TransactionCoordinator::recover(
            dyn_store,
            "t6",
            &config(),
            Arc::new(GovernanceMetrics::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(recovered.phase(), TransactionPhase::Commit);
        assert_eq!(recovered.resume().await.unwrap(), TransactionPhase::Commit);
        assert_eq!(
            store.get("/tx/t6/commit/a").await.unwrap(),
            Some("COMMIT".to_string())
        );
    }

    #[tokio::test]
    async fn test_recover_unknown_transaction() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let recovered = TransactionCoordinator::recover(
            store,
            "missing",
            &config(),
            Arc::new(GovernanceMetrics::new()),
        )
        .await
        .unwrap();
        assert!(recovered.is_none());
    }

    #[tokio::test]
    async fn test_resume_without_decision_presumes_abort() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(&store, "t7");
        coordinator.add_participant("a").unwrap();
        coordinator.add_participant("b").unwrap();
        store.put("/tx/t7/vote/a", "yes", None).await.unwrap();
        store.put("/tx/t7/vote/b", "yes", None).await.unwrap();
        assert!(coordinator.prepare_phase().await.unwrap());
        drop(coordinator);

        let dyn_store: Arc<dyn CoordinationStore> = store.clone();
        let metrics = Arc::new(GovernanceMetrics::new());
        let mut recovered = TransactionCoordinator::recover(dyn_store, "t7", &config(), metrics)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recovered.phase(), TransactionPhase::Prepare);
        assert_eq!(recovered.resume().await.unwrap(), TransactionPhase::Rollback);
        assert_eq!(store.get("/tx/t7/decision").await.unwrap(), Some("rollback".to_string()));
        assert!(store.get("/tx/t7/rollback/b").await.unwrap().is_some());
    }
}
