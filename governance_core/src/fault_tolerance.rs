//! Fault tolerance façade
//!
//! Tracks node liveness, creates transaction coordinators and election
//! services over one coordination store, and rolls back in-flight
//! transactions when a participant node fails.

use crate::config::{ElectionConfig, GovernanceConfig, TransactionConfig};
use crate::election::LeaderElection;
use crate::error::{BoxError, GovernanceError, GovernanceResult};
use crate::metrics::GovernanceMetrics;
use crate::store::CoordinationStore;
use crate::transaction::{TransactionCoordinator, TransactionPhase};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Coordinator shared between the caller and the manager
pub type SharedCoordinator = Arc<Mutex<TransactionCoordinator>>;

/// Pluggable reaction to node liveness changes
#[async_trait::async_trait]
pub trait RecoveryStrategy: Send + Sync {
    async fn on_node_failure(&self, _node_id: &str) -> Result<(), BoxError> {
        Ok(())
    }

    async fn on_node_recovery(&self, _node_id: &str) -> Result<(), BoxError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct NodeSets {
    active: BTreeSet<String>,
    failed: BTreeSet<String>,
}

/// Entry point for transactions, elections and node liveness
pub struct FaultToleranceManager {
    store: Option<Arc<dyn CoordinationStore>>,
    transaction_config: TransactionConfig,
    election_config: ElectionConfig,
    metrics: Arc<GovernanceMetrics>,
    strategies: RwLock<BTreeMap<String, Arc<dyn RecoveryStrategy>>>,
    nodes: RwLock<NodeSets>,
    /// node id -> in-flight transactions naming it as participant
    node_transactions: Mutex<HashMap<String, BTreeSet<String>>>,
    transactions: Mutex<HashMap<String, SharedCoordinator>>,
    elections: Mutex<Vec<Arc<LeaderElection>>>,
}

impl FaultToleranceManager {
    /// Create a manager. Without a store, liveness tracking still works but
    /// transactions and elections are unavailable.
    pub fn new(
        store: Option<Arc<dyn CoordinationStore>>,
        transaction_config: TransactionConfig,
        election_config: ElectionConfig,
    ) -> Self {
        Self {
            store,
            transaction_config,
            election_config,
            metrics: Arc::new(GovernanceMetrics::new()),
            strategies: RwLock::new(BTreeMap::new()),
            nodes: RwLock::new(NodeSets::default()),
            node_transactions: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            elections: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(
        config: &GovernanceConfig,
        store: Option<Arc<dyn CoordinationStore>>,
    ) -> Self {
        Self::new(store, config.transaction.clone(), config.election.clone())
    }

    pub fn with_metrics(mut self, metrics: Arc<GovernanceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<GovernanceMetrics> {
        &self.metrics
    }

    fn store(&self) -> GovernanceResult<Arc<dyn CoordinationStore>> {
        self.store.clone().ok_or(GovernanceError::StoreNotConfigured)
    }

    /// Register (or replace) a named recovery strategy
    pub async fn register_strategy(
        &self,
        name: impl Into<String>,
        strategy: Arc<dyn RecoveryStrategy>,
    ) {
        let name = name.into();
        tracing::info!("Registered recovery strategy {}", name);
        self.strategies.write().await.insert(name, strategy);
    }

    pub async fn strategy_names(&self) -> Vec<String> {
        self.strategies.read().await.keys().cloned().collect()
    }

    /// Mark a node as active
    pub async fn register_node(&self, node_id: impl Into<String>) {
        let node_id = node_id.into();
        let mut nodes = self.nodes.write().await;
        nodes.failed.remove(&node_id);
        nodes.active.insert(node_id);
        self.metrics.update_node_counts(nodes.active.len(), nodes.failed.len());
    }

    pub async fn active_nodes(&self) -> Vec<String> {
        self.nodes.read().await.active.iter().cloned().collect()
    }

    pub async fn failed_nodes(&self) -> Vec<String> {
        self.nodes.read().await.failed.iter().cloned().collect()
    }

    pub async fn is_node_active(&self, node_id: &str) -> bool {
        self.nodes.read().await.active.contains(node_id)
    }

    async fn notify_strategies(&self, node_id: &str, failed: bool) {
        let strategies: Vec<(String, Arc<dyn RecoveryStrategy>)> = self
            .strategies
            .read()
            .await
            .iter()
            .map(|(name, s)| (name.clone(), Arc::clone(s)))
            .collect();

        for (name, strategy) in strategies {
            let result = if failed {
                strategy.on_node_failure(node_id).await
            } else {
                strategy.on_node_recovery(node_id).await
            };
            if let Err(e) = result {
                tracing::warn!("Recovery strategy {} failed for node {}: {}", name, node_id, e);
            }
        }
    }

    /// Move a node to the failed set and roll back every in-flight
    /// transaction it participates in. Returns the rolled back ids.
    ///
    /// A transaction that is running its prepare phase is rolled back once
    /// that phase finishes; one that already reached a decision is left as is.
    pub async fn handle_node_failure(&self, node_id: &str) -> GovernanceResult<Vec<String>> {
        {
            let mut nodes = self.nodes.write().await;
            nodes.active.remove(node_id);
            nodes.failed.insert(node_id.to_string());
            self.metrics.update_node_counts(nodes.active.len(), nodes.failed.len());
        }
        self.metrics.record_node_failure();
        tracing::warn!("Node {} marked as failed", node_id);

        self.notify_strategies(node_id, true).await;

        if self.store.is_none() {
            return Ok(Vec::new());
        }

        let affected: Vec<String> = self
            .node_transactions
            .lock()
            .await
            .get(node_id)
            .map(|txns| txns.iter().cloned().collect())
            .unwrap_or_default();

        let mut rolled_back = Vec::new();
        let mut first_error = None;
        for transaction_id in affected {
            let Some(coordinator) = self.transaction(&transaction_id).await else {
                continue;
            };
            let mut coordinator = coordinator.lock().await;
            match coordinator.phase() {
                TransactionPhase::Prepare => match coordinator.rollback_phase().await {
                    Ok(()) => {
                        tracing::info!(
                            "Rolled back transaction {} after failure of node {}",
                            transaction_id,
                            node_id
                        );
                        rolled_back.push(transaction_id.clone());
                    }
                    Err(e) => {
                        tracing::error!("Rollback of transaction {} failed: {}", transaction_id, e);
                        first_error.get_or_insert(e);
                        continue;
                    }
                },
                TransactionPhase::Commit | TransactionPhase::Rollback => {}
            }
            drop(coordinator);
            self.complete_transaction(&transaction_id).await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(rolled_back),
        }
    }

    /// Move a node back to the active set
    pub async fn recover_node(&self, node_id: &str) {
        {
            let mut nodes = self.nodes.write().await;
            nodes.failed.remove(node_id);
            nodes.active.insert(node_id.to_string());
            self.metrics.update_node_counts(nodes.active.len(), nodes.failed.len());
        }
        self.metrics.record_node_recovery();
        tracing::info!("Node {} recovered", node_id);
        self.notify_strategies(node_id, false).await;
    }

    /// Create a coordinator for a new transaction and index it by participant
    pub async fn start_2pc_transaction<S: AsRef<str>>(
        &self,
        transaction_id: &str,
        participants: &[S],
    ) -> GovernanceResult<SharedCoordinator> {
        let store = self.store()?;
        let mut transactions = self.transactions.lock().await;
        if transactions.contains_key(transaction_id) {
            return Err(GovernanceError::DuplicateTransaction(transaction_id.to_string()));
        }

        let mut coordinator = TransactionCoordinator::new(
            transaction_id,
            store,
            &self.transaction_config,
            Arc::clone(&self.metrics),
        );
        for participant in participants {
            coordinator.add_participant(participant.as_ref())?;
        }

        {
            let mut index = self.node_transactions.lock().await;
            for participant in coordinator.participants() {
                index
                    .entry(participant.clone())
                    .or_default()
                    .insert(transaction_id.to_string());
            }
        }

        let shared = Arc::new(Mutex::new(coordinator));
        transactions.insert(transaction_id.to_string(), Arc::clone(&shared));
        tracing::info!(
            "Started transaction {} with {} participants",
            transaction_id,
            participants.len()
        );
        Ok(shared)
    }

    pub async fn transaction(&self, transaction_id: &str) -> Option<SharedCoordinator> {
        self.transactions.lock().await.get(transaction_id).cloned()
    }

    /// Run a registered transaction to completion and forget it. Returns
    /// whether it committed.
    pub async fn run_transaction(&self, transaction_id: &str) -> GovernanceResult<bool> {
        let coordinator = self
            .transaction(transaction_id)
            .await
            .ok_or_else(|| GovernanceError::TransactionNotFound(transaction_id.to_string()))?;

        let result = coordinator.lock().await.execute().await;
        let finished = coordinator.lock().await.phase().is_terminal();
        if finished {
            self.complete_transaction(transaction_id).await;
        }
        result
    }

    /// Drop a transaction from the registry and the node index. Returns
    /// false if it was unknown.
    pub async fn complete_transaction(&self, transaction_id: &str) -> bool {
        let removed = self.transactions.lock().await.remove(transaction_id);
        let mut index = self.node_transactions.lock().await;
        index.retain(|_, txns| {
            txns.remove(transaction_id);
            !txns.is_empty()
        });
        removed.is_some()
    }

    /// In-flight transactions naming `node_id` as participant
    pub async fn transactions_for_node(&self, node_id: &str) -> Vec<String> {
        self.node_transactions
            .lock()
            .await
            .get(node_id)
            .map(|txns| txns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Create an election service and immediately run for `election_key`.
    /// Check [`LeaderElection::is_leader`] for the outcome.
    pub async fn elect_leader(
        &self,
        election_key: &str,
        node_id: &str,
    ) -> GovernanceResult<Arc<LeaderElection>> {
        let store = self.store()?;
        let election = Arc::new(LeaderElection::new(
            store,
            election_key,
            &self.election_config,
            Arc::clone(&self.metrics),
        )?);
        let won = election.run_for_election(node_id).await?;

        // Only held leaderships need resigning at shutdown
        let mut elections = self.elections.lock().await;
        elections.retain(|held| held.is_leader());
        if won {
            elections.push(Arc::clone(&election));
        }
        Ok(election)
    }

    /// Election keys this manager currently leads
    pub async fn held_elections(&self) -> Vec<String> {
        self.elections
            .lock()
            .await
            .iter()
            .filter(|election| election.is_leader())
            .map(|election| election.election_key().to_string())
            .collect()
    }

    /// Resign every election started through this manager
    pub async fn shutdown(&self) {
        let elections: Vec<Arc<LeaderElection>> = self.elections.lock().await.drain(..).collect();
        for election in elections {
            if let Err(e) = election.resign().await {
                tracing::warn!("Failed to resign {}: {}", election.election_key(), e);
            }
        }
    }
}

impl std::fmt::Debug for FaultToleranceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultToleranceManager")
            .field("has_store", &self.store.is_some())
            .field("transaction_config", &self.transaction_config)
            .field("election_config", &self.election_config)
            .finish()
    }
}
