use governance_core::config::{ElectionConfig, TransactionConfig};
use governance_core::store::{CoordinationStore, MemoryStore};
use governance_core::transaction::{ParticipantState, TransactionParticipant, TransactionPhase};
use governance_core::{FaultToleranceManager, GovernanceError};
use std::sync::Arc;
use std::time::Duration;

fn manager(store: &Arc<MemoryStore>) -> FaultToleranceManager {
    let dyn_store: Arc<dyn CoordinationStore> = store.clone();
    FaultToleranceManager::new(
        Some(dyn_store),
        TransactionConfig::default(),
        ElectionConfig::default(),
    )
}

#[tokio::test]
async fn test_participant_failure_rolls_back_pending_transactions() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager(&store);
    for node in ["a", "b", "c"] {
        manager.register_node(node).await;
    }

    let dyn_store: Arc<dyn CoordinationStore> = store.clone();
    let participant_a = Arc::new(TransactionParticipant::new("a", dyn_store, "/transactions"));
    let waiting = {
        let participant = Arc::clone(&participant_a);
        tokio::spawn(async move { participant.participate("transfer-1").await })
    };

    manager
        .start_2pc_transaction("transfer-1", &["a", "b"])
        .await
        .unwrap();
    manager
        .start_2pc_transaction("audit-1", &["c"])
        .await
        .unwrap();
    assert_eq!(manager.transactions_for_node("a").await, vec!["transfer-1".to_string()]);

    let rolled_back = manager.handle_node_failure("b").await.unwrap();
    assert_eq!(rolled_back, vec!["transfer-1".to_string()]);
    assert_eq!(manager.failed_nodes().await, vec!["b".to_string()]);
    assert!(!manager.is_node_active("b").await);

    // a was waiting for PREPARE and learns about the rollback instead
    let outcome = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, ParticipantState::RolledBack);

    // unrelated transaction untouched and still indexed
    assert_eq!(manager.transactions_for_node("c").await, vec!["audit-1".to_string()]);
    assert!(manager.transactions_for_node("a").await.is_empty());
    assert_eq!(manager.metrics().snapshot().transactions_rolled_back, 1);

    manager.recover_node("b").await;
    assert!(manager.is_node_active("b").await);
}

#[tokio::test]
async fn test_run_transaction_commits_and_unindexes() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager(&store);

    let participants: Vec<Arc<TransactionParticipant>> = ["a", "b"]
        .iter()
        .map(|id| {
            let dyn_store: Arc<dyn CoordinationStore> = store.clone();
            Arc::new(TransactionParticipant::new(*id, dyn_store, "/transactions"))
        })
        .collect();
    let tasks: Vec<_> = participants
        .iter()
        .map(|p| {
            let p = Arc::clone(p);
            tokio::spawn(async move { p.participate("deploy-7").await })
        })
        .collect();

    let coordinator = manager
        .start_2pc_transaction("deploy-7", &["a", "b"])
        .await
        .unwrap();
    assert!(manager.run_transaction("deploy-7").await.unwrap());
    assert_eq!(coordinator.lock().await.phase(), TransactionPhase::Commit);

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), ParticipantState::Committed);
    }
    assert!(manager.transaction("deploy-7").await.is_none());
    assert!(manager.transactions_for_node("a").await.is_empty());

    // nothing left to roll back when a participant fails afterwards
    assert!(manager.handle_node_failure("a").await.unwrap().is_empty());
    assert!(matches!(
        manager.run_transaction("deploy-7").await.unwrap_err(),
        GovernanceError::TransactionNotFound(_)
    ));
}

#[tokio::test]
async fn test_elect_leader_through_manager() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager(&store);

    let first = manager.elect_leader("/leader", "n1").await.unwrap();
    let second = manager.elect_leader("/leader", "n2").await.unwrap();
    assert!(first.is_leader());
    assert!(!second.is_leader());
    assert_eq!(second.current_leader().await.unwrap(), Some("n1".to_string()));

    manager.shutdown().await;
    assert!(!first.is_leader());
    assert_eq!(store.get("/leader").await.unwrap(), None);
}
