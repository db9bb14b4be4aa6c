use governance_core::config::ElectionConfig;
use governance_core::store::{CoordinationStore, MemoryStore};
use governance_core::{GovernanceMetrics, LeaderElection};
use std::sync::Arc;
use std::time::Duration;

const KEY: &str = "/services/scheduler/leader";

fn candidate(store: &Arc<MemoryStore>, metrics: &Arc<GovernanceMetrics>) -> LeaderElection {
    let dyn_store: Arc<dyn CoordinationStore> = store.clone();
    LeaderElection::new(dyn_store, KEY, &ElectionConfig::default(), Arc::clone(metrics))
        .and_then(|election| {
            election.with_timing(Duration::from_millis(150), Duration::from_millis(40))
        })
        .unwrap()
}

#[tokio::test]
async fn test_concurrent_candidates_elect_exactly_one() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(GovernanceMetrics::new());
    let candidates: Vec<Arc<LeaderElection>> =
        (0..8).map(|_| Arc::new(candidate(&store, &metrics))).collect();

    let tasks: Vec<_> = candidates
        .iter()
        .enumerate()
        .map(|(i, election)| {
            let election = Arc::clone(election);
            tokio::spawn(async move {
                election
                    .run_for_election(&format!("node-{}", i))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = Vec::new();
    for (i, task) in tasks.into_iter().enumerate() {
        if task.await.unwrap() {
            winners.push(i);
        }
    }

    assert_eq!(winners.len(), 1);
    let leaders = candidates.iter().filter(|c| c.is_leader()).count();
    assert_eq!(leaders, 1);

    let holder = candidates[0].current_leader().await.unwrap();
    assert_eq!(holder, Some(format!("node-{}", winners[0])));

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.elections_won, 1);
    assert_eq!(snapshot.elections_lost, 7);
    assert_eq!(store.lease_count().await, 1);
}

#[tokio::test]
async fn test_resignation_hands_over_leadership() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(GovernanceMetrics::new());
    let first = candidate(&store, &metrics);
    let second = candidate(&store, &metrics);

    assert!(first.run_for_election("node-1").await.unwrap());
    assert!(!second.run_for_election("node-2").await.unwrap());

    first.resign().await.unwrap();
    assert!(!first.is_leader());
    assert!(second.run_for_election("node-2").await.unwrap());
    assert_eq!(first.current_leader().await.unwrap(), Some("node-2".to_string()));
}

#[tokio::test]
async fn test_expired_lease_allows_new_leader() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(GovernanceMetrics::new());
    let first = candidate(&store, &metrics);
    let second = candidate(&store, &metrics);

    assert!(first.run_for_election("node-1").await.unwrap());
    // stop heartbeating without revoking, as a crashed leader would
    first.stop().await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(second.current_leader().await.unwrap(), None);
    assert!(second.run_for_election("node-2").await.unwrap());
    assert!(second.is_leader());
}

#[tokio::test]
async fn test_lost_lease_is_noticed_by_holder() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(GovernanceMetrics::new());
    let leader = candidate(&store, &metrics);
    assert!(leader.run_for_election("node-1").await.unwrap());

    // an operator deletes the key out from under the leader
    store.delete(KEY).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!leader.is_leader());
    assert_eq!(metrics.snapshot().leadership_lost, 1);

    // running again after a loss starts a fresh term
    assert!(leader.run_for_election("node-1").await.unwrap());
    assert!(leader.is_leader());
}
