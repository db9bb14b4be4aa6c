//! Metrics collection for the governance core
//!
//! Counters are kept locally as atomics (for snapshots and tests) and mirrored
//! to the `metrics` facade so a Prometheus exporter can scrape them.

use crate::config::MetricsConfig;
use crate::resource::ResourceKind;
use crate::transaction::Vote;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector shared by the resource manager, the 2PC coordinator,
/// leader elections and the fault tolerance manager
#[derive(Debug, Default)]
pub struct GovernanceMetrics {
    resource: ResourceMetrics,
    transaction: TransactionMetrics,
    election: ElectionMetrics,
    nodes: NodeMetrics,
}

/// Resource manager metrics
#[derive(Debug, Default)]
pub struct ResourceMetrics {
    pub registered: AtomicU64,
    pub released: AtomicU64,
    pub reclaimed: AtomicU64,
    pub limit_rejections: AtomicU64,
    pub cleanup_failures: AtomicU64,
    /// Last published number of live resources
    pub live: AtomicU64,
}

/// Two-phase commit metrics
#[derive(Debug, Default)]
pub struct TransactionMetrics {
    pub started: AtomicU64,
    pub committed: AtomicU64,
    pub rolled_back: AtomicU64,
    pub votes_yes: AtomicU64,
    pub votes_no: AtomicU64,
    pub votes_timeout: AtomicU64,
}

/// Leader election metrics
#[derive(Debug, Default)]
pub struct ElectionMetrics {
    pub won: AtomicU64,
    pub lost: AtomicU64,
    pub leadership_lost: AtomicU64,
}

/// Node liveness metrics
#[derive(Debug, Default)]
pub struct NodeMetrics {
    pub failures: AtomicU64,
    pub recoveries: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub resources_registered: u64,
    pub resources_released: u64,
    pub resources_reclaimed: u64,
    pub limit_rejections: u64,
    pub cleanup_failures: u64,
    pub resources_live: u64,
    pub transactions_started: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub votes_yes: u64,
    pub votes_no: u64,
    pub votes_timeout: u64,
    pub elections_won: u64,
    pub elections_lost: u64,
    pub leadership_lost: u64,
    pub node_failures: u64,
    pub node_recoveries: u64,
}

impl GovernanceMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_resource_registered(&self, kind: ResourceKind) {
        self.resource.registered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("governance_resources_registered_total", 1, "kind" => kind.as_str());
    }

    pub fn record_resource_released(&self, kind: ResourceKind) {
        self.resource.released.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("governance_resources_released_total", 1, "kind" => kind.as_str());
    }

    pub fn record_resources_reclaimed(&self, count: usize) {
        self.resource.reclaimed.fetch_add(count as u64, Ordering::Relaxed);
        metrics::counter!("governance_resources_reclaimed_total", count as u64);
    }

    pub fn record_limit_rejection(&self, kind: ResourceKind) {
        self.resource.limit_rejections.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("governance_resource_limit_rejections_total", 1, "kind" => kind.as_str());
    }

    /// Record a cleanup callback that returned an error or panicked
    pub fn record_cleanup_failure(&self, kind: ResourceKind) {
        self.resource.cleanup_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("governance_cleanup_failures_total", 1, "kind" => kind.as_str());
    }

    /// Update live resource gauges
    pub fn update_resource_usage(&self, total: usize, memory_mb: f64) {
        self.resource.live.store(total as u64, Ordering::Relaxed);
        metrics::gauge!("governance_resources_live", total as f64);
        metrics::gauge!("governance_process_memory_mb", memory_mb);
    }

    pub fn record_transaction_started(&self) {
        self.transaction.started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("governance_transactions_started_total", 1);
    }

    pub fn record_transaction_committed(&self) {
        self.transaction.committed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("governance_transactions_committed_total", 1);
    }

    pub fn record_transaction_rolled_back(&self) {
        self.transaction.rolled_back.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("governance_transactions_rolled_back_total", 1);
    }

    pub fn record_vote(&self, vote: Vote) {
        let counter = match vote {
            Vote::Yes => &self.transaction.votes_yes,
            Vote::No => &self.transaction.votes_no,
            Vote::Timeout => &self.transaction.votes_timeout,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("governance_votes_total", 1, "vote" => vote.as_str());
    }

    pub fn record_election(&self, won: bool) {
        if won {
            self.election.won.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("governance_elections_won_total", 1);
        } else {
            self.election.lost.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("governance_elections_lost_total", 1);
        }
    }

    pub fn record_leadership_lost(&self) {
        self.election.leadership_lost.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("governance_leadership_lost_total", 1);
    }

    pub fn record_node_failure(&self) {
        self.nodes.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("governance_node_failures_total", 1);
    }

    pub fn record_node_recovery(&self) {
        self.nodes.recoveries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("governance_node_recoveries_total", 1);
    }

    pub fn update_node_counts(&self, active: usize, failed: usize) {
        metrics::gauge!("governance_nodes_active", active as f64);
        metrics::gauge!("governance_nodes_failed", failed as f64);
    }

    /// Number of cleanup callbacks that failed so far
    pub fn cleanup_failures(&self) -> u64 {
        self.resource.cleanup_failures.load(Ordering::Relaxed)
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            resources_registered: self.resource.registered.load(Ordering::Relaxed),
            resources_released: self.resource.released.load(Ordering::Relaxed),
            resources_reclaimed: self.resource.reclaimed.load(Ordering::Relaxed),
            limit_rejections: self.resource.limit_rejections.load(Ordering::Relaxed),
            cleanup_failures: self.resource.cleanup_failures.load(Ordering::Relaxed),
            resources_live: self.resource.live.load(Ordering::Relaxed),
            transactions_started: self.transaction.started.load(Ordering::Relaxed),
            transactions_committed: self.transaction.committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transaction.rolled_back.load(Ordering::Relaxed),
            votes_yes: self.transaction.votes_yes.load(Ordering::Relaxed),
            votes_no: self.transaction.votes_no.load(Ordering::Relaxed),
            votes_timeout: self.transaction.votes_timeout.load(Ordering::Relaxed),
            elections_won: self.election.won.load(Ordering::Relaxed),
            elections_lost: self.election.lost.load(Ordering::Relaxed),
            leadership_lost: self.election.leadership_lost.load(Ordering::Relaxed),
            node_failures: self.nodes.failures.load(Ordering::Relaxed),
            node_recoveries: self.nodes.recoveries.load(Ordering::Relaxed),
        }
    }
}

/// Install the Prometheus exporter with an HTTP listener.
///
/// Returns `Ok(false)` when metrics or the exporter are disabled.
pub fn install_prometheus_exporter(
    config: &MetricsConfig,
) -> Result<bool, Box<dyn std::error::Error>> {
    if !config.enabled || !config.prometheus {
        return Ok(false);
    }

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port).parse()?;
    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    for (key, value) in &config.labels {
        builder = builder.add_global_label(key.clone(), value.clone());
    }
    builder.install()?;

    tracing::info!("Prometheus exporter listening on {}", addr);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = GovernanceMetrics::new();
        metrics.record_resource_registered(ResourceKind::Thread);
        metrics.record_resource_registered(ResourceKind::Thread);
        metrics.record_resource_released(ResourceKind::Thread);
        metrics.record_cleanup_failure(ResourceKind::Thread);
        metrics.record_vote(Vote::Yes);
        metrics.record_vote(Vote::Timeout);
        metrics.record_election(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.resources_registered, 2);
        assert_eq!(snapshot.resources_released, 1);
        assert_eq!(snapshot.cleanup_failures, 1);
        assert_eq!(snapshot.votes_yes, 1);
        assert_eq!(snapshot.votes_timeout, 1);
        assert_eq!(snapshot.elections_lost, 1);
        assert_eq!(metrics.cleanup_failures(), 1);
    }

    #[test]
    fn test_exporter_disabled() {
        let config = MetricsConfig {
            prometheus: false,
            ..Default::default()
        };
        assert!(!install_prometheus_exporter(&config).unwrap());
    }
}
