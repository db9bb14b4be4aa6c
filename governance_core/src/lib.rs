//! Distributed coordination and resource governance core
//!
//! - [`resource`]: per-node resource quotas, idle reclamation and region scopes
//! - [`transaction`]: two-phase commit coordinator and participant
//! - [`election`]: lease-based leader election
//! - [`fault_tolerance`]: node liveness and the entry point tying them together
//!
//! Everything distributed is written against the [`store::CoordinationStore`]
//! trait; [`store::MemoryStore`] is an in-process implementation.

pub mod config;
pub mod election;
pub mod error;
pub mod fault_tolerance;
pub mod log;
pub mod metrics;
pub mod resource;
pub mod shutdown;
pub mod store;
pub mod transaction;

pub use config::GovernanceConfig;
pub use election::LeaderElection;
pub use error::{BoxError, GovernanceError, GovernanceResult, StoreError, StoreResult};
pub use fault_tolerance::{FaultToleranceManager, RecoveryStrategy, SharedCoordinator};
pub use metrics::{GovernanceMetrics, MetricsSnapshot};
pub use resource::{
    Registration, RegionAllocator, RegionSweep, ResourceInfo, ResourceKind, ResourceManager,
    UsageSnapshot,
};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};
pub use store::{CoordinationStore, LeaseId, MemoryStore, WatchEvent, WatchEventKind, WatchStream};
pub use transaction::{
    LocalTransactionHandler, ParticipantState, TransactionCoordinator, TransactionParticipant,
    TransactionPhase, Vote,
};
