//! Error types for the coordination and resource governance core

use crate::resource::ResourceKind;
use crate::store::LeaseId;
use crate::transaction::{TransactionPhase, Vote};
use thiserror::Error;

/// Boxed error returned by caller-supplied hooks (cleanup callbacks, local
/// transaction actions).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the coordination store client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("lease {0} not found or expired")]
    LeaseNotFound(LeaseId),

    #[error("coordination store disconnected")]
    Disconnected,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors surfaced by the governance core
#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("resource limit exceeded for {kind}: requested {requested}, available {available}")]
    ResourceLimit {
        kind: ResourceKind,
        requested: u64,
        available: u64,
    },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource already registered: {0}")]
    DuplicateResource(String),

    #[error("region {0} is no longer active")]
    RegionInactive(String),

    #[error("region {0} belongs to another resource manager")]
    ForeignRegion(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("transaction {transaction_id}: cannot {operation} in phase {phase}")]
    InvalidTransactionState {
        transaction_id: String,
        phase: TransactionPhase,
        operation: &'static str,
    },

    #[error(
        "transaction {transaction_id}: commit not allowed, participant {participant} voted {vote}"
    )]
    CommitNotAllowed {
        transaction_id: String,
        participant: String,
        vote: Vote,
    },

    #[error("transaction {transaction_id}: participant {node_id} contract violation: {reason}")]
    ParticipantContractViolation {
        transaction_id: String,
        node_id: String,
        reason: String,
    },

    #[error("transaction {transaction_id}: local {action} failed: {reason}")]
    LocalAction {
        transaction_id: String,
        action: &'static str,
        reason: String,
    },

    #[error("transaction {0} already exists")]
    DuplicateTransaction(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(String),

    #[error("no coordination store configured")]
    StoreNotConfigured,

    #[error("configuration error: {0}")]
    Config(String),
}

impl GovernanceError {
    /// True for quota violations, which callers may retry after freeing resources
    pub fn is_limit(&self) -> bool {
        matches!(self, GovernanceError::ResourceLimit { .. })
    }

    /// True when the resource id was unknown
    pub fn is_not_found(&self) -> bool {
        matches!(self, GovernanceError::ResourceNotFound(_))
    }
}

/// Result alias for governance operations
pub type GovernanceResult<T> = Result<T, GovernanceError>;

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_error_display() {
        let err = GovernanceError::ResourceLimit {
            kind: ResourceKind::NetworkSocket,
            requested: 1,
            available: 0,
        };
        assert_eq!(
            err.to_string(),
            "resource limit exceeded for network_socket: requested 1, available 0"
        );
        assert!(err.is_limit());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: GovernanceError = StoreError::LeaseNotFound(LeaseId(7)).into();
        assert_eq!(err.to_string(), "lease 7 not found or expired");
    }
}
