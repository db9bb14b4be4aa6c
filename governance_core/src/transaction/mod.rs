//! Two-phase commit over the coordination store
//!
//! The store is both the vote channel and the durable transaction log. Every
//! transaction owns a key space under `<prefix>/<transaction_id>/`:
//!
//! | key                     | written by  | value                          |
//! |-------------------------|-------------|--------------------------------|
//! | `prepare/<participant>` | coordinator | `PREPARE`                      |
//! | `vote/<participant>`    | participant | `yes` / `no`                   |
//! | `commit/<participant>`  | coordinator | `COMMIT`                       |
//! | `rollback/<participant>`| coordinator | `ROLLBACK`                     |
//! | `log/<participant>`     | participant | `prepared`/`committed`/`rolledback` |
//! | `state`                 | coordinator | JSON [`TransactionRecord`]     |
//! | `decision`              | coordinator | `commit` / `rollback`          |
//!
//! The `decision` key is written before any commit or rollback instruction,
//! so a restarted coordinator can always finish what it started.

pub mod coordinator;
pub mod participant;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use coordinator::{TransactionCoordinator, TransactionRecord};
pub use participant::{
    LocalTransactionHandler, NoopHandler, ParticipantState, TransactionParticipant,
};

pub const PREPARE_REQUEST: &str = "PREPARE";
pub const COMMIT_REQUEST: &str = "COMMIT";
pub const ROLLBACK_REQUEST: &str = "ROLLBACK";

pub const LOG_PREPARED: &str = "prepared";
pub const LOG_COMMITTED: &str = "committed";
pub const LOG_ROLLED_BACK: &str = "rolledback";

/// A participant's answer to PREPARE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Yes,
    No,
    /// No vote arrived in time; counts as `No`
    Timeout,
}

impl Vote {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vote::Yes => "yes",
            Vote::No => "no",
            Vote::Timeout => "timeout",
        }
    }

    /// Parse a vote written to the store. Anything other than a recognised
    /// value is treated as `No`.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "yes" => Vote::Yes,
            "timeout" => Vote::Timeout,
            _ => Vote::No,
        }
    }

    pub fn is_yes(&self) -> bool {
        matches!(self, Vote::Yes)
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordinator state machine: `Prepare -> {Commit | Rollback}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionPhase {
    Prepare,
    Commit,
    Rollback,
}

impl TransactionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionPhase::Prepare => "PREPARE",
            TransactionPhase::Commit => "COMMIT",
            TransactionPhase::Rollback => "ROLLBACK",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionPhase::Prepare)
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Global outcome recorded under the `decision` key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Rollback,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Commit => "commit",
            Decision::Rollback => "rollback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "commit" => Some(Decision::Commit),
            "rollback" => Some(Decision::Rollback),
            _ => None,
        }
    }

    pub fn phase(&self) -> TransactionPhase {
        match self {
            Decision::Commit => TransactionPhase::Commit,
            Decision::Rollback => TransactionPhase::Rollback,
        }
    }
}

/// Key layout of one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionKeys {
    base: String,
}

impl TransactionKeys {
    pub fn new(prefix: &str, transaction_id: &str) -> Self {
        Self {
            base: format!("{}/{}", prefix.trim_end_matches('/'), transaction_id),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn prepare(&self, participant: &str) -> String {
        format!("{}/prepare/{}", self.base, participant)
    }

    pub fn vote(&self, participant: &str) -> String {
        format!("{}/vote/{}", self.base, participant)
    }

    pub fn commit(&self, participant: &str) -> String {
        format!("{}/commit/{}", self.base, participant)
    }

    pub fn rollback(&self, participant: &str) -> String {
        format!("{}/rollback/{}", self.base, participant)
    }

    pub fn log(&self, participant: &str) -> String {
        format!("{}/log/{}", self.base, participant)
    }

    pub fn state(&self) -> String {
        format!("{}/state", self.base)
    }

    pub fn decision(&self) -> String {
        format!("{}/decision", self.base)
    }

    /// Instruction key and value for a terminal phase
    pub(crate) fn instruction(
        &self,
        decision: Decision,
        participant: &str,
    ) -> (String, &'static str) {
        match decision {
            Decision::Commit => (self.commit(participant), COMMIT_REQUEST),
            Decision::Rollback => (self.rollback(participant), ROLLBACK_REQUEST),
        }
    }
}
