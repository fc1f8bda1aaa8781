//! Error types for LumaTM
//!
//! Provides a unified error type hierarchy for the transaction manager. The
//! top-level variants follow the JTA failure classes: rollback, heuristic,
//! and system failures.

use std::fmt;

use thiserror::Error;

use crate::types::{Status, Xid};
use crate::xa::XaError;

/// Result type alias using LumaTM's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for LumaTM
#[derive(Error, Debug)]
pub enum Error {
    // Transaction Errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    // Heuristic Outcomes
    #[error("Heuristic outcome: {0}")]
    Heuristic(#[from] HeuristicError),

    // Journal Errors
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    // Resource Manager Errors
    #[error("Resource error: {0}")]
    Resource(#[from] XaError),

    // Internal failures the transaction cannot survive
    #[error("System error: {0}")]
    System(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transaction-related errors
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction rolled back: {reason}")]
    RolledBack {
        reason: String,
        #[source]
        cause: Option<Box<Error>>,
    },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Invalid resource name: {0}")]
    InvalidResourceName(String),

    #[error("Duplicate resource name: {0}")]
    DuplicateResource(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),
}

/// Journal-related errors
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Journal is closed")]
    Closed,

    #[error("Corrupt journal: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch at position {position}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        position: u64,
        expected: u32,
        actual: u32,
    },

    #[error("Record of {size} bytes does not fit a journal file of {capacity} bytes")]
    RecordTooLarge { size: usize, capacity: u64 },

    #[error("Unique name is not US-ASCII: {0}")]
    NonAsciiName(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

// ============================================================================
// Heuristic Outcomes
// ============================================================================

/// Overall heuristic outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeuristicKind {
    /// Every branch committed although the decision was rollback
    Commit,
    /// Every branch rolled back although the decision was commit
    Rollback,
    /// Some branches committed and some rolled back
    Mixed,
    /// The outcome of at least one branch cannot be known
    Hazard,
}

impl fmt::Display for HeuristicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeuristicKind::Commit => "heuristic commit",
            HeuristicKind::Rollback => "heuristic rollback",
            HeuristicKind::Mixed => "heuristic mixed",
            HeuristicKind::Hazard => "heuristic hazard",
        })
    }
}

/// What happened to a single branch during a completion phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchState {
    Committed,
    RolledBack,
    HeuristicCommit,
    HeuristicRollback,
    HeuristicMixed,
    HeuristicHazard,
    /// The branch may still be completed later by recovery
    NotCompleted,
    Failed(XaError),
}

/// Per-branch outcome reported with a heuristic error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchOutcome {
    pub unique_name: String,
    pub xid: Xid,
    pub state: BranchState,
}

/// A resource deviated from the coordinator's decision
#[derive(Error, Debug, Clone)]
#[error("{kind} in transaction {gtrid} ({} branch(es))", .outcomes.len())]
pub struct HeuristicError {
    pub kind: HeuristicKind,
    pub gtrid: String,
    pub outcomes: Vec<BranchOutcome>,
}

impl HeuristicError {
    /// Branches that did not follow the decision
    pub fn deviating(&self) -> impl Iterator<Item = &BranchOutcome> {
        self.outcomes
            .iter()
            .filter(|o| !matches!(o.state, BranchState::Committed | BranchState::RolledBack))
    }
}

impl Error {
    /// Rollback-class failure: the transaction was rolled back instead of committed
    pub fn rolled_back(reason: impl Into<String>) -> Self {
        Error::Transaction(TransactionError::RolledBack {
            reason: reason.into(),
            cause: None,
        })
    }

    /// Rollback-class failure carrying its cause
    pub fn rolled_back_by(reason: impl Into<String>, cause: Error) -> Self {
        Error::Transaction(TransactionError::RolledBack {
            reason: reason.into(),
            cause: Some(Box::new(cause)),
        })
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError::IllegalState(message.into()))
    }

    /// Illegal operation for the current transaction status
    pub fn wrong_status(operation: &str, status: Status) -> Self {
        Error::illegal_state(format!("cannot {operation} a transaction in status {status}"))
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, Error::Transaction(TransactionError::RolledBack { .. }))
    }

    pub fn is_heuristic(&self) -> bool {
        matches!(self, Error::Heuristic(_))
    }

    pub fn heuristic_kind(&self) -> Option<HeuristicKind> {
        match self {
            Error::Heuristic(h) => Some(h.kind),
            _ => None,
        }
    }

    /// SystemException-class failure
    pub fn is_system(&self) -> bool {
        matches!(self, Error::System(_) | Error::Journal(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
