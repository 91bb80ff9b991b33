//! Error taxonomy for the cluster engine.
//!
//! Every engine operation either commits fully or returns one of these. The
//! calling layer maps [`ErrorKind`] to whatever its users see.

use serde::{Deserialize, Serialize};

/// Errors raised by the persistence port.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt collection '{collection}': {reason}")]
    Corrupt { collection: String, reason: String },
}

/// Errors from cluster operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("user {user_id} is already a member of cluster {cluster_id}")]
    DuplicateMembership { cluster_id: String, user_id: String },
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },
    #[error("invalid proposal type: {0}")]
    InvalidProposalType(String),
    #[error("voting closed on decision {0}")]
    VotingClosed(String),
    #[error("invalid vote: {0}")]
    InvalidVote(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Stable, serialisable error kind handed to the request layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    DuplicateMembership,
    InsufficientFunds,
    InvalidProposalType,
    VotingClosed,
    InvalidVote,
    InvalidInput,
    InvariantViolation,
    Storage,
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::NotFound(_) => ErrorKind::NotFound,
            ClusterError::DuplicateMembership { .. } => ErrorKind::DuplicateMembership,
            ClusterError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            ClusterError::InvalidProposalType(_) => ErrorKind::InvalidProposalType,
            ClusterError::VotingClosed(_) => ErrorKind::VotingClosed,
            ClusterError::InvalidVote(_) => ErrorKind::InvalidVote,
            ClusterError::InvalidInput(_) => ErrorKind::InvalidInput,
            ClusterError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            ClusterError::Store(_) => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
