//! Raft error types.

use thiserror::Error;

use crate::id::PeerId;
use crate::storage::record::RecordError;
use crate::types::{LogIndex, Term};

/// Raft errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader (cannot accept writes or linearizable reads).
    #[error("Not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<PeerId> },

    /// Leader elected but its term's no-op entry is not applied yet.
    #[error("Leader not ready (no-op for term {term} not yet applied)")]
    LeaderNotReady { term: Term },

    /// Too many requests in flight.
    #[error("Resource unavailable ({pending} pending requests, limit {limit})")]
    ResourceUnavailable { pending: usize, limit: usize },

    /// Operation did not complete before its deadline.
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout {
        operation: &'static str,
        elapsed_ms: u64,
    },

    /// Log append did not match the entry preceding the batch.
    #[error("Log conflict at index {index} (expected term {expected_term}, found {actual_term:?})")]
    LogConflict {
        index: LogIndex,
        expected_term: Term,
        actual_term: Option<Term>,
    },

    /// State machine failed to apply a committed entry. Fatal for the replica.
    #[error("State machine failure at index {index}: {reason}")]
    StateMachineFailure { index: LogIndex, reason: String },

    /// Entry compacted away or beyond the log tail.
    #[error("Log entry {index} not found (retained range {first}..={last})")]
    NotFound {
        index: LogIndex,
        first: LogIndex,
        last: LogIndex,
    },

    /// Operation would break a log invariant (e.g. truncating committed entries).
    #[error("Invariant violation: {reason}")]
    InvariantViolation { reason: String },

    /// Snapshot creation, persistence or installation failed.
    #[error("Snapshot error: {reason}")]
    Snapshot { reason: String },

    /// Invalid Raft configuration.
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Request rejected before it reached the log.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Persisted data failed validation.
    #[error("Corrupted data: {reason}")]
    Corruption { reason: String },

    /// Server has been shut down.
    #[error("Raft server is shut down")]
    Shutdown,

    /// I/O error (storage, transport).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },

    /// Internal error (bug).
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl RaftError {
    /// Whether a client may retry the same request, possibly against another server.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. }
                | RaftError::LeaderNotReady { .. }
                | RaftError::ResourceUnavailable { .. }
                | RaftError::Timeout { .. }
        )
    }

    pub(crate) fn not_leader(leader: Option<PeerId>) -> Self {
        RaftError::NotLeader { leader }
    }
}

impl From<RecordError> for RaftError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::Io(source) => RaftError::Io { source },
            other => RaftError::Corruption {
                reason: other.to_string(),
            },
        }
    }
}

/// Raft result type.
pub type Result<T> = std::result::Result<T, RaftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(RaftError::not_leader(None).is_retriable());
        assert!(RaftError::LeaderNotReady { term: Term(3) }.is_retriable());
        assert!(RaftError::Timeout {
            operation: "submit",
            elapsed_ms: 10
        }
        .is_retriable());
        assert!(!RaftError::StateMachineFailure {
            index: LogIndex(4),
            reason: "boom".into()
        }
        .is_retriable());
        assert!(!RaftError::Shutdown.is_retriable());
    }

    #[test]
    fn test_record_error_maps_to_corruption() {
        let err: RaftError = RecordError::CrcMismatch {
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(matches!(err, RaftError::Corruption { .. }));
    }
}
