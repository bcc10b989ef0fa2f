//! Durable log primitives.
//!
//! `LogStorage` is what the engine needs from a disk: append a batch durably,
//! drop a suffix, drop a prefix below a snapshot point, and persist the small
//! hard state (term, vote, commit index). `RaftLog` keeps the in-memory view
//! and calls into storage before acknowledging anything.

pub mod file;
pub mod memory;
pub mod record;

pub use file::FileStorage;
pub use memory::MemStorage;

use crate::error::Result;
use crate::id::PeerId;
use crate::types::{LogEntry, LogIndex, Term, TermIndex};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// State that must survive a crash besides the entries themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// Latest term this server has seen
    pub current_term: Term,

    /// Candidate voted for in `current_term`
    pub voted_for: Option<PeerId>,

    /// Highest index known committed
    pub commit_index: LogIndex,
}

/// Everything recovered from storage at startup.
#[derive(Debug, Clone, Default)]
pub struct LoadedLog {
    pub hard_state: HardState,

    /// Last purged position; retained entries start right after it
    pub snapshot_point: TermIndex,

    /// Retained entries in index order
    pub entries: Vec<LogEntry>,
}

/// Durable storage for log entries and hard state.
///
/// Implementations must make every mutation durable before returning `Ok`.
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Recover the persisted log.
    async fn load(&self) -> Result<LoadedLog>;

    /// Append contiguous entries at the tail.
    async fn append(&self, entries: &[LogEntry]) -> Result<()>;

    /// Drop every entry with index >= `from`.
    async fn truncate_suffix(&self, from: LogIndex) -> Result<()>;

    /// Drop every entry with index <= `point.index` and record `point` as the
    /// new log start. `point` may lie beyond the current tail.
    async fn purge_prefix(&self, point: TermIndex) -> Result<()>;

    /// Persist term, vote and commit index.
    async fn save_hard_state(&self, state: &HardState) -> Result<()>;
}
