//! In-memory `LogStorage`.
//!
//! Clones share the same underlying state, so a test can drop a `Raft` and
//! reopen it on the same storage to simulate a restart.

use super::{HardState, LoadedLog, LogStorage};
use crate::error::Result;
use crate::types::{LogEntry, LogIndex, TermIndex};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct MemInner {
    hard_state: HardState,
    snapshot_point: TermIndex,
    entries: Vec<LogEntry>,
}

/// Shared in-memory log storage.
#[derive(Clone, Default)]
pub struct MemStorage {
    inner: Arc<Mutex<MemInner>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hard_state(&self) -> HardState {
        self.inner.lock().hard_state
    }
}

#[async_trait]
impl LogStorage for MemStorage {
    async fn load(&self) -> Result<LoadedLog> {
        let inner = self.inner.lock();
        Ok(LoadedLog {
            hard_state: inner.hard_state,
            snapshot_point: inner.snapshot_point,
            entries: inner.entries.clone(),
        })
    }

    async fn append(&self, entries: &[LogEntry]) -> Result<()> {
        self.inner.lock().entries.extend_from_slice(entries);
        Ok(())
    }

    async fn truncate_suffix(&self, from: LogIndex) -> Result<()> {
        self.inner.lock().entries.retain(|e| e.index < from);
        Ok(())
    }

    async fn purge_prefix(&self, point: TermIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.retain(|e| e.index > point.index);
        inner.snapshot_point = point;
        Ok(())
    }

    async fn save_hard_state(&self, state: &HardState) -> Result<()> {
        self.inner.lock().hard_state = *state;
        Ok(())
    }
}
