//! Raft log: ordered entries, commit index, and compaction point.
//!
//! `RaftLog` is the in-memory view of the replicated log. Every mutation goes
//! to `LogStorage` first and only updates memory once storage has made it
//! durable. It is owned by a single server and only mutated while that
//! server's state lock is held.
//!
//! Invariants:
//! - Retained entries are contiguous: `first_index()..=last_index()`
//! - Terms are non-decreasing along the log
//! - `commit_index` never decreases and never exceeds `last_index()`
//! - Entries at or below `commit_index` are never truncated

use crate::error::{RaftError, Result};
use crate::storage::{HardState, LogStorage};
use crate::types::{EntryPayload, LogEntry, LogIndex, Membership, Term, TermIndex};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Replicated log backed by `LogStorage`.
pub struct RaftLog {
    storage: Arc<dyn LogStorage>,

    /// Retained entries (index → entry)
    entries: BTreeMap<LogIndex, LogEntry>,

    /// Last purged position (covered by a snapshot)
    snapshot_point: TermIndex,

    /// Highest index known committed
    commit_index: LogIndex,
}

impl RaftLog {
    /// Open the log, recovering persisted entries.
    ///
    /// Returns the log and the recovered hard state.
    pub async fn open(storage: Arc<dyn LogStorage>) -> Result<(Self, HardState)> {
        let loaded = storage.load().await?;

        let mut entries = BTreeMap::new();
        let mut prev = loaded.snapshot_point;
        for entry in loaded.entries {
            if entry.index != prev.index.next() || entry.term < prev.term {
                return Err(RaftError::Corruption {
                    reason: format!("entry {} does not follow {}", entry.term_index(), prev),
                });
            }
            prev = entry.term_index();
            entries.insert(entry.index, entry);
        }

        let mut log = Self {
            storage,
            entries,
            snapshot_point: loaded.snapshot_point,
            commit_index: LogIndex::ZERO,
        };
        log.commit_index = loaded
            .hard_state
            .commit_index
            .max(log.snapshot_point.index)
            .min(log.last_index());

        Ok((log, loaded.hard_state))
    }

    /// First retained index (snapshot point + 1).
    pub fn first_index(&self) -> LogIndex {
        self.snapshot_point.index.next()
    }

    /// Last index, or the snapshot point when nothing is retained.
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.snapshot_point.index)
    }

    /// Position of the last entry (or the snapshot point).
    pub fn last_term_index(&self) -> TermIndex {
        self.entries
            .values()
            .next_back()
            .map(LogEntry::term_index)
            .unwrap_or(self.snapshot_point)
    }

    pub fn snapshot_point(&self) -> TermIndex {
        self.snapshot_point
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`.
    ///
    /// Known for retained entries and for the snapshot point itself.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_point.index {
            return Some(self.snapshot_point.term);
        }
        self.entries.get(&index).map(|e| e.term)
    }

    /// Whether the log holds an entry at `pos.index` with term `pos.term`.
    pub fn matches(&self, pos: TermIndex) -> bool {
        self.term_at(pos.index) == Some(pos.term)
    }

    /// Get an entry. Fails with `NotFound` if compacted or beyond the tail.
    pub fn get(&self, index: LogIndex) -> Result<LogEntry> {
        self.entries
            .get(&index)
            .cloned()
            .ok_or_else(|| self.not_found(index))
    }

    /// Entries in `from..=to`, at most `max_entries` of them and roughly
    /// `max_bytes` of payload (always at least one entry if any).
    pub fn get_range(
        &self,
        from: LogIndex,
        to: LogIndex,
        max_entries: usize,
        max_bytes: usize,
    ) -> Result<Vec<LogEntry>> {
        if from > to {
            return Ok(Vec::new());
        }
        if from < self.first_index() || to > self.last_index() {
            return Err(self.not_found(if from < self.first_index() { from } else { to }));
        }

        let mut batch = Vec::new();
        let mut bytes = 0usize;
        for entry in self.entries.range(from..=to).map(|(_, e)| e) {
            if batch.len() >= max_entries || (!batch.is_empty() && bytes >= max_bytes) {
                break;
            }
            bytes += entry.payload_len();
            batch.push(entry.clone());
        }
        Ok(batch)
    }

    /// Retained entries (for inspection and tests).
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.values()
    }

    /// Append `entries` after `prev`, which must be the current tail.
    ///
    /// Fails with `LogConflict` if `prev` is not the tail position. Returns the
    /// number of entries appended.
    pub async fn append(&mut self, prev: TermIndex, entries: Vec<LogEntry>) -> Result<usize> {
        let tail = self.last_term_index();
        if prev != tail {
            return Err(RaftError::LogConflict {
                index: prev.index,
                expected_term: prev.term,
                actual_term: self.term_at(prev.index),
            });
        }

        let mut expected = prev;
        for entry in &entries {
            if entry.index != expected.index.next() || entry.term < expected.term {
                return Err(RaftError::InvalidRequest {
                    reason: format!("entry {} cannot follow {}", entry.term_index(), expected),
                });
            }
            expected = entry.term_index();
        }

        if entries.is_empty() {
            return Ok(0);
        }

        self.storage.append(&entries).await?;

        let count = entries.len();
        for entry in entries {
            self.entries.insert(entry.index, entry);
        }
        Ok(count)
    }

    /// Append a single entry at the tail.
    pub async fn append_entry(&mut self, entry: LogEntry) -> Result<LogIndex> {
        let index = entry.index;
        self.append(self.last_term_index(), vec![entry]).await?;
        Ok(index)
    }

    /// Discard entries with index >= `from`.
    ///
    /// Fails with `InvariantViolation` if that would remove a committed entry.
    pub async fn truncate_suffix(&mut self, from: LogIndex) -> Result<()> {
        if from <= self.commit_index {
            return Err(RaftError::InvariantViolation {
                reason: format!(
                    "truncate from {} would drop committed entries (commit {})",
                    from, self.commit_index
                ),
            });
        }
        if from > self.last_index() {
            return Ok(());
        }

        self.storage.truncate_suffix(from).await?;
        self.entries.split_off(&from);
        Ok(())
    }

    /// Advance the commit index.
    ///
    /// Must be monotonic and within the log. Returns true if it moved. The
    /// caller persists it as part of the hard state.
    pub fn set_commit_index(&mut self, index: LogIndex) -> Result<bool> {
        if index < self.commit_index {
            return Err(RaftError::InvariantViolation {
                reason: format!(
                    "commit index cannot decrease ({} -> {})",
                    self.commit_index, index
                ),
            });
        }
        if index > self.last_index() {
            return Err(RaftError::InvariantViolation {
                reason: format!(
                    "commit index {} beyond log tail {}",
                    index,
                    self.last_index()
                ),
            });
        }
        let advanced = index > self.commit_index;
        self.commit_index = index;
        Ok(advanced)
    }

    /// Discard entries up to and including `index`.
    ///
    /// Legal only when `index <= last_applied` and a durable snapshot covers it.
    /// Returns the number of entries removed.
    pub async fn purge_up_to(
        &mut self,
        index: LogIndex,
        last_applied: LogIndex,
        snapshot_index: LogIndex,
    ) -> Result<usize> {
        if index > last_applied || index > snapshot_index {
            return Err(RaftError::InvariantViolation {
                reason: format!(
                    "purge to {} needs last_applied ({}) and snapshot ({}) to cover it",
                    index, last_applied, snapshot_index
                ),
            });
        }
        if index <= self.snapshot_point.index {
            return Ok(0);
        }

        let term = self.term_at(index).ok_or_else(|| self.not_found(index))?;
        let point = TermIndex::new(term, index);
        self.storage.purge_prefix(point).await?;

        let retained = self.entries.split_off(&index.next());
        let removed = self.entries.len();
        self.entries = retained;
        self.snapshot_point = point;
        Ok(removed)
    }

    /// Reset the log start to an installed snapshot's position.
    ///
    /// If the log already holds `point`, the suffix after it is kept;
    /// otherwise the whole log is discarded. The commit index moves up to
    /// `point.index`.
    pub async fn install_snapshot(&mut self, point: TermIndex) -> Result<()> {
        if point.index <= self.snapshot_point.index {
            return Ok(());
        }

        if !self.matches(point) {
            if !self.entries.is_empty() {
                self.storage.truncate_suffix(self.first_index()).await?;
            }
            self.entries.clear();
        }

        self.storage.purge_prefix(point).await?;
        self.entries = self.entries.split_off(&point.index.next());
        self.snapshot_point = point;
        if self.commit_index < point.index {
            self.commit_index = point.index;
        }
        Ok(())
    }

    /// Backtracking hint for a rejected `prev` position.
    pub fn conflict_hint(&self, prev: TermIndex) -> crate::types::ConflictHint {
        use crate::types::ConflictHint;

        if prev.index > self.last_index() {
            return ConflictHint {
                term: None,
                index: self.last_index().next(),
            };
        }

        match self.term_at(prev.index) {
            Some(term) => {
                // Walk back to the first index holding `term`
                let mut first = prev.index;
                while let Some(before) = first.prev() {
                    if before < self.first_index() || self.term_at(before) != Some(term) {
                        break;
                    }
                    first = before;
                }
                ConflictHint {
                    term: Some(term),
                    index: first,
                }
            }
            None => ConflictHint {
                term: None,
                index: self.first_index(),
            },
        }
    }

    /// Last index in the log that holds `term`, if any.
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .values()
            .rev()
            .skip_while(|e| e.term > term)
            .take_while(|e| e.term == term)
            .map(|e| e.index)
            .next()
    }

    /// Latest configuration entry at or below `upto`, if retained.
    pub fn latest_membership(&self, upto: LogIndex) -> Option<(LogIndex, Membership)> {
        self.entries
            .range(..=upto)
            .rev()
            .find_map(|(index, e)| match &e.payload {
                EntryPayload::Configuration(m) => Some((*index, m.clone())),
                _ => None,
            })
    }

    fn not_found(&self, index: LogIndex) -> RaftError {
        RaftError::NotFound {
            index,
            first: self.first_index(),
            last: self.last_index(),
        }
    }
}
