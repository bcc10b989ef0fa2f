//! Pluggable application state machine.
//!
//! The engine drives a `StateMachine` through a fixed lifecycle:
//! `initialize` once at startup (with the latest snapshot, if any), then
//! `apply_transaction` for every committed command in index order, exactly
//! once per index. Only the apply pipeline mutates the state machine.
//! `start_transaction` runs on the leader before a write enters the log and
//! may reject it. `query` serves reads without touching the log.

use crate::error::Result;
use crate::id::{GroupId, PeerId};
use crate::snapshot::Snapshot;
use crate::types::{ClientRequest, TermIndex};
use bytes::Bytes;

/// Application state machine driven by the Raft engine.
///
/// Implementations must be deterministic: two instances fed the same
/// sequence of `apply_transaction` calls must end in the same state and
/// return the same replies.
pub trait StateMachine: Send + 'static {
    /// Bind to a server and recover from `latest` if given.
    ///
    /// Returns the position the state now reflects (`TermIndex::ZERO` for a
    /// fresh state machine).
    fn initialize(
        &mut self,
        server_id: PeerId,
        group_id: GroupId,
        latest: Option<&Snapshot>,
    ) -> Result<TermIndex>;

    /// Drop in-memory state and recover again from `latest`.
    fn reinitialize(&mut self, latest: Option<&Snapshot>) -> Result<TermIndex>;

    /// Validate a client write on the leader.
    ///
    /// Returns the command to place in the log, or an error to reject the
    /// request before it is replicated.
    fn start_transaction(&self, request: &ClientRequest) -> Result<Bytes>;

    /// Apply a committed command and produce the client reply.
    ///
    /// An error here is fatal for this replica: the engine stops applying.
    fn apply_transaction(&mut self, at: TermIndex, command: &Bytes) -> Result<Bytes>;

    /// Serve a read-only request against the current state.
    fn query(&self, request: &Bytes) -> Result<Bytes>;

    /// Serialize the current state.
    ///
    /// The engine pairs the bytes with the last applied position.
    fn take_snapshot(&self) -> Result<Bytes>;

    /// Replace the current state with `snapshot`.
    fn load(&mut self, snapshot: &Snapshot) -> Result<()>;

    /// Position of the last applied command or loaded snapshot.
    fn last_applied(&self) -> TermIndex;
}
