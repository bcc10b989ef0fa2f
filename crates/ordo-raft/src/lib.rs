//! ordo-raft: a Raft consensus engine.
//!
//! Replicates an ordered log of client commands across a group of servers and
//! feeds the committed prefix, in order, to a deterministic state machine:
//! - Leader election with randomized timeouts and epoch-tagged timer fires
//! - Log replication with conflict-term backtracking
//! - Commit tracking restricted to current-term entries
//! - Linearizable reads confirmed by a heartbeat round
//! - Snapshots with chunked InstallSnapshot and log compaction
//! - Single-server membership changes
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014).

pub mod acceptor;
pub mod apply;
pub mod config;
pub mod counter;
pub mod election;
pub mod error;
pub mod id;
pub mod log;
pub mod raft;
pub mod replication;
pub mod rpc_handler;
pub mod snapshot;
pub mod state;
pub mod statemachine;
pub mod storage;
pub mod timer;
pub mod transport;
pub mod types;

pub use config::RaftConfig;
pub use counter::CounterStateMachine;
pub use error::{RaftError, Result};
pub use id::{ClientId, GroupId, PeerId};
pub use raft::{Raft, RaftStorage};
pub use snapshot::{Snapshot, SnapshotStore};
pub use state::ServerStatus;
pub use statemachine::StateMachine;
pub use storage::{FileStorage, HardState, LogStorage, MemStorage};
pub use transport::{InMemoryTransport, RaftTransport, RpcMessage, RpcReceiver, RpcSender};
pub use types::*;

/// Client-facing interface of a replicated state machine.
///
/// Implemented by `Raft`.
#[async_trait::async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Replicate a write and return the state machine's reply once applied.
    ///
    /// Fails with `NotLeader` on followers and `LeaderNotReady` until the
    /// leader has applied the first entry of its term.
    async fn submit(&self, request: ClientRequest) -> Result<ClientReply>;

    /// Answer a read against the local state machine.
    ///
    /// `Read` is linearizable: leadership is confirmed by a quorum first.
    /// `StaleRead` is answered immediately from whatever has been applied.
    async fn query(&self, request: ClientRequest) -> Result<ClientReply>;

    /// Confirm leadership and wait until the commit index at the time of the
    /// call has been applied. Returns that index.
    async fn read_index(&self) -> Result<LogIndex>;

    fn is_leader(&self) -> bool;

    /// Current leader, if known.
    fn leader(&self) -> Option<PeerId>;

    /// Watch the applied position.
    fn subscribe_applied(&self) -> tokio::sync::watch::Receiver<TermIndex>;
}
