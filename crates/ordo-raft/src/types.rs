//! Core Raft types: terms, indices, log entries, membership, RPC messages.

use crate::id::{ClientId, PeerId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Raft term number (monotonically increasing).
///
/// Terms act as a logical clock. Each term has at most one leader.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 is the sentinel for "before the log").
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// A log position: (term, index).
///
/// Ordered lexicographically, term first. This ordering is exactly the
/// "at least as up-to-date" comparison used when granting votes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TermIndex {
    pub term: Term,
    pub index: LogIndex,
}

impl TermIndex {
    pub const ZERO: TermIndex = TermIndex {
        term: Term::ZERO,
        index: LogIndex::ZERO,
    };

    pub fn new(term: Term, index: LogIndex) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for TermIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.term, self.index)
    }
}

/// Voting members of a Raft group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    voters: BTreeSet<PeerId>,
}

impl Membership {
    pub fn new(voters: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            voters: voters.into_iter().collect(),
        }
    }

    pub fn voters(&self) -> impl Iterator<Item = &PeerId> {
        self.voters.iter()
    }

    /// All voters except `id`.
    pub fn peers_of<'a>(&'a self, id: &'a PeerId) -> impl Iterator<Item = &'a PeerId> + 'a {
        self.voters.iter().filter(move |p| *p != id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.voters.contains(id)
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    /// Strict majority size.
    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Whether `votes` contains a strict majority of the voters.
    pub fn has_quorum<'a>(&self, votes: impl IntoIterator<Item = &'a PeerId>) -> bool {
        let granted: BTreeSet<&PeerId> = votes
            .into_iter()
            .filter(|p| self.voters.contains(*p))
            .collect();
        granted.len() >= self.quorum()
    }
}

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Opaque state machine command.
    Command(Bytes),
    /// New voter set; takes effect when applied.
    Configuration(Membership),
    /// Appended by a new leader at the start of its term.
    NoOp,
}

/// Replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: EntryPayload,
    /// Client that proposed the entry (nil for internal entries)
    pub client_id: ClientId,
    /// Client-assigned call number
    pub call_id: u64,
}

impl LogEntry {
    pub fn command(
        term: Term,
        index: LogIndex,
        command: Bytes,
        client_id: ClientId,
        call_id: u64,
    ) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Command(command),
            client_id,
            call_id,
        }
    }

    pub fn no_op(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::NoOp,
            client_id: ClientId::NIL,
            call_id: 0,
        }
    }

    pub fn configuration(term: Term, index: LogIndex, membership: Membership) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Configuration(membership),
            client_id: ClientId::NIL,
            call_id: 0,
        }
    }

    pub fn term_index(&self) -> TermIndex {
        TermIndex::new(self.term, self.index)
    }

    /// Approximate payload size, used to bound replication batches.
    pub fn payload_len(&self) -> usize {
        match &self.payload {
            EntryPayload::Command(bytes) => bytes.len(),
            EntryPayload::Configuration(m) => m.len() * 16,
            EntryPayload::NoOp => 0,
        }
    }
}

/// Raft role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// RequestVote RPC request.
///
/// Sent by a candidate to every voter during an election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting the vote
    pub candidate_id: PeerId,

    /// Candidate's last log position
    pub last_log: TermIndex,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Voter's current term (candidate steps down if higher)
    pub term: Term,

    pub vote_granted: bool,
}

/// AppendEntries RPC request (replication and heartbeat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's id, so followers can redirect clients
    pub leader_id: PeerId,

    /// Position of the entry immediately preceding `entries`
    pub prev_log: TermIndex,

    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Follower's current term
    pub term: Term,

    /// True if the follower matched `prev_log` and stored the entries
    pub success: bool,

    /// On success, the last index known to match the leader's log
    pub match_index: LogIndex,

    /// On rejection, where the leader should retry from
    pub conflict: Option<ConflictHint>,
}

/// Backtracking hint returned by a follower that rejected `prev_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHint {
    /// Term of the follower's entry at `prev_log.index`, if it has one
    pub term: Option<Term>,

    /// First index of `term` in the follower's log, or the follower's tail + 1
    pub index: LogIndex,
}

/// InstallSnapshot RPC request (one chunk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term
    pub term: Term,

    pub leader_id: PeerId,

    /// Metadata of the snapshot being transferred
    pub meta: SnapshotMeta,

    /// Byte offset of this chunk
    pub offset: u64,

    /// Raw chunk bytes
    pub data: Bytes,

    /// True for the final chunk
    pub done: bool,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Follower's current term
    pub term: Term,

    /// Bytes of the snapshot received so far (the next expected offset)
    pub bytes_stored: u64,

    /// True once the snapshot is installed (or already covered by the follower)
    pub installed: bool,
}

/// Snapshot metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Last log position covered by the snapshot
    pub last_included: TermIndex,

    /// Membership in effect at `last_included`
    pub membership: Membership,

    /// CRC32C of the snapshot data
    pub checksum: u32,

    /// Snapshot data size (bytes)
    pub size_bytes: u64,
}

/// Client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub client_id: ClientId,
    pub call_id: u64,
    pub kind: RequestKind,
    pub message: Bytes,
}

/// How a client request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Replicated through the log.
    Write,
    /// Linearizable read (read-index on the leader).
    Read,
    /// Read local state without any leadership check.
    StaleRead,
}

impl ClientRequest {
    pub fn write(client_id: ClientId, call_id: u64, message: impl Into<Bytes>) -> Self {
        Self {
            client_id,
            call_id,
            kind: RequestKind::Write,
            message: message.into(),
        }
    }

    pub fn read(client_id: ClientId, call_id: u64, message: impl Into<Bytes>) -> Self {
        Self {
            client_id,
            call_id,
            kind: RequestKind::Read,
            message: message.into(),
        }
    }

    pub fn stale_read(client_id: ClientId, call_id: u64, message: impl Into<Bytes>) -> Self {
        Self {
            client_id,
            call_id,
            kind: RequestKind::StaleRead,
            message: message.into(),
        }
    }
}

/// Reply to a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReply {
    pub client_id: ClientId,
    pub call_id: u64,
    /// Index the write was committed at, or the read index for reads
    pub log_index: LogIndex,
    pub message: Bytes,
}
