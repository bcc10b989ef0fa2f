//! Per-server Raft state and role transitions.
//!
//! # Persistent state (survives crashes)
//!
//! - `term`: latest term this server has seen
//! - `voted_for`: candidate that received our vote in `term`
//! - the log itself (see `RaftLog`)
//!
//! # Volatile state
//!
//! - `role`, `leader_id`, the commit index (kept in `RaftLog`)
//! - on leaders: per-peer `next_index` / `match_index`
//!
//! Every mutation of term, vote, role or log happens while holding the single
//! `core` lock, and anything persistent is written to storage before the lock
//! is released. That makes each RPC handler and each role transition atomic
//! with respect to the others.
//!
//! Each role change bumps an epoch. Background tasks (replicators, election
//! attempts, timer fires) remember the epoch they were started in and stop
//! as soon as it no longer matches.

use crate::apply::PendingRequests;
use crate::config::RaftConfig;
use crate::election::is_log_up_to_date;
use crate::error::{RaftError, Result};
use crate::id::{GroupId, PeerId};
use crate::log::RaftLog;
use crate::replication::advance_commit_index;
use crate::snapshot::SnapshotStore;
use crate::statemachine::StateMachine;
use crate::storage::{HardState, LogStorage};
use crate::timer::ElectionTimer;
use crate::transport::RaftTransport;
use crate::types::*;
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tokio::time::Instant;

/// Externally visible role information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub term: Term,
    pub role: Role,
    pub leader: Option<PeerId>,
    /// Incremented on every role or term change
    pub epoch: u64,
}

/// Leader's view of one follower.
#[derive(Debug, Clone)]
pub(crate) struct PeerProgress {
    /// Next index to send
    pub(crate) next_index: LogIndex,

    /// Highest index known replicated on the peer
    pub(crate) match_index: LogIndex,

    /// Last successful response in this term
    pub(crate) last_ack: Option<Instant>,

    /// Latest read round the peer acknowledged
    pub(crate) acked_round: u64,
}

impl PeerProgress {
    pub(crate) fn new(next_index: LogIndex) -> Self {
        Self {
            next_index,
            match_index: LogIndex::ZERO,
            last_ack: None,
            acked_round: 0,
        }
    }
}

/// Leader-only volatile state.
#[derive(Debug)]
pub(crate) struct LeaderState {
    pub(crate) progress: HashMap<PeerId, PeerProgress>,

    /// Set once this term's no-op has been applied
    pub(crate) ready: bool,

    /// Current read-confirmation round; requests sent after it was bumped
    /// carry it, and a quorum of acks for it confirms leadership
    pub(crate) read_round: u64,
}

/// Snapshot chunks received so far.
#[derive(Debug)]
pub(crate) struct InstallBuffer {
    pub(crate) meta: SnapshotMeta,
    pub(crate) data: BytesMut,
}

/// State guarded by the core lock.
pub(crate) struct Core {
    pub(crate) term: Term,
    pub(crate) voted_for: Option<PeerId>,
    pub(crate) role: Role,
    pub(crate) leader_id: Option<PeerId>,
    pub(crate) epoch: u64,
    pub(crate) log: RaftLog,
    pub(crate) membership: Membership,
    pub(crate) leader: Option<LeaderState>,
    pub(crate) install: Option<InstallBuffer>,

    /// Snapshot installed from the leader that the apply worker must load
    pub(crate) pending_install: Option<TermIndex>,
}

/// What a candidate needs to run one election round.
#[derive(Debug, Clone)]
pub(crate) struct Ballot {
    pub(crate) term: Term,
    pub(crate) epoch: u64,
    pub(crate) last_log: TermIndex,
    pub(crate) membership: Membership,
}

/// Collaborators handed to `RaftState::new`.
pub(crate) struct Services {
    pub(crate) storage: Arc<dyn LogStorage>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) snapshots: Arc<SnapshotStore>,
    pub(crate) state_machine: Box<dyn StateMachine>,
}

/// Raft server state.
pub struct RaftState {
    id: PeerId,
    config: RaftConfig,
    core: Mutex<Core>,
    storage: Arc<dyn LogStorage>,
    transport: Arc<dyn RaftTransport>,

    pub(crate) snapshots: Arc<SnapshotStore>,

    /// Mutated only by the apply worker
    pub(crate) state_machine: parking_lot::Mutex<Box<dyn StateMachine>>,

    pub(crate) pending: parking_lot::Mutex<PendingRequests>,
    pub(crate) timer: Arc<ElectionTimer>,

    epoch: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
    shut_down: AtomicBool,

    status_tx: watch::Sender<ServerStatus>,
    commit_tx: watch::Sender<LogIndex>,
    applied_tx: watch::Sender<TermIndex>,
    kick_tx: watch::Sender<u64>,
    ack_tx: watch::Sender<u64>,

    /// Set when the state machine failed; the replica stops applying
    halted: parking_lot::Mutex<Option<(LogIndex, String)>>,
}

impl RaftState {
    pub(crate) fn new(
        id: PeerId,
        config: RaftConfig,
        log: RaftLog,
        hard: HardState,
        membership: Membership,
        applied: TermIndex,
        services: Services,
    ) -> Self {
        let epoch = Arc::new(AtomicU64::new(0));
        let timer = Arc::new(ElectionTimer::new(config.clone(), epoch.clone()));
        let (shutdown_tx, _) = broadcast::channel(16);
        let (status_tx, _) = watch::channel(ServerStatus {
            term: hard.current_term,
            role: Role::Follower,
            leader: None,
            epoch: 0,
        });
        let (commit_tx, _) = watch::channel(log.commit_index());
        let (applied_tx, _) = watch::channel(applied);
        let (kick_tx, _) = watch::channel(0);
        let (ack_tx, _) = watch::channel(0);

        let core = Core {
            term: hard.current_term,
            voted_for: hard.voted_for,
            role: Role::Follower,
            leader_id: None,
            epoch: 0,
            log,
            membership,
            leader: None,
            install: None,
            pending_install: None,
        };

        Self {
            id,
            config,
            core: Mutex::new(core),
            storage: services.storage,
            transport: services.transport,
            snapshots: services.snapshots,
            state_machine: parking_lot::Mutex::new(services.state_machine),
            pending: parking_lot::Mutex::new(PendingRequests::default()),
            timer,
            epoch,
            shutdown_tx,
            shut_down: AtomicBool::new(false),
            status_tx,
            commit_tx,
            applied_tx,
            kick_tx,
            ack_tx,
            halted: parking_lot::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn group_id(&self) -> GroupId {
        self.config.group_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn status(&self) -> ServerStatus {
        self.status_tx.borrow().clone()
    }

    pub fn role(&self) -> Role {
        self.status_tx.borrow().role
    }

    pub fn current_term(&self) -> Term {
        self.status_tx.borrow().term
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.status_tx.borrow().leader
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn commit_index(&self) -> LogIndex {
        *self.commit_tx.borrow()
    }

    pub fn last_applied(&self) -> TermIndex {
        *self.applied_tx.borrow()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn RaftTransport> {
        &self.transport
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().await
    }

    pub(crate) fn subscribe_status(&self) -> watch::Receiver<ServerStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn subscribe_commit(&self) -> watch::Receiver<LogIndex> {
        self.commit_tx.subscribe()
    }

    pub(crate) fn subscribe_applied(&self) -> watch::Receiver<TermIndex> {
        self.applied_tx.subscribe()
    }

    pub(crate) fn subscribe_kicks(&self) -> watch::Receiver<u64> {
        self.kick_tx.subscribe()
    }

    pub(crate) fn subscribe_acks(&self) -> watch::Receiver<u64> {
        self.ack_tx.subscribe()
    }

    pub(crate) fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) async fn persist_hard_state(&self, core: &Core) -> Result<()> {
        self.storage
            .save_hard_state(&HardState {
                current_term: core.term,
                voted_for: core.voted_for,
                commit_index: core.log.commit_index(),
            })
            .await
    }

    pub(crate) fn publish_status(&self, core: &Core) {
        self.status_tx.send_replace(ServerStatus {
            term: core.term,
            role: core.role,
            leader: core.leader_id,
            epoch: core.epoch,
        });
    }

    pub(crate) fn publish_commit(&self, index: LogIndex) {
        self.commit_tx.send_if_modified(|current| {
            if index > *current {
                *current = index;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn publish_applied(&self, at: TermIndex) {
        self.applied_tx.send_replace(at);
    }

    /// Wake every replicator (new entries or a commit change to propagate).
    pub(crate) fn kick_replicators(&self) {
        self.kick_tx.send_modify(|k| *k = k.wrapping_add(1));
    }

    /// Signal that a follower acknowledged something (read rounds, commit).
    pub(crate) fn notify_ack(&self) {
        self.ack_tx.send_modify(|k| *k = k.wrapping_add(1));
    }

    fn bump_epoch(&self, core: &mut Core) {
        core.epoch += 1;
        self.epoch.store(core.epoch, Ordering::SeqCst);
    }

    /// Become a follower, adopting `term` if it is newer.
    ///
    /// A leader stepping down fails every pending client request with
    /// `NotLeader`.
    pub(crate) async fn step_down(
        &self,
        core: &mut Core,
        term: Term,
        leader: Option<PeerId>,
    ) -> Result<()> {
        let was_leader = core.role == Role::Leader;
        let term_changed = term > core.term;
        let role_changed = core.role != Role::Follower;

        if term_changed {
            core.term = term;
            core.voted_for = None;
        }
        core.role = Role::Follower;
        core.leader = None;
        core.leader_id = leader;

        if term_changed || role_changed {
            self.bump_epoch(core);
        }
        if term_changed {
            self.persist_hard_state(core).await?;
        }
        self.publish_status(core);

        if was_leader {
            tracing::info!(term = %core.term, leader = ?leader, "Stepping down from leader");
            self.pending.lock().fail_all(|| RaftError::not_leader(leader));
        } else if role_changed {
            tracing::debug!(term = %core.term, "Candidate stepping down");
        }

        self.timer.reset();
        Ok(())
    }

    /// Handle RequestVote RPC.
    ///
    /// Grants at most one vote per term, and only to a candidate whose log is
    /// at least as up-to-date as ours. The vote is durable before the reply.
    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let mut guard = self.lock().await;
        let core = &mut *guard;

        if request.term > core.term {
            self.step_down(core, request.term, None).await?;
        }

        let mut vote_granted = false;
        if request.term == core.term {
            let free = core
                .voted_for
                .map_or(true, |voted| voted == request.candidate_id);
            let log_ok = is_log_up_to_date(request.last_log, core.log.last_term_index());

            if free && log_ok {
                vote_granted = true;
                if core.voted_for.is_none() {
                    core.voted_for = Some(request.candidate_id);
                    self.persist_hard_state(core).await?;
                }
            }
        }

        tracing::debug!(
            term = %core.term,
            candidate = %request.candidate_id,
            granted = vote_granted,
            "RequestVote"
        );

        Ok(RequestVoteResponse {
            term: core.term,
            vote_granted,
        })
    }

    /// Become a candidate for the next term.
    ///
    /// Returns `None` if this server is a leader, not a voter, or halted.
    pub(crate) async fn start_election(&self) -> Result<Option<Ballot>> {
        let mut guard = self.lock().await;
        let core = &mut *guard;

        if core.role == Role::Leader || !core.membership.contains(&self.id) || self.is_halted() {
            return Ok(None);
        }

        core.term = core.term.next();
        core.voted_for = Some(self.id);
        core.role = Role::Candidate;
        core.leader_id = None;
        core.leader = None;
        self.bump_epoch(core);
        self.persist_hard_state(core).await?;
        self.publish_status(core);
        self.timer.reset();

        tracing::info!(term = %core.term, "Starting election");

        Ok(Some(Ballot {
            term: core.term,
            epoch: core.epoch,
            last_log: core.log.last_term_index(),
            membership: core.membership.clone(),
        }))
    }

    /// Become leader for `term` after winning its election.
    ///
    /// Appends this term's no-op entry. Returns the new epoch, or `None` if
    /// the server moved on from that candidacy in the meantime.
    pub(crate) async fn become_leader(&self, term: Term) -> Result<Option<u64>> {
        let mut guard = self.lock().await;
        let core = &mut *guard;

        if core.role != Role::Candidate || core.term != term {
            return Ok(None);
        }

        core.role = Role::Leader;
        core.leader_id = Some(self.id);
        self.bump_epoch(core);

        let next = core.log.last_index().next();
        let progress = core
            .membership
            .peers_of(&self.id)
            .map(|peer| (*peer, PeerProgress::new(next)))
            .collect();
        core.leader = Some(LeaderState {
            progress,
            ready: false,
            read_round: 0,
        });

        core.log.append_entry(LogEntry::no_op(term, next)).await?;
        self.publish_status(core);
        advance_commit_index(self, core).await?;
        self.kick_replicators();

        tracing::info!(term = %term, no_op = %next, "Became leader");
        Ok(Some(core.epoch))
    }

    /// Record a fatal state machine failure and leave any active role.
    ///
    /// Pending requests fail with `StateMachineFailure`. A halted leader
    /// steps down so the rest of the group can elect a replacement, and a
    /// halted server never campaigns again.
    pub(crate) async fn halt(&self, index: LogIndex, reason: String) -> Result<()> {
        tracing::error!(index = %index, reason = %reason, "State machine failed, halting apply");
        *self.halted.lock() = Some((index, reason.clone()));

        let mut guard = self.lock().await;
        let core = &mut *guard;
        self.pending.lock().fail_all(|| RaftError::StateMachineFailure {
            index,
            reason: reason.clone(),
        });
        if core.role != Role::Follower {
            let term = core.term;
            self.step_down(core, term, None).await?;
        }
        Ok(())
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.lock().is_some()
    }

    /// Fails if the state machine previously failed.
    pub(crate) fn check_halted(&self) -> Result<()> {
        match &*self.halted.lock() {
            Some((index, reason)) => Err(RaftError::StateMachineFailure {
                index: *index,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn check_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(RaftError::Shutdown);
        }
        self.check_halted()
    }

    /// Stop background tasks and fail pending requests.
    pub(crate) fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timer.shutdown();
        let _ = self.shutdown_tx.send(());
        self.pending.lock().fail_all(|| RaftError::Shutdown);
        tracing::info!(peer = %self.id, "Raft server shut down");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::counter::CounterStateMachine;
    use crate::storage::MemStorage;
    use crate::transport::InMemoryTransport;

    /// State for `id` in a group of `voters`, with in-memory collaborators
    /// and no peers reachable.
    pub(crate) async fn test_state(id: PeerId, voters: &[PeerId]) -> RaftState {
        test_state_on(id, voters, MemStorage::new()).await
    }

    pub(crate) async fn test_state_on(
        id: PeerId,
        voters: &[PeerId],
        storage: MemStorage,
    ) -> RaftState {
        let storage: Arc<dyn LogStorage> = Arc::new(storage);
        let (log, hard) = RaftLog::open(storage.clone()).await.unwrap();
        let services = Services {
            storage,
            transport: Arc::new(InMemoryTransport::new(id, HashMap::new())),
            snapshots: Arc::new(SnapshotStore::in_memory()),
            state_machine: Box::new(CounterStateMachine::new()),
        };
        RaftState::new(
            id,
            RaftConfig::default(),
            log,
            hard,
            Membership::new(voters.iter().copied()),
            TermIndex::ZERO,
            services,
        )
    }
}
