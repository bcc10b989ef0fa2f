//! Apply pipeline.
//!
//! A single worker per server moves the applied cursor forward over the
//! committed prefix of the log, strictly in index order and exactly once per
//! index:
//!
//! - commands go to `StateMachine::apply_transaction`; on the leader the
//!   reply completes the client's pending write
//! - configuration entries switch the membership
//! - the leader's own no-op marks it ready to serve clients
//!
//! The same worker loads snapshots installed from the leader and takes local
//! snapshots, so the state machine only ever changes on this task.
//!
//! A state machine error is fatal: the replica stops applying, every pending
//! request fails with `StateMachineFailure`, and a leader steps down.

use crate::error::{RaftError, Result};
use crate::id::ClientId;
use crate::replication::{advance_commit_index, spawn_replicator};
use crate::snapshot::take_snapshot;
use crate::state::{PeerProgress, RaftState};
use crate::types::*;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Reply channel for an explicit snapshot request.
pub(crate) type SnapshotRequest = oneshot::Sender<Result<TermIndex>>;

struct Waiter {
    term: Term,
    client_id: ClientId,
    call_id: u64,
    tx: oneshot::Sender<Result<ClientReply>>,
}

/// Writes appended by this leader, waiting to be applied.
#[derive(Default)]
pub(crate) struct PendingRequests {
    waiters: BTreeMap<LogIndex, Waiter>,
}

impl PendingRequests {
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Wait for the entry appended at `at` to be applied.
    pub(crate) fn register(
        &mut self,
        at: TermIndex,
        client_id: ClientId,
        call_id: u64,
    ) -> oneshot::Receiver<Result<ClientReply>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(
            at.index,
            Waiter {
                term: at.term,
                client_id,
                call_id,
                tx,
            },
        );
        rx
    }

    /// Deliver the outcome of applying `entry`.
    ///
    /// If a different term's entry ended up at that index, the original write
    /// was overwritten and fails with `NotLeader`.
    pub(crate) fn complete(&mut self, entry: &LogEntry, result: Result<Bytes>) {
        let Some(waiter) = self.waiters.remove(&entry.index) else {
            return;
        };
        let outcome = if waiter.term != entry.term {
            Err(RaftError::not_leader(None))
        } else {
            result.map(|message| ClientReply {
                client_id: waiter.client_id,
                call_id: waiter.call_id,
                log_index: entry.index,
                message,
            })
        };
        let _ = waiter.tx.send(outcome);
    }

    /// Drop the waiter at `index` (its caller gave up).
    pub(crate) fn remove(&mut self, index: LogIndex) {
        self.waiters.remove(&index);
    }

    /// Fail every waiter with `make_err()`.
    pub(crate) fn fail_all(&mut self, make_err: impl Fn() -> RaftError) {
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.tx.send(Err(make_err()));
        }
    }
}

/// Apply worker. Spawn as a background task.
pub(crate) async fn apply_loop(
    state: Arc<RaftState>,
    mut snapshot_rx: mpsc::Receiver<SnapshotRequest>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut commit_rx = state.subscribe_commit();

    loop {
        commit_rx.borrow_and_update();

        match apply_committed(&state).await {
            Ok(()) => {}
            Err(RaftError::StateMachineFailure { index, reason }) => {
                if let Err(e) = state.halt(index, reason).await {
                    tracing::error!(error = %e, "Failed to step down after halting");
                }
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "Apply round failed");
            }
        }

        maybe_auto_snapshot(&state).await;

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            changed = commit_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            Some(reply) = snapshot_rx.recv() => {
                let _ = reply.send(take_snapshot(&state, state.last_applied()).await);
            }
        }
    }

    tracing::debug!("Apply loop stopped");
}

enum Work {
    Install(TermIndex),
    Batch(Vec<LogEntry>),
    Idle,
}

/// Apply everything committed so far.
pub(crate) async fn apply_committed(state: &Arc<RaftState>) -> Result<()> {
    loop {
        if state.is_shutdown() {
            return Ok(());
        }
        let applied = state.last_applied();

        let work = {
            let mut core = state.lock().await;
            if let Some(point) = core.pending_install.take() {
                Work::Install(point)
            } else {
                let commit = core.log.commit_index();
                let from = applied.index.next();
                if from > commit {
                    Work::Idle
                } else if from < core.log.first_index() {
                    return Err(RaftError::InvariantViolation {
                        reason: format!(
                            "entry {} was purged before being applied (log starts at {})",
                            from,
                            core.log.first_index()
                        ),
                    });
                } else {
                    Work::Batch(core.log.get_range(
                        from,
                        commit,
                        state.config().apply_batch_size,
                        usize::MAX,
                    )?)
                }
            }
        };

        match work {
            Work::Idle => return Ok(()),
            Work::Install(point) => load_installed_snapshot(state, point)?,
            Work::Batch(entries) => {
                for entry in entries {
                    apply_entry(state, entry).await?;
                }
            }
        }
    }
}

fn load_installed_snapshot(state: &RaftState, point: TermIndex) -> Result<()> {
    let snapshot = state
        .snapshots
        .latest()
        .filter(|s| s.meta.last_included >= point)
        .ok_or_else(|| RaftError::Snapshot {
            reason: format!("installed snapshot {} is missing", point),
        })?;

    let at = snapshot.meta.last_included;
    state
        .state_machine
        .lock()
        .reinitialize(Some(&snapshot))
        .map_err(|e| RaftError::StateMachineFailure {
            index: at.index,
            reason: format!("loading snapshot: {}", e),
        })?;
    state.publish_applied(at);

    tracing::info!(last_included = %at, "Loaded installed snapshot into state machine");
    Ok(())
}

async fn apply_entry(state: &Arc<RaftState>, entry: LogEntry) -> Result<()> {
    let at = entry.term_index();

    match &entry.payload {
        EntryPayload::Command(command) => {
            let result = state.state_machine.lock().apply_transaction(at, command);
            let reply = result.map_err(|e| RaftError::StateMachineFailure {
                index: entry.index,
                reason: e.to_string(),
            })?;
            state.publish_applied(at);
            state.pending.lock().complete(&entry, Ok(reply));
        }
        EntryPayload::Configuration(membership) => {
            // Complete first: a leader removing itself steps down below
            state.pending.lock().complete(&entry, Ok(Bytes::new()));
            apply_configuration(state, membership.clone()).await?;
            state.publish_applied(at);
        }
        EntryPayload::NoOp => {
            {
                let mut core = state.lock().await;
                let term = core.term;
                if let Some(leader) = core.leader.as_mut() {
                    if term == entry.term && !leader.ready {
                        leader.ready = true;
                        tracing::info!(term = %term, index = %entry.index, "Leader ready");
                    }
                }
            }
            state.publish_applied(at);
        }
    }

    tracing::trace!(index = %entry.index, term = %entry.term, "Applied entry");
    Ok(())
}

async fn apply_configuration(state: &Arc<RaftState>, membership: Membership) -> Result<()> {
    let mut guard = state.lock().await;
    let core = &mut *guard;
    let me = *state.id();

    tracing::info!(
        voters = membership.len(),
        member = membership.contains(&me),
        "Membership changed"
    );
    core.membership = membership;

    if core.role != Role::Leader {
        return Ok(());
    }

    if !core.membership.contains(&me) {
        let term = core.term;
        return state.step_down(core, term, None).await;
    }

    let next = core.log.last_index().next();
    let epoch = core.epoch;
    if let Some(leader) = core.leader.as_mut() {
        let membership = &core.membership;
        leader.progress.retain(|peer, _| membership.contains(peer));
        for peer in membership.peers_of(&me) {
            if !leader.progress.contains_key(peer) {
                leader.progress.insert(*peer, PeerProgress::new(next));
                spawn_replicator(state.clone(), *peer, epoch);
            }
        }
    }

    // A smaller group may already have a quorum for more entries
    advance_commit_index(state, core).await?;
    Ok(())
}

async fn maybe_auto_snapshot(state: &Arc<RaftState>) {
    let threshold = state.config().snapshot_auto_trigger_threshold;
    if threshold == 0 {
        return;
    }
    let applied = state.last_applied();
    let covered = state.snapshots.latest_point().index;
    if applied.index.as_u64().saturating_sub(covered.as_u64()) < threshold {
        return;
    }
    if let Err(e) = take_snapshot(state, applied).await {
        tracing::warn!(error = %e, at = %applied, "Automatic snapshot failed");
    }
}
