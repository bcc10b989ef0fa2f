//! Leader side of log replication.
//!
//! - One replicator task per follower, started when a term's leadership
//!   begins and stopped when the epoch changes.
//! - A replicator sends AppendEntries from the follower's `next_index`, as a
//!   heartbeat when there is nothing new, and streams a snapshot instead when
//!   the needed entries were purged.
//! - Rejections carry a conflict hint that lets the leader skip a whole term
//!   of mismatched entries at once.
//! - The commit index advances to the highest index stored on a majority
//!   whose entry is from the current term.
//! - Every response in the current term counts as an acknowledgement for
//!   the read round it was sent in; a quorum of those confirms leadership for
//!   linearizable reads.

use crate::error::{RaftError, Result};
use crate::id::PeerId;
use crate::log::RaftLog;
use crate::snapshot::send_snapshot;
use crate::state::{Core, RaftState};
use crate::types::*;
use std::sync::Arc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};

/// Outcome of one replication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplicationStep {
    /// More to send right away
    Continue,
    /// Follower is caught up; wait for new entries or the next heartbeat
    Idle,
    /// Leadership for the replicator's epoch is over
    Stale,
}

/// Start a replicator for every follower of the current leadership.
pub(crate) async fn spawn_replicators(state: &Arc<RaftState>, epoch: u64) {
    let peers: Vec<PeerId> = {
        let core = state.lock().await;
        if core.epoch != epoch {
            return;
        }
        match &core.leader {
            Some(leader) => leader.progress.keys().copied().collect(),
            None => return,
        }
    };
    for peer in peers {
        spawn_replicator(state.clone(), peer, epoch);
    }
}

pub(crate) fn spawn_replicator(state: Arc<RaftState>, peer: PeerId, epoch: u64) {
    if state.is_shutdown() {
        return;
    }
    tokio::spawn(async move {
        replicator_loop(state, peer, epoch).await;
    });
}

async fn replicator_loop(state: Arc<RaftState>, peer: PeerId, epoch: u64) {
    let mut shutdown_rx = state.shutdown_receiver();
    let mut kick_rx = state.subscribe_kicks();
    let period = state.config().heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(peer = %peer, epoch, "Replicator started");

    loop {
        if state.epoch() != epoch || state.is_shutdown() {
            break;
        }
        // Kicks that arrive while sending must wake the next wait
        kick_rx.borrow_and_update();

        let step = match replicate_once(&state, &peer, epoch).await {
            Ok(step) => step,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "Replication attempt failed");
                ReplicationStep::Idle
            }
        };

        match step {
            ReplicationStep::Stale => break,
            ReplicationStep::Continue => continue,
            ReplicationStep::Idle => {}
        }

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            changed = kick_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {}
        }
    }

    tracing::debug!(peer = %peer, epoch, "Replicator stopped");
}

/// Send one AppendEntries (or a snapshot) to `peer` and process the reply.
pub(crate) async fn replicate_once(
    state: &Arc<RaftState>,
    peer: &PeerId,
    epoch: u64,
) -> Result<ReplicationStep> {
    let config = state.config();

    let (request, sent_next, read_round) = {
        let core = state.lock().await;
        if core.epoch != epoch {
            return Ok(ReplicationStep::Stale);
        }
        let Some(leader) = core.leader.as_ref() else {
            return Ok(ReplicationStep::Stale);
        };
        let Some(progress) = leader.progress.get(peer) else {
            // Removed from the group
            return Ok(ReplicationStep::Stale);
        };
        let next = progress.next_index;
        let read_round = leader.read_round;

        if next < core.log.first_index() {
            drop(core);
            return send_snapshot(state, peer, epoch).await;
        }

        let prev_index = next.prev().unwrap_or(LogIndex::ZERO);
        let prev_term = core
            .log
            .term_at(prev_index)
            .ok_or_else(|| RaftError::Internal {
                reason: format!("next index {} for {} is beyond the log", next, peer),
            })?;

        let last = core.log.last_index();
        let entries = if next <= last {
            core.log.get_range(
                next,
                last,
                config.max_entries_per_append,
                config.max_append_bytes,
            )?
        } else {
            Vec::new()
        };

        let request = AppendEntriesRequest {
            term: core.term,
            leader_id: *state.id(),
            prev_log: TermIndex::new(prev_term, prev_index),
            entries,
            leader_commit: core.log.commit_index(),
        };
        (request, next, read_round)
    };

    let sent_last = request
        .entries
        .last()
        .map(|e| e.index)
        .unwrap_or(request.prev_log.index);

    let started = Instant::now();
    let response = match timeout(
        config.rpc_timeout,
        state.transport().append_entries(peer, request),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            return Err(RaftError::Timeout {
                operation: "append_entries",
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
        }
    };

    let mut guard = state.lock().await;
    let core = &mut *guard;

    if response.term > core.term {
        tracing::info!(
            peer = %peer,
            term = %response.term,
            "Follower has a newer term"
        );
        state.step_down(core, response.term, None).await?;
        return Ok(ReplicationStep::Stale);
    }
    if core.epoch != epoch {
        return Ok(ReplicationStep::Stale);
    }

    let last_index = core.log.last_index();
    let Some(leader) = core.leader.as_mut() else {
        return Ok(ReplicationStep::Stale);
    };
    let Some(progress) = leader.progress.get_mut(peer) else {
        return Ok(ReplicationStep::Stale);
    };

    progress.last_ack = Some(Instant::now());
    progress.acked_round = progress.acked_round.max(read_round);

    if response.success {
        progress.match_index = progress.match_index.max(sent_last);
        progress.next_index = progress.match_index.next();
        let more = progress.next_index <= last_index;

        advance_commit_index(state, core).await?;
        state.notify_ack();
        Ok(if more {
            ReplicationStep::Continue
        } else {
            ReplicationStep::Idle
        })
    } else {
        let next = backtrack(&core.log, response.conflict, sent_next, progress.match_index);
        tracing::debug!(
            peer = %peer,
            from = %sent_next,
            to = %next,
            "Follower rejected entries, backing off"
        );
        progress.next_index = next;
        state.notify_ack();
        Ok(ReplicationStep::Continue)
    }
}

/// Where to resume after a rejection of entries starting at `sent_next`.
///
/// Uses the follower's hint when present: if the leader has entries of the
/// conflicting term, resume right after its last one; otherwise resume at the
/// follower's first index of that term (or its tail). Always moves strictly
/// back and never below `match_index + 1`.
fn backtrack(
    log: &RaftLog,
    hint: Option<ConflictHint>,
    sent_next: LogIndex,
    match_index: LogIndex,
) -> LogIndex {
    let target = match hint {
        Some(ConflictHint {
            term: Some(term),
            index,
        }) => log
            .last_index_of_term(term)
            .map(LogIndex::next)
            .unwrap_or(index),
        Some(ConflictHint { term: None, index }) => index,
        None => sent_next.prev().unwrap_or(LogIndex::ZERO),
    };
    let below_sent = sent_next.prev().unwrap_or(LogIndex::ZERO);
    target.min(below_sent).max(match_index.next())
}

/// Highest index that may be committed.
///
/// `match_indices` holds one entry per voter (the leader's own last index
/// included). The candidate is the largest index stored on a strict
/// majority; it is only committed if its entry is from `current_term`.
pub fn compute_commit_index(
    current_term: Term,
    commit: LogIndex,
    match_indices: &[LogIndex],
    term_at: impl Fn(LogIndex) -> Option<Term>,
) -> LogIndex {
    if match_indices.is_empty() {
        return commit;
    }
    let mut sorted = match_indices.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let candidate = sorted[sorted.len() / 2];

    // Terms never decrease along the log, so a lower index cannot be from
    // the current term if the candidate is not
    if candidate > commit && term_at(candidate) == Some(current_term) {
        candidate
    } else {
        commit
    }
}

/// Recompute and publish the leader's commit index.
///
/// Returns true if it advanced.
pub(crate) async fn advance_commit_index(state: &RaftState, core: &mut Core) -> Result<bool> {
    let Some(leader) = core.leader.as_ref() else {
        return Ok(false);
    };

    let me = state.id();
    let own_last = core.log.last_index();
    let match_indices: Vec<LogIndex> = core
        .membership
        .voters()
        .map(|voter| {
            if voter == me {
                own_last
            } else {
                leader
                    .progress
                    .get(voter)
                    .map(|p| p.match_index)
                    .unwrap_or(LogIndex::ZERO)
            }
        })
        .collect();

    let current = core.log.commit_index();
    let new_commit =
        compute_commit_index(core.term, current, &match_indices, |i| core.log.term_at(i));
    if new_commit <= current {
        return Ok(false);
    }

    core.log.set_commit_index(new_commit)?;
    state.persist_hard_state(core).await?;
    state.publish_commit(new_commit);
    // Followers learn the new commit index on the next round
    state.kick_replicators();

    tracing::trace!(term = %core.term, commit = %new_commit, "Commit index advanced");
    Ok(true)
}

/// Confirm this server is still leader and return the read index.
///
/// Starts a new read round and waits until a majority of voters (counting
/// this server) answered a request sent in that round. The returned index is
/// the commit index when the read started; a read is linearizable once the
/// state machine has applied up to it.
pub(crate) async fn confirm_leadership(state: &Arc<RaftState>) -> Result<LogIndex> {
    let started = Instant::now();
    let deadline = started + state.config().read_timeout;
    let mut ack_rx = state.subscribe_acks();

    let (round, read_index, epoch) = {
        let mut guard = state.lock().await;
        let core = &mut *guard;
        let term = core.term;
        let leader_id = core.leader_id;
        let Some(leader) = core.leader.as_mut() else {
            return Err(RaftError::not_leader(leader_id));
        };
        if !leader.ready {
            return Err(RaftError::LeaderNotReady { term });
        }
        leader.read_round += 1;
        (leader.read_round, core.log.commit_index(), core.epoch)
    };
    state.kick_replicators();

    loop {
        {
            let core = state.lock().await;
            if core.epoch != epoch {
                return Err(RaftError::not_leader(core.leader_id));
            }
            if let Some(leader) = &core.leader {
                let me = state.id();
                let acked = core.membership.voters().filter(|voter| {
                    *voter == me
                        || leader
                            .progress
                            .get(*voter)
                            .map_or(false, |p| p.acked_round >= round)
                });
                if core.membership.has_quorum(acked) {
                    return Ok(read_index);
                }
            }
        }

        match timeout_at(deadline, ack_rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(RaftError::Shutdown),
            Err(_) => {
                return Err(RaftError::Timeout {
                    operation: "read_index",
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }
}
