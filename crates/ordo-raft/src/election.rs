//! Leader election.
//!
//! - A follower or candidate whose election timer fires (in the epoch it was
//!   armed in) becomes a candidate for the next term and votes for itself.
//! - RequestVote goes to every other voter in parallel; the candidate wins as
//!   soon as a strict majority granted, and steps down on any newer term.
//! - A split vote simply waits for the next randomized timeout.

use crate::error::Result;
use crate::id::PeerId;
use crate::replication::spawn_replicators;
use crate::state::RaftState;
use crate::timer::TimerFire;
use crate::types::*;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

/// Election result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Majority granted
    Won { term: Term, votes_received: usize },

    /// Discovered a higher term (or the candidacy was superseded)
    Lost { current_term: Term },

    /// Not enough votes before every peer answered or timed out
    Timeout,

    /// Not eligible to campaign (already leader, or not a voter)
    Skipped,
}

/// Run one election round as a candidate.
pub async fn run_election(state: &Arc<RaftState>) -> Result<ElectionOutcome> {
    let Some(ballot) = state.start_election().await? else {
        return Ok(ElectionOutcome::Skipped);
    };

    let me = *state.id();
    let mut votes: HashSet<PeerId> = HashSet::new();
    votes.insert(me);
    if ballot.membership.has_quorum(votes.iter()) {
        return Ok(ElectionOutcome::Won {
            term: ballot.term,
            votes_received: votes.len(),
        });
    }

    let rpc_timeout = state.config().rpc_timeout;
    let mut requests: FuturesUnordered<_> = ballot
        .membership
        .peers_of(&me)
        .map(|peer| {
            let peer = *peer;
            let transport = state.transport().clone();
            let request = RequestVoteRequest {
                term: ballot.term,
                candidate_id: me,
                last_log: ballot.last_log,
            };
            async move {
                let result = timeout(rpc_timeout, transport.request_vote(&peer, request)).await;
                (peer, result)
            }
        })
        .collect();

    while let Some((peer, result)) = requests.next().await {
        match result {
            Ok(Ok(response)) => {
                if response.term > ballot.term {
                    let mut guard = state.lock().await;
                    let core = &mut *guard;
                    if response.term > core.term {
                        state.step_down(core, response.term, None).await?;
                    }
                    return Ok(ElectionOutcome::Lost {
                        current_term: core.term,
                    });
                }
                if response.vote_granted {
                    votes.insert(peer);
                    if ballot.membership.has_quorum(votes.iter()) {
                        return Ok(ElectionOutcome::Won {
                            term: ballot.term,
                            votes_received: votes.len(),
                        });
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "RequestVote failed");
            }
            Err(_) => {
                tracing::debug!(peer = %peer, "RequestVote timed out");
            }
        }

        if state.epoch() != ballot.epoch {
            // Heard from a leader or a newer term meanwhile
            return Ok(ElectionOutcome::Lost {
                current_term: state.current_term(),
            });
        }
    }

    Ok(ElectionOutcome::Timeout)
}

/// Election loop. Spawn as a background task.
///
/// Fires armed before the latest timer reset or role change are dropped.
pub(crate) async fn election_loop(
    state: Arc<RaftState>,
    mut timeout_rx: mpsc::Receiver<TimerFire>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            fired = timeout_rx.recv() => {
                let Some(fire) = fired else {
                    break;
                };
                if state.timer.is_stale(fire) {
                    tracing::trace!(?fire, "Ignoring stale election timeout");
                    continue;
                }
                if state.role() == Role::Leader {
                    continue;
                }

                match run_election(&state).await {
                    Ok(ElectionOutcome::Won { term, votes_received }) => {
                        tracing::info!(
                            term = %term,
                            votes = votes_received,
                            "Won election, becoming leader"
                        );
                        match state.become_leader(term).await {
                            Ok(Some(epoch)) => spawn_replicators(&state, epoch).await,
                            Ok(None) => {
                                tracing::debug!(term = %term, "Candidacy superseded before taking office");
                            }
                            Err(e) => tracing::error!(error = %e, "Failed to become leader"),
                        }
                    }
                    Ok(ElectionOutcome::Lost { current_term }) => {
                        tracing::debug!(term = %current_term, "Lost election");
                    }
                    Ok(ElectionOutcome::Timeout) => {
                        tracing::debug!("Election timed out (split vote), will retry");
                    }
                    Ok(ElectionOutcome::Skipped) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "Election error");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Election loop shutting down");
                break;
            }
        }
    }
}

/// Whether a candidate whose log ends at `candidate` is at least as
/// up-to-date as a voter whose log ends at `voter`.
///
/// The later last term wins; with equal last terms the longer log wins.
pub fn is_log_up_to_date(candidate: TermIndex, voter: TermIndex) -> bool {
    candidate >= voter
}
