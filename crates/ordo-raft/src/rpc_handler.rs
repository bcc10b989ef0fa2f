//! Dispatcher from incoming RPC messages to `RaftState` handlers.
//!
//! ```text
//! transport → RpcMessage → rpc_handler_loop → RaftState::handle_*
//!                                   ↓
//!                       response via oneshot channel
//! ```
//!
//! Traffic from the current leader (and granting a vote) resets the election
//! timer here, after the handler has run.

use crate::state::RaftState;
use crate::transport::{RpcMessage, RpcReceiver};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Serve incoming RPCs until shutdown or until the channel closes.
///
/// Messages are handled one at a time, in arrival order.
pub async fn rpc_handler_loop(
    state: Arc<RaftState>,
    mut rpc_rx: RpcReceiver,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg = rpc_rx.recv() => {
                match msg {
                    Some(msg) => handle_rpc_message(&state, msg).await,
                    None => {
                        tracing::debug!("RPC channel closed, exiting handler loop");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("RPC handler loop shutting down");
                break;
            }
        }
    }
}

async fn handle_rpc_message(state: &RaftState, msg: RpcMessage) {
    match msg {
        RpcMessage::RequestVote { request, response_tx } => {
            match state.handle_request_vote(request).await {
                Ok(response) => {
                    if response.vote_granted {
                        state.timer.reset();
                    }
                    let _ = response_tx.send(response);
                }
                // No reply; the caller times out
                Err(e) => tracing::error!(error = %e, "Failed to handle RequestVote"),
            }
        }

        RpcMessage::AppendEntries { request, response_tx } => {
            let term = request.term;
            match state.handle_append_entries(request).await {
                Ok(response) => {
                    if response.term == term {
                        state.timer.reset();
                    }
                    let _ = response_tx.send(response);
                }
                Err(e) => tracing::error!(error = %e, "Failed to handle AppendEntries"),
            }
        }

        RpcMessage::InstallSnapshot { request, response_tx } => {
            let term = request.term;
            match state.handle_install_snapshot(request).await {
                Ok(response) => {
                    if response.term == term {
                        state.timer.reset();
                    }
                    let _ = response_tx.send(response);
                }
                Err(e) => tracing::error!(error = %e, "Failed to handle InstallSnapshot"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::PeerId;
    use crate::state::test_support::test_state;
    use crate::types::*;
    use tokio::sync::{mpsc, oneshot};

    async fn spawn_handler() -> (
        Arc<RaftState>,
        mpsc::Sender<RpcMessage>,
        broadcast::Sender<()>,
        tokio::task::JoinHandle<()>,
    ) {
        let id = PeerId::random();
        let state = Arc::new(test_state(id, &[id]).await);
        let (rpc_tx, rpc_rx) = mpsc::channel(10);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(rpc_handler_loop(state.clone(), rpc_rx, shutdown_rx));
        (state, rpc_tx, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_dispatches_request_vote() {
        let (_state, rpc_tx, shutdown_tx, handle) = spawn_handler().await;

        let (response_tx, response_rx) = oneshot::channel();
        rpc_tx
            .send(RpcMessage::RequestVote {
                request: RequestVoteRequest {
                    term: Term(5),
                    candidate_id: PeerId::random(),
                    last_log: TermIndex::ZERO,
                },
                response_tx,
            })
            .await
            .unwrap();

        let response = response_rx.await.unwrap();
        assert_eq!(response.term, Term(5));
        assert!(response.vote_granted);

        let _ = shutdown_tx.send(());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatches_append_entries() {
        let (state, rpc_tx, shutdown_tx, handle) = spawn_handler().await;
        let leader = PeerId::random();

        let (response_tx, response_rx) = oneshot::channel();
        rpc_tx
            .send(RpcMessage::AppendEntries {
                request: AppendEntriesRequest {
                    term: Term(1),
                    leader_id: leader,
                    prev_log: TermIndex::ZERO,
                    entries: vec![],
                    leader_commit: LogIndex::ZERO,
                },
                response_tx,
            })
            .await
            .unwrap();

        let response = response_rx.await.unwrap();
        assert!(response.success);
        assert_eq!(state.leader(), Some(leader));

        let _ = shutdown_tx.send(());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_exits_when_channel_closes() {
        let (_state, rpc_tx, _shutdown_tx, handle) = spawn_handler().await;
        drop(rpc_tx);
        handle.await.unwrap();
    }
}
