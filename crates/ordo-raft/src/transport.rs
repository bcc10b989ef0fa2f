//! Transport abstraction for Raft RPC communication.
//!
//! `RaftTransport` is the only way the engine talks to peers. Production
//! deployments plug in a network transport; `InMemoryTransport` wires servers
//! in one process through channels, which is what the tests and the
//! simulator use. Removing a peer from an `InMemoryTransport` cuts that link,
//! which is how partitions are simulated.

use crate::error::{RaftError, Result};
use crate::id::PeerId;
use crate::types::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Outbound RPCs to other servers of the group.
///
/// Calls may take arbitrarily long; the engine wraps each one in its own
/// timeout. Unreachable peers should fail with `RaftError::Io`.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Ask `target` for its vote.
    async fn request_vote(
        &self,
        target: &PeerId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Replicate entries to `target` (or heartbeat when empty).
    async fn append_entries(
        &self,
        target: &PeerId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Send one snapshot chunk to `target`.
    async fn install_snapshot(
        &self,
        target: &PeerId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// RPC message envelope delivered to a server's handler loop.
#[derive(Debug)]
pub enum RpcMessage {
    RequestVote {
        request: RequestVoteRequest,
        response_tx: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response_tx: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response_tx: oneshot::Sender<InstallSnapshotResponse>,
    },
}

pub type RpcSender = mpsc::Sender<RpcMessage>;
pub type RpcReceiver = mpsc::Receiver<RpcMessage>;

/// In-process transport over channels.
pub struct InMemoryTransport {
    local_id: PeerId,
    peers: Arc<RwLock<HashMap<PeerId, RpcSender>>>,
}

impl InMemoryTransport {
    pub fn new(local_id: PeerId, peers: HashMap<PeerId, RpcSender>) -> Self {
        Self {
            local_id,
            peers: Arc::new(RwLock::new(peers)),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Connect (or reconnect) the link to `peer`.
    pub fn add_peer(&self, peer: PeerId, sender: RpcSender) {
        self.peers.write().insert(peer, sender);
    }

    /// Cut the link to `peer`; calls fail until it is added again.
    pub fn remove_peer(&self, peer: &PeerId) {
        self.peers.write().remove(peer);
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.read().contains_key(peer)
    }

    async fn call<R>(
        &self,
        target: &PeerId,
        envelope: impl FnOnce(oneshot::Sender<R>) -> RpcMessage,
    ) -> Result<R> {
        let sender = self
            .peers
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| io_error(io::ErrorKind::NotFound, format!("peer not found: {}", target)))?;

        let (response_tx, response_rx) = oneshot::channel();
        sender
            .send(envelope(response_tx))
            .await
            .map_err(|e| io_error(io::ErrorKind::BrokenPipe, e.to_string()))?;

        response_rx
            .await
            .map_err(|e| io_error(io::ErrorKind::BrokenPipe, e.to_string()))
    }
}

fn io_error(kind: io::ErrorKind, message: String) -> RaftError {
    RaftError::Io {
        source: io::Error::new(kind, message),
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: &PeerId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.call(target, |response_tx| RpcMessage::RequestVote {
            request,
            response_tx,
        })
        .await
    }

    async fn append_entries(
        &self,
        target: &PeerId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.call(target, |response_tx| RpcMessage::AppendEntries {
            request,
            response_tx,
        })
        .await
    }

    async fn install_snapshot(
        &self,
        target: &PeerId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.call(target, |response_tx| RpcMessage::InstallSnapshot {
            request,
            response_tx,
        })
        .await
    }
}
