//! In-process Raft group wired through `InMemoryTransport`.

use crate::config::SimConfig;
use ordo_raft::counter::{CounterStateMachine, GET, INCREMENT};
use ordo_raft::{
    ClientId, ClientReply, ClientRequest, InMemoryTransport, LogIndex, Membership, PeerId, Raft,
    RaftError, RaftStorage, ReplicatedLog, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const LEADER_WAIT: Duration = Duration::from_secs(10);

pub struct SimServer {
    pub id: PeerId,
    pub raft: Arc<Raft>,
    transport: Arc<InMemoryTransport>,
}

pub struct SimCluster {
    servers: Vec<SimServer>,
    senders: HashMap<PeerId, mpsc::Sender<ordo_raft::RpcMessage>>,
}

impl SimCluster {
    /// Open and start every server of the group.
    pub async fn start(config: &SimConfig) -> Result<Self> {
        let ids: Vec<PeerId> = (0..config.servers).map(|_| PeerId::random()).collect();
        let membership = Membership::new(ids.iter().copied());

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for id in &ids {
            let (tx, rx) = mpsc::channel(1024);
            senders.insert(*id, tx);
            receivers.insert(*id, rx);
        }

        let mut servers = Vec::with_capacity(ids.len());
        for (n, id) in ids.iter().enumerate() {
            let peers = senders
                .iter()
                .filter(|(peer, _)| *peer != id)
                .map(|(peer, tx)| (*peer, tx.clone()))
                .collect();
            let transport = Arc::new(InMemoryTransport::new(*id, peers));

            let storage = match config.server_dir(n) {
                Some(dir) => RaftStorage::open_dir(dir).await?,
                None => RaftStorage::in_memory(),
            };

            let raft = Raft::open(
                *id,
                config.raft.clone(),
                storage,
                transport.clone(),
                membership.clone(),
                Box::new(CounterStateMachine::new()),
                receivers.remove(id),
            )
            .await?;
            raft.start().await?;

            tracing::info!(server = n, id = %id, "Server started");
            servers.push(SimServer {
                id: *id,
                raft: Arc::new(raft),
                transport,
            });
        }

        Ok(Self { servers, senders })
    }

    pub fn servers(&self) -> &[SimServer] {
        &self.servers
    }

    /// Index of a server that is leader and ready for clients.
    pub async fn wait_for_leader(&self) -> Result<usize> {
        let deadline = Instant::now() + LEADER_WAIT;
        loop {
            for (n, server) in self.servers.iter().enumerate() {
                if server.raft.is_ready_leader().await {
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Err(RaftError::Timeout {
                    operation: "wait_for_leader",
                    elapsed_ms: LEADER_WAIT.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Submit one INCREMENT through the current leader, retrying transient
    /// failures.
    pub async fn increment(&self, client: ClientId, call_id: u64) -> Result<ClientReply> {
        loop {
            let leader = self.wait_for_leader().await?;
            let request = ClientRequest::write(client, call_id, INCREMENT);
            match self.servers[leader].raft.submit(request).await {
                Err(e) if e.is_retriable() => {
                    tracing::debug!(error = %e, call_id, "Retrying write");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                other => return other,
            }
        }
    }

    /// Cut every link of server `n`.
    pub fn isolate(&self, n: usize) {
        let id = self.servers[n].id;
        for server in &self.servers {
            if server.id != id {
                server.transport.remove_peer(&id);
                self.servers[n].transport.remove_peer(&server.id);
            }
        }
        tracing::warn!(server = n, "Isolated server");
    }

    /// Reconnect server `n` to the rest of the group.
    pub fn reconnect(&self, n: usize) {
        let id = self.servers[n].id;
        for server in &self.servers {
            if server.id != id {
                server.transport.add_peer(id, self.senders[&id].clone());
                self.servers[n]
                    .transport
                    .add_peer(server.id, self.senders[&server.id].clone());
            }
        }
        tracing::info!(server = n, "Reconnected server");
    }

    /// Counter value on every server once each has applied `index`.
    pub async fn converged_values(&self, index: LogIndex) -> Result<Vec<i32>> {
        let mut values = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            let mut applied = server.raft.subscribe_applied();
            let deadline = Instant::now() + LEADER_WAIT;
            while applied.borrow_and_update().index < index {
                tokio::time::timeout_at(deadline, applied.changed())
                    .await
                    .map_err(|_| RaftError::Timeout {
                        operation: "converge",
                        elapsed_ms: LEADER_WAIT.as_millis() as u64,
                    })?
                    .map_err(|_| RaftError::Shutdown)?;
            }

            let reply = server
                .raft
                .query(ClientRequest::stale_read(ClientId::NIL, 0, GET))
                .await?;
            values.push(CounterStateMachine::decode_value(&reply.message)?);
        }
        Ok(values)
    }

    pub fn shutdown(&self) {
        for server in &self.servers {
            server.raft.shutdown();
        }
    }
}
