//! In-process test cluster with partition, heal and restart.

#![allow(dead_code)]

use bytes::Bytes;
use ordo_raft::counter::{CounterStateMachine, GET, INCREMENT};
use ordo_raft::{
    ClientId, ClientReply, ClientRequest, GroupId, InMemoryTransport, LogIndex, Membership,
    PeerId, Raft, RaftConfig, RaftError, RaftStorage, ReplicatedLog, Result, RpcReceiver,
    RpcSender, Snapshot, StateMachine, Term, TermIndex,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn test_config() -> RaftConfig {
    RaftConfig {
        group_id: GroupId::random(),
        heartbeat_interval: Duration::from_millis(50),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        rpc_timeout: Duration::from_millis(100),
        ..RaftConfig::default()
    }
}

/// Counter whose `apply_transaction` starts failing once `fail` is set.
pub struct FaultyCounter {
    inner: CounterStateMachine,
    fail: Arc<AtomicBool>,
}

impl StateMachine for FaultyCounter {
    fn initialize(
        &mut self,
        server_id: PeerId,
        group_id: GroupId,
        latest: Option<&Snapshot>,
    ) -> Result<TermIndex> {
        self.inner.initialize(server_id, group_id, latest)
    }

    fn reinitialize(&mut self, latest: Option<&Snapshot>) -> Result<TermIndex> {
        self.inner.reinitialize(latest)
    }

    fn start_transaction(&self, request: &ClientRequest) -> Result<Bytes> {
        self.inner.start_transaction(request)
    }

    fn apply_transaction(&mut self, at: TermIndex, command: &Bytes) -> Result<Bytes> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RaftError::Internal {
                reason: format!("disk full while applying {}", at),
            });
        }
        self.inner.apply_transaction(at, command)
    }

    fn query(&self, request: &Bytes) -> Result<Bytes> {
        self.inner.query(request)
    }

    fn take_snapshot(&self) -> Result<Bytes> {
        self.inner.take_snapshot()
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.inner.load(snapshot)
    }

    fn last_applied(&self) -> TermIndex {
        self.inner.last_applied()
    }
}

pub struct TestNode {
    pub id: PeerId,
    pub raft: Arc<Raft>,
    pub storage: RaftStorage,
    pub fail_apply: Arc<AtomicBool>,
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub transports: HashMap<PeerId, Arc<InMemoryTransport>>,
    pub rpc_senders: HashMap<PeerId, RpcSender>,
    pub config: RaftConfig,
}

impl TestCluster {
    pub async fn new(size: usize) -> Self {
        Self::with_config(size, test_config()).await
    }

    /// Fully connected, started cluster of `size` voters on in-memory storage.
    pub async fn with_config(size: usize, config: RaftConfig) -> Self {
        let ids: Vec<PeerId> = (0..size).map(|_| PeerId::random()).collect();
        let membership = Membership::new(ids.iter().copied());

        let mut cluster = TestCluster {
            nodes: Vec::new(),
            transports: HashMap::new(),
            rpc_senders: HashMap::new(),
            config,
        };

        let mut receivers = HashMap::new();
        for id in &ids {
            let (tx, rx) = mpsc::channel(256);
            cluster.rpc_senders.insert(*id, tx);
            receivers.insert(*id, rx);
        }
        for id in &ids {
            let transport = Arc::new(InMemoryTransport::new(*id, HashMap::new()));
            cluster.transports.insert(*id, transport);
        }
        for id in &ids {
            cluster.connect(id);
        }

        for id in &ids {
            let storage = RaftStorage::in_memory();
            let rpc_rx = receivers.remove(id);
            let fail_apply = Arc::new(AtomicBool::new(false));
            let raft = cluster
                .open_node(
                    *id,
                    storage.clone(),
                    membership.clone(),
                    rpc_rx,
                    fail_apply.clone(),
                )
                .await;
            cluster.nodes.push(TestNode {
                id: *id,
                raft,
                storage,
                fail_apply,
            });
        }

        for node in &cluster.nodes {
            node.raft.start().await.unwrap();
        }
        cluster
    }

    async fn open_node(
        &self,
        id: PeerId,
        storage: RaftStorage,
        membership: Membership,
        rpc_rx: Option<RpcReceiver>,
        fail_apply: Arc<AtomicBool>,
    ) -> Arc<Raft> {
        let transport = self.transports[&id].clone();
        let raft = Raft::open(
            id,
            self.config.clone(),
            storage,
            transport,
            membership,
            Box::new(FaultyCounter {
                inner: CounterStateMachine::new(),
                fail: fail_apply,
            }),
            rpc_rx,
        )
        .await
        .unwrap();
        Arc::new(raft)
    }

    /// Add and start a server that is not yet a voter.
    pub async fn add_node(&mut self, known: Membership) -> usize {
        let id = PeerId::random();
        let (tx, rx) = mpsc::channel(256);
        self.rpc_senders.insert(id, tx);
        self.transports
            .insert(id, Arc::new(InMemoryTransport::new(id, HashMap::new())));
        self.connect(&id);

        let storage = RaftStorage::in_memory();
        let fail_apply = Arc::new(AtomicBool::new(false));
        let raft = self
            .open_node(id, storage.clone(), known, Some(rx), fail_apply.clone())
            .await;
        raft.start().await.unwrap();
        self.nodes.push(TestNode {
            id,
            raft,
            storage,
            fail_apply,
        });
        self.nodes.len() - 1
    }

    fn connect(&self, id: &PeerId) {
        for (peer, transport) in &self.transports {
            if peer == id {
                continue;
            }
            transport.add_peer(*id, self.rpc_senders[id].clone());
            self.transports[id].add_peer(*peer, self.rpc_senders[peer].clone());
        }
    }

    /// Cut every link of node `i`.
    pub fn partition(&self, i: usize) {
        let id = self.nodes[i].id;
        for (peer, transport) in &self.transports {
            if *peer != id {
                transport.remove_peer(&id);
                self.transports[&id].remove_peer(peer);
            }
        }
    }

    /// Reconnect node `i` to everyone.
    pub fn heal(&self, i: usize) {
        self.connect(&self.nodes[i].id);
    }

    /// Crash node `i` and start it again on the same storage.
    pub async fn restart(&mut self, i: usize) {
        let id = self.nodes[i].id;
        self.nodes[i].raft.shutdown();

        let (tx, rx) = mpsc::channel(256);
        self.rpc_senders.insert(id, tx);
        self.connect(&id);

        let storage = self.nodes[i].storage.clone();
        let membership = self.nodes[i].raft.membership().await;
        let fail_apply = Arc::new(AtomicBool::new(false));
        let raft = self
            .open_node(id, storage, membership, Some(rx), fail_apply.clone())
            .await;
        raft.start().await.unwrap();
        self.nodes[i].raft = raft;
        self.nodes[i].fail_apply = fail_apply;
    }

    /// Make every later command applied on node `i` fail.
    pub fn fail_state_machine(&self, i: usize) {
        self.nodes[i].fail_apply.store(true, Ordering::SeqCst);
    }

    pub fn raft(&self, i: usize) -> &Arc<Raft> {
        &self.nodes[i].raft
    }

    pub fn index_of(&self, id: &PeerId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == *id)
    }

    /// Wait until one of `candidates` is a leader that can serve clients.
    pub async fn wait_for_leader_among(
        &self,
        candidates: &[usize],
        timeout: Duration,
    ) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            for &i in candidates {
                if self.nodes[i].raft.is_ready_leader().await {
                    return Some(i);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<usize> {
        let all: Vec<usize> = (0..self.nodes.len()).collect();
        self.wait_for_leader_among(&all, timeout).await
    }

    /// (node, term) of every server that believes it leads.
    pub fn leaders(&self) -> Vec<(usize, Term)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.raft.is_leader())
            .map(|(i, n)| (i, n.raft.current_term()))
            .collect()
    }

    /// Submit an INCREMENT through whoever leads, retrying transient errors.
    pub async fn increment(&self, client: ClientId, call_id: u64) -> Result<ClientReply> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let leader = self.wait_for_leader(Duration::from_secs(5)).await;
            let result = match leader {
                Some(i) => {
                    self.nodes[i]
                        .raft
                        .submit(ClientRequest::write(client, call_id, INCREMENT))
                        .await
                }
                None => Err(RaftError::NotLeader { leader: None }),
            };
            match result {
                Err(e) if e.is_retriable() && Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                other => return other,
            }
        }
    }

    /// Counter value on node `i` without leadership checks.
    pub async fn counter_on(&self, i: usize) -> i32 {
        let reply = self.nodes[i]
            .raft
            .query(ClientRequest::stale_read(ClientId::random(), 0, GET))
            .await
            .unwrap();
        CounterStateMachine::decode_value(&reply.message).unwrap()
    }

    /// Wait until node `i` has applied `index`.
    pub async fn wait_applied(&self, i: usize, index: LogIndex, timeout: Duration) -> bool {
        let mut applied = self.nodes[i].raft.subscribe_applied();
        let deadline = Instant::now() + timeout;
        loop {
            if applied.borrow_and_update().index >= index {
                return true;
            }
            match tokio::time::timeout_at(deadline, applied.changed()).await {
                Ok(Ok(())) => {}
                _ => return false,
            }
        }
    }

    /// Wait until every listed node has applied `index`.
    pub async fn wait_all_applied(&self, nodes: &[usize], index: LogIndex) {
        for &i in nodes {
            assert!(
                self.wait_applied(i, index, Duration::from_secs(10)).await,
                "node {} did not apply {}",
                i,
                index
            );
        }
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.raft.shutdown();
        }
    }
}
