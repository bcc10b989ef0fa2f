//! Raft server: wires state, background tasks and the client API together.
//!
//! `Raft::open` recovers the log, the latest snapshot and the state machine;
//! `Raft::start` spawns the background tasks:
//! - election timer and election loop
//! - apply worker
//! - RPC handler loop (when an RPC receiver was provided)
//!
//! Replicators are spawned per follower whenever this server becomes leader.

use crate::apply::{apply_loop, SnapshotRequest};
use crate::config::RaftConfig;
use crate::election::election_loop;
use crate::error::{RaftError, Result};
use crate::id::{ClientId, GroupId, PeerId};
use crate::log::RaftLog;
use crate::replication::{advance_commit_index, confirm_leadership};
use crate::rpc_handler::rpc_handler_loop;
use crate::snapshot::SnapshotStore;
use crate::state::{Core, RaftState, ServerStatus, Services};
use crate::statemachine::StateMachine;
use crate::storage::{FileStorage, LogStorage, MemStorage};
use crate::transport::{RaftTransport, RpcReceiver};
use crate::types::*;
use crate::ReplicatedLog;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, timeout_at, Instant};

/// Durable collaborators of one server.
#[derive(Clone)]
pub struct RaftStorage {
    pub log: Arc<dyn LogStorage>,
    pub snapshots: Arc<SnapshotStore>,
}

impl RaftStorage {
    pub fn new(log: Arc<dyn LogStorage>, snapshots: Arc<SnapshotStore>) -> Self {
        Self { log, snapshots }
    }

    /// Volatile storage. Clones share state, so a server can be reopened on
    /// it to simulate a restart.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemStorage::new()),
            Arc::new(SnapshotStore::in_memory()),
        )
    }

    /// File-backed storage under `dir` (`log/` and `snapshots/`).
    pub async fn open_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let log = FileStorage::open(dir.join("log")).await?;
        let snapshots = SnapshotStore::open(dir.join("snapshots")).await?;
        Ok(Self::new(Arc::new(log), Arc::new(snapshots)))
    }
}

struct Background {
    rpc_rx: Option<RpcReceiver>,
    snapshot_rx: mpsc::Receiver<SnapshotRequest>,
}

/// A Raft server.
pub struct Raft {
    state: Arc<RaftState>,
    snapshot_tx: mpsc::Sender<SnapshotRequest>,
    background: parking_lot::Mutex<Option<Background>>,
}

impl Raft {
    /// Recover a server from `storage`.
    ///
    /// The state machine is initialized from the latest snapshot; committed
    /// entries after it are replayed by the apply worker once started.
    /// `initial_membership` is used only when neither the log nor a snapshot
    /// records one.
    pub async fn open(
        id: PeerId,
        config: RaftConfig,
        storage: RaftStorage,
        transport: Arc<dyn RaftTransport>,
        initial_membership: Membership,
        mut state_machine: Box<dyn StateMachine>,
        rpc_rx: Option<RpcReceiver>,
    ) -> Result<Self> {
        config.validate()?;

        let (mut log, hard) = RaftLog::open(storage.log.clone()).await?;
        let latest = storage.snapshots.latest();
        let applied = state_machine.initialize(id, config.group_id, latest.as_deref())?;

        if log.snapshot_point().index > applied.index {
            return Err(RaftError::Snapshot {
                reason: format!(
                    "log is compacted through {} but the state machine starts at {}",
                    log.snapshot_point(),
                    applied
                ),
            });
        }
        if applied.index > log.commit_index() {
            // Snapshot persisted before the log was reset to it
            log.install_snapshot(applied).await?;
        }

        let from_log = log.latest_membership(log.commit_index());
        let from_snapshot = latest
            .as_ref()
            .map(|s| (s.meta.last_included.index, s.meta.membership.clone()));
        let membership = match (from_log, from_snapshot) {
            (Some((log_index, from_log)), Some((snap_index, from_snap))) => {
                if log_index > snap_index {
                    from_log
                } else {
                    from_snap
                }
            }
            (Some((_, m)), None) | (None, Some((_, m))) => m,
            (None, None) => initial_membership,
        };

        tracing::info!(
            peer = %id,
            term = %hard.current_term,
            commit = %log.commit_index(),
            applied = %applied,
            voters = membership.len(),
            "Opened raft server"
        );

        let (snapshot_tx, snapshot_rx) = mpsc::channel(4);
        let state = Arc::new(RaftState::new(
            id,
            config,
            log,
            hard,
            membership,
            applied,
            Services {
                storage: storage.log,
                transport,
                snapshots: storage.snapshots,
                state_machine,
            },
        ));

        Ok(Self {
            state,
            snapshot_tx,
            background: parking_lot::Mutex::new(Some(Background {
                rpc_rx,
                snapshot_rx,
            })),
        })
    }

    /// Spawn the background tasks. Fails if called twice.
    pub async fn start(&self) -> Result<()> {
        self.state.check_running()?;
        let background = self
            .background
            .lock()
            .take()
            .ok_or_else(|| RaftError::InvalidRequest {
                reason: "server already started".to_string(),
            })?;
        let timeout_rx = self
            .state
            .timer
            .take_receiver()
            .ok_or_else(|| RaftError::Internal {
                reason: "election timer receiver already taken".to_string(),
            })?;

        tokio::spawn(self.state.timer.clone().run());
        tokio::spawn(election_loop(
            self.state.clone(),
            timeout_rx,
            self.state.shutdown_receiver(),
        ));
        tokio::spawn(apply_loop(
            self.state.clone(),
            background.snapshot_rx,
            self.state.shutdown_receiver(),
        ));
        if let Some(rpc_rx) = background.rpc_rx {
            tokio::spawn(rpc_handler_loop(
                self.state.clone(),
                rpc_rx,
                self.state.shutdown_receiver(),
            ));
        }

        tracing::debug!(peer = %self.state.id(), "Raft server started");
        Ok(())
    }

    /// Stop background tasks. Pending requests fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.state.shutdown();
    }

    pub fn id(&self) -> &PeerId {
        self.state.id()
    }

    pub fn group_id(&self) -> GroupId {
        self.state.group_id()
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.commit_index()
    }

    pub fn last_applied(&self) -> TermIndex {
        self.state.last_applied()
    }

    pub fn status(&self) -> ServerStatus {
        self.state.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ServerStatus> {
        self.state.subscribe_status()
    }

    /// Whether this server is leader and has applied its term's no-op.
    pub async fn is_ready_leader(&self) -> bool {
        let core = self.state.lock().await;
        core.leader.as_ref().map_or(false, |l| l.ready)
    }

    pub async fn membership(&self) -> Membership {
        self.state.lock().await.membership.clone()
    }

    /// Position of the last log entry.
    pub async fn last_log(&self) -> TermIndex {
        self.state.lock().await.log.last_term_index()
    }

    /// Position of the last compacted entry.
    pub async fn snapshot_point(&self) -> TermIndex {
        self.state.lock().await.log.snapshot_point()
    }

    /// Copy of the retained log entries.
    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.state.lock().await.log.entries().cloned().collect()
    }

    pub fn latest_snapshot(&self) -> Option<SnapshotMeta> {
        self.state.snapshots.latest_meta()
    }

    /// Snapshot the state machine at its applied position and compact the log.
    pub async fn take_snapshot(&self) -> Result<TermIndex> {
        self.state.check_running()?;
        let (tx, rx) = oneshot::channel();
        self.snapshot_tx
            .send(tx)
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Replace the voter set, adding or removing exactly one server.
    ///
    /// Returns once the configuration entry is applied on this leader. Only
    /// one change may be in flight at a time.
    pub async fn change_membership(&self, target: Membership) -> Result<LogIndex> {
        if target.is_empty() {
            return Err(RaftError::InvalidRequest {
                reason: "membership must contain at least one voter".to_string(),
            });
        }

        let applied = self.state.last_applied().index;
        let reply = self
            .propose(ClientId::NIL, 0, move |core: &Core| {
                let current = &core.membership;
                let added = target.voters().filter(|p| !current.contains(p)).count();
                let removed = current.voters().filter(|p| !target.contains(p)).count();
                if added + removed > 1 {
                    return Err(RaftError::InvalidRequest {
                        reason: format!(
                            "only one voter may change at a time ({} added, {} removed)",
                            added, removed
                        ),
                    });
                }
                let in_flight = core
                    .log
                    .latest_membership(core.log.last_index())
                    .map_or(false, |(index, _)| index > applied);
                if in_flight {
                    return Err(RaftError::InvalidRequest {
                        reason: "a membership change is already in progress".to_string(),
                    });
                }
                Ok(EntryPayload::Configuration(target))
            })
            .await?;
        Ok(reply.log_index)
    }

    /// Append an entry as leader and wait until it is applied here.
    async fn propose(
        &self,
        client_id: ClientId,
        call_id: u64,
        make_payload: impl FnOnce(&Core) -> Result<EntryPayload> + Send,
    ) -> Result<ClientReply> {
        self.state.check_running()?;
        let started = Instant::now();
        let config = self.state.config();

        let (index, reply_rx) = {
            let mut guard = self.state.lock().await;
            let core = &mut *guard;
            self.state.check_halted()?;

            let Some(leader) = core.leader.as_ref() else {
                return Err(RaftError::not_leader(core.leader_id));
            };
            if !leader.ready {
                return Err(RaftError::LeaderNotReady { term: core.term });
            }
            let pending = self.state.pending.lock().len();
            if pending >= config.max_pending_requests {
                return Err(RaftError::ResourceUnavailable {
                    pending,
                    limit: config.max_pending_requests,
                });
            }

            let payload = make_payload(core)?;
            let at = TermIndex::new(core.term, core.log.last_index().next());
            core.log
                .append_entry(LogEntry {
                    term: at.term,
                    index: at.index,
                    payload,
                    client_id,
                    call_id,
                })
                .await?;

            let reply_rx = self.state.pending.lock().register(at, client_id, call_id);
            advance_commit_index(&self.state, core).await?;
            self.state.kick_replicators();
            (at.index, reply_rx)
        };

        let remaining = config.propose_timeout.saturating_sub(started.elapsed());
        match timeout(remaining, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => {
                self.state.pending.lock().remove(index);
                Err(RaftError::Timeout {
                    operation: "submit",
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Wait until the state machine has applied `index`, at most
    /// `read_timeout` after `started`.
    async fn wait_applied(&self, index: LogIndex, started: Instant) -> Result<()> {
        let deadline = started + self.state.config().read_timeout;
        let mut applied_rx = self.state.subscribe_applied();
        loop {
            if applied_rx.borrow_and_update().index >= index {
                return Ok(());
            }
            self.state.check_running()?;
            match timeout_at(deadline, applied_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(RaftError::Shutdown),
                Err(_) => {
                    return Err(RaftError::Timeout {
                        operation: "wait_applied",
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
                }
            }
        }
    }
}

impl Drop for Raft {
    fn drop(&mut self) {
        self.state.shutdown();
    }
}

#[async_trait::async_trait]
impl ReplicatedLog for Raft {
    async fn submit(&self, request: ClientRequest) -> Result<ClientReply> {
        if request.kind != RequestKind::Write {
            return Err(RaftError::InvalidRequest {
                reason: "reads go through query".to_string(),
            });
        }
        let state = &self.state;
        self.propose(request.client_id, request.call_id, |_core: &Core| {
            state
                .state_machine
                .lock()
                .start_transaction(&request)
                .map(EntryPayload::Command)
        })
        .await
    }

    async fn query(&self, request: ClientRequest) -> Result<ClientReply> {
        self.state.check_running()?;
        match request.kind {
            RequestKind::Write => {
                return Err(RaftError::InvalidRequest {
                    reason: "writes go through submit".to_string(),
                })
            }
            RequestKind::Read => {
                self.read_index().await?;
            }
            RequestKind::StaleRead => {}
        }

        let message = self.state.state_machine.lock().query(&request.message)?;
        Ok(ClientReply {
            client_id: request.client_id,
            call_id: request.call_id,
            log_index: self.state.last_applied().index,
            message,
        })
    }

    async fn read_index(&self) -> Result<LogIndex> {
        self.state.check_running()?;
        let started = Instant::now();
        let index = confirm_leadership(&self.state).await?;
        self.wait_applied(index, started).await?;
        Ok(index)
    }

    fn is_leader(&self) -> bool {
        self.state.role() == Role::Leader
    }

    fn leader(&self) -> Option<PeerId> {
        self.state.leader()
    }

    fn subscribe_applied(&self) -> watch::Receiver<TermIndex> {
        self.state.subscribe_applied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterStateMachine, GET, INCREMENT};
    use crate::transport::InMemoryTransport;
    use std::collections::HashMap;
    use std::time::Duration;

    fn fast_config() -> RaftConfig {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(20),
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            ..RaftConfig::default()
        }
    }

    async fn open_single(id: PeerId, storage: RaftStorage) -> Raft {
        let transport = Arc::new(InMemoryTransport::new(id, HashMap::new()));
        Raft::open(
            id,
            fast_config(),
            storage,
            transport,
            Membership::new([id]),
            Box::new(CounterStateMachine::new()),
            None,
        )
        .await
        .unwrap()
    }

    async fn wait_ready(raft: &Raft) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if raft.is_ready_leader().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no ready leader");
    }

    async fn counter(raft: &Raft) -> i32 {
        let reply = raft
            .query(ClientRequest::read(ClientId::random(), 0, GET))
            .await
            .unwrap();
        CounterStateMachine::decode_value(&reply.message).unwrap()
    }

    #[tokio::test]
    async fn test_not_leader_before_start() {
        let id = PeerId::random();
        let raft = open_single(id, RaftStorage::in_memory()).await;
        assert!(!raft.is_leader());
        assert_eq!(raft.leader(), None);

        let result = raft
            .submit(ClientRequest::write(ClientId::random(), 1, INCREMENT))
            .await;
        assert!(matches!(result, Err(RaftError::NotLeader { leader: None })));
        assert!(matches!(
            raft.read_index().await,
            Err(RaftError::NotLeader { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_applied_reports_elapsed_time() {
        let raft = open_single(PeerId::random(), RaftStorage::in_memory()).await;
        let read_timeout = raft.state.config().read_timeout;

        // Leadership confirmation alone outlasted the budget
        let started = Instant::now();
        let spent = read_timeout + read_timeout / 2;
        tokio::time::advance(spent).await;

        match raft.wait_applied(LogIndex(1), started).await {
            Err(RaftError::Timeout {
                operation,
                elapsed_ms,
            }) => {
                assert_eq!(operation, "wait_applied");
                assert!(elapsed_ms >= spent.as_millis() as u64);
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let raft = open_single(PeerId::random(), RaftStorage::in_memory()).await;
        raft.start().await.unwrap();
        assert!(matches!(
            raft.start().await,
            Err(RaftError::InvalidRequest { .. })
        ));
        raft.shutdown();
        assert!(matches!(
            raft.take_snapshot().await,
            Err(RaftError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_single_node_submit_and_read() {
        let raft = open_single(PeerId::random(), RaftStorage::in_memory()).await;
        raft.start().await.unwrap();
        wait_ready(&raft).await;

        let client = ClientId::random();
        for call in 1..=3u64 {
            let reply = raft
                .submit(ClientRequest::write(client, call, INCREMENT))
                .await
                .unwrap();
            assert_eq!(reply.call_id, call);
            assert_eq!(
                CounterStateMachine::decode_value(&reply.message).unwrap(),
                call as i32
            );
        }
        assert_eq!(counter(&raft).await, 3);

        // Rejected before reaching the log
        let last = raft.last_log().await;
        let result = raft
            .submit(ClientRequest::write(client, 4, "DECREMENT"))
            .await;
        assert!(matches!(result, Err(RaftError::InvalidRequest { .. })));
        assert_eq!(raft.last_log().await, last);
    }

    #[tokio::test]
    async fn test_single_node_snapshot_compacts_log() {
        let raft = open_single(PeerId::random(), RaftStorage::in_memory()).await;
        raft.start().await.unwrap();
        wait_ready(&raft).await;

        for call in 1..=5 {
            raft.submit(ClientRequest::write(ClientId::random(), call, INCREMENT))
                .await
                .unwrap();
        }
        let at = raft.take_snapshot().await.unwrap();
        assert_eq!(at, raft.last_applied());
        assert_eq!(raft.snapshot_point().await, at);
        assert!(raft.log_entries().await.is_empty());
        assert_eq!(raft.latest_snapshot().unwrap().last_included, at);

        // Still serving after compaction
        raft.submit(ClientRequest::write(ClientId::random(), 6, INCREMENT))
            .await
            .unwrap();
        assert_eq!(counter(&raft).await, 6);
    }

    #[tokio::test]
    async fn test_restart_replays_committed_entries() {
        let id = PeerId::random();
        let storage = RaftStorage::in_memory();
        {
            let raft = open_single(id, storage.clone()).await;
            raft.start().await.unwrap();
            wait_ready(&raft).await;
            for call in 1..=3 {
                raft.submit(ClientRequest::write(ClientId::random(), call, INCREMENT))
                    .await
                    .unwrap();
            }
            raft.take_snapshot().await.unwrap();
            raft.submit(ClientRequest::write(ClientId::random(), 4, INCREMENT))
                .await
                .unwrap();
            raft.shutdown();
        }

        let raft = open_single(id, storage).await;
        let term_before = raft.current_term();
        raft.start().await.unwrap();
        wait_ready(&raft).await;

        assert!(raft.current_term() > term_before);
        assert_eq!(counter(&raft).await, 4);
    }
}
