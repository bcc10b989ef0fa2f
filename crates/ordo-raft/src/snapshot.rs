//! Snapshots: creation, persistence, transfer and installation.
//!
//! A snapshot is the state machine's serialized state at some applied
//! position plus the membership in effect there. Once a snapshot is durable,
//! log entries at or below its index may be purged.
//!
//! - Creation runs on the apply worker (`take_snapshot`), either when enough
//!   entries were applied since the last snapshot or on explicit request.
//! - A leader whose follower needs a purged entry streams its latest snapshot
//!   in chunks (`send_snapshot`).
//! - A follower assembles the chunks, verifies the checksum, persists the
//!   snapshot, resets its log, and hands the snapshot to the apply worker
//!   (`RaftState::handle_install_snapshot`).
//!
//! # On-disk format
//!
//! `snapshot.<term>_<index>` holds:
//! 1. Metadata length (u64 little-endian)
//! 2. Metadata (bincode `SnapshotMeta`)
//! 3. Data (raw bytes, CRC32C recorded in the metadata)

use crate::error::{RaftError, Result};
use crate::replication::{advance_commit_index, ReplicationStep};
use crate::state::{InstallBuffer, RaftState};
use crate::storage::file::write_atomic;
use crate::types::*;
use crate::id::PeerId;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{timeout, Instant};

const FILE_PREFIX: &str = "snapshot.";

/// Complete snapshot (metadata + data).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Bytes,
}

impl Snapshot {
    /// Create a snapshot covering `last_included`.
    pub fn new(last_included: TermIndex, membership: Membership, data: Bytes) -> Self {
        Self {
            meta: SnapshotMeta {
                last_included,
                membership,
                checksum: crc32c::crc32c(&data),
                size_bytes: data.len() as u64,
            },
            data,
        }
    }

    /// Reassemble a transferred snapshot, checking it against its metadata.
    pub fn from_parts(meta: SnapshotMeta, data: Bytes) -> Result<Self> {
        let snapshot = Self { meta, data };
        snapshot.verify()?;
        Ok(snapshot)
    }

    pub fn last_included(&self) -> TermIndex {
        self.meta.last_included
    }

    /// Check size and checksum.
    pub fn verify(&self) -> Result<()> {
        if self.data.len() as u64 != self.meta.size_bytes {
            return Err(RaftError::Corruption {
                reason: format!(
                    "snapshot {} has {} bytes, metadata says {}",
                    self.meta.last_included,
                    self.data.len(),
                    self.meta.size_bytes
                ),
            });
        }
        let actual = crc32c::crc32c(&self.data);
        if actual != self.meta.checksum {
            return Err(RaftError::Corruption {
                reason: format!(
                    "snapshot {} checksum mismatch: expected {:#x}, got {:#x}",
                    self.meta.last_included, self.meta.checksum, actual
                ),
            });
        }
        Ok(())
    }

    /// Serialize to writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let meta_bytes = bincode::serialize(&self.meta)?;
        writer.write_all(&(meta_bytes.len() as u64).to_le_bytes())?;
        writer.write_all(&meta_bytes)?;
        writer.write_all(&self.data)?;
        Ok(())
    }

    /// Deserialize from reader and verify.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut len_buf = [0u8; 8];
        reader.read_exact(&mut len_buf)?;
        let meta_len = u64::from_le_bytes(len_buf) as usize;

        let mut meta_bytes = vec![0u8; meta_len];
        reader.read_exact(&mut meta_bytes)?;
        let meta: SnapshotMeta = bincode::deserialize(&meta_bytes)?;

        let mut data = Vec::with_capacity(meta.size_bytes as usize);
        reader.read_to_end(&mut data)?;

        Self::from_parts(meta, Bytes::from(data))
    }

    fn file_name(&self) -> String {
        file_name(self.meta.last_included)
    }
}

fn file_name(at: TermIndex) -> String {
    format!("{}{}_{}", FILE_PREFIX, at.term.as_u64(), at.index.as_u64())
}

fn parse_file_name(name: &str) -> Option<TermIndex> {
    let rest = name.strip_prefix(FILE_PREFIX)?;
    let (term, index) = rest.split_once('_')?;
    Some(TermIndex::new(
        Term(term.parse().ok()?),
        LogIndex(index.parse().ok()?),
    ))
}

/// Holds the latest snapshot, in memory or in a directory.
///
/// Saving a newer snapshot supersedes the previous one. Readers hold an
/// `Arc<Snapshot>`, so a transfer in progress keeps its snapshot alive even
/// after it is superseded and its file removed.
pub struct SnapshotStore {
    dir: Option<PathBuf>,
    latest: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotStore {
    /// Store that keeps snapshots in memory only.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            latest: RwLock::new(None),
        }
    }

    /// Open a directory-backed store, loading the newest valid snapshot.
    ///
    /// Corrupt, older and temporary files are removed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut found = Vec::new();
        let mut stale = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(dirent) = read_dir.next_entry().await? {
            let name = dirent.file_name().to_string_lossy().into_owned();
            match parse_file_name(&name) {
                Some(at) => found.push((at, dirent.path())),
                None if name.ends_with(".tmp") => stale.push(dirent.path()),
                None => {}
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));

        let mut latest = None;
        for (at, path) in found {
            if latest.is_some() {
                stale.push(path);
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match Snapshot::read_from(&mut bytes.as_slice()) {
                Ok(snapshot) if snapshot.meta.last_included == at => {
                    latest = Some(Arc::new(snapshot));
                }
                Ok(_) | Err(_) => {
                    tracing::warn!(path = %path.display(), "Discarding unreadable snapshot");
                    stale.push(path);
                }
            }
        }

        for path in stale {
            let _ = tokio::fs::remove_file(&path).await;
        }

        if let Some(snapshot) = &latest {
            tracing::info!(
                dir = %dir.display(),
                last_included = %snapshot.meta.last_included,
                size = snapshot.meta.size_bytes,
                "Loaded snapshot"
            );
        }

        Ok(Self {
            dir: Some(dir),
            latest: RwLock::new(latest),
        })
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.latest.read().clone()
    }

    pub fn latest_meta(&self) -> Option<SnapshotMeta> {
        self.latest.read().as_ref().map(|s| s.meta.clone())
    }

    /// Position covered by the latest snapshot (`TermIndex::ZERO` if none).
    pub fn latest_point(&self) -> TermIndex {
        self.latest
            .read()
            .as_ref()
            .map(|s| s.meta.last_included)
            .unwrap_or(TermIndex::ZERO)
    }

    /// Persist `snapshot` and mark it latest.
    ///
    /// A snapshot no newer than the current latest is ignored and the current
    /// latest is returned.
    pub async fn save(&self, snapshot: Snapshot) -> Result<Arc<Snapshot>> {
        if let Some(current) = self.latest() {
            if current.meta.last_included >= snapshot.meta.last_included {
                return Ok(current);
            }
        }

        if let Some(dir) = &self.dir {
            let mut buf = Vec::with_capacity(snapshot.data.len() + 64);
            snapshot.write_to(&mut buf)?;
            write_atomic(&dir.join(snapshot.file_name()), &buf).await?;
        }

        let snapshot = Arc::new(snapshot);
        let previous = self.latest.write().replace(snapshot.clone());

        if let (Some(dir), Some(previous)) = (&self.dir, previous) {
            let _ = tokio::fs::remove_file(dir.join(previous.file_name())).await;
        }

        Ok(snapshot)
    }
}

/// Snapshot the state machine at `applied` and purge the covered log prefix.
///
/// Runs on the apply worker, so `applied` is exactly the state the state
/// machine is in.
pub(crate) async fn take_snapshot(state: &RaftState, applied: TermIndex) -> Result<TermIndex> {
    if applied.index == LogIndex::ZERO {
        return Err(RaftError::Snapshot {
            reason: "nothing applied yet".to_string(),
        });
    }

    let latest = state.snapshots.latest_point();
    if latest >= applied {
        return Ok(latest);
    }

    let data = state
        .state_machine
        .lock()
        .take_snapshot()
        .map_err(|e| RaftError::Snapshot {
            reason: format!("state machine snapshot at {} failed: {}", applied, e),
        })?;
    let membership = state.lock().await.membership.clone();

    let snapshot = state
        .snapshots
        .save(Snapshot::new(applied, membership, data))
        .await?;

    let purged = {
        let mut core = state.lock().await;
        core.log
            .purge_up_to(applied.index, applied.index, applied.index)
            .await?
    };

    tracing::info!(
        last_included = %applied,
        size = snapshot.meta.size_bytes,
        purged,
        "Took snapshot"
    );
    Ok(applied)
}

/// Stream the latest snapshot to `peer`.
///
/// Called by the peer's replicator when the entries it needs were purged.
pub(crate) async fn send_snapshot(
    state: &Arc<RaftState>,
    peer: &PeerId,
    epoch: u64,
) -> Result<ReplicationStep> {
    let snapshot = state.snapshots.latest().ok_or_else(|| RaftError::Snapshot {
        reason: "log is compacted but no snapshot is available".to_string(),
    })?;

    let term = {
        let core = state.lock().await;
        if core.epoch != epoch {
            return Ok(ReplicationStep::Stale);
        }
        core.term
    };

    let config = state.config();
    let total = snapshot.data.len();
    let mut offset = 0usize;

    tracing::info!(
        peer = %peer,
        last_included = %snapshot.meta.last_included,
        size = total,
        "Sending snapshot"
    );

    loop {
        let end = (offset + config.snapshot_chunk_size).min(total);
        let done = end == total;
        let request = InstallSnapshotRequest {
            term,
            leader_id: *state.id(),
            meta: snapshot.meta.clone(),
            offset: offset as u64,
            data: snapshot.data.slice(offset..end),
            done,
        };

        let started = Instant::now();
        let response = match timeout(
            config.rpc_timeout,
            state.transport().install_snapshot(peer, request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(RaftError::Timeout {
                    operation: "install_snapshot",
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        };

        let mut guard = state.lock().await;
        let core = &mut *guard;
        if response.term > core.term {
            state.step_down(core, response.term, None).await?;
            return Ok(ReplicationStep::Stale);
        }
        if core.epoch != epoch {
            return Ok(ReplicationStep::Stale);
        }

        if done && response.installed {
            let covered = snapshot.meta.last_included.index;
            if let Some(progress) = core
                .leader
                .as_mut()
                .and_then(|leader| leader.progress.get_mut(peer))
            {
                progress.match_index = progress.match_index.max(covered);
                progress.next_index = progress.match_index.next();
                progress.last_ack = Some(Instant::now());
            }
            advance_commit_index(state, core).await?;
            state.notify_ack();
            tracing::info!(peer = %peer, last_included = %snapshot.meta.last_included, "Snapshot installed on follower");
            return Ok(ReplicationStep::Continue);
        }

        if response.bytes_stored != end as u64 {
            return Err(RaftError::Snapshot {
                reason: format!(
                    "follower {} expects offset {}, sent up to {}",
                    peer, response.bytes_stored, end
                ),
            });
        }
        offset = end;
    }
}

impl RaftState {
    /// Handle one InstallSnapshot chunk.
    ///
    /// Chunks must arrive in order; a chunk at offset 0 restarts assembly.
    /// After the final chunk the snapshot is verified, persisted, the log is
    /// reset to its position and the apply worker is told to load it.
    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut guard = self.lock().await;
        let core = &mut *guard;

        if request.term < core.term {
            return Ok(InstallSnapshotResponse {
                term: core.term,
                bytes_stored: 0,
                installed: false,
            });
        }

        if request.term > core.term || core.role != Role::Follower {
            self.step_down(core, request.term, Some(request.leader_id))
                .await?;
        } else if core.leader_id != Some(request.leader_id) {
            core.leader_id = Some(request.leader_id);
            self.publish_status(core);
        }

        let point = request.meta.last_included;
        if point.index <= core.log.commit_index() {
            // Already have everything the snapshot covers
            core.install = None;
            return Ok(InstallSnapshotResponse {
                term: core.term,
                bytes_stored: request.offset + request.data.len() as u64,
                installed: true,
            });
        }

        if request.offset == 0 {
            core.install = Some(InstallBuffer {
                meta: request.meta.clone(),
                data: BytesMut::with_capacity(request.meta.size_bytes as usize),
            });
        }

        let stored = match core.install.as_mut() {
            Some(buf) if buf.meta == request.meta && buf.data.len() as u64 == request.offset => {
                buf.data.extend_from_slice(&request.data);
                buf.data.len() as u64
            }
            other => {
                // Out of order: tell the leader where we are
                let stored = other
                    .filter(|buf| buf.meta == request.meta)
                    .map(|buf| buf.data.len() as u64)
                    .unwrap_or(0);
                return Ok(InstallSnapshotResponse {
                    term: core.term,
                    bytes_stored: stored,
                    installed: false,
                });
            }
        };

        if !request.done {
            return Ok(InstallSnapshotResponse {
                term: core.term,
                bytes_stored: stored,
                installed: false,
            });
        }

        let buffer = match core.install.take() {
            Some(buffer) => buffer,
            None => {
                return Err(RaftError::Internal {
                    reason: "snapshot buffer vanished".to_string(),
                })
            }
        };
        let snapshot = match Snapshot::from_parts(buffer.meta, buffer.data.freeze()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting transferred snapshot");
                return Ok(InstallSnapshotResponse {
                    term: core.term,
                    bytes_stored: 0,
                    installed: false,
                });
            }
        };

        let membership = snapshot.meta.membership.clone();
        self.snapshots.save(snapshot).await?;
        core.log.install_snapshot(point).await?;
        core.membership = membership;
        core.pending_install = Some(point);
        self.persist_hard_state(core).await?;
        self.publish_commit(core.log.commit_index());

        tracing::info!(
            term = %core.term,
            last_included = %point,
            "Installed snapshot from leader"
        );

        Ok(InstallSnapshotResponse {
            term: core.term,
            bytes_stored: stored,
            installed: true,
        })
    }
}
