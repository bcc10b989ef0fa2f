//! File-backed `LogStorage`.
//!
//! Directory layout:
//! - `log.dat`: append-only sequence of checksummed records, one per entry
//! - `log.start`: bincode `TermIndex` of the last purged position
//! - `hard_state`: bincode `HardState`
//!
//! Small files are replaced atomically (write tmp, fsync, rename). Every append
//! is fsynced before returning. On load, a torn or corrupt tail (crash during
//! append) is truncated away; everything before it is kept.

use super::record::{decode_record, encode_record, RecordError};
use super::{HardState, LoadedLog, LogStorage};
use crate::error::{RaftError, Result};
use crate::types::{LogEntry, LogIndex, TermIndex};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const LOG_FILE: &str = "log.dat";
const START_FILE: &str = "log.start";
const HARD_STATE_FILE: &str = "hard_state";

/// Log storage in a single directory.
pub struct FileStorage {
    dir: PathBuf,
    inner: Mutex<FileInner>,
}

struct FileInner {
    file: File,
    /// Byte offset of each retained entry
    offsets: BTreeMap<LogIndex, u64>,
    /// Valid length of the log file
    len: u64,
}

impl FileStorage {
    /// Open (or create) storage in `dir`.
    ///
    /// `load` must be called before any mutation; it performs recovery.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let file = open_log(&dir.join(LOG_FILE)).await?;

        Ok(Self {
            dir,
            inner: Mutex::new(FileInner {
                file,
                offsets: BTreeMap::new(),
                len: 0,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_start(&self) -> Result<TermIndex> {
        match tokio::fs::read(self.dir.join(START_FILE)).await {
            Ok(bytes) => Ok(bincode::deserialize(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TermIndex::ZERO),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_hard_state(&self) -> Result<HardState> {
        match tokio::fs::read(self.dir.join(HARD_STATE_FILE)).await {
            Ok(bytes) => Ok(bincode::deserialize(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HardState::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LogStorage for FileStorage {
    async fn load(&self) -> Result<LoadedLog> {
        let hard_state = self.read_hard_state().await?;
        let snapshot_point = self.read_start().await?;

        let mut inner = self.inner.lock().await;
        let data = tokio::fs::read(self.dir.join(LOG_FILE)).await?;

        let mut entries = Vec::new();
        let mut offsets = BTreeMap::new();
        let mut offset = 0usize;

        while offset < data.len() {
            let (payload, used) = match decode_record(&data[offset..]) {
                Ok(decoded) => decoded,
                Err(RecordError::Incomplete)
                | Err(RecordError::CrcMismatch { .. })
                | Err(RecordError::Corrupt(_)) => {
                    tracing::warn!(
                        dir = %self.dir.display(),
                        offset,
                        discarded = data.len() - offset,
                        "Truncating torn tail of raft log"
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            let entry: LogEntry = bincode::deserialize(&payload)?;
            if entry.index > snapshot_point.index {
                let expected = entries
                    .last()
                    .map(|e: &LogEntry| e.index.next())
                    .unwrap_or_else(|| snapshot_point.index.next());
                if entry.index != expected {
                    return Err(RaftError::Corruption {
                        reason: format!(
                            "log gap in {}: expected {}, found {}",
                            self.dir.display(),
                            expected,
                            entry.index
                        ),
                    });
                }
                offsets.insert(entry.index, offset as u64);
                entries.push(entry);
            }
            offset += used;
        }

        if offset < data.len() {
            inner.file.set_len(offset as u64).await?;
            inner.file.sync_all().await?;
        }

        inner.offsets = offsets;
        inner.len = offset as u64;

        tracing::debug!(
            dir = %self.dir.display(),
            entries = entries.len(),
            start = %snapshot_point,
            term = %hard_state.current_term,
            "Loaded raft log"
        );

        Ok(LoadedLog {
            hard_state,
            snapshot_point,
            entries,
        })
    }

    async fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        let mut buf = BytesMut::new();
        let mut new_offsets = Vec::with_capacity(entries.len());

        for entry in entries {
            new_offsets.push((entry.index, inner.len + buf.len() as u64));
            let payload = bincode::serialize(entry)?;
            encode_record(&payload, &mut buf);
        }

        inner.file.write_all(&buf).await?;
        inner.file.sync_data().await?;

        inner.len += buf.len() as u64;
        inner.offsets.extend(new_offsets);
        Ok(())
    }

    async fn truncate_suffix(&self, from: LogIndex) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let cut = match inner.offsets.range(from..).next() {
            Some((_, &offset)) => offset,
            None => return Ok(()),
        };

        inner.file.set_len(cut).await?;
        inner.file.sync_all().await?;
        inner.offsets.split_off(&from);
        inner.len = cut;
        Ok(())
    }

    async fn purge_prefix(&self, point: TermIndex) -> Result<()> {
        // Record the new start first: a crash before the rewrite below leaves
        // stale entries <= point in log.dat, which load skips.
        write_atomic(&self.dir.join(START_FILE), &bincode::serialize(&point)?).await?;

        let mut inner = self.inner.lock().await;
        let log_path = self.dir.join(LOG_FILE);
        let keep_from = inner
            .offsets
            .range(point.index.next()..)
            .next()
            .map(|(_, &offset)| offset);

        let data = tokio::fs::read(&log_path).await?;
        let retained: &[u8] = match keep_from {
            Some(offset) => &data[offset as usize..inner.len as usize],
            None => &[],
        };
        write_atomic(&log_path, retained).await?;

        let base = keep_from.unwrap_or(inner.len);
        let kept = inner.offsets.split_off(&point.index.next());
        inner.offsets = kept.into_iter().map(|(i, o)| (i, o - base)).collect();
        inner.len = retained.len() as u64;
        inner.file = open_log(&log_path).await?;
        Ok(())
    }

    async fn save_hard_state(&self, state: &HardState) -> Result<()> {
        write_atomic(&self.dir.join(HARD_STATE_FILE), &bincode::serialize(state)?).await
    }
}

async fn open_log(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

/// Replace `path` with `bytes` so that readers see either the old or the new
/// contents, never a mix.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut file = File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;

    if let Some(parent) = path.parent() {
        // Directory fsync is not supported everywhere; the rename is already done.
        if let Ok(dir) = File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
    Ok(())
}
