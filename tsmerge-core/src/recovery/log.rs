//! Merge log: one durable record per merge task transition
//!
//! Record format:
//! - 4 bytes: payload length
//! - N bytes: bincode [`MergeLogRecord`]
//! - 4 bytes: CRC32 of the payload

use crate::merge::{MergeKind, MergeTaskState};
use crate::{MergeError, PartitionId, Result, StorageGroup};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Name of the merge log inside the data directory
pub const MERGE_LOG_FILE: &str = "merge.log";

/// Everything recovery needs to finish or undo a task without the in-memory state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub storage_group: StorageGroup,
    pub partition: PartitionId,
    pub kind: MergeKind,
    pub inputs: Vec<PathBuf>,
    /// Final (published) path of the output file
    pub output: PathBuf,
    /// Temporary path the output is written to
    pub output_tmp: PathBuf,
    pub output_level: u32,
    pub target_sequence: bool,
}

/// One task transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeLogRecord {
    pub task_id: Uuid,
    pub state: MergeTaskState,
    pub at: DateTime<Utc>,
    /// Present on the `Selected` record only
    pub descriptor: Option<TaskDescriptor>,
}

impl MergeLogRecord {
    pub fn selected(task_id: Uuid, descriptor: TaskDescriptor) -> Self {
        Self {
            task_id,
            state: MergeTaskState::Selected,
            at: Utc::now(),
            descriptor: Some(descriptor),
        }
    }

    pub fn transition(task_id: Uuid, state: MergeTaskState) -> Self {
        Self {
            task_id,
            state,
            at: Utc::now(),
            descriptor: None,
        }
    }

    /// Serialize the record with length prefix and CRC checksum
    pub fn serialize_with_checksum(&self) -> Result<Bytes> {
        let payload = bincode::serialize(self)?;

        let mut buf = BytesMut::with_capacity(payload.len() + 8);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        buf.put_u32_le(crc32fast::hash(&payload));
        Ok(buf.freeze())
    }

    /// Deserialize one record, returning it and the bytes consumed
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(MergeError::InvalidFormat("Record too short".into()));
        }
        let len = (&data[..4]).get_u32_le() as usize;
        if data.len() < 4 + len + 4 {
            return Err(MergeError::InvalidFormat("Incomplete record".into()));
        }

        let payload = &data[4..4 + len];
        let expected = (&data[4 + len..4 + len + 4]).get_u32_le();
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(MergeError::ChecksumMismatch { expected, actual });
        }

        Ok((bincode::deserialize(payload)?, 4 + len + 4))
    }
}

/// Append-only, fsynced merge log.
///
/// The log is truncated as soon as the last task it tracks reaches `Cleaned`
/// or `Failed`, so it only ever holds the records of unfinished tasks.
pub struct MergeLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

struct LogState {
    file: BufWriter<File>,
    /// Tasks whose last record is neither `Cleaned` nor `Failed`
    active: HashSet<Uuid>,
}

impl MergeLog {
    /// Open (or create) the merge log at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = Self::open_append(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(LogState {
                file: BufWriter::new(file),
                active: HashSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of tasks appended since the last truncation that have not finished
    pub fn active_tasks(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Durably append a record
    pub fn append(&self, record: &MergeLogRecord) -> Result<()> {
        let serialized = record.serialize_with_checksum()?;
        let mut state = self.state.lock();
        state.file.write_all(&serialized)?;
        state.file.flush()?;
        state.file.get_ref().sync_data()?;

        let finished = match record.state {
            MergeTaskState::Cleaned | MergeTaskState::Failed => {
                state.active.remove(&record.task_id)
            }
            _ => {
                state.active.insert(record.task_id);
                false
            }
        };
        if finished && state.active.is_empty() {
            self.truncate(&mut state)?;
            debug!(task_id = %record.task_id, "Merge log truncated");
        }
        Ok(())
    }

    /// Drop every record
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.active.clear();
        self.truncate(&mut state)
    }

    fn truncate(&self, state: &mut LogState) -> Result<()> {
        state.file.flush()?;
        state.file.get_ref().set_len(0)?;
        state.file.get_ref().sync_all()?;
        state.file = BufWriter::new(Self::open_append(&self.path)?);
        Ok(())
    }

    /// Read every intact record of the log at `path`.
    ///
    /// A torn or corrupt tail (crash during append) ends the replay.
    pub fn replay(path: &Path) -> Result<Vec<MergeLogRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let mut records = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            match MergeLogRecord::deserialize_with_checksum(&data[offset..]) {
                Ok((record, consumed)) => {
                    records.push(record);
                    offset += consumed;
                }
                Err(MergeError::ChecksumMismatch { .. }) | Err(MergeError::Decode(_)) => {
                    warn!(
                        "Corrupt merge log record at offset {} in {:?}, truncating",
                        offset, path
                    );
                    break;
                }
                Err(MergeError::InvalidFormat(_)) => {
                    // Incomplete record at end (crash during write)
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(records)
    }

    fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(MergeError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor {
            storage_group: "root.sg".into(),
            partition: 0,
            kind: MergeKind::Inner {
                level: 0,
                sequence: true,
            },
            inputs: vec![PathBuf::from("a.tsfile"), PathBuf::from("b.tsfile")],
            output: PathBuf::from("c.tsfile"),
            output_tmp: PathBuf::from("c.tsfile.tmp"),
            output_level: 1,
            target_sequence: true,
        }
    }

    #[test]
    fn test_append_and_replay() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MERGE_LOG_FILE);
        let task_id = Uuid::new_v4();

        {
            let log = MergeLog::open(&path).unwrap();
            log.append(&MergeLogRecord::selected(task_id, descriptor()))
                .unwrap();
            log.append(&MergeLogRecord::transition(task_id, MergeTaskState::Running))
                .unwrap();
        }

        let records = MergeLog::replay(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].descriptor, Some(descriptor()));
        assert_eq!(records[1].state, MergeTaskState::Running);
        assert_eq!(records[1].task_id, task_id);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MERGE_LOG_FILE);
        let task_id = Uuid::new_v4();

        let log = MergeLog::open(&path).unwrap();
        log.append(&MergeLogRecord::selected(task_id, descriptor()))
            .unwrap();
        drop(log);

        let partial = MergeLogRecord::transition(task_id, MergeTaskState::Committed)
            .serialize_with_checksum()
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() - 3]).unwrap();

        let records = MergeLog::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, MergeTaskState::Selected);
    }

    #[test]
    fn test_reset_clears_log() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MERGE_LOG_FILE);
        let log = MergeLog::open(&path).unwrap();
        let task_id = Uuid::new_v4();

        log.append(&MergeLogRecord::selected(task_id, descriptor()))
            .unwrap();
        log.reset().unwrap();
        assert!(MergeLog::replay(&path).unwrap().is_empty());

        log.append(&MergeLogRecord::transition(task_id, MergeTaskState::Cleaned))
            .unwrap();
        assert_eq!(MergeLog::replay(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_log_truncated_after_last_task_finishes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MERGE_LOG_FILE);
        let log = MergeLog::open(&path).unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        for state in [MergeTaskState::Running, MergeTaskState::Committed] {
            log.append(&MergeLogRecord::transition(first, state)).unwrap();
        }
        log.append(&MergeLogRecord::selected(second, descriptor()))
            .unwrap();
        assert_eq!(log.active_tasks(), 2);

        log.append(&MergeLogRecord::transition(first, MergeTaskState::Cleaned))
            .unwrap();
        assert_eq!(MergeLog::replay(&path).unwrap().len(), 4);

        log.append(&MergeLogRecord::transition(second, MergeTaskState::Failed))
            .unwrap();
        assert_eq!(log.active_tasks(), 0);
        assert!(MergeLog::replay(&path).unwrap().is_empty());

        // Appends keep working after truncation
        log.append(&MergeLogRecord::transition(second, MergeTaskState::Running))
            .unwrap();
        assert_eq!(MergeLog::replay(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_checksum_validation() {
        let record = MergeLogRecord::transition(Uuid::new_v4(), MergeTaskState::Running);
        let mut serialized = record.serialize_with_checksum().unwrap().to_vec();
        serialized[6] ^= 0xFF;

        let result = MergeLogRecord::deserialize_with_checksum(&serialized);
        assert!(matches!(result, Err(MergeError::ChecksumMismatch { .. })));
    }
}
