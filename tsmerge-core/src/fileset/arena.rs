//! Live TsFile records and deferred deletion

use crate::recovery::{MergeLog, MergeLogRecord};
use crate::merge::MergeTaskState;
use crate::tsfile::TsFileMeta;
use crate::FileId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A TsFile tracked by the engine
#[derive(Debug)]
pub struct TsFileRecord {
    meta: TsFileMeta,
    readers: AtomicUsize,
    merging: AtomicBool,
    obsolete: AtomicBool,
}

impl TsFileRecord {
    pub(crate) fn new(meta: TsFileMeta) -> Self {
        Self {
            meta,
            readers: AtomicUsize::new(0),
            merging: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> FileId {
        self.meta.id
    }

    pub fn meta(&self) -> &TsFileMeta {
        &self.meta
    }

    /// Number of snapshots currently holding this file
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::Acquire)
    }

    /// Replaced by a merge output; deleted once no reader holds it
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    pub(crate) fn set_merging(&self, merging: bool) {
        self.merging.store(merging, Ordering::Release);
    }

    pub(crate) fn acquire(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the remaining reader count
    pub(crate) fn release(&self) -> usize {
        self.readers.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

struct DeferredDelete {
    file: Arc<TsFileRecord>,
    task_id: Uuid,
}

/// Owner of every live record, plus the queue of files waiting to be unlinked
pub struct FileArena {
    records: RwLock<HashMap<FileId, Arc<TsFileRecord>>>,
    delete_tx: Sender<DeferredDelete>,
    delete_rx: Receiver<DeferredDelete>,
    /// Inputs of committed tasks still on disk
    awaiting_cleanup: Mutex<HashMap<Uuid, HashSet<FileId>>>,
    log: Option<Arc<MergeLog>>,
    deleted: AtomicU64,
}

impl FileArena {
    /// Create an arena; `log` receives a `Cleaned` record once a task's inputs are gone
    pub fn new(log: Option<Arc<MergeLog>>) -> Self {
        let (delete_tx, delete_rx) = unbounded();
        Self {
            records: RwLock::new(HashMap::new()),
            delete_tx,
            delete_rx,
            awaiting_cleanup: Mutex::new(HashMap::new()),
            log,
            deleted: AtomicU64::new(0),
        }
    }

    pub(crate) fn insert(&self, meta: TsFileMeta) -> Arc<TsFileRecord> {
        let record = Arc::new(TsFileRecord::new(meta));
        self.records.write().insert(record.id(), record.clone());
        record
    }

    pub fn get(&self, id: FileId) -> Option<Arc<TsFileRecord>> {
        self.records.read().get(&id).cloned()
    }

    pub fn contains(&self, id: FileId) -> bool {
        self.records.read().contains_key(&id)
    }

    /// Number of live files
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Files waiting for their last reader
    pub fn pending_deletions(&self) -> usize {
        self.delete_rx.len()
    }

    /// Files unlinked since startup
    pub fn deleted_count(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Take the inputs of a committed task out of the live set and queue them for deletion
    pub(crate) fn retire(&self, task_id: Uuid, inputs: &[Arc<TsFileRecord>]) {
        {
            let mut records = self.records.write();
            for input in inputs {
                records.remove(&input.id());
                input.obsolete.store(true, Ordering::Release);
            }
        }
        self.awaiting_cleanup
            .lock()
            .insert(task_id, inputs.iter().map(|f| f.id()).collect());

        for input in inputs {
            let _ = self.delete_tx.send(DeferredDelete {
                file: input.clone(),
                task_id,
            });
        }
    }

    /// Unlink every queued file no reader holds any more. Returns the number unlinked.
    pub fn drain_deletions(&self) -> usize {
        let mut requeue = Vec::new();
        let mut unlinked = 0;

        while let Ok(pending) = self.delete_rx.try_recv() {
            if pending.file.readers() > 0 {
                requeue.push(pending);
                continue;
            }

            let path = &pending.file.meta().path;
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to delete merged TsFile {:?}: {}", path, e);
                    requeue.push(pending);
                    continue;
                }
            }
            debug!(file_id = pending.file.id(), ?path, "Deleted merged TsFile");
            unlinked += 1;
            self.deleted.fetch_add(1, Ordering::Relaxed);
            self.finish_cleanup(pending.task_id, pending.file.id());
        }

        for pending in requeue {
            let _ = self.delete_tx.send(pending);
        }
        unlinked
    }

    fn finish_cleanup(&self, task_id: Uuid, file_id: FileId) {
        let done = {
            let mut awaiting = self.awaiting_cleanup.lock();
            match awaiting.get_mut(&task_id) {
                Some(remaining) => {
                    remaining.remove(&file_id);
                    if remaining.is_empty() {
                        awaiting.remove(&task_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if done {
            if let Some(log) = &self.log {
                let record = MergeLogRecord::transition(task_id, MergeTaskState::Cleaned);
                if let Err(e) = log.append(&record) {
                    warn!(%task_id, "Failed to log merge cleanup: {}", e);
                }
            }
            debug!(%task_id, "Merge inputs cleaned");
        }
    }
}
