//! Read snapshots of a partition's file set

use super::{FileArena, TsFileRecord};
use crate::{PartitionId, StorageGroup};
use std::sync::Arc;

/// Files visible to a query at the moment it started.
///
/// Holding a snapshot keeps every file in it on disk; dropping it releases
/// them and unlinks any that a merge has since replaced.
pub struct FileSnapshot {
    storage_group: StorageGroup,
    partition: PartitionId,
    sequence: Vec<Arc<TsFileRecord>>,
    unsequence: Vec<Arc<TsFileRecord>>,
    arena: Arc<FileArena>,
}

impl FileSnapshot {
    /// Callers hold the partition lock while building a snapshot
    pub(crate) fn new(
        storage_group: StorageGroup,
        partition: PartitionId,
        sequence: Vec<Arc<TsFileRecord>>,
        unsequence: Vec<Arc<TsFileRecord>>,
        arena: Arc<FileArena>,
    ) -> Self {
        for file in sequence.iter().chain(unsequence.iter()) {
            file.acquire();
        }
        Self {
            storage_group,
            partition,
            sequence,
            unsequence,
            arena,
        }
    }

    pub fn storage_group(&self) -> &str {
        &self.storage_group
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn sequence_files(&self) -> &[Arc<TsFileRecord>] {
        &self.sequence
    }

    pub fn unsequence_files(&self) -> &[Arc<TsFileRecord>] {
        &self.unsequence
    }

    pub fn files(&self) -> impl Iterator<Item = &Arc<TsFileRecord>> {
        self.sequence.iter().chain(self.unsequence.iter())
    }

    pub fn len(&self) -> usize {
        self.sequence.len() + self.unsequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for FileSnapshot {
    fn drop(&mut self) {
        let mut released_obsolete = false;
        for file in self.sequence.iter().chain(self.unsequence.iter()) {
            if file.release() == 0 && file.is_obsolete() {
                released_obsolete = true;
            }
        }
        if released_obsolete {
            self.arena.drain_deletions();
        }
    }
}
