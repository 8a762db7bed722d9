//! File-set manager
//!
//! Tracks the TsFiles of every storage group partition, split into a
//! sequence and an unsequence [`FileLevelSet`]. All mutations of one
//! partition happen under its own mutex: registration of flushed files,
//! merge commits and snapshot acquisition are therefore atomic with respect
//! to each other.

mod arena;
mod level;
mod snapshot;

pub use arena::{FileArena, TsFileRecord};
pub use level::FileLevelSet;
pub use snapshot::FileSnapshot;

use crate::config::MergeConfig;
use crate::merge::{MergeKind, MergeTask};
use crate::recovery::MergeLog;
use crate::tsfile::{is_tmp_file, is_tsfile, TsFileMeta, TsFileReader};
use crate::{FileId, Level, MergeError, PartitionId, Result, StorageGroup};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Files of one (storage group, partition)
#[derive(Debug, Default)]
pub struct PartitionFiles {
    pub sequence: FileLevelSet,
    pub unsequence: FileLevelSet,
    /// A merge task of this partition is selected or running
    pub merging: bool,
}

impl PartitionFiles {
    fn set(&self, sequence: bool) -> &FileLevelSet {
        if sequence {
            &self.sequence
        } else {
            &self.unsequence
        }
    }

    fn set_mut(&mut self, sequence: bool) -> &mut FileLevelSet {
        if sequence {
            &mut self.sequence
        } else {
            &mut self.unsequence
        }
    }

    fn contains(&self, id: FileId) -> bool {
        self.sequence.contains(id) || self.unsequence.contains(id)
    }
}

/// Files of one over-full level, handed to the candidate selector
#[derive(Debug, Clone)]
pub struct LevelCandidates {
    pub storage_group: StorageGroup,
    pub partition: PartitionId,
    pub kind: MergeKind,
    /// Minimum window size
    pub cap: usize,
    /// Sequence levels in time order, unsequence levels in version order
    pub files: Vec<Arc<TsFileRecord>>,
    /// Sequence files the output must not overlap (inner sequence), or may absorb (cross)
    pub siblings: Vec<Arc<TsFileRecord>>,
}

/// File count and size of one level
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelStat {
    pub storage_group: StorageGroup,
    pub partition: PartitionId,
    pub sequence: bool,
    pub level: Level,
    pub file_count: usize,
    pub total_size: u64,
}

/// Owner of the level sets of every partition
pub struct FileSetManager {
    config: Arc<MergeConfig>,
    arena: Arc<FileArena>,
    partitions: RwLock<BTreeMap<(StorageGroup, PartitionId), Arc<Mutex<PartitionFiles>>>>,
    next_file_id: AtomicU64,
    next_version: AtomicU64,
}

impl FileSetManager {
    pub fn new(config: Arc<MergeConfig>, log: Option<Arc<MergeLog>>) -> Self {
        Self {
            config,
            arena: Arc::new(FileArena::new(log)),
            partitions: RwLock::new(BTreeMap::new()),
            next_file_id: AtomicU64::new(1),
            next_version: AtomicU64::new(1),
        }
    }

    pub fn arena(&self) -> &Arc<FileArena> {
        &self.arena
    }

    /// Fresh file id for a flushed or merged file
    pub fn allocate_file_id(&self) -> FileId {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Fresh write version for a flushed file
    pub fn allocate_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Add a closed file to its partition at the level recorded in its header
    pub fn register(&self, meta: TsFileMeta) -> Result<Arc<TsFileRecord>> {
        if meta.storage_group.is_empty() {
            return Err(MergeError::InvalidFormat(format!(
                "TsFile {:?} has no storage group",
                meta.path
            )));
        }
        if self.arena.contains(meta.id) {
            return Err(MergeError::Internal(format!(
                "TsFile id {} registered twice",
                meta.id
            )));
        }

        let top = self.config.level_num(meta.sequence) - 1;
        let level = meta.level.min(top);
        let partition = self.partition_or_create(&meta.storage_group, meta.partition);
        let mut files = partition.lock();

        if meta.sequence {
            if let Some(conflict) = files.sequence.find_overlap(&meta.time_range, &HashSet::new()) {
                return Err(MergeError::Overlap(format!(
                    "{:?} {:?} overlaps sequence file {:?} {:?}",
                    meta.path,
                    meta.time_range,
                    conflict.meta().path,
                    conflict.meta().time_range
                )));
            }
        }

        self.next_file_id.fetch_max(meta.id + 1, Ordering::SeqCst);
        self.next_version.fetch_max(meta.version + 1, Ordering::SeqCst);

        let sequence = meta.sequence;
        let record = self.arena.insert(meta);
        files.set_mut(sequence).insert(level, record.clone());
        debug!(
            file_id = record.id(),
            storage_group = %record.meta().storage_group,
            partition = record.meta().partition,
            level,
            sequence,
            "Registered TsFile"
        );
        Ok(record)
    }

    /// Levels of a partition whose file count exceeds their cap
    pub fn select_promotion_candidates(
        &self,
        storage_group: &str,
        partition: PartitionId,
    ) -> Vec<LevelCandidates> {
        self.candidates(storage_group, partition, false)
    }

    /// Every level holding something to merge, ignoring caps: any sequence level
    /// with two or more files, and any unsequence file
    pub fn select_forced_candidates(
        &self,
        storage_group: &str,
        partition: PartitionId,
    ) -> Vec<LevelCandidates> {
        self.candidates(storage_group, partition, true)
    }

    fn candidates(
        &self,
        storage_group: &str,
        partition: PartitionId,
        forced: bool,
    ) -> Vec<LevelCandidates> {
        let Some(handle) = self.partition(storage_group, partition) else {
            return Vec::new();
        };
        let files = handle.lock();
        if files.merging {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        let candidate = |kind, cap, files: Vec<Arc<TsFileRecord>>, siblings| LevelCandidates {
            storage_group: storage_group.to_string(),
            partition,
            kind,
            cap,
            files,
            siblings,
        };

        // Sequence levels below the top one, time ordered
        for level in 0..self.config.level_num(true) - 1 {
            let level_files = files.sequence.level(level);
            let mut seq_cap = self.config.level_cap(true);
            if forced && level_files.len() >= 2 {
                seq_cap = seq_cap.min(level_files.len());
            } else if level_files.len() <= seq_cap {
                continue;
            }
            let mut window: Vec<_> = level_files
                .iter()
                .filter(|f| !f.is_merging())
                .cloned()
                .collect();
            window.sort_by_key(|f| (f.meta().time_range.start, f.id()));
            let siblings = files
                .sequence
                .files()
                .filter(|f| !level_files.iter().any(|l| l.id() == f.id()))
                .cloned()
                .collect();
            candidates.push(candidate(
                MergeKind::Inner {
                    level,
                    sequence: true,
                },
                seq_cap,
                window,
                siblings,
            ));
        }

        // Unsequence levels, version ordered; the top one feeds cross merges
        let unseq_top = self.config.level_num(false) - 1;
        for level in 0..=unseq_top {
            let level_files = files.unsequence.level(level);
            let mut unseq_cap = self.config.level_cap(false);
            if forced && !level_files.is_empty() {
                unseq_cap = unseq_cap.min(level_files.len());
            } else if level_files.len() <= unseq_cap {
                continue;
            }
            let mut window: Vec<_> = level_files
                .iter()
                .filter(|f| !f.is_merging())
                .cloned()
                .collect();
            window.sort_by_key(|f| (f.meta().version, f.id()));

            if level == unseq_top {
                let mut siblings: Vec<_> = files.sequence.files().cloned().collect();
                siblings.sort_by_key(|f| (f.meta().time_range.start, f.id()));
                candidates.push(candidate(MergeKind::Cross, unseq_cap, window, siblings));
            } else {
                candidates.push(candidate(
                    MergeKind::Inner {
                        level,
                        sequence: false,
                    },
                    unseq_cap,
                    window,
                    Vec::new(),
                ));
            }
        }

        candidates
    }

    /// Claim the inputs of `task`. Fails if the partition already runs a merge
    /// or an input is no longer live.
    pub fn begin_merge(&self, task: &MergeTask) -> bool {
        let Some(handle) = self.partition(&task.storage_group, task.partition) else {
            return false;
        };
        let mut files = handle.lock();
        if files.merging {
            return false;
        }
        if task
            .inputs
            .iter()
            .any(|f| f.is_merging() || !files.contains(f.id()))
        {
            return false;
        }
        for input in &task.inputs {
            input.set_merging(true);
        }
        files.merging = true;
        true
    }

    /// Release the inputs of a task that will not commit
    pub fn abort_merge(&self, task: &MergeTask) {
        self.abort_inputs(&task.storage_group, task.partition, &task.inputs);
    }

    /// Release claimed inputs when the task owning them is gone
    pub fn abort_inputs(
        &self,
        storage_group: &str,
        partition: PartitionId,
        inputs: &[Arc<TsFileRecord>],
    ) {
        if let Some(handle) = self.partition(storage_group, partition) {
            let mut files = handle.lock();
            for input in inputs {
                input.set_merging(false);
            }
            files.merging = false;
        }
    }

    /// Atomically replace the inputs of `task` with its published output
    pub fn commit_merge(&self, task: &MergeTask, output: TsFileMeta) -> Result<Arc<TsFileRecord>> {
        let handle = self
            .partition(&task.storage_group, task.partition)
            .ok_or_else(|| MergeError::StorageGroupNotFound(task.storage_group.clone()))?;

        let record = {
            let mut files = handle.lock();
            let input_ids: HashSet<FileId> = task.inputs.iter().map(|f| f.id()).collect();

            if let Some(missing) = input_ids.iter().find(|id| !files.contains(**id)) {
                return Err(MergeError::FileNotFound(*missing));
            }
            if task.target_sequence {
                if let Some(conflict) =
                    files.sequence.find_overlap(&output.time_range, &input_ids)
                {
                    return Err(MergeError::Overlap(format!(
                        "merge output {:?} overlaps sequence file {:?}",
                        output.time_range,
                        conflict.meta().path
                    )));
                }
            }

            files.sequence.remove(&input_ids);
            files.unsequence.remove(&input_ids);
            let record = self.arena.insert(output);
            files
                .set_mut(task.target_sequence)
                .insert(task.output_level, record.clone());

            for input in &task.inputs {
                input.set_merging(false);
            }
            files.merging = false;
            record
        };

        self.arena.retire(task.id, &task.inputs);
        self.arena.drain_deletions();
        Ok(record)
    }

    /// Pin the current files of a partition for reading
    pub fn acquire_snapshot(
        &self,
        storage_group: &str,
        partition: PartitionId,
    ) -> Result<FileSnapshot> {
        let handle = self
            .partition(storage_group, partition)
            .ok_or_else(|| MergeError::StorageGroupNotFound(storage_group.to_string()))?;
        let files = handle.lock();
        Ok(FileSnapshot::new(
            storage_group.to_string(),
            partition,
            files.sequence.files().cloned().collect(),
            files.unsequence.files().cloned().collect(),
            self.arena.clone(),
        ))
    }

    /// Unlink replaced files no reader holds any more
    pub fn drain_deletions(&self) -> usize {
        self.arena.drain_deletions()
    }

    /// Level ids of one side of a partition
    pub fn level_ids(
        &self,
        storage_group: &str,
        partition: PartitionId,
        sequence: bool,
    ) -> BTreeMap<Level, Vec<FileId>> {
        self.partition(storage_group, partition)
            .map(|handle| handle.lock().set(sequence).level_ids())
            .unwrap_or_default()
    }

    /// A merge task of the partition is selected or running
    pub fn is_merging(&self, storage_group: &str, partition: PartitionId) -> bool {
        self.partition(storage_group, partition)
            .map_or(false, |handle| handle.lock().merging)
    }

    /// Find a live file of a partition by path
    pub fn find_by_path(
        &self,
        storage_group: &str,
        partition: PartitionId,
        path: &Path,
    ) -> Option<Arc<TsFileRecord>> {
        let handle = self.partition(storage_group, partition)?;
        let files = handle.lock();
        let found = files
            .sequence
            .files()
            .chain(files.unsequence.files())
            .find(|f| f.meta().path == path)
            .cloned();
        found
    }

    pub fn storage_groups(&self) -> Vec<StorageGroup> {
        let mut groups: Vec<_> = self.partitions.read().keys().map(|(sg, _)| sg.clone()).collect();
        groups.dedup();
        groups
    }

    pub fn partitions_of(&self, storage_group: &str) -> Vec<PartitionId> {
        self.partitions
            .read()
            .keys()
            .filter(|(sg, _)| sg == storage_group)
            .map(|(_, p)| *p)
            .collect()
    }

    pub fn all_partitions(&self) -> Vec<(StorageGroup, PartitionId)> {
        self.partitions.read().keys().cloned().collect()
    }

    /// Per-level file counts of every partition
    pub fn files_per_level(&self) -> Vec<LevelStat> {
        let partitions: Vec<_> = self
            .partitions
            .read()
            .iter()
            .map(|(key, handle)| (key.clone(), handle.clone()))
            .collect();

        let mut stats = Vec::new();
        for ((storage_group, partition), handle) in partitions {
            let files = handle.lock();
            for sequence in [true, false] {
                let set = files.set(sequence);
                for (level, file_count) in set.level_counts() {
                    stats.push(LevelStat {
                        storage_group: storage_group.clone(),
                        partition,
                        sequence,
                        level,
                        file_count,
                        total_size: set.level_size(level),
                    });
                }
            }
        }
        stats
    }

    /// Rebuild every partition from `<data_dir>/<sg>/<partition>/*.tsfile`.
    ///
    /// Must run after recovery; leftover temp files are removed.
    pub fn load_from_disk(&self) -> Result<usize> {
        let data_dir = &self.config.data_dir;
        if !data_dir.exists() {
            return Ok(0);
        }

        let mut metas = Vec::new();
        for sg_entry in fs::read_dir(data_dir)? {
            let sg_entry = sg_entry?;
            if !sg_entry.file_type()?.is_dir() {
                continue;
            }
            let sg_name = sg_entry.file_name().to_string_lossy().to_string();
            if sg_name.starts_with('.') {
                continue;
            }

            for partition_entry in fs::read_dir(sg_entry.path())? {
                let partition_entry = partition_entry?;
                let partition_name = partition_entry.file_name().to_string_lossy().to_string();
                if !partition_entry.file_type()?.is_dir()
                    || partition_name.parse::<PartitionId>().is_err()
                {
                    continue;
                }
                self.scan_partition_dir(&partition_entry.path(), &mut metas)?;
            }
        }

        // Version order keeps unsequence levels in write order
        metas.sort_by_key(|m: &TsFileMeta| (m.version, m.id));
        let mut loaded = 0;
        for meta in metas {
            let path = meta.path.clone();
            match self.register(meta) {
                Ok(_) => loaded += 1,
                Err(e) => warn!("Skipping TsFile {:?}: {}", path, e),
            }
        }

        info!(files = loaded, "Loaded TsFiles from disk");
        Ok(loaded)
    }

    fn scan_partition_dir(&self, dir: &Path, metas: &mut Vec<TsFileMeta>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if is_tmp_file(&path) {
                info!("Removing leftover temp file {:?}", path);
                fs::remove_file(&path)?;
            } else if is_tsfile(&path) {
                match TsFileReader::open(&path) {
                    Ok(reader) => metas.push(reader.meta().clone()),
                    Err(e) => warn!("Failed to open TsFile {:?}: {}", path, e),
                }
            }
        }
        Ok(())
    }

    fn partition(
        &self,
        storage_group: &str,
        partition: PartitionId,
    ) -> Option<Arc<Mutex<PartitionFiles>>> {
        self.partitions
            .read()
            .get(&(storage_group.to_string(), partition))
            .cloned()
    }

    fn partition_or_create(
        &self,
        storage_group: &str,
        partition: PartitionId,
    ) -> Arc<Mutex<PartitionFiles>> {
        if let Some(handle) = self.partition(storage_group, partition) {
            return handle;
        }
        self.partitions
            .write()
            .entry((storage_group.to_string(), partition))
            .or_default()
            .clone()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Synthetic records for selector and level tests

    use super::*;
    use crate::TimeRange;
    use std::path::PathBuf;

    pub fn meta_at(id: FileId, path: &Path) -> TsFileMeta {
        TsFileMeta {
            path: path.to_path_buf(),
            id,
            version: id,
            storage_group: "root.sg".into(),
            partition: 0,
            level: 0,
            sequence: true,
            time_range: TimeRange::new(0, 0),
            file_size: 1,
            chunk_count: 1,
            series_count: 1,
            point_count: 1,
        }
    }

    pub fn synthetic_meta(
        id: FileId,
        start: i64,
        end: i64,
        file_size: u64,
        series_count: usize,
    ) -> TsFileMeta {
        TsFileMeta {
            path: PathBuf::from(format!("/nonexistent/{}.tsfile", id)),
            time_range: TimeRange::new(start, end),
            file_size,
            series_count,
            ..meta_at(id, Path::new(""))
        }
    }

    pub fn record(
        id: FileId,
        start: i64,
        end: i64,
        file_size: u64,
        series_count: usize,
    ) -> Arc<TsFileRecord> {
        Arc::new(TsFileRecord::new(synthetic_meta(
            id,
            start,
            end,
            file_size,
            series_count,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::synthetic_meta;
    use super::*;

    fn manager(seq_cap: usize, unseq_cap: usize) -> FileSetManager {
        let config = MergeConfig {
            seq_file_num_in_each_level: seq_cap,
            unseq_file_num_in_each_level: unseq_cap,
            ..Default::default()
        };
        FileSetManager::new(Arc::new(config), None)
    }

    fn unseq(id: FileId, start: i64, end: i64) -> TsFileMeta {
        TsFileMeta {
            sequence: false,
            ..synthetic_meta(id, start, end, 100, 1)
        }
    }

    #[test]
    fn test_register_rejects_sequence_overlap() {
        let fileset = manager(3, 3);
        fileset.register(synthetic_meta(1, 0, 10, 100, 1)).unwrap();
        let err = fileset
            .register(synthetic_meta(2, 5, 15, 100, 1))
            .unwrap_err();
        assert!(matches!(err, MergeError::Overlap(_)));

        // Unsequence files may overlap anything
        fileset.register(unseq(3, 5, 15)).unwrap();
        assert_eq!(fileset.arena().len(), 2);
        assert!(fileset.allocate_file_id() > 3);
    }

    #[test]
    fn test_candidates_require_count_above_cap() {
        let fileset = manager(3, 3);
        for id in 1..=3 {
            fileset
                .register(synthetic_meta(id, id as i64 * 10, id as i64 * 10 + 5, 100, 1))
                .unwrap();
        }
        assert!(fileset.select_promotion_candidates("root.sg", 0).is_empty());

        fileset.register(synthetic_meta(4, 40, 45, 100, 1)).unwrap();
        let candidates = fileset.select_promotion_candidates("root.sg", 0);
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].kind,
            MergeKind::Inner {
                level: 0,
                sequence: true
            }
        );
        assert_eq!(candidates[0].files.len(), 4);
    }

    #[test]
    fn test_top_unsequence_level_yields_cross() {
        let config = MergeConfig {
            unseq_file_num_in_each_level: 1,
            unseq_level_num: 1,
            ..Default::default()
        };
        let fileset = FileSetManager::new(Arc::new(config), None);
        fileset.register(synthetic_meta(1, 0, 10, 100, 1)).unwrap();
        fileset.register(unseq(2, 5, 6)).unwrap();
        fileset.register(unseq(3, 7, 8)).unwrap();

        let candidates = fileset.select_promotion_candidates("root.sg", 0);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kind, MergeKind::Cross);
        assert_eq!(candidates[0].siblings.len(), 1);
    }

    #[test]
    fn test_snapshot_pins_files() {
        let fileset = manager(3, 3);
        let record = fileset.register(synthetic_meta(1, 0, 10, 100, 1)).unwrap();

        let snapshot = fileset.acquire_snapshot("root.sg", 0).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(record.readers(), 1);
        drop(snapshot);
        assert_eq!(record.readers(), 0);

        assert!(matches!(
            fileset.acquire_snapshot("root.missing", 0),
            Err(MergeError::StorageGroupNotFound(_))
        ));
    }

    #[test]
    fn test_files_per_level() {
        let fileset = manager(3, 3);
        fileset.register(synthetic_meta(1, 0, 10, 100, 1)).unwrap();
        fileset
            .register(TsFileMeta {
                level: 2,
                ..synthetic_meta(2, 20, 30, 50, 1)
            })
            .unwrap();
        fileset.register(unseq(3, 0, 5)).unwrap();

        let stats = fileset.files_per_level();
        assert_eq!(stats.len(), 3);
        assert!(stats
            .iter()
            .any(|s| s.sequence && s.level == 2 && s.total_size == 50));
        assert_eq!(fileset.storage_groups(), vec!["root.sg".to_string()]);
        assert_eq!(fileset.partitions_of("root.sg"), vec![0]);
        assert_eq!(
            fileset.level_ids("root.sg", 0, true),
            BTreeMap::from([(0, vec![1]), (2, vec![2])])
        );
    }
}
