//! Merge engine - top-level coordinator
//!
//! Wires the file set, selector, executor, limiter and merge log together and
//! schedules merge tasks. A task is started when a registration pushes a
//! level over its cap, on every periodic round, and on administrative request.
//! Each task runs on the blocking pool of the tokio runtime; a semaphore of
//! `hot_compaction_threads` permits bounds how many run at once.

use crate::config::MergeConfig;
use crate::fileset::{FileSetManager, FileSnapshot, TsFileRecord};
use crate::limiter::ThroughputLimiter;
use crate::merge::{MergeExecutor, MergeTask, MergeTaskState};
use crate::metrics::{EngineStats, MergeMetrics};
use crate::recovery::{MergeLog, MergeLogRecord, RecoveryManager, TaskDescriptor, MERGE_LOG_FILE};
use crate::selector::{CandidateSelector, Selection};
use crate::tsfile::{TsFileMeta, TsFileReader};
use crate::{FileId, Level, MergeError, PartitionId, Result, StorageGroup};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of an administrative merge of one storage group
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ForceMergeReport {
    pub storage_group: StorageGroup,
    pub rounds: usize,
    pub committed: usize,
    pub failed: usize,
}

/// Level layout of one partition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionLevels {
    pub storage_group: StorageGroup,
    pub partition: PartitionId,
    pub sequence: BTreeMap<Level, Vec<FileId>>,
    pub unsequence: BTreeMap<Level, Vec<FileId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Promotion,
    Forced,
}

enum StartOutcome {
    Started(JoinHandle<bool>),
    /// Nothing to merge
    Idle,
    /// The partition or the memory budget is taken; retry later
    Busy,
    Failed,
}

/// Soft ceiling on the memory held by admitted tasks.
///
/// A task is admitted if it fits or if nothing else is admitted, so an
/// oversized task still runs alone instead of starving.
#[derive(Debug)]
struct MemoryBudget {
    limit: u64,
    state: Mutex<BudgetState>,
}

#[derive(Debug, Default)]
struct BudgetState {
    reserved: u64,
    running: usize,
}

impl MemoryBudget {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            state: Mutex::new(BudgetState::default()),
        }
    }

    fn try_reserve(&self, bytes: u64) -> bool {
        let mut state = self.state.lock();
        if state.running > 0 && state.reserved.saturating_add(bytes) > self.limit {
            return false;
        }
        state.reserved = state.reserved.saturating_add(bytes);
        state.running += 1;
        true
    }

    fn release(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(bytes);
        state.running = state.running.saturating_sub(1);
    }

    fn reserved(&self) -> u64 {
        self.state.lock().reserved
    }

    fn running(&self) -> usize {
        self.state.lock().running
    }
}

/// TsMerge engine
pub struct MergeEngine {
    config: Arc<MergeConfig>,
    fileset: Arc<FileSetManager>,
    selector: CandidateSelector,
    executor: Arc<MergeExecutor>,
    log: Arc<MergeLog>,
    limiter: Arc<ThroughputLimiter>,
    metrics: Arc<MergeMetrics>,
    budget: MemoryBudget,
    permits: Arc<Semaphore>,
    runtime: Handle,
    /// Signalled whenever a task finishes
    task_done: Notify,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl MergeEngine {
    /// Recover interrupted merges, load the data directory and resume
    /// unfinished tasks if configured to
    pub fn open(config: MergeConfig, runtime: Handle) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir)?;

        let log = Arc::new(MergeLog::open(config.data_dir.join(MERGE_LOG_FILE))?);
        let report = RecoveryManager::new(config.clone()).recover(&log)?;

        let fileset = Arc::new(FileSetManager::new(config.clone(), Some(log.clone())));
        let loaded = fileset.load_from_disk()?;

        let limiter = Arc::new(ThroughputLimiter::from_config(&config));
        let metrics = Arc::new(MergeMetrics::new());
        let executor = Arc::new(MergeExecutor::new(
            config.clone(),
            fileset.clone(),
            log.clone(),
            limiter.clone(),
            metrics.clone(),
        )?);
        let (shutdown, _) = watch::channel(false);

        let engine = Arc::new(Self {
            selector: CandidateSelector::from_config(&config),
            budget: MemoryBudget::new(config.merge_memory_budget),
            permits: Arc::new(Semaphore::new(config.hot_compaction_threads)),
            config,
            fileset,
            executor,
            log,
            limiter,
            metrics,
            runtime,
            task_done: Notify::new(),
            closed: AtomicBool::new(false),
            shutdown,
        });

        info!(
            data_dir = ?engine.config.data_dir,
            files = loaded,
            rolled_back = report.discarded.len(),
            rolled_forward = report.completed.len(),
            "Merge engine opened"
        );

        for descriptor in report.resumable {
            engine.resume(descriptor);
        }
        Ok(engine)
    }

    pub fn config(&self) -> &Arc<MergeConfig> {
        &self.config
    }

    pub fn fileset(&self) -> &Arc<FileSetManager> {
        &self.fileset
    }

    /// Start the periodic merge round, if `merge_interval_secs` is set
    pub fn start(self: &Arc<Self>) {
        let Some(period) = self.config.merge_interval() else {
            info!("Periodic merge disabled");
            return;
        };

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        self.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            info!(period_secs = period.as_secs(), "Periodic merge started");

            while !engine.closed.load(Ordering::Acquire) {
                tokio::select! {
                    _ = interval.tick() => {
                        let started = engine.merge_all();
                        debug!(started, "Periodic merge round");
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Periodic merge stopped");
        });
    }

    /// Register a flushed file and merge its partition if a level overflowed
    pub fn register(self: &Arc<Self>, meta: TsFileMeta) -> Result<Arc<TsFileRecord>> {
        let storage_group = meta.storage_group.clone();
        let partition = meta.partition;
        let record = self.fileset.register(meta)?;
        self.schedule(&storage_group, partition);
        Ok(record)
    }

    /// Register a closed TsFile found at `path`
    pub fn register_file(self: &Arc<Self>, path: &Path) -> Result<Arc<TsFileRecord>> {
        let meta = TsFileReader::open(path)?.meta().clone();
        self.register(meta)
    }

    /// Pin the current files of a partition for a query
    pub fn acquire_snapshot(
        &self,
        storage_group: &str,
        partition: PartitionId,
    ) -> Result<FileSnapshot> {
        self.fileset.acquire_snapshot(storage_group, partition)
    }

    /// Level layout of one partition
    pub fn levels(&self, storage_group: &str, partition: PartitionId) -> Result<PartitionLevels> {
        if !self.fileset.partitions_of(storage_group).contains(&partition) {
            return Err(MergeError::StorageGroupNotFound(format!(
                "{}/{}",
                storage_group, partition
            )));
        }
        Ok(PartitionLevels {
            storage_group: storage_group.to_string(),
            partition,
            sequence: self.fileset.level_ids(storage_group, partition, true),
            unsequence: self.fileset.level_ids(storage_group, partition, false),
        })
    }

    /// Merge everything mergeable in `storage_group`, ignoring level caps, and
    /// wait for the resulting tasks.
    ///
    /// Rounds repeat until no partition has anything left to merge or a round
    /// commits nothing.
    pub async fn force_merge(self: &Arc<Self>, storage_group: &str) -> Result<ForceMergeReport> {
        let partitions = self.fileset.partitions_of(storage_group);
        if partitions.is_empty() {
            return Err(MergeError::StorageGroupNotFound(storage_group.to_string()));
        }
        info!(storage_group, partitions = partitions.len(), "Force merge requested");

        let mut report = ForceMergeReport {
            storage_group: storage_group.to_string(),
            ..Default::default()
        };

        loop {
            let mut handles = Vec::new();
            let mut busy = false;
            for &partition in &partitions {
                match self.try_start(storage_group, partition, Trigger::Forced) {
                    StartOutcome::Started(handle) => handles.push(handle),
                    StartOutcome::Busy => busy = true,
                    StartOutcome::Failed => report.failed += 1,
                    StartOutcome::Idle => {}
                }
            }

            if handles.is_empty() {
                if busy && !self.closed.load(Ordering::Acquire) {
                    self.wait_for_task_end().await;
                    continue;
                }
                break;
            }

            report.rounds += 1;
            let mut committed = 0;
            for handle in handles {
                match handle.await {
                    Ok(true) => committed += 1,
                    Ok(false) => report.failed += 1,
                    Err(e) => {
                        error!("Merge task panicked: {}", e);
                        report.failed += 1;
                    }
                }
            }
            report.committed += committed;
            if committed == 0 {
                break;
            }
        }

        info!(
            storage_group,
            rounds = report.rounds,
            committed = report.committed,
            failed = report.failed,
            "Force merge finished"
        );
        Ok(report)
    }

    /// Start promotion merges in every partition; returns the number started
    pub fn merge_all(self: &Arc<Self>) -> usize {
        let mut started = 0;
        for (storage_group, partition) in self.fileset.all_partitions() {
            let outcome = self.try_start(&storage_group, partition, Trigger::Promotion);
            if let StartOutcome::Started(_) = outcome {
                started += 1;
            }
        }
        self.fileset.drain_deletions();
        started
    }

    /// Engine statistics
    pub fn stats(&self) -> EngineStats {
        let limiter = self.limiter.stats();
        EngineStats {
            metrics: self.metrics.snapshot(),
            running_tasks: self.budget.running(),
            reserved_memory: self.budget.reserved(),
            memory_budget: self.config.merge_memory_budget,
            pending_deletions: self.fileset.arena().pending_deletions(),
            live_files: self.fileset.arena().len(),
            read_throttled_ms: limiter.read_throttled.as_millis() as u64,
            write_throttled_ms: limiter.write_throttled.as_millis() as u64,
            levels: self.fileset.files_per_level(),
        }
    }

    /// Stop scheduling and wait for running tasks
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        info!(running = self.budget.running(), "Stopping merge engine");

        while self.budget.running() > 0 {
            self.wait_for_task_end().await;
        }
        self.fileset.drain_deletions();
        info!("Merge engine stopped");
    }

    fn schedule(self: &Arc<Self>, storage_group: &str, partition: PartitionId) {
        let outcome = self.try_start(storage_group, partition, Trigger::Promotion);
        if let StartOutcome::Started(_) = outcome {
            debug!(storage_group, partition, "Scheduled promotion merge");
        }
    }

    fn try_start(
        self: &Arc<Self>,
        storage_group: &str,
        partition: PartitionId,
        trigger: Trigger,
    ) -> StartOutcome {
        if self.closed.load(Ordering::Acquire) {
            return StartOutcome::Idle;
        }
        if self.fileset.is_merging(storage_group, partition) {
            return StartOutcome::Busy;
        }

        let candidates = match trigger {
            Trigger::Promotion => {
                self.fileset.select_promotion_candidates(storage_group, partition)
            }
            Trigger::Forced => self.fileset.select_forced_candidates(storage_group, partition),
        };
        let Some(selection) = self.selector.select_first(&candidates) else {
            return StartOutcome::Idle;
        };
        if selection.timed_out {
            self.metrics.selection_timeout();
        }

        let task = MergeTask::new(
            selection,
            self.fileset.allocate_file_id(),
            &self.config.data_dir,
            self.selector.strategy(),
        );
        self.submit(task, trigger == Trigger::Promotion)
    }

    /// Claim the inputs, admit the task against the memory budget, log it and spawn it
    fn submit(self: &Arc<Self>, task: MergeTask, reschedule: bool) -> StartOutcome {
        if !self.fileset.begin_merge(&task) {
            return StartOutcome::Busy;
        }

        let estimate = task.estimated_memory();
        if !self.budget.try_reserve(estimate) {
            self.fileset.abort_merge(&task);
            self.metrics.admission_delayed();
            debug!(
                storage_group = %task.storage_group,
                partition = task.partition,
                estimate,
                reserved = self.budget.reserved(),
                "Merge task delayed by memory budget"
            );
            return StartOutcome::Busy;
        }

        if let Err(e) = self
            .log
            .append(&MergeLogRecord::selected(task.id, task.descriptor()))
        {
            self.fileset.abort_merge(&task);
            self.budget.release(estimate);
            warn!(
                task_id = %task.id,
                storage_group = %task.storage_group,
                partition = task.partition,
                "Failed to log selected merge task: {}",
                e
            );
            return StartOutcome::Failed;
        }

        debug!(
            task_id = %task.id,
            storage_group = %task.storage_group,
            partition = task.partition,
            kind = %task.kind,
            inputs = task.inputs.len(),
            "Merge task selected"
        );
        StartOutcome::Started(self.spawn(task, estimate, reschedule))
    }

    fn spawn(
        self: &Arc<Self>,
        mut task: MergeTask,
        estimate: u64,
        reschedule: bool,
    ) -> JoinHandle<bool> {
        let engine = Arc::clone(self);
        self.runtime.spawn(async move {
            let storage_group = task.storage_group.clone();
            let partition = task.partition;
            let task_id = task.id;
            let inputs = task.inputs.clone();

            let committed = match engine.permits.clone().acquire_owned().await {
                Ok(_permit) => {
                    let executor = engine.executor.clone();
                    let worker = tokio::task::spawn_blocking(move || executor.run(&mut task));
                    match worker.await {
                        Ok(result) => result.is_ok(),
                        Err(e) => {
                            // The merge log keeps the task open; recovery resolves it on restart
                            error!(
                                %task_id,
                                %storage_group,
                                partition,
                                "Merge worker panicked: {}",
                                e
                            );
                            engine.fileset.abort_inputs(&storage_group, partition, &inputs);
                            engine.metrics.task_failed();
                            false
                        }
                    }
                }
                Err(_) => {
                    engine.fileset.abort_merge(&task);
                    let record = MergeLogRecord::transition(task_id, MergeTaskState::Failed);
                    if let Err(e) = engine.log.append(&record) {
                        warn!(%task_id, "Failed to log cancelled merge task: {}", e);
                    }
                    false
                }
            };

            engine.budget.release(estimate);
            if committed && reschedule {
                engine.schedule(&storage_group, partition);
            }
            engine.task_done.notify_waiters();
            committed
        })
    }

    /// Rebuild a task interrupted by a crash from its logged descriptor
    fn resume(self: &Arc<Self>, descriptor: TaskDescriptor) {
        let mut files = Vec::with_capacity(descriptor.inputs.len());
        for path in &descriptor.inputs {
            match self
                .fileset
                .find_by_path(&descriptor.storage_group, descriptor.partition, path)
            {
                Some(file) => files.push(file),
                None => {
                    warn!(input = ?path, "Input of interrupted merge is gone, not resuming");
                    return;
                }
            }
        }

        let selection = Selection {
            total_size: files.iter().map(|f| f.meta().file_size).sum(),
            storage_group: descriptor.storage_group,
            partition: descriptor.partition,
            kind: descriptor.kind,
            files,
            output_level: descriptor.output_level,
            target_sequence: descriptor.target_sequence,
            score: 0.0,
            windows_evaluated: 0,
            timed_out: false,
        };
        let task = MergeTask::new(
            selection,
            self.fileset.allocate_file_id(),
            &self.config.data_dir,
            self.selector.strategy(),
        );
        info!(
            task_id = %task.id,
            storage_group = %task.storage_group,
            partition = task.partition,
            kind = %task.kind,
            "Resuming interrupted merge"
        );
        if !matches!(self.submit(task, true), StartOutcome::Started(_)) {
            warn!("Interrupted merge could not be resubmitted");
        }
    }

    async fn wait_for_task_end(&self) {
        let notified = self.task_done.notified();
        if self.budget.running() == 0 {
            // A claim without admission is in flight
            tokio::time::sleep(Duration::from_millis(10)).await;
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{MergeKind, MergeTaskState};
    use crate::tsfile::{partition_dir, tmp_path, FileHeader, TsFileWriter};
    use crate::{SeriesKey, TimeValue};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn engine(temp_dir: &TempDir, config: MergeConfig) -> Arc<MergeEngine> {
        let config = MergeConfig {
            data_dir: temp_dir.path().to_path_buf(),
            merge_read_throughput_mb_per_sec: 0,
            merge_write_throughput_mb_per_sec: 0,
            ..config
        };
        MergeEngine::open(config, Handle::current()).unwrap()
    }

    fn write_file(
        engine: &MergeEngine,
        sequence: bool,
        points: &[(i64, f64)],
    ) -> TsFileMeta {
        let header = FileHeader::new(
            engine.fileset().allocate_file_id(),
            engine.fileset().allocate_version(),
            "root.sg",
            0,
            0,
            sequence,
        );
        let dir = partition_dir(&engine.config().data_dir, "root.sg", 0);
        let mut writer = TsFileWriter::create(&dir, header, true).unwrap();
        let points: Vec<_> = points.iter().map(|(t, v)| TimeValue::new(*t, *v)).collect();
        writer.write_points(&series(), &points).unwrap();
        writer.finish().unwrap().publish().unwrap()
    }

    fn series() -> SeriesKey {
        SeriesKey::new("sensor", "value").with_tag("id", "1")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_memory_budget_admission() {
        let budget = MemoryBudget::new(100);
        assert!(budget.try_reserve(500));
        assert!(!budget.try_reserve(1));
        budget.release(500);

        assert!(budget.try_reserve(60));
        assert!(budget.try_reserve(40));
        assert!(!budget.try_reserve(1));
        assert_eq!(budget.running(), 2);
        budget.release(60);
        budget.release(40);
        assert_eq!(budget.reserved(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_register_triggers_promotion() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(
            &temp_dir,
            MergeConfig {
                seq_file_num_in_each_level: 2,
                ..Default::default()
            },
        );

        for i in 0..3 {
            let start = i * 100;
            let meta = write_file(&engine, true, &[(start, 1.0), (start + 10, 2.0)]);
            engine.register(meta).unwrap();
        }

        wait_until(|| {
            let levels = engine.levels("root.sg", 0).unwrap();
            levels.sequence.get(&1).map_or(0, Vec::len) == 1 && engine.stats().running_tasks == 0
        })
        .await;

        let levels = engine.levels("root.sg", 0).unwrap();
        assert!(levels.sequence.get(&0).map_or(0, Vec::len) <= 2);
        assert_eq!(engine.stats().metrics.tasks_committed, 1);
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_force_merge_folds_unsequence_data() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir, MergeConfig::default());

        let seq = write_file(&engine, true, &[(1, 1.0), (5, 5.0), (9, 9.0)]);
        engine.register(seq).unwrap();
        let unseq = write_file(&engine, false, &[(5, 55.0)]);
        engine.register(unseq).unwrap();

        let report = engine.force_merge("root.sg").await.unwrap();
        assert!(report.committed >= 1);
        assert_eq!(report.failed, 0);

        let levels = engine.levels("root.sg", 0).unwrap();
        assert!(levels.unsequence.is_empty());
        assert_eq!(levels.sequence.values().map(Vec::len).sum::<usize>(), 1);

        let snapshot = engine.acquire_snapshot("root.sg", 0).unwrap();
        let path = snapshot.sequence_files()[0].meta().path.clone();
        let points = TsFileReader::open(&path).unwrap().read_series(&series()).unwrap();
        let values: Vec<_> = points
            .iter()
            .map(|p| (p.timestamp, p.value.as_f64().unwrap()))
            .collect();
        assert_eq!(values, vec![(1, 1.0), (5, 55.0), (9, 9.0)]);
        drop(snapshot);

        let stats = engine.stats();
        assert_eq!(stats.running_tasks, 0);
        assert_eq!(stats.reserved_memory, 0);
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicked_merge_releases_partition() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(
            &temp_dir,
            MergeConfig {
                seq_file_num_in_each_level: 2,
                ..Default::default()
            },
        );
        engine.executor.inject_panic(true);

        for i in 0..3 {
            let start = i * 100;
            let meta = write_file(&engine, true, &[(start, 1.0), (start + 10, 2.0)]);
            engine.register(meta).unwrap();
        }
        wait_until(|| {
            let stats = engine.stats();
            stats.metrics.tasks_failed == 1 && stats.running_tasks == 0
        })
        .await;

        assert!(!engine.fileset().is_merging("root.sg", 0));
        assert_eq!(engine.levels("root.sg", 0).unwrap().sequence[&0].len(), 3);
        assert_eq!(engine.stats().reserved_memory, 0);

        engine.executor.inject_panic(false);
        let report = engine.force_merge("root.sg").await.unwrap();
        assert!(report.committed >= 1);
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_force_merge_unknown_storage_group() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir, MergeConfig::default());
        let result = engine.force_merge("root.missing").await;
        assert!(matches!(result, Err(MergeError::StorageGroupNotFound(_))));
        assert!(engine.levels("root.missing", 0).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interrupted_merge_resumed_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let config = MergeConfig {
            continue_merge_after_reboot: true,
            ..Default::default()
        };

        // First run: two files on disk and a merge that crashed while running
        let inputs = {
            let first = engine(&temp_dir, config.clone());
            let a = write_file(&first, true, &[(0, 0.0), (1, 1.0)]);
            let b = write_file(&first, true, &[(10, 10.0)]);
            first.shutdown().await;
            vec![a.path, b.path]
        };
        let dir = partition_dir(temp_dir.path(), "root.sg", 0);
        let output = dir.join("crashed-output.tsfile");
        std::fs::write(tmp_path(&output), b"partial").unwrap();

        let log = MergeLog::open(temp_dir.path().join(MERGE_LOG_FILE)).unwrap();
        let task_id = Uuid::new_v4();
        log.append(&MergeLogRecord::selected(
            task_id,
            TaskDescriptor {
                storage_group: "root.sg".into(),
                partition: 0,
                kind: MergeKind::Inner {
                    level: 0,
                    sequence: true,
                },
                inputs: inputs.clone(),
                output_tmp: tmp_path(&output),
                output,
                output_level: 1,
                target_sequence: true,
            },
        ))
        .unwrap();
        log.append(&MergeLogRecord::transition(task_id, MergeTaskState::Running))
            .unwrap();
        drop(log);

        let engine = engine(&temp_dir, config);
        wait_until(|| {
            let levels = engine.levels("root.sg", 0).unwrap();
            levels.sequence.get(&1).map_or(0, Vec::len) == 1 && engine.stats().running_tasks == 0
        })
        .await;

        assert!(engine.levels("root.sg", 0).unwrap().sequence.get(&0).is_none());
        for input in &inputs {
            assert!(!input.exists());
        }
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_stops_scheduling() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(
            &temp_dir,
            MergeConfig {
                seq_file_num_in_each_level: 1,
                ..Default::default()
            },
        );
        engine.shutdown().await;

        for i in 0..3 {
            let meta = write_file(&engine, true, &[(i * 10, 0.0)]);
            engine.register(meta).unwrap();
        }
        assert_eq!(engine.merge_all(), 0);
        assert_eq!(engine.stats().metrics.tasks_started, 0);
        assert_eq!(engine.levels("root.sg", 0).unwrap().sequence[&0].len(), 3);
    }
}
