//! Merge task execution
//!
//! Reads every input, plans each series, writes the merged chunks to a
//! temporary file and commits it:
//!
//! 1. log `Running`
//! 2. write and fsync `<output>.tmp`
//! 3. log `Committed` (the commit point)
//! 4. rename to the final name and swap the file set
//!
//! Any failure before step 3 leaves the inputs untouched and removes the
//! temporary file.

use super::plan::{merge_points, ChunkAction, ChunkMergePlan, PlanThresholds, SourceChunk};
use super::{MergeTask, MergeTaskState};
use crate::config::MergeConfig;
use crate::fileset::{FileSetManager, TsFileRecord};
use crate::limiter::ThroughputLimiter;
use crate::metrics::MergeMetrics;
use crate::recovery::{MergeLog, MergeLogRecord};
use crate::tsfile::{tmp_path, Chunk, PendingTsFile, TsFileReader, TsFileWriter};
use crate::{MergeError, Result, SeriesKey};
use bytes::Bytes;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
use parking_lot::Mutex;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs merge tasks; shared by every scheduler worker
pub struct MergeExecutor {
    config: Arc<MergeConfig>,
    fileset: Arc<FileSetManager>,
    log: Arc<MergeLog>,
    limiter: Arc<ThroughputLimiter>,
    metrics: Arc<MergeMetrics>,
    pool: rayon::ThreadPool,
    #[cfg(test)]
    fail_after_chunks: Mutex<Option<usize>>,
    #[cfg(test)]
    panic_on_write: AtomicBool,
}

impl MergeExecutor {
    pub fn new(
        config: Arc<MergeConfig>,
        fileset: Arc<FileSetManager>,
        log: Arc<MergeLog>,
        limiter: Arc<ThroughputLimiter>,
        metrics: Arc<MergeMetrics>,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.merge_chunk_sub_threads)
            .thread_name(|i| format!("merge-series-{}", i))
            .build()
            .map_err(|e| MergeError::Internal(format!("failed to build merge pool: {}", e)))?;

        Ok(Self {
            config,
            fileset,
            log,
            limiter,
            metrics,
            pool,
            #[cfg(test)]
            fail_after_chunks: Mutex::new(None),
            #[cfg(test)]
            panic_on_write: AtomicBool::new(false),
        })
    }

    /// Make the next tasks fail after writing `chunks` chunks
    #[cfg(test)]
    pub(crate) fn inject_fault_after(&self, chunks: Option<usize>) {
        *self.fail_after_chunks.lock() = chunks;
    }

    /// Make the next tasks panic before writing their first chunk
    #[cfg(test)]
    pub(crate) fn inject_panic(&self, enabled: bool) {
        self.panic_on_write.store(enabled, Ordering::SeqCst);
    }

    /// Execute a task whose inputs were claimed with `FileSetManager::begin_merge`
    pub fn run(&self, task: &mut MergeTask) -> Result<Arc<TsFileRecord>> {
        let started = Instant::now();
        if let Err(e) = self
            .log
            .append(&MergeLogRecord::transition(task.id, MergeTaskState::Running))
        {
            return Err(self.fail(task, e));
        }
        task.set_state(MergeTaskState::Running);
        self.metrics.task_started();
        info!(
            task_id = %task.id,
            storage_group = %task.storage_group,
            partition = task.partition,
            kind = %task.kind,
            inputs = task.inputs.len(),
            input_bytes = task.estimated_memory(),
            "Merge task started"
        );

        let pending = match self.write_output(task) {
            Ok(pending) => pending,
            Err(e) => return Err(self.fail(task, e)),
        };

        if let Err(e) = self
            .log
            .append(&MergeLogRecord::transition(task.id, MergeTaskState::Committed))
        {
            let _ = pending.discard();
            return Err(self.fail(task, e));
        }
        task.set_state(MergeTaskState::Committed);

        let output = match pending.publish() {
            Ok(meta) => meta,
            Err(e) => return Err(self.fail(task, e)),
        };
        let points = output.point_count;
        let record = match self.fileset.commit_merge(task, output) {
            Ok(record) => record,
            Err(e) => return Err(self.fail(task, e)),
        };

        let elapsed = started.elapsed();
        self.metrics
            .task_committed(elapsed, record.meta().file_size, points);
        info!(
            task_id = %task.id,
            storage_group = %task.storage_group,
            partition = task.partition,
            output = ?record.meta().path,
            level = task.output_level,
            sequence = task.target_sequence,
            points,
            elapsed_ms = elapsed.as_millis() as u64,
            "Merge task committed"
        );
        Ok(record)
    }

    /// Undo every on-disk effect of a failed task and release its inputs
    fn fail(&self, task: &mut MergeTask, error: MergeError) -> MergeError {
        let committed = task.state() == MergeTaskState::Committed;
        let logged = self
            .log
            .append(&MergeLogRecord::transition(task.id, MergeTaskState::Failed));

        let output = task.output_path();
        match logged {
            Ok(()) => {
                remove_quietly(&tmp_path(&output));
                if committed {
                    remove_quietly(&output);
                }
            }
            // Without a `Failed` record recovery rolls a committed task forward
            Err(e) if committed => {
                warn!(task_id = %task.id, "Failed to log merge failure, keeping output: {}", e)
            }
            Err(_) => remove_quietly(&tmp_path(&output)),
        }

        self.fileset.abort_merge(task);
        task.set_state(MergeTaskState::Failed);
        self.metrics.task_failed();
        warn!(
            task_id = %task.id,
            storage_group = %task.storage_group,
            partition = task.partition,
            retryable = error.is_retryable(),
            "Merge task failed: {}",
            error
        );
        error
    }

    fn write_output(&self, task: &MergeTask) -> Result<PendingTsFile> {
        let readers = task
            .inputs
            .iter()
            .map(|f| Ok(TsFileReader::open(&f.meta().path)?.with_limiter(self.limiter.clone())))
            .collect::<Result<Vec<_>>>()?;

        let mut series: BTreeMap<SeriesKey, Vec<SourceChunk>> = BTreeMap::new();
        for (input, reader) in readers.iter().enumerate() {
            let recency = task.recency(input);
            for meta in reader.chunk_metas() {
                series.entry(meta.series.clone()).or_default().push(SourceChunk {
                    input,
                    recency,
                    meta: meta.clone(),
                });
            }
        }

        let mut writer = TsFileWriter::create(
            task.output_dir(),
            task.output_header().clone(),
            self.config.compress_chunks,
        )?
        .with_limiter(self.limiter.clone());

        match self.write_series(&readers, series, &mut writer) {
            Ok(()) => writer.finish(),
            Err(e) => {
                writer.abort();
                Err(e)
            }
        }
    }

    /// Plan and merge series in parallel batches, writing them in key order
    fn write_series(
        &self,
        readers: &[TsFileReader],
        series: BTreeMap<SeriesKey, Vec<SourceChunk>>,
        writer: &mut TsFileWriter,
    ) -> Result<()> {
        let thresholds = PlanThresholds::from_config(&self.config);
        let series: Vec<_> = series.into_iter().collect();
        let batch_size = self.config.merge_chunk_sub_threads * 4;
        let mut written = 0usize;

        for batch in series.chunks(batch_size.max(1)) {
            let merged = self.pool.install(|| {
                batch
                    .par_iter()
                    .map(|(key, chunks)| {
                        self.merge_series(readers, key, chunks.clone(), thresholds)
                    })
                    .collect::<Result<Vec<_>>>()
            })?;

            for frame in merged.iter().flatten() {
                self.check_fault(written)?;
                writer.append_frame(frame)?;
                written += 1;
            }
        }

        debug!(chunks = written, series = series.len(), "Merged series written");
        Ok(())
    }

    fn merge_series(
        &self,
        readers: &[TsFileReader],
        key: &SeriesKey,
        chunks: Vec<SourceChunk>,
        thresholds: PlanThresholds,
    ) -> Result<Vec<Bytes>> {
        let plan = ChunkMergePlan::build(key.clone(), chunks, thresholds);
        self.metrics
            .record_chunks(plan.appended_chunks() as u64, plan.rewritten_chunks() as u64);

        let mut frames = Vec::with_capacity(plan.actions.len());
        for action in plan.actions {
            match action {
                ChunkAction::Append(source) => {
                    let frame = readers[source.input].read_raw_chunk(&source.meta)?;
                    self.metrics.record_read(frame.len() as u64);
                    frames.push(frame);
                }
                ChunkAction::Rewrite(group) => {
                    let mut sources = Vec::with_capacity(group.len());
                    for source in &group {
                        let chunk = readers[source.input].read_chunk(&source.meta)?;
                        self.metrics.record_read(source.meta.size as u64);
                        sources.push((source.recency, chunk.points));
                    }
                    let points = merge_points(sources);
                    if !points.is_empty() {
                        let chunk = Chunk::new(key.clone(), points);
                        frames.push(chunk.encode(self.config.compress_chunks)?);
                    }
                }
            }
        }
        Ok(frames)
    }

    #[cfg(test)]
    fn check_fault(&self, written: usize) -> Result<()> {
        if self.panic_on_write.load(Ordering::SeqCst) {
            panic!("injected merge panic");
        }
        match *self.fail_after_chunks.lock() {
            Some(limit) if written >= limit => Err(MergeError::MergeAborted(format!(
                "injected fault after {} chunks",
                written
            ))),
            _ => Ok(()),
        }
    }

    #[cfg(not(test))]
    fn check_fault(&self, _written: usize) -> Result<()> {
        Ok(())
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}
