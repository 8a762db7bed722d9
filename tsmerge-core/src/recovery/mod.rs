//! Crash recovery for interrupted merges
//!
//! Replays the merge log before the file set is loaded. For every task the
//! last durable record decides the outcome:
//!
//! | last record | on disk action                                         |
//! |-------------|--------------------------------------------------------|
//! | Selected    | remove temp output                                     |
//! | Running     | remove temp output, optionally re-run the task         |
//! | Failed      | remove temp and published output                       |
//! | Committed   | publish temp output, delete remaining inputs, Cleaned  |
//! | Cleaned     | nothing                                                |
//!
//! A committed task whose output and temp output are both gone had its
//! output consumed by a later merge, so its inputs are deleted as well.
//!
//! Every action is idempotent, so a crash during recovery is handled by
//! simply recovering again.

mod log;

pub use log::{MergeLog, MergeLogRecord, TaskDescriptor, MERGE_LOG_FILE};

use crate::config::MergeConfig;
use crate::merge::MergeTaskState;
use crate::tsfile::sync_dir;
use crate::{MergeError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What recovery did with the tasks found in the merge log
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Tasks rolled back to their inputs
    pub discarded: Vec<Uuid>,
    /// Committed tasks whose cleanup was finished
    pub completed: Vec<Uuid>,
    /// Interrupted tasks to run again once the file set is loaded
    pub resumable: Vec<TaskDescriptor>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.discarded.is_empty() && self.completed.is_empty() && self.resumable.is_empty()
    }
}

/// Brings the data directory back to a state matching exactly one side of every merge
pub struct RecoveryManager {
    config: Arc<MergeConfig>,
}

impl RecoveryManager {
    pub fn new(config: Arc<MergeConfig>) -> Self {
        Self { config }
    }

    /// Resolve every task recorded in `log` and truncate it
    pub fn recover(&self, log: &MergeLog) -> Result<RecoveryReport> {
        let records = MergeLog::replay(log.path())?;
        let mut report = RecoveryReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        // Last state per task, in order of first appearance
        let mut order = Vec::new();
        let mut tasks: HashMap<Uuid, (Option<TaskDescriptor>, MergeTaskState)> = HashMap::new();
        for record in records {
            let entry = tasks.entry(record.task_id).or_insert_with(|| {
                order.push(record.task_id);
                (None, record.state)
            });
            if record.descriptor.is_some() {
                entry.0 = record.descriptor;
            }
            entry.1 = record.state;
        }

        for task_id in order {
            let Some((descriptor, state)) = tasks.remove(&task_id) else {
                continue;
            };
            let Some(descriptor) = descriptor else {
                if state != MergeTaskState::Cleaned {
                    warn!(%task_id, ?state, "Merge log has no descriptor for task, skipping");
                }
                continue;
            };

            match state {
                MergeTaskState::Selected => {
                    remove_if_exists(&descriptor.output_tmp)?;
                    report.discarded.push(task_id);
                }
                MergeTaskState::Failed => {
                    remove_if_exists(&descriptor.output_tmp)?;
                    remove_if_exists(&descriptor.output)?;
                    report.discarded.push(task_id);
                }
                MergeTaskState::Running | MergeTaskState::Crashed => {
                    remove_if_exists(&descriptor.output_tmp)?;
                    if self.config.continue_merge_after_reboot {
                        info!(%task_id, storage_group = %descriptor.storage_group,
                            partition = descriptor.partition, "Interrupted merge will be resumed");
                        report.resumable.push(descriptor);
                    } else {
                        info!(%task_id, storage_group = %descriptor.storage_group,
                            partition = descriptor.partition, "Interrupted merge rolled back");
                        report.discarded.push(task_id);
                    }
                }
                MergeTaskState::Committed => {
                    self.finish_commit(task_id, &descriptor)?;
                    log.append(&MergeLogRecord::transition(task_id, MergeTaskState::Cleaned))?;
                    report.completed.push(task_id);
                }
                MergeTaskState::Cleaned => {}
            }
        }

        log.reset()?;
        info!(
            discarded = report.discarded.len(),
            completed = report.completed.len(),
            resumable = report.resumable.len(),
            "Merge log recovery complete"
        );
        Ok(report)
    }

    /// Roll a committed task forward
    fn finish_commit(&self, task_id: Uuid, descriptor: &TaskDescriptor) -> Result<()> {
        if descriptor.output.exists() {
            remove_if_exists(&descriptor.output_tmp)?;
        } else if descriptor.output_tmp.exists() {
            fs::rename(&descriptor.output_tmp, &descriptor.output).map_err(|e| {
                MergeError::Recovery(format!(
                    "failed to publish {:?}: {}",
                    descriptor.output_tmp, e
                ))
            })?;
            if let Some(dir) = descriptor.output.parent() {
                sync_dir(dir);
            }
        } else {
            // Failures after the commit point log `Failed`, so the output was
            // swapped in and has since been merged away
            info!(%task_id, output = ?descriptor.output, "Committed merge output already consumed");
        }

        for input in &descriptor.inputs {
            remove_if_exists(input)?;
        }
        info!(%task_id, inputs = descriptor.inputs.len(), "Finished committed merge");
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MergeError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeKind;
    use crate::tsfile::tmp_path;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::write(path, b"data").unwrap();
    }

    fn setup(dir: &Path) -> TaskDescriptor {
        let inputs = vec![dir.join("a.tsfile"), dir.join("b.tsfile")];
        for input in &inputs {
            touch(input);
        }
        let output = dir.join("c.tsfile");
        TaskDescriptor {
            storage_group: "root.sg".into(),
            partition: 0,
            kind: MergeKind::Inner {
                level: 0,
                sequence: true,
            },
            inputs,
            output_tmp: tmp_path(&output),
            output,
            output_level: 1,
            target_sequence: true,
        }
    }

    fn manager(resume: bool) -> RecoveryManager {
        RecoveryManager::new(Arc::new(MergeConfig {
            continue_merge_after_reboot: resume,
            ..Default::default()
        }))
    }

    fn listing(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap() != MERGE_LOG_FILE)
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_running_task_is_rolled_back() {
        let temp_dir = TempDir::new().unwrap();
        let descriptor = setup(temp_dir.path());
        touch(&descriptor.output_tmp);

        let log = MergeLog::open(temp_dir.path().join(MERGE_LOG_FILE)).unwrap();
        let id = Uuid::new_v4();
        log.append(&MergeLogRecord::selected(id, descriptor.clone()))
            .unwrap();
        log.append(&MergeLogRecord::transition(id, MergeTaskState::Running))
            .unwrap();

        let report = manager(false).recover(&log).unwrap();
        assert_eq!(report.discarded, vec![id]);
        assert!(report.resumable.is_empty());
        assert_eq!(listing(temp_dir.path()), descriptor.inputs);
    }

    #[test]
    fn test_running_task_is_resumable() {
        let temp_dir = TempDir::new().unwrap();
        let descriptor = setup(temp_dir.path());

        let log = MergeLog::open(temp_dir.path().join(MERGE_LOG_FILE)).unwrap();
        let id = Uuid::new_v4();
        log.append(&MergeLogRecord::selected(id, descriptor.clone()))
            .unwrap();
        log.append(&MergeLogRecord::transition(id, MergeTaskState::Running))
            .unwrap();

        let report = manager(true).recover(&log).unwrap();
        assert_eq!(report.resumable, vec![descriptor]);
    }

    #[test]
    fn test_committed_task_is_rolled_forward() {
        let temp_dir = TempDir::new().unwrap();
        let descriptor = setup(temp_dir.path());
        touch(&descriptor.output_tmp);

        let log = MergeLog::open(temp_dir.path().join(MERGE_LOG_FILE)).unwrap();
        let id = Uuid::new_v4();
        log.append(&MergeLogRecord::selected(id, descriptor.clone()))
            .unwrap();
        log.append(&MergeLogRecord::transition(id, MergeTaskState::Running))
            .unwrap();
        log.append(&MergeLogRecord::transition(id, MergeTaskState::Committed))
            .unwrap();

        let report = manager(false).recover(&log).unwrap();
        assert_eq!(report.completed, vec![id]);
        assert_eq!(listing(temp_dir.path()), vec![descriptor.output.clone()]);
        assert!(MergeLog::replay(log.path()).unwrap().is_empty());
    }

    #[test]
    fn test_committed_with_consumed_output_drops_inputs() {
        let temp_dir = TempDir::new().unwrap();
        let descriptor = setup(temp_dir.path());
        // Any snapshot-pinned input left behind by the merge that consumed the output
        let later = temp_dir.path().join("d.tsfile");
        touch(&later);

        let log = MergeLog::open(temp_dir.path().join(MERGE_LOG_FILE)).unwrap();
        let id = Uuid::new_v4();
        log.append(&MergeLogRecord::selected(id, descriptor.clone()))
            .unwrap();
        log.append(&MergeLogRecord::transition(id, MergeTaskState::Running))
            .unwrap();
        log.append(&MergeLogRecord::transition(id, MergeTaskState::Committed))
            .unwrap();

        let report = manager(true).recover(&log).unwrap();
        assert_eq!(report.completed, vec![id]);
        assert!(report.resumable.is_empty());
        assert_eq!(listing(temp_dir.path()), vec![later]);
    }

    #[test]
    fn test_failed_task_is_not_resumed() {
        let temp_dir = TempDir::new().unwrap();
        let descriptor = setup(temp_dir.path());
        touch(&descriptor.output_tmp);
        touch(&descriptor.output);

        // A second unfinished task keeps the log from being truncated
        let mut pending = descriptor.clone();
        pending.output = temp_dir.path().join("e.tsfile");
        pending.output_tmp = tmp_path(&pending.output);

        let log = MergeLog::open(temp_dir.path().join(MERGE_LOG_FILE)).unwrap();
        let id = Uuid::new_v4();
        log.append(&MergeLogRecord::selected(Uuid::new_v4(), pending))
            .unwrap();
        log.append(&MergeLogRecord::selected(id, descriptor.clone()))
            .unwrap();
        for state in [
            MergeTaskState::Running,
            MergeTaskState::Committed,
            MergeTaskState::Failed,
        ] {
            log.append(&MergeLogRecord::transition(id, state)).unwrap();
        }

        let report = manager(true).recover(&log).unwrap();
        assert!(report.resumable.is_empty());
        assert_eq!(listing(temp_dir.path()), descriptor.inputs);
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let descriptor = setup(temp_dir.path());
        touch(&descriptor.output_tmp);
        let log_path = temp_dir.path().join(MERGE_LOG_FILE);

        let records = {
            let id = Uuid::new_v4();
            vec![
                MergeLogRecord::selected(id, descriptor.clone()),
                MergeLogRecord::transition(id, MergeTaskState::Running),
                MergeLogRecord::transition(id, MergeTaskState::Committed),
            ]
        };
        let log = MergeLog::open(&log_path).unwrap();
        for record in &records {
            log.append(record).unwrap();
        }
        manager(false).recover(&log).unwrap();
        let after_first = listing(temp_dir.path());

        // Crash before the log was truncated: the same records are replayed again
        for record in &records {
            log.append(record).unwrap();
        }
        manager(false).recover(&log).unwrap();
        assert_eq!(listing(temp_dir.path()), after_first);

        let report = manager(false).recover(&log).unwrap();
        assert!(report.is_empty());
        assert_eq!(listing(temp_dir.path()), after_first);
    }

    #[test]
    fn test_cleaned_task_needs_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let descriptor = setup(temp_dir.path());

        let log = MergeLog::open(temp_dir.path().join(MERGE_LOG_FILE)).unwrap();
        let id = Uuid::new_v4();
        log.append(&MergeLogRecord::selected(id, descriptor.clone()))
            .unwrap();
        log.append(&MergeLogRecord::transition(id, MergeTaskState::Committed))
            .unwrap();
        log.append(&MergeLogRecord::transition(id, MergeTaskState::Cleaned))
            .unwrap();

        let report = manager(false).recover(&log).unwrap();
        assert!(report.is_empty());
        assert_eq!(listing(temp_dir.path()), descriptor.inputs);
    }
}
