//! Merge task description and lifecycle

use crate::fileset::TsFileRecord;
use crate::recovery::TaskDescriptor;
use crate::selector::{MergeFileStrategy, Selection};
use crate::tsfile::{partition_dir, tmp_path, FileHeader};
use crate::{FileId, Level, PartitionId, StorageGroup};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// What a task merges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeKind {
    /// Files of one level promoted into the next level of the same set
    Inner { level: Level, sequence: bool },
    /// Top-level unsequence files merged into the sequence files they overlap
    Cross,
}

impl fmt::Display for MergeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeKind::Inner { level, sequence } => write!(
                f,
                "inner-{}-L{}",
                if *sequence { "seq" } else { "unseq" },
                level
            ),
            MergeKind::Cross => write!(f, "cross"),
        }
    }
}

/// Lifecycle of a merge task.
///
/// `Selected -> Running -> Committed -> Cleaned`. Any state before `Cleaned`
/// can move to `Failed`.
/// `Crashed` only exists after a restart found the task unfinished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeTaskState {
    Selected,
    Running,
    Committed,
    Cleaned,
    Failed,
    Crashed,
}

/// Position of an input in last-write-wins order. Greater is more recent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Recency {
    pub unsequence: bool,
    pub version: u64,
    pub input_order: usize,
}

/// One unit of merge work
#[derive(Debug)]
pub struct MergeTask {
    pub id: Uuid,
    pub storage_group: StorageGroup,
    pub partition: PartitionId,
    pub kind: MergeKind,
    /// Inputs, least recent first
    pub inputs: Vec<Arc<TsFileRecord>>,
    pub output_level: Level,
    pub target_sequence: bool,
    pub strategy: MergeFileStrategy,
    output: FileHeader,
    output_dir: PathBuf,
    state: MergeTaskState,
    created_at: Instant,
}

impl MergeTask {
    /// Build a task writing its output as file `output_id` under `data_dir`
    pub fn new(
        selection: Selection,
        output_id: FileId,
        data_dir: &Path,
        strategy: MergeFileStrategy,
    ) -> Self {
        let version = selection
            .files
            .iter()
            .map(|f| f.meta().version)
            .max()
            .unwrap_or(0);
        let output = FileHeader::new(
            output_id,
            version,
            selection.storage_group.clone(),
            selection.partition,
            selection.output_level,
            selection.target_sequence,
        );

        Self {
            id: Uuid::new_v4(),
            output_dir: partition_dir(data_dir, &selection.storage_group, selection.partition),
            storage_group: selection.storage_group,
            partition: selection.partition,
            kind: selection.kind,
            inputs: selection.files,
            output_level: selection.output_level,
            target_sequence: selection.target_sequence,
            strategy,
            output,
            state: MergeTaskState::Selected,
            created_at: Instant::now(),
        }
    }

    pub fn state(&self) -> MergeTaskState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: MergeTaskState) {
        tracing::debug!(
            task_id = %self.id,
            from = ?self.state,
            to = ?state,
            "Merge task transition"
        );
        self.state = state;
    }

    pub fn output_header(&self) -> &FileHeader {
        &self.output
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Final path of the output file
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(self.output.file_name())
    }

    pub fn input_ids(&self) -> Vec<FileId> {
        self.inputs.iter().map(|f| f.id()).collect()
    }

    /// Sum of input file sizes, used for memory admission
    pub fn estimated_memory(&self) -> u64 {
        self.inputs.iter().map(|f| f.meta().file_size).sum()
    }

    pub fn input_points(&self) -> u64 {
        self.inputs.iter().map(|f| f.meta().point_count).sum()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Recency of input `index`
    pub fn recency(&self, index: usize) -> Recency {
        let meta = self.inputs[index].meta();
        Recency {
            unsequence: !meta.sequence,
            version: meta.version,
            input_order: index,
        }
    }

    /// Durable description for the merge log
    pub fn descriptor(&self) -> TaskDescriptor {
        let output = self.output_path();
        TaskDescriptor {
            storage_group: self.storage_group.clone(),
            partition: self.partition,
            kind: self.kind,
            inputs: self.inputs.iter().map(|f| f.meta().path.clone()).collect(),
            output_tmp: tmp_path(&output),
            output,
            output_level: self.output_level,
            target_sequence: self.target_sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileset::testing::record;

    #[test]
    fn test_task_from_selection() {
        let selection = Selection {
            storage_group: "root.sg".into(),
            partition: 3,
            kind: MergeKind::Inner {
                level: 0,
                sequence: true,
            },
            files: vec![record(4, 0, 10, 100, 1), record(7, 20, 30, 300, 1)],
            output_level: 1,
            target_sequence: true,
            score: 2.0,
            total_size: 400,
            windows_evaluated: 1,
            timed_out: false,
        };
        let task = MergeTask::new(selection, 9, Path::new("/data"), MergeFileStrategy::MaxFileNum);

        assert_eq!(task.state(), MergeTaskState::Selected);
        assert_eq!(task.output_header().version, 7);
        assert_eq!(task.output_header().level, 1);
        assert_eq!(task.estimated_memory(), 400);
        assert_eq!(task.input_ids(), vec![4, 7]);
        assert!(task.recency(1) > task.recency(0));

        let descriptor = task.descriptor();
        assert_eq!(descriptor.inputs.len(), 2);
        assert!(descriptor.output.starts_with("/data/root.sg/3"));
        assert_eq!(descriptor.output_tmp, tmp_path(&descriptor.output));
        assert_eq!(MergeKind::Cross.to_string(), "cross");
    }

    #[test]
    fn test_recency_order() {
        let seq_new = Recency {
            unsequence: false,
            version: 10,
            input_order: 0,
        };
        let unseq_old = Recency {
            unsequence: true,
            version: 1,
            input_order: 0,
        };
        assert!(unseq_old > seq_new);

        let later_input = Recency {
            input_order: 1,
            ..seq_new
        };
        assert!(later_input > seq_new);
    }
}
