//! Merge tasks: planning and execution

mod executor;
mod plan;
mod task;

pub use executor::MergeExecutor;
pub use plan::{merge_points, ChunkAction, ChunkMergePlan, PlanThresholds, SourceChunk};
pub use task::{MergeKind, MergeTask, MergeTaskState, Recency};
