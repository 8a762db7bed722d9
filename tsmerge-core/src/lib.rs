//! TsMerge Core - Compaction Engine for Time-Series Files
//!
//! Owns the immutable TsFiles of every storage group and time partition and
//! rewrites them in the background into fewer, larger files:
//! - Level-based promotion of sequence and unsequence files
//! - Cross merges folding out-of-order data into the sequence files it overlaps
//! - Crash-safe commits through a durable merge log
//!
//! # Architecture
//!
//! - **File Set**: per-partition level sets, snapshots and deferred deletion
//! - **Selector**: scores windows of candidate files under a time budget
//! - **Merge**: plans each series and writes the merged output
//! - **Limiter**: token buckets capping merge read and write throughput
//! - **Recovery**: replays the merge log so every merge is all or nothing
//! - **Engine**: schedules merge tasks on a bounded worker pool

pub mod config;
pub mod engine;
pub mod fileset;
pub mod limiter;
pub mod merge;
pub mod metrics;
pub mod recovery;
pub mod selector;
pub mod tsfile;

mod error;
mod types;

pub use config::{FileManagementStrategy, MergeConfig};
pub use engine::{ForceMergeReport, MergeEngine, PartitionLevels};
pub use error::{MergeError, Result};
pub use metrics::{EngineStats, MetricsSnapshot};
pub use selector::MergeFileStrategy;
pub use types::*;

/// TsMerge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
