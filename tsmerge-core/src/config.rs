//! Merge engine configuration
//!
//! A `MergeConfig` is built once at startup, validated, and shared as
//! `Arc<MergeConfig>` with every component. Nothing mutates it afterwards.

use crate::selector::MergeFileStrategy;
use crate::{MergeError, PartitionId, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How files are arranged into levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileManagementStrategy {
    /// Files are promoted level by level; the top unsequence level feeds cross merges
    Level,
    /// Every file stays at level 0; only unsequence-to-sequence merges run
    Normal,
}

impl Default for FileManagementStrategy {
    fn default() -> Self {
        FileManagementStrategy::Level
    }
}

/// Merge engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Root directory holding `<storage_group>/<partition>/*.tsfile` and the merge log
    pub data_dir: PathBuf,
    /// Max sequence files in one level before it is merged into the next
    pub seq_file_num_in_each_level: usize,
    /// Number of sequence levels
    pub seq_level_num: u32,
    /// Max unsequence files in one level before it is merged into the next
    pub unseq_file_num_in_each_level: usize,
    /// Number of unsequence levels
    pub unseq_level_num: u32,
    /// Chunks with fewer points are combined with their neighbours up to this size
    pub chunk_merge_point_threshold: usize,
    /// Non-overlapping chunks with at least this many points are copied without decoding
    pub merge_page_point_threshold: usize,
    /// Inner merges of at least this many points are written straight to the top level
    pub merge_chunk_point_number_threshold: u64,
    /// Soft ceiling for memory held by concurrently running merges
    pub merge_memory_budget: u64,
    /// Read throughput cap for merges, 0 = unlimited
    pub merge_read_throughput_mb_per_sec: u64,
    /// Write throughput cap for merges, 0 = unlimited
    pub merge_write_throughput_mb_per_sec: u64,
    /// Wall-clock budget for one candidate selection
    pub merge_file_selection_time_budget_ms: u64,
    /// Number of merge tasks allowed to run at once
    pub hot_compaction_threads: usize,
    /// Number of threads processing series inside one merge task
    pub merge_chunk_sub_threads: usize,
    /// Rewrite every sequence file regardless of unsequence overlap
    pub force_full_merge: bool,
    /// Re-run merges that were interrupted by a crash
    pub continue_merge_after_reboot: bool,
    /// Cost function used by the candidate selector
    pub merge_file_strategy: MergeFileStrategy,
    /// Level layout strategy
    pub file_management_strategy: FileManagementStrategy,
    /// Period of the global merge round, 0 = disabled
    pub merge_interval_secs: u64,
    /// Split storage groups into time partitions
    pub enable_partition: bool,
    /// Time partition width in seconds
    pub partition_interval_secs: u64,
    /// LZ4-compress chunk payloads of newly written chunks
    pub compress_chunks: bool,
    /// Token bucket refill interval
    pub limiter_refill_interval_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            seq_file_num_in_each_level: 10,
            seq_level_num: 4,
            unseq_file_num_in_each_level: 10,
            unseq_level_num: 2,
            chunk_merge_point_threshold: 20480,
            merge_page_point_threshold: 1000,
            merge_chunk_point_number_threshold: 100_000,
            merge_memory_budget: 512 * 1024 * 1024, // 512MB
            merge_read_throughput_mb_per_sec: 16,
            merge_write_throughput_mb_per_sec: 16,
            merge_file_selection_time_budget_ms: 30 * 1000,
            hot_compaction_threads: 4,
            merge_chunk_sub_threads: 4,
            force_full_merge: false,
            continue_merge_after_reboot: false,
            merge_file_strategy: MergeFileStrategy::default(),
            file_management_strategy: FileManagementStrategy::default(),
            merge_interval_secs: 0,
            enable_partition: false,
            partition_interval_secs: 604800,
            compress_chunks: true,
            limiter_refill_interval_ms: 100,
        }
    }
}

impl MergeConfig {
    /// Default configuration rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON document; missing keys take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: MergeConfig =
            serde_json::from_str(json).map_err(|e| MergeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.seq_file_num_in_each_level == 0 || self.unseq_file_num_in_each_level == 0 {
            return Err(MergeError::Config(
                "file num in each level must be positive".into(),
            ));
        }
        if self.seq_level_num == 0 || self.unseq_level_num == 0 {
            return Err(MergeError::Config("level num must be positive".into()));
        }
        if self.hot_compaction_threads == 0 || self.merge_chunk_sub_threads == 0 {
            return Err(MergeError::Config("thread counts must be positive".into()));
        }
        if self.merge_page_point_threshold == 0
            || self.chunk_merge_point_threshold == 0
            || self.merge_chunk_point_number_threshold == 0
        {
            return Err(MergeError::Config("point thresholds must be positive".into()));
        }
        if self.enable_partition && self.partition_interval_secs == 0 {
            return Err(MergeError::Config(
                "partition interval must be positive when partitioning is enabled".into(),
            ));
        }
        if self.limiter_refill_interval_ms == 0 || self.limiter_refill_interval_ms > 1000 {
            return Err(MergeError::Config(
                "limiter refill interval must be within 1..=1000 ms".into(),
            ));
        }
        Ok(())
    }

    pub fn selection_time_budget(&self) -> Duration {
        Duration::from_millis(self.merge_file_selection_time_budget_ms)
    }

    pub fn merge_interval(&self) -> Option<Duration> {
        (self.merge_interval_secs > 0).then(|| Duration::from_secs(self.merge_interval_secs))
    }

    pub fn limiter_refill_interval(&self) -> Duration {
        Duration::from_millis(self.limiter_refill_interval_ms)
    }

    /// File-count cap of one level
    pub fn level_cap(&self, sequence: bool) -> usize {
        if sequence {
            self.seq_file_num_in_each_level
        } else {
            self.unseq_file_num_in_each_level
        }
    }

    /// Number of levels of the sequence or unsequence set
    pub fn level_num(&self, sequence: bool) -> u32 {
        match self.file_management_strategy {
            FileManagementStrategy::Normal => 1,
            FileManagementStrategy::Level if sequence => self.seq_level_num,
            FileManagementStrategy::Level => self.unseq_level_num,
        }
    }

    /// Time partition a timestamp (nanoseconds) belongs to
    pub fn partition_of(&self, ts: Timestamp) -> PartitionId {
        if !self.enable_partition {
            return 0;
        }
        let width = self.partition_interval_secs as i64 * 1_000_000_000;
        ts.max(0).div_euclid(width) as PartitionId
    }
}
