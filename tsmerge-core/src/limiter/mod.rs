//! Throughput limiter for background merges
//!
//! Two independent token buckets meter the bytes merges read from and write to
//! disk. Foreground reads and writes never pass through here.

mod bucket;

pub use bucket::TokenBucket;

use crate::config::MergeConfig;
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Direction of a metered I/O operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Read and write governors shared by every running merge task
pub struct ThroughputLimiter {
    read: TokenBucket,
    write: TokenBucket,
}

impl ThroughputLimiter {
    /// Create a limiter from byte rates; 0 disables a direction
    pub fn new(read_bytes_per_sec: u64, write_bytes_per_sec: u64, refill: Duration) -> Self {
        Self {
            read: TokenBucket::new(read_bytes_per_sec, refill),
            write: TokenBucket::new(write_bytes_per_sec, refill),
        }
    }

    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(
            config.merge_read_throughput_mb_per_sec * MB,
            config.merge_write_throughput_mb_per_sec * MB,
            config.limiter_refill_interval(),
        )
    }

    /// A limiter that never blocks
    pub fn unlimited() -> Self {
        Self::new(0, 0, Duration::from_millis(100))
    }

    /// Block the calling merge thread until `bytes` may be transferred
    pub fn consume(&self, bytes: u64, direction: IoDirection) -> Duration {
        let waited = self.bucket(direction).consume(bytes);
        if waited > Duration::from_millis(500) {
            tracing::debug!(
                ?direction,
                bytes,
                waited_ms = waited.as_millis() as u64,
                "Merge I/O throttled"
            );
        }
        waited
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            read_bytes: self.read.total_consumed(),
            write_bytes: self.write.total_consumed(),
            read_throttled: self.read.total_wait(),
            write_throttled: self.write.total_wait(),
        }
    }

    fn bucket(&self, direction: IoDirection) -> &TokenBucket {
        match direction {
            IoDirection::Read => &self.read,
            IoDirection::Write => &self.write,
        }
    }
}

/// Cumulative limiter counters
#[derive(Debug, Clone, Default)]
pub struct LimiterStats {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_throttled: Duration,
    pub write_throttled: Duration,
}
