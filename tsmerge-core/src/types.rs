//! Core types for TsMerge

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Storage group name (e.g. "root.sg1")
pub type StorageGroup = String;

/// Time partition number inside a storage group
pub type PartitionId = u64;

/// Stable identifier of a TsFile inside the file arena
pub type FileId = u64;

/// Compaction tier; 0 holds freshly flushed files
pub type Level = u32;

/// Series key combining measurement, tags and the field that a chunk stores
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Measurement name (e.g., "temperature", "cpu_usage")
    pub measurement: String,
    /// Sorted tags for consistent ordering
    pub tags: BTreeMap<String, String>,
    /// Field name
    pub field: String,
}

impl SeriesKey {
    /// Create a new series key
    pub fn new(measurement: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            field: field.into(),
        }
    }

    /// Add a tag to the series key
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        self.measurement.len()
            + self.field.len()
            + self
                .tags
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// Create a canonical string representation, used as the chunk index key
    pub fn canonical(&self) -> String {
        let mut s = self.measurement.clone();
        for (k, v) in &self.tags {
            s.push(',');
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s.push('#');
        s.push_str(&self.field);
        s
    }

    /// Parse the canonical form back into a key
    pub fn parse(canonical: &str) -> Option<Self> {
        let (series, field) = canonical.rsplit_once('#')?;
        let mut parts = series.split(',');
        let mut key = SeriesKey::new(parts.next()?, field);
        for tag in parts {
            let (k, v) = tag.split_once('=')?;
            key = key.with_tag(k, v);
        }
        Some(key)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Possible field value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 64-bit float
    Float(f64),
    /// 64-bit signed integer
    Integer(i64),
    /// Boolean
    Boolean(bool),
    /// String
    String(String),
}

impl FieldValue {
    /// Get the size in bytes
    pub fn size(&self) -> usize {
        match self {
            FieldValue::Float(_) => 8,
            FieldValue::Integer(_) => 8,
            FieldValue::Boolean(_) => 1,
            FieldValue::String(s) => s.len(),
        }
    }

    /// Get as f64 if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

/// A single point of one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeValue {
    /// Timestamp in nanoseconds
    pub timestamp: Timestamp,
    /// Field value
    pub value: FieldValue,
}

impl TimeValue {
    /// Create a new point
    pub fn new(timestamp: Timestamp, value: impl Into<FieldValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        8 + self.value.size()
    }
}

/// Inclusive time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Range that contains nothing; `union` with it yields the other operand
    pub fn empty() -> Self {
        Self {
            start: Timestamp::MAX,
            end: Timestamp::MIN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start <= other.end && self.end >= other.start
    }

    /// Smallest range covering both
    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Extend the range to cover `ts`
    pub fn extend(&mut self, ts: Timestamp) {
        self.start = self.start.min(ts);
        self.end = self.end.max(ts);
    }
}
