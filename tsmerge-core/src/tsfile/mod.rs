//! TsFile: immutable on-disk container of per-series chunks
//!
//! File layout:
//! - header: magic, format version, header length, bincode [`FileHeader`], CRC32
//! - chunk frames (see [`chunk`])
//! - index: bincode `Vec<ChunkMeta>`, CRC32
//! - footer: index offset, index length, magic
//!
//! Files are written under a `.tmp` name and only become `.tsfile` once
//! published, so a crash never leaves a half-written file under a live name.

mod chunk;
mod reader;
mod writer;

pub use chunk::{verify_frame, Chunk, ChunkHeader};
pub use reader::TsFileReader;
pub use writer::{PendingTsFile, TsFileWriter};
pub(crate) use writer::sync_dir;

use crate::{FileId, Level, PartitionId, SeriesKey, StorageGroup, TimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// TsFile magic bytes
pub const MAGIC: &[u8; 4] = b"TSMF";

/// TsFile format version
pub const FORMAT_VERSION: u32 = 1;

/// Extension of published files
pub const TSFILE_EXTENSION: &str = "tsfile";

/// Extension of files still being written
pub const TMP_EXTENSION: &str = "tmp";

/// Footer size: index offset + index length + magic
pub const FOOTER_SIZE: u64 = 8 + 8 + 4;

/// Identity of a TsFile, stored in its header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHeader {
    pub id: FileId,
    /// Write version; merges inherit the max version of their inputs
    pub version: u64,
    pub storage_group: StorageGroup,
    pub partition: PartitionId,
    pub level: Level,
    pub sequence: bool,
    pub created_at: DateTime<Utc>,
}

impl FileHeader {
    pub fn new(
        id: FileId,
        version: u64,
        storage_group: impl Into<StorageGroup>,
        partition: PartitionId,
        level: Level,
        sequence: bool,
    ) -> Self {
        Self {
            id,
            version,
            storage_group: storage_group.into(),
            partition,
            level,
            sequence,
            created_at: Utc::now(),
        }
    }

    /// Published file name: `{version}-{id}-L{level}-{seq|unseq}.tsfile`
    pub fn file_name(&self) -> String {
        format!(
            "{:020}-{:010}-L{}-{}.{}",
            self.version,
            self.id,
            self.level,
            if self.sequence { "seq" } else { "unseq" },
            TSFILE_EXTENSION
        )
    }
}

/// Location of one chunk inside a TsFile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub series: SeriesKey,
    pub offset: u64,
    pub size: u32,
    pub point_count: u32,
    pub time_range: TimeRange,
}

/// Metadata of a closed TsFile
#[derive(Debug, Clone, PartialEq)]
pub struct TsFileMeta {
    pub path: PathBuf,
    pub id: FileId,
    pub version: u64,
    pub storage_group: StorageGroup,
    pub partition: PartitionId,
    pub level: Level,
    pub sequence: bool,
    /// Min/max timestamp over all series
    pub time_range: TimeRange,
    pub file_size: u64,
    pub chunk_count: usize,
    pub series_count: usize,
    pub point_count: u64,
}

impl TsFileMeta {
    /// Check if the file may contain data in time range
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.time_range.overlaps(range)
    }
}

/// Directory holding the files of one storage group partition
pub fn partition_dir(data_dir: &Path, storage_group: &str, partition: PartitionId) -> PathBuf {
    data_dir.join(storage_group).join(partition.to_string())
}

/// Temporary path a file is written to before it is published
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(TMP_EXTENSION);
    PathBuf::from(name)
}

pub fn is_tsfile(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == TSFILE_EXTENSION)
}

pub fn is_tmp_file(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == TMP_EXTENSION)
}
