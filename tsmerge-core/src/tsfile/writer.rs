//! TsFile writer

use super::{
    tmp_path, verify_frame, Chunk, ChunkMeta, FileHeader, TsFileMeta, FORMAT_VERSION, MAGIC,
};
use crate::limiter::{IoDirection, ThroughputLimiter};
use crate::{MergeError, Result, SeriesKey, TimeRange, TimeValue};
use bytes::{BufMut, BytesMut};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Streams chunks into a temporary file and seals it with an index
pub struct TsFileWriter {
    header: FileHeader,
    path: PathBuf,
    tmp: PathBuf,
    file: BufWriter<File>,
    offset: u64,

    // Index data
    index: Vec<ChunkMeta>,
    series: BTreeSet<SeriesKey>,

    // Stats
    time_range: TimeRange,
    point_count: u64,

    compress: bool,
    limiter: Option<Arc<ThroughputLimiter>>,
}

impl TsFileWriter {
    /// Create a writer for `header` inside `dir`
    pub fn create(dir: &Path, header: FileHeader, compress: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(header.file_name());
        let tmp = tmp_path(&path);
        let file = BufWriter::new(File::create(&tmp)?);

        let mut writer = Self {
            header,
            path,
            tmp,
            file,
            offset: 0,
            index: Vec::new(),
            series: BTreeSet::new(),
            time_range: TimeRange::empty(),
            point_count: 0,
            compress,
            limiter: None,
        };
        writer.write_header()?;
        Ok(writer)
    }

    /// Meter every write through `limiter`
    pub fn with_limiter(mut self, limiter: Arc<ThroughputLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Bytes written so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Encode `points` (strictly ascending timestamps) as one chunk
    pub fn write_points(&mut self, series: &SeriesKey, points: &[TimeValue]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let chunk = Chunk::new(series.clone(), points.to_vec());
        self.write_chunk(&chunk)
    }

    /// Encode a decoded chunk
    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        let frame = chunk.encode(self.compress)?;
        self.append_frame(&frame)
    }

    /// Copy an already encoded chunk frame without decoding it
    pub fn append_frame(&mut self, frame: &[u8]) -> Result<()> {
        let (chunk_header, _) = verify_frame(frame)?;

        self.write_bytes(frame)?;
        self.time_range = self.time_range.union(&chunk_header.time_range);
        self.point_count += chunk_header.point_count as u64;
        self.series.insert(chunk_header.series.clone());
        self.index.push(ChunkMeta {
            series: chunk_header.series,
            offset: self.offset - frame.len() as u64,
            size: frame.len() as u32,
            point_count: chunk_header.point_count,
            time_range: chunk_header.time_range,
        });
        Ok(())
    }

    /// Write index and footer, fsync, and return the still unpublished file
    pub fn finish(mut self) -> Result<PendingTsFile> {
        let index_offset = self.offset;
        let index_len = self.write_index()?;
        self.write_footer(index_offset, index_len)?;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        let meta = TsFileMeta {
            path: self.path,
            id: self.header.id,
            version: self.header.version,
            storage_group: self.header.storage_group,
            partition: self.header.partition,
            level: self.header.level,
            sequence: self.header.sequence,
            time_range: self.time_range,
            file_size: self.offset,
            chunk_count: self.index.len(),
            series_count: self.series.len(),
            point_count: self.point_count,
        };

        Ok(PendingTsFile { meta, tmp: self.tmp })
    }

    /// Drop the partially written file
    pub fn abort(self) {
        let tmp = self.tmp.clone();
        drop(self.file);
        if let Err(e) = fs::remove_file(&tmp) {
            tracing::warn!("Failed to remove aborted TsFile {:?}: {}", tmp, e);
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            limiter.consume(bytes.len() as u64, IoDirection::Write);
        }
        self.file.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let encoded = bincode::serialize(&self.header)?;

        let mut buf = BytesMut::with_capacity(encoded.len() + 16);
        buf.put_slice(MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u32_le(encoded.len() as u32);
        buf.put_slice(&encoded);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        self.write_bytes(&buf)
    }

    fn write_index(&mut self) -> Result<u64> {
        let encoded = bincode::serialize(&self.index)?;

        let mut buf = BytesMut::with_capacity(encoded.len() + 4);
        buf.put_slice(&encoded);
        buf.put_u32_le(crc32fast::hash(&encoded));

        self.write_bytes(&buf)?;
        Ok(buf.len() as u64)
    }

    fn write_footer(&mut self, index_offset: u64, index_len: u64) -> Result<()> {
        let mut buf = BytesMut::with_capacity(super::FOOTER_SIZE as usize);
        buf.put_u64_le(index_offset);
        buf.put_u64_le(index_len);
        // Magic number at end for validation
        buf.put_slice(MAGIC);

        self.write_bytes(&buf)
    }
}

/// A sealed TsFile still living under its temporary name
#[derive(Debug)]
pub struct PendingTsFile {
    meta: TsFileMeta,
    tmp: PathBuf,
}

impl PendingTsFile {
    /// Metadata the file will have once published
    pub fn meta(&self) -> &TsFileMeta {
        &self.meta
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp
    }

    /// Atomically move the file to its final name
    pub fn publish(self) -> Result<TsFileMeta> {
        fs::rename(&self.tmp, &self.meta.path)?;
        if let Some(dir) = self.meta.path.parent() {
            sync_dir(dir);
        }
        Ok(self.meta)
    }

    /// Delete the temporary file
    pub fn discard(self) -> Result<()> {
        match fs::remove_file(&self.tmp) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MergeError::Io(e)),
        }
    }
}

/// Best-effort fsync of a directory so renames survive a crash
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
