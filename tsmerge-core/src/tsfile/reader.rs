//! TsFile reader

use super::{
    verify_frame, Chunk, ChunkMeta, FileHeader, TsFileMeta, FOOTER_SIZE, FORMAT_VERSION, MAGIC,
};
use crate::limiter::{IoDirection, ThroughputLimiter};
use crate::{MergeError, Result, SeriesKey, TimeRange, TimeValue};
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Random-access reader over a published (or pending) TsFile
pub struct TsFileReader {
    path: PathBuf,
    meta: TsFileMeta,
    index: Vec<ChunkMeta>,
    file: Mutex<File>,
    limiter: Option<Arc<ThroughputLimiter>>,
}

impl TsFileReader {
    /// Open a TsFile, validating header, index and footer
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < 12 + FOOTER_SIZE {
            return Err(MergeError::InvalidFormat(format!(
                "TsFile {:?} too short ({} bytes)",
                path, file_size
            )));
        }

        let header = Self::read_header(&mut file)?;

        // Read footer
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;
        let mut cursor = &footer[..];
        let index_offset = cursor.get_u64_le();
        let index_len = cursor.get_u64_le();
        if cursor != MAGIC {
            return Err(MergeError::InvalidFormat("Invalid TsFile footer magic".into()));
        }
        let index_end = index_offset
            .checked_add(index_len)
            .and_then(|end| end.checked_add(FOOTER_SIZE));
        if index_len < 4 || index_end != Some(file_size) {
            return Err(MergeError::Corruption(format!(
                "TsFile {:?} index bounds do not match file size",
                path
            )));
        }

        // Read index
        file.seek(SeekFrom::Start(index_offset))?;
        let mut index_data = vec![0u8; index_len as usize];
        file.read_exact(&mut index_data)?;
        let index = Self::parse_index(&index_data)?;

        let mut time_range = TimeRange::empty();
        let mut point_count = 0u64;
        let mut series = std::collections::BTreeSet::new();
        for chunk in &index {
            time_range = time_range.union(&chunk.time_range);
            point_count += chunk.point_count as u64;
            series.insert(&chunk.series);
        }

        let meta = TsFileMeta {
            path: path.clone(),
            id: header.id,
            version: header.version,
            storage_group: header.storage_group,
            partition: header.partition,
            level: header.level,
            sequence: header.sequence,
            time_range,
            file_size,
            chunk_count: index.len(),
            series_count: series.len(),
            point_count,
        };

        Ok(Self {
            path,
            meta,
            index,
            file: Mutex::new(file),
            limiter: None,
        })
    }

    /// Meter every chunk read through `limiter`
    pub fn with_limiter(mut self, limiter: Arc<ThroughputLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Get TsFile metadata
    pub fn meta(&self) -> &TsFileMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All chunk metadata in file order
    pub fn chunk_metas(&self) -> &[ChunkMeta] {
        &self.index
    }

    /// Chunk metadata grouped by series, each list in file order
    pub fn chunks_by_series(&self) -> BTreeMap<SeriesKey, Vec<ChunkMeta>> {
        let mut grouped: BTreeMap<SeriesKey, Vec<ChunkMeta>> = BTreeMap::new();
        for chunk in &self.index {
            grouped
                .entry(chunk.series.clone())
                .or_default()
                .push(chunk.clone());
        }
        grouped
    }

    /// Read the raw frame of a chunk, verifying its checksum
    pub fn read_raw_chunk(&self, chunk: &ChunkMeta) -> Result<Bytes> {
        if let Some(limiter) = &self.limiter {
            limiter.consume(chunk.size as u64, IoDirection::Read);
        }

        let mut data = vec![0u8; chunk.size as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(chunk.offset))?;
            file.read_exact(&mut data)?;
        }

        let (header, _) = verify_frame(&data)?;
        if header.series != chunk.series || header.point_count != chunk.point_count {
            return Err(MergeError::Corruption(format!(
                "chunk at offset {} of {:?} does not match its index entry",
                chunk.offset, self.path
            )));
        }
        Ok(Bytes::from(data))
    }

    /// Read and decode a chunk
    pub fn read_chunk(&self, chunk: &ChunkMeta) -> Result<Chunk> {
        let frame = self.read_raw_chunk(chunk)?;
        Chunk::decode(&frame)
    }

    /// All points of a series in timestamp order
    pub fn read_series(&self, series: &SeriesKey) -> Result<Vec<TimeValue>> {
        let mut points = Vec::new();
        for chunk in self.index.iter().filter(|c| &c.series == series) {
            points.extend(self.read_chunk(chunk)?.points);
        }
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    /// Decode the whole file
    pub fn read_all(&self) -> Result<BTreeMap<SeriesKey, Vec<TimeValue>>> {
        let mut all = BTreeMap::new();
        for series in self.chunks_by_series().into_keys() {
            let points = self.read_series(&series)?;
            all.insert(series, points);
        }
        Ok(all)
    }

    /// Read only the header of a TsFile
    pub fn read_file_header(path: &Path) -> Result<FileHeader> {
        let mut file = File::open(path)?;
        Self::read_header(&mut file)
    }

    fn read_header(file: &mut File) -> Result<FileHeader> {
        file.seek(SeekFrom::Start(0))?;
        let mut prefix = [0u8; 12];
        file.read_exact(&mut prefix)?;

        let mut cursor = &prefix[..];
        if &cursor[..4] != MAGIC {
            return Err(MergeError::InvalidFormat("Invalid TsFile header".into()));
        }
        cursor.advance(4);
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(MergeError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }
        let header_len = cursor.get_u32_le() as usize;

        let mut body = vec![0u8; header_len + 4];
        file.read_exact(&mut body)?;
        let expected = (&body[header_len..]).get_u32_le();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&prefix);
        hasher.update(&body[..header_len]);
        let actual = hasher.finalize();
        if expected != actual {
            return Err(MergeError::ChecksumMismatch { expected, actual });
        }

        Ok(bincode::deserialize(&body[..header_len])?)
    }

    fn parse_index(data: &[u8]) -> Result<Vec<ChunkMeta>> {
        let (encoded, mut checksum) = data.split_at(data.len() - 4);
        let expected = checksum.get_u32_le();
        let actual = crc32fast::hash(encoded);
        if expected != actual {
            return Err(MergeError::ChecksumMismatch { expected, actual });
        }
        Ok(bincode::deserialize(encoded)?)
    }
}
