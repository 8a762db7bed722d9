//! Self-describing chunk frames
//!
//! Frame layout (little endian):
//! - 2 bytes: series key length, then the canonical series key
//! - 4 bytes: point count
//! - 8 + 8 bytes: first and last timestamp
//! - 1 byte: LZ4 flag
//! - 4 bytes: payload length, then the payload (bincode `Vec<TimeValue>`)
//! - 4 bytes: CRC32 of everything before it
//!
//! Because a frame carries its own header and checksum it can be copied
//! byte-for-byte into another file.

use crate::{MergeError, Result, SeriesKey, TimeRange, TimeValue};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Decoded header of a chunk frame
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHeader {
    pub series: SeriesKey,
    pub point_count: u32,
    pub time_range: TimeRange,
    pub compressed: bool,
    pub payload_len: u32,
}

/// A decoded chunk: the points of one series in timestamp order
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub series: SeriesKey,
    pub points: Vec<TimeValue>,
}

impl Chunk {
    pub fn new(series: SeriesKey, points: Vec<TimeValue>) -> Self {
        Self { series, points }
    }

    pub fn time_range(&self) -> TimeRange {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => TimeRange::new(first.timestamp, last.timestamp),
            _ => TimeRange::empty(),
        }
    }

    /// Serialize into a frame
    pub fn encode(&self, compress: bool) -> Result<Bytes> {
        if self.points.is_empty() {
            return Err(MergeError::InvalidFormat("empty chunk".into()));
        }
        if self
            .points
            .windows(2)
            .any(|w| w[0].timestamp >= w[1].timestamp)
        {
            return Err(MergeError::InvalidFormat(format!(
                "chunk of {} is not strictly ordered by timestamp",
                self.series
            )));
        }

        let raw = bincode::serialize(&self.points)?;
        let payload = if compress {
            lz4_flex::compress_prepend_size(&raw)
        } else {
            raw
        };
        let key = self.series.canonical();
        let key_len = u16::try_from(key.len()).map_err(|_| {
            MergeError::InvalidFormat(format!("series key of {} bytes is too long", key.len()))
        })?;
        let range = self.time_range();

        let mut buf = BytesMut::with_capacity(key.len() + payload.len() + 35);
        buf.put_u16_le(key_len);
        buf.put_slice(key.as_bytes());
        buf.put_u32_le(self.points.len() as u32);
        buf.put_i64_le(range.start);
        buf.put_i64_le(range.end);
        buf.put_u8(compress as u8);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        Ok(buf.freeze())
    }

    /// Deserialize a frame, verifying its checksum
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (header, payload_start) = verify_frame(frame)?;
        let payload = &frame[payload_start..payload_start + header.payload_len as usize];

        let raw = if header.compressed {
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| MergeError::Compression(e.to_string()))?
        } else {
            payload.to_vec()
        };
        let points: Vec<TimeValue> = bincode::deserialize(&raw)?;
        if points.len() != header.point_count as usize {
            return Err(MergeError::Decode(format!(
                "chunk of {} declares {} points but holds {}",
                header.series,
                header.point_count,
                points.len()
            )));
        }

        Ok(Self {
            series: header.series,
            points,
        })
    }
}

/// Parse a frame header and check the trailing CRC without decoding the payload.
///
/// Returns the header and the offset of the payload inside the frame.
pub fn verify_frame(frame: &[u8]) -> Result<(ChunkHeader, usize)> {
    if frame.len() < 2 {
        return Err(MergeError::InvalidFormat("Chunk too short".into()));
    }
    let mut cursor = std::io::Cursor::new(frame);

    let key_len = cursor.get_u16_le() as usize;
    let pos = cursor.position() as usize;
    // key + count + range + flag + payload length + crc
    if frame.len() < pos + key_len + 4 + 16 + 1 + 4 + 4 {
        return Err(MergeError::InvalidFormat("Chunk header truncated".into()));
    }
    let key = std::str::from_utf8(&frame[pos..pos + key_len])
        .map_err(|e| MergeError::InvalidFormat(e.to_string()))?;
    let series = SeriesKey::parse(key)
        .ok_or_else(|| MergeError::InvalidFormat(format!("bad series key {:?}", key)))?;
    cursor.set_position((pos + key_len) as u64);

    let point_count = cursor.get_u32_le();
    let start = cursor.get_i64_le();
    let end = cursor.get_i64_le();
    let compressed = cursor.get_u8() == 1;
    let payload_len = cursor.get_u32_le();
    let payload_start = cursor.position() as usize;

    let checksum_pos = payload_start + payload_len as usize;
    if checksum_pos + 4 != frame.len() {
        return Err(MergeError::InvalidFormat(format!(
            "Chunk frame length {} does not match payload length {}",
            frame.len(),
            payload_len
        )));
    }
    let expected = (&frame[checksum_pos..]).get_u32_le();
    let actual = crc32fast::hash(&frame[..checksum_pos]);
    if expected != actual {
        return Err(MergeError::ChecksumMismatch { expected, actual });
    }

    Ok((
        ChunkHeader {
            series,
            point_count,
            time_range: TimeRange::new(start, end),
            compressed,
            payload_len,
        },
        payload_start,
    ))
}
