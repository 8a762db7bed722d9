//! Per-series chunk merge planning
//!
//! Chunks of a series are clustered by overlapping time ranges. A cluster of
//! one large chunk is copied as is; everything else is decoded, merged
//! last-write-wins and re-chunked. Small neighbours are coalesced until the
//! buffer reaches `chunk_merge_point_threshold` points.

use super::Recency;
use crate::config::MergeConfig;
use crate::tsfile::ChunkMeta;
use crate::{SeriesKey, TimeValue, Timestamp};
use std::collections::BTreeMap;

/// A chunk of one input file
#[derive(Debug, Clone, PartialEq)]
pub struct SourceChunk {
    /// Index of the input in the task
    pub input: usize,
    pub recency: Recency,
    pub meta: ChunkMeta,
}

/// What to do with a group of input chunks
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkAction {
    /// Copy the encoded frame without decoding it
    Append(SourceChunk),
    /// Decode, merge last-write-wins, and write the result as one chunk
    Rewrite(Vec<SourceChunk>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanThresholds {
    pub chunk_merge_points: usize,
    pub page_points: usize,
}

impl PlanThresholds {
    pub fn from_config(config: &MergeConfig) -> Self {
        Self {
            chunk_merge_points: config.chunk_merge_point_threshold,
            page_points: config.merge_page_point_threshold,
        }
    }
}

/// Ordered actions producing the merged chunks of one series
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMergePlan {
    pub series: SeriesKey,
    pub actions: Vec<ChunkAction>,
}

impl ChunkMergePlan {
    pub fn build(
        series: SeriesKey,
        mut chunks: Vec<SourceChunk>,
        thresholds: PlanThresholds,
    ) -> Self {
        chunks.sort_by_key(|c| (c.meta.time_range.start, c.recency));

        let mut actions = Vec::new();
        let mut pending: Vec<SourceChunk> = Vec::new();
        let mut pending_points = 0usize;

        for cluster in cluster_overlapping(chunks) {
            if let [single] = cluster.as_slice() {
                let points = single.meta.point_count as usize;
                if points >= thresholds.chunk_merge_points {
                    flush(&mut actions, &mut pending, &mut pending_points);
                    if points >= thresholds.page_points {
                        actions.push(ChunkAction::Append(single.clone()));
                    } else {
                        actions.push(ChunkAction::Rewrite(vec![single.clone()]));
                    }
                    continue;
                }
            }

            pending_points += cluster.iter().map(|c| c.meta.point_count as usize).sum::<usize>();
            pending.extend(cluster);
            if pending_points >= thresholds.chunk_merge_points {
                flush(&mut actions, &mut pending, &mut pending_points);
            }
        }
        flush(&mut actions, &mut pending, &mut pending_points);

        Self { series, actions }
    }

    pub fn appended_chunks(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, ChunkAction::Append(_)))
            .count()
    }

    pub fn rewritten_chunks(&self) -> usize {
        self.actions
            .iter()
            .map(|a| match a {
                ChunkAction::Rewrite(group) => group.len(),
                ChunkAction::Append(_) => 0,
            })
            .sum()
    }
}

fn flush(actions: &mut Vec<ChunkAction>, pending: &mut Vec<SourceChunk>, points: &mut usize) {
    if !pending.is_empty() {
        actions.push(ChunkAction::Rewrite(std::mem::take(pending)));
    }
    *points = 0;
}

/// Split time-sorted chunks into maximal groups of transitively overlapping ranges
fn cluster_overlapping(chunks: Vec<SourceChunk>) -> Vec<Vec<SourceChunk>> {
    let mut clusters: Vec<Vec<SourceChunk>> = Vec::new();
    let mut cluster_end = Timestamp::MIN;

    for chunk in chunks {
        match clusters.last_mut() {
            Some(cluster) if chunk.meta.time_range.start <= cluster_end => {
                cluster_end = cluster_end.max(chunk.meta.time_range.end);
                cluster.push(chunk);
            }
            _ => {
                cluster_end = chunk.meta.time_range.end;
                clusters.push(vec![chunk]);
            }
        }
    }
    clusters
}

/// Merge point lists; for equal timestamps the most recent source wins
pub fn merge_points(mut sources: Vec<(Recency, Vec<TimeValue>)>) -> Vec<TimeValue> {
    sources.sort_by_key(|(recency, _)| *recency);

    let mut merged: BTreeMap<Timestamp, TimeValue> = BTreeMap::new();
    for (_, points) in sources {
        for point in points {
            merged.insert(point.timestamp, point);
        }
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldValue, TimeRange};

    const THRESHOLDS: PlanThresholds = PlanThresholds {
        chunk_merge_points: 100,
        page_points: 50,
    };

    fn chunk(input: usize, start: i64, end: i64, points: u32) -> SourceChunk {
        SourceChunk {
            input,
            recency: Recency {
                unsequence: false,
                version: input as u64,
                input_order: input,
            },
            meta: ChunkMeta {
                series: SeriesKey::new("m", "f"),
                offset: 0,
                size: 0,
                point_count: points,
                time_range: TimeRange::new(start, end),
            },
        }
    }

    fn plan(chunks: Vec<SourceChunk>, thresholds: PlanThresholds) -> ChunkMergePlan {
        ChunkMergePlan::build(SeriesKey::new("m", "f"), chunks, thresholds)
    }

    #[test]
    fn test_large_disjoint_chunks_are_appended() {
        let p = plan(
            vec![chunk(1, 200, 300, 150), chunk(0, 0, 100, 120)],
            THRESHOLDS,
        );
        assert_eq!(p.appended_chunks(), 2);
        assert_eq!(p.rewritten_chunks(), 0);
        // Output stays in time order
        match &p.actions[0] {
            ChunkAction::Append(c) => assert_eq!(c.input, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_small_chunks_are_coalesced() {
        let p = plan(
            vec![
                chunk(0, 0, 10, 40),
                chunk(1, 20, 30, 40),
                chunk(2, 40, 50, 40),
                chunk(3, 60, 70, 40),
            ],
            THRESHOLDS,
        );
        // 40 + 40 + 40 reaches 100, the last chunk goes into a second group
        assert_eq!(p.actions.len(), 2);
        assert_eq!(p.rewritten_chunks(), 4);
        match &p.actions[0] {
            ChunkAction::Rewrite(group) => assert_eq!(group.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_large_chunks_are_rewritten() {
        let p = plan(vec![chunk(0, 0, 100, 500), chunk(1, 50, 150, 500)], THRESHOLDS);
        assert_eq!(p.appended_chunks(), 0);
        assert_eq!(p.actions.len(), 1);
        assert_eq!(p.rewritten_chunks(), 2);
    }

    #[test]
    fn test_small_buffer_flushed_before_append() {
        let p = plan(
            vec![chunk(0, 0, 10, 5), chunk(1, 20, 30, 500), chunk(2, 40, 50, 5)],
            THRESHOLDS,
        );
        assert_eq!(p.actions.len(), 3);
        assert!(matches!(p.actions[0], ChunkAction::Rewrite(_)));
        assert!(matches!(p.actions[1], ChunkAction::Append(_)));
        assert!(matches!(p.actions[2], ChunkAction::Rewrite(_)));
    }

    #[test]
    fn test_large_chunk_below_page_threshold_rewritten_alone() {
        let thresholds = PlanThresholds {
            chunk_merge_points: 10,
            page_points: 1000,
        };
        let p = plan(vec![chunk(0, 0, 10, 3), chunk(1, 20, 30, 500)], thresholds);
        assert_eq!(p.actions.len(), 2);
        match &p.actions[1] {
            ChunkAction::Rewrite(group) => assert_eq!(group.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_merge_points_last_write_wins() {
        let old = Recency {
            unsequence: false,
            version: 5,
            input_order: 0,
        };
        let new = Recency {
            unsequence: true,
            version: 1,
            input_order: 1,
        };
        let merged = merge_points(vec![
            (new, vec![TimeValue::new(5, 99.0)]),
            (old, vec![TimeValue::new(1, 1.0), TimeValue::new(5, 5.0), TimeValue::new(9, 9.0)]),
        ]);

        let timestamps: Vec<_> = merged.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![1, 5, 9]);
        assert_eq!(merged[1].value, FieldValue::Float(99.0));
    }
}
