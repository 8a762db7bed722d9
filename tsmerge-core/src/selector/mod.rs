//! Candidate selection
//!
//! Given the files of an over-full level, pick the window of files whose
//! merge scores best under the configured [`MergeFileStrategy`]. Selection is
//! bounded by a wall-clock budget; when it runs out the best window seen so
//! far is used.

mod strategy;

pub use strategy::MergeFileStrategy;

use crate::config::MergeConfig;
use crate::fileset::{LevelCandidates, TsFileRecord};
use crate::merge::MergeKind;
use crate::{Level, PartitionId, StorageGroup, TimeRange};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Files chosen for one merge task
#[derive(Debug, Clone)]
pub struct Selection {
    pub storage_group: StorageGroup,
    pub partition: PartitionId,
    pub kind: MergeKind,
    /// Task inputs, least recent first
    pub files: Vec<Arc<TsFileRecord>>,
    pub output_level: Level,
    pub target_sequence: bool,
    pub score: f64,
    pub total_size: u64,
    pub windows_evaluated: usize,
    /// The time budget ran out before every window was scored
    pub timed_out: bool,
}

/// Scores candidate windows and keeps the best one
#[derive(Debug, Clone)]
pub struct CandidateSelector {
    strategy: MergeFileStrategy,
    time_budget: Duration,
    force_full: bool,
    top_level: Option<TopLevelShortcut>,
}

/// Inner merges of at least `points` points skip the intermediate levels
#[derive(Debug, Clone, Copy)]
struct TopLevelShortcut {
    points: u64,
    seq_top: Level,
    unseq_top: Level,
}

struct Best {
    files: Vec<Arc<TsFileRecord>>,
    output_level: Level,
    score: f64,
    total_size: u64,
}

impl CandidateSelector {
    pub fn new(strategy: MergeFileStrategy, time_budget: Duration, force_full: bool) -> Self {
        Self {
            strategy,
            time_budget,
            force_full,
            top_level: None,
        }
    }

    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(
            config.merge_file_strategy,
            config.selection_time_budget(),
            config.force_full_merge,
        )
        .with_top_level_threshold(
            config.merge_chunk_point_number_threshold,
            config.level_num(true) - 1,
            config.level_num(false) - 1,
        )
    }

    /// Send inner merges of at least `points` points to the top sequence or unsequence level
    pub fn with_top_level_threshold(
        mut self,
        points: u64,
        seq_top: Level,
        unseq_top: Level,
    ) -> Self {
        self.top_level = Some(TopLevelShortcut {
            points,
            seq_top,
            unseq_top,
        });
        self
    }

    pub fn strategy(&self) -> MergeFileStrategy {
        self.strategy
    }

    /// First candidate level that yields a selection
    pub fn select_first(&self, candidates: &[LevelCandidates]) -> Option<Selection> {
        candidates.iter().find_map(|c| self.select(c))
    }

    /// Best window of `candidates`, or `None` if no window of at least `cap` files qualifies
    pub fn select(&self, candidates: &LevelCandidates) -> Option<Selection> {
        let files = &candidates.files;
        let cap = candidates.cap.max(1);
        if files.len() < cap {
            return None;
        }

        let deadline = Instant::now() + self.time_budget;
        let mut best: Option<Best> = None;
        let mut evaluated = 0;
        let mut timed_out = false;

        match candidates.kind {
            MergeKind::Inner {
                level,
                sequence: true,
            } => {
                // Contiguous, time ordered windows whose hull touches no other sequence file
                'outer: for start in 0..files.len() {
                    let mut hull = TimeRange::empty();
                    for end in start..files.len() {
                        hull = hull.union(&files[end].meta().time_range);
                        if candidates.siblings.iter().any(|s| s.meta().overlaps(&hull)) {
                            break;
                        }
                        if end + 1 - start < cap {
                            continue;
                        }
                        self.consider(&mut best, files[start..=end].to_vec(), level + 1);
                        evaluated += 1;
                        if Instant::now() >= deadline {
                            timed_out = true;
                            break 'outer;
                        }
                    }
                }
            }
            MergeKind::Inner {
                level,
                sequence: false,
            } => {
                // Oldest prefixes only, so versions of unsequence files never interleave
                for end in cap..=files.len() {
                    self.consider(&mut best, files[..end].to_vec(), level + 1);
                    evaluated += 1;
                    if Instant::now() >= deadline {
                        timed_out = true;
                        break;
                    }
                }
            }
            MergeKind::Cross => {
                for end in cap..=files.len() {
                    let unseq = &files[..end];
                    let seq = self.absorb_sequence(unseq, &candidates.siblings);
                    let output_level = seq.iter().map(|f| f.meta().level).max().unwrap_or(0);

                    let mut inputs = seq;
                    inputs.extend(unseq.iter().cloned());
                    self.consider(&mut best, inputs, output_level);
                    evaluated += 1;
                    if Instant::now() >= deadline {
                        timed_out = true;
                        break;
                    }
                }
            }
        }

        let mut best = best?;
        if let (Some(shortcut), MergeKind::Inner { sequence, .. }) =
            (self.top_level, candidates.kind)
        {
            let points: u64 = best.files.iter().map(|f| f.meta().point_count).sum();
            let top = if sequence {
                shortcut.seq_top
            } else {
                shortcut.unseq_top
            };
            if points >= shortcut.points && best.output_level < top {
                debug!(
                    points,
                    from = best.output_level,
                    to = top,
                    "Merge output sent to top level"
                );
                best.output_level = top;
            }
        }
        if timed_out {
            warn!(
                storage_group = %candidates.storage_group,
                partition = candidates.partition,
                kind = ?candidates.kind,
                evaluated,
                budget_ms = self.time_budget.as_millis() as u64,
                "Merge file selection timed out, using best candidate so far"
            );
        }
        debug!(
            storage_group = %candidates.storage_group,
            partition = candidates.partition,
            kind = ?candidates.kind,
            strategy = self.strategy.name(),
            files = best.files.len(),
            score = best.score,
            "Selected merge candidates"
        );

        Some(Selection {
            storage_group: candidates.storage_group.clone(),
            partition: candidates.partition,
            kind: candidates.kind,
            files: best.files,
            output_level: best.output_level,
            target_sequence: match candidates.kind {
                MergeKind::Inner { sequence, .. } => sequence,
                MergeKind::Cross => true,
            },
            score: best.score,
            total_size: best.total_size,
            windows_evaluated: evaluated,
            timed_out,
        })
    }

    fn consider(
        &self,
        best: &mut Option<Best>,
        files: Vec<Arc<TsFileRecord>>,
        output_level: Level,
    ) {
        let score = self.strategy.score(&files);
        let total_size: u64 = files.iter().map(|f| f.meta().file_size).sum();

        let better = match best {
            None => true,
            Some(current) => {
                score > current.score || (score == current.score && total_size < current.total_size)
            }
        };
        if better {
            *best = Some(Best {
                files,
                output_level,
                score,
                total_size,
            });
        }
    }

    /// Sequence files a cross merge of `unseq` must rewrite: every file
    /// overlapping the growing hull of the inputs, in time order
    fn absorb_sequence(
        &self,
        unseq: &[Arc<TsFileRecord>],
        sequence: &[Arc<TsFileRecord>],
    ) -> Vec<Arc<TsFileRecord>> {
        if self.force_full {
            return sequence.to_vec();
        }

        let mut hull = unseq
            .iter()
            .fold(TimeRange::empty(), |acc, f| acc.union(&f.meta().time_range));
        loop {
            let absorbed: Vec<_> = sequence
                .iter()
                .filter(|f| f.meta().overlaps(&hull))
                .cloned()
                .collect();
            let grown = absorbed
                .iter()
                .fold(hull, |acc, f| acc.union(&f.meta().time_range));
            if grown == hull {
                return absorbed;
            }
            hull = grown;
        }
    }
}
