//! Cost functions for candidate windows

use crate::fileset::TsFileRecord;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How the selector scores a window of files. Higher scores win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeFileStrategy {
    /// Merge as many files as possible at once
    MaxFileNum,
    /// Merge the window holding the most series chunks, consolidating the most metadata
    #[default]
    MaxSeriesNum,
    /// Prefer windows of similarly sized files
    SizeBalance,
}

impl MergeFileStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            MergeFileStrategy::MaxFileNum => "max_file_num",
            MergeFileStrategy::MaxSeriesNum => "max_series_num",
            MergeFileStrategy::SizeBalance => "size_balance",
        }
    }

    /// Score a window; empty windows score 0
    pub fn score(&self, window: &[Arc<TsFileRecord>]) -> f64 {
        if window.is_empty() {
            return 0.0;
        }
        match self {
            MergeFileStrategy::MaxFileNum => window.len() as f64,
            MergeFileStrategy::MaxSeriesNum => window
                .iter()
                .map(|f| f.meta().series_count as f64)
                .sum(),
            MergeFileStrategy::SizeBalance => {
                let sizes = window.iter().map(|f| f.meta().file_size.max(1));
                let min = sizes.clone().min().unwrap_or(1) as f64;
                let max = sizes.max().unwrap_or(1) as f64;
                window.len() as f64 * (min / max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileset::testing::record;

    #[test]
    fn test_scores() {
        let even = vec![record(1, 0, 10, 100, 5), record(2, 11, 20, 100, 5)];
        let skewed = vec![
            record(3, 0, 10, 10, 1),
            record(4, 11, 20, 1000, 1),
            record(5, 21, 30, 10, 1),
        ];

        assert_eq!(MergeFileStrategy::MaxFileNum.score(&skewed), 3.0);
        assert_eq!(MergeFileStrategy::MaxSeriesNum.score(&even), 10.0);
        assert_eq!(MergeFileStrategy::SizeBalance.score(&even), 2.0);
        assert!(MergeFileStrategy::SizeBalance.score(&skewed) < 0.1);
        assert_eq!(MergeFileStrategy::MaxFileNum.score(&[]), 0.0);
    }
}
