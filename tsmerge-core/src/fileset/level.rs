//! Files of one partition grouped by level

use super::TsFileRecord;
use crate::{FileId, Level, TimeRange};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// `Level -> files`, each level in append order
#[derive(Debug, Default, Clone)]
pub struct FileLevelSet {
    levels: BTreeMap<Level, Vec<Arc<TsFileRecord>>>,
}

impl FileLevelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, level: Level, file: Arc<TsFileRecord>) {
        self.levels.entry(level).or_default().push(file);
    }

    /// Remove every file in `ids`; returns how many were removed
    pub fn remove(&mut self, ids: &HashSet<FileId>) -> usize {
        let mut removed = 0;
        for files in self.levels.values_mut() {
            let before = files.len();
            files.retain(|f| !ids.contains(&f.id()));
            removed += before - files.len();
        }
        self.levels.retain(|_, files| !files.is_empty());
        removed
    }

    pub fn level(&self, level: Level) -> &[Arc<TsFileRecord>] {
        self.levels.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, id: FileId) -> bool {
        self.files().any(|f| f.id() == id)
    }

    /// Every file, lowest level first
    pub fn files(&self) -> impl Iterator<Item = &Arc<TsFileRecord>> {
        self.levels.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.levels.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Populated levels with their file counts
    pub fn level_counts(&self) -> BTreeMap<Level, usize> {
        self.levels
            .iter()
            .map(|(level, files)| (*level, files.len()))
            .collect()
    }

    pub fn level_ids(&self) -> BTreeMap<Level, Vec<FileId>> {
        self.levels
            .iter()
            .map(|(level, files)| (*level, files.iter().map(|f| f.id()).collect()))
            .collect()
    }

    pub fn level_size(&self, level: Level) -> u64 {
        self.level(level).iter().map(|f| f.meta().file_size).sum()
    }

    /// First file, outside `exclude`, whose time range overlaps `range`
    pub fn find_overlap(
        &self,
        range: &TimeRange,
        exclude: &HashSet<FileId>,
    ) -> Option<&Arc<TsFileRecord>> {
        self.files()
            .find(|f| !exclude.contains(&f.id()) && f.meta().overlaps(range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileset::testing::record;

    #[test]
    fn test_insert_remove() {
        let mut set = FileLevelSet::new();
        set.insert(0, record(1, 0, 10, 100, 1));
        set.insert(0, record(2, 20, 30, 100, 1));
        set.insert(1, record(3, 40, 50, 100, 1));

        assert_eq!(set.len(), 3);
        assert_eq!(set.level_ids()[&0], vec![1, 2]);
        assert_eq!(set.level_size(0), 200);

        let removed = set.remove(&[1, 2].into_iter().collect());
        assert_eq!(removed, 2);
        assert!(set.level(0).is_empty());
        assert_eq!(set.level_counts().len(), 1);
        assert!(set.contains(3));
    }

    #[test]
    fn test_find_overlap() {
        let mut set = FileLevelSet::new();
        set.insert(0, record(1, 0, 10, 100, 1));
        set.insert(1, record(2, 20, 30, 100, 1));

        let hit = set.find_overlap(&TimeRange::new(25, 40), &HashSet::new());
        assert_eq!(hit.map(|f| f.id()), Some(2));

        let excluded: HashSet<_> = [2].into_iter().collect();
        assert!(set.find_overlap(&TimeRange::new(25, 40), &excluded).is_none());
        assert!(set
            .find_overlap(&TimeRange::new(11, 19), &HashSet::new())
            .is_none());
    }
}
