//! Chunk selection: which chunks a query must read, and which of them can share timestamps.

use crate::chunk::{Chunk, ChunkReader, ReadHandleTracker};
use crate::error::DbError;
use crate::filter::TimeFilter;
use crate::types::{ChunkKind, DataType, Timestamp, Version};

use std::collections::HashSet;
use std::sync::Arc;

/// The chunks of one series visible to a query, partitioned by origin kind.
///
/// A `ChunkSet` is an immutable snapshot: it holds `Arc`s, so chunks removed from the store
/// by compaction stay readable until the query drops the set.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    series: String,
    data_type: Option<DataType>,
    sequential: Vec<Arc<Chunk>>,
    unsequential: Vec<Arc<Chunk>>,
    handles: Arc<ReadHandleTracker>,
}

impl ChunkSet {
    /// Builds a validated set with its own read handle tracker.
    pub fn new(
        series: &str,
        sequential: Vec<Arc<Chunk>>,
        unsequential: Vec<Arc<Chunk>>,
    ) -> Result<Self, DbError> {
        Self::with_tracker(series, sequential, unsequential, ReadHandleTracker::new())
    }

    /// Builds a validated set whose readers report to `handles`.
    ///
    /// # Errors
    /// `Integrity` if a chunk sits in the wrong partition, two chunks share a version,
    /// sequential chunks overlap each other, or chunks disagree on the data type.
    pub fn with_tracker(
        series: &str,
        mut sequential: Vec<Arc<Chunk>>,
        unsequential: Vec<Arc<Chunk>>,
        handles: Arc<ReadHandleTracker>,
    ) -> Result<Self, DbError> {
        for (chunks, kind) in [
            (&sequential, ChunkKind::Sequential),
            (&unsequential, ChunkKind::Unsequential),
        ] {
            if let Some(c) = chunks.iter().find(|c| c.kind() != kind) {
                return Err(DbError::integrity(
                    series,
                    format!("chunk v{} is {:?} but listed as {:?}", c.version(), c.kind(), kind),
                ));
            }
        }

        let mut versions: HashSet<Version> = HashSet::new();
        let mut data_type = None;
        for c in sequential.iter().chain(unsequential.iter()) {
            if !versions.insert(c.version()) {
                return Err(DbError::integrity(
                    series,
                    format!("duplicate write-order version {}", c.version()),
                ));
            }
            match data_type {
                None => data_type = Some(c.data_type()),
                Some(dt) if dt != c.data_type() => {
                    return Err(DbError::integrity(
                        series,
                        format!(
                            "chunk v{} is {:?}, other chunks are {:?}",
                            c.version(),
                            c.data_type(),
                            dt
                        ),
                    ))
                }
                Some(_) => {}
            }
        }

        sequential.sort_by_key(|c| c.min_time());
        for pair in sequential.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(DbError::integrity(
                    series,
                    format!(
                        "sequential chunks v{} [{}, {}] and v{} [{}, {}] overlap",
                        pair[0].version(),
                        pair[0].min_time(),
                        pair[0].max_time(),
                        pair[1].version(),
                        pair[1].min_time(),
                        pair[1].max_time()
                    ),
                ));
            }
        }

        Ok(Self {
            series: series.to_string(),
            data_type,
            sequential,
            unsequential,
            handles,
        })
    }

    /// This set plus `transient` chunks, validated again and reporting to the same tracker.
    pub fn with_transient(self, transient: Vec<Arc<Chunk>>) -> Result<Self, DbError> {
        if transient.is_empty() {
            return Ok(self);
        }
        let Self {
            series,
            mut sequential,
            mut unsequential,
            handles,
            ..
        } = self;
        for chunk in transient {
            match chunk.kind() {
                ChunkKind::Sequential => sequential.push(chunk),
                ChunkKind::Unsequential => unsequential.push(chunk),
            }
        }
        Self::with_tracker(&series, sequential, unsequential, handles)
    }

    pub fn series(&self) -> &str {
        &self.series
    }

    /// Data type shared by all chunks, `None` when the set is empty.
    pub fn data_type(&self) -> Option<DataType> {
        self.data_type
    }

    /// Sequential chunks in ascending time order.
    pub fn sequential(&self) -> &[Arc<Chunk>] {
        &self.sequential
    }

    pub fn unsequential(&self) -> &[Arc<Chunk>] {
        &self.unsequential
    }

    pub fn len(&self) -> usize {
        self.sequential.len() + self.unsequential.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Chunk>> {
        self.sequential.iter().chain(self.unsequential.iter())
    }

    pub fn handles(&self) -> &Arc<ReadHandleTracker> {
        &self.handles
    }

    /// Opens a reader on `chunk`, registering its handle with this set's tracker.
    pub fn open_reader(&self, chunk: &Arc<Chunk>) -> Result<ChunkReader, DbError> {
        ChunkReader::open(self.handles.acquire(chunk))
    }
}

/// A maximal set of chunks whose time ranges transitively intersect.
#[derive(Debug, Clone)]
pub struct OverlapGroup {
    chunks: Vec<Arc<Chunk>>,
    min_time: Timestamp,
    max_time: Timestamp,
}

impl OverlapGroup {
    fn start(chunk: Arc<Chunk>) -> Self {
        Self {
            min_time: chunk.min_time(),
            max_time: chunk.max_time(),
            chunks: vec![chunk],
        }
    }

    fn push(&mut self, chunk: Arc<Chunk>) {
        self.max_time = self.max_time.max(chunk.max_time());
        self.chunks.push(chunk);
    }

    /// Chunks ordered by `(min_time, version)`.
    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// True if only one chunk contributes, so no deduplication is needed.
    pub fn is_singleton(&self) -> bool {
        self.chunks.len() == 1
    }

    pub fn min_time(&self) -> Timestamp {
        self.min_time
    }

    pub fn max_time(&self) -> Timestamp {
        self.max_time
    }

    pub fn versions(&self) -> Vec<Version> {
        self.chunks.iter().map(|c| c.version()).collect()
    }
}

/// Selects the chunks of `set` that intersect `filter` and partitions them into overlap groups.
///
/// Groups come back in ascending time order and are pairwise disjoint. Uses one sort and a
/// sweep with a running maximum of `max_time`: a chunk opens a new group only when its
/// `min_time` is past everything seen in the current group.
pub fn select(set: &ChunkSet, filter: &TimeFilter) -> Vec<OverlapGroup> {
    let mut candidates: Vec<Arc<Chunk>> = set
        .iter()
        .filter(|c| filter.intersects(c.min_time(), c.max_time()))
        .cloned()
        .collect();
    candidates.sort_by_key(|c| (c.min_time(), c.version()));

    let mut groups: Vec<OverlapGroup> = Vec::new();
    for chunk in candidates {
        match groups.last_mut() {
            Some(group) if chunk.min_time() <= group.max_time => group.push(chunk),
            _ => groups.push(OverlapGroup::start(chunk)),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Point, Value};

    fn chunk(kind: ChunkKind, version: Version, min: Timestamp, max: Timestamp) -> Arc<Chunk> {
        let mut points = vec![Point::new(min, Value::Int64(min))];
        if max != min {
            points.push(Point::new(max, Value::Int64(max)));
        }
        Arc::new(Chunk::encode("s", kind, version, &points).unwrap())
    }

    fn seq(version: Version, min: Timestamp, max: Timestamp) -> Arc<Chunk> {
        chunk(ChunkKind::Sequential, version, min, max)
    }

    fn unseq(version: Version, min: Timestamp, max: Timestamp) -> Arc<Chunk> {
        chunk(ChunkKind::Unsequential, version, min, max)
    }

    fn group_versions(groups: &[OverlapGroup]) -> Vec<Vec<Version>> {
        groups.iter().map(|g| g.versions()).collect()
    }

    #[test]
    fn disjoint_ranges_form_singleton_groups() {
        let set = ChunkSet::new("s", vec![], vec![unseq(1, 1, 5), unseq(2, 10, 15)]).unwrap();
        let groups = select(&set, &TimeFilter::all());
        assert_eq!(group_versions(&groups), vec![vec![1], vec![2]]);
        assert!(groups.iter().all(|g| g.is_singleton()));
    }

    #[test]
    fn intersecting_ranges_form_one_group() {
        let set = ChunkSet::new("s", vec![], vec![unseq(1, 1, 10), unseq(2, 5, 15)]).unwrap();
        let groups = select(&set, &TimeFilter::all());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
        assert_eq!((groups[0].min_time(), groups[0].max_time()), (1, 15));
    }

    #[test]
    fn touching_ranges_share_a_group() {
        let set = ChunkSet::new("s", vec![], vec![unseq(1, 1, 5), unseq(2, 5, 9)]).unwrap();
        assert_eq!(select(&set, &TimeFilter::all()).len(), 1);
    }

    #[test]
    fn transitive_overlap_through_a_long_chunk() {
        // [0,100] bridges chunks that do not touch each other.
        let set = ChunkSet::new(
            "s",
            vec![seq(1, 0, 100), seq(5, 200, 300)],
            vec![unseq(2, 10, 20), unseq(3, 90, 150), unseq(4, 30, 40)],
        )
        .unwrap();
        let groups = select(&set, &TimeFilter::all());
        assert_eq!(group_versions(&groups), vec![vec![1, 2, 4, 3], vec![5]]);
        assert_eq!(groups[0].max_time(), 150);
    }

    #[test]
    fn filter_drops_non_intersecting_chunks_before_grouping() {
        let set = ChunkSet::new(
            "s",
            vec![seq(1, 1_000_000, 1_000_000)],
            vec![unseq(2, 1, 500), unseq(3, 400, 1000)],
        )
        .unwrap();
        let groups = select(&set, &TimeFilter::lt(1_000_000));
        assert_eq!(group_versions(&groups), vec![vec![2, 3]]);

        assert!(select(&set, &TimeFilter::gt(1_000_000)).is_empty());
        assert!(select(&set, &TimeFilter::between(600, 300)).is_empty());
    }

    #[test]
    fn empty_set_selects_nothing() {
        let set = ChunkSet::new("s", vec![], vec![]).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.data_type(), None);
        assert!(select(&set, &TimeFilter::all()).is_empty());
    }

    #[test]
    fn validation_rejects_inconsistent_sets() {
        let dup = ChunkSet::new("s", vec![seq(1, 1, 2)], vec![unseq(1, 5, 6)]);
        assert!(matches!(dup, Err(DbError::Integrity { .. })));

        let overlapping_seq = ChunkSet::new("s", vec![seq(1, 1, 10), seq(2, 10, 20)], vec![]);
        assert!(matches!(overlapping_seq, Err(DbError::Integrity { .. })));

        let wrong_partition = ChunkSet::new("s", vec![unseq(1, 1, 2)], vec![]);
        assert!(matches!(wrong_partition, Err(DbError::Integrity { .. })));

        let double = Arc::new(
            Chunk::encode("s", ChunkKind::Unsequential, 9, &[Point::new(3, Value::Double(1.0))])
                .unwrap(),
        );
        let mixed_types = ChunkSet::new("s", vec![seq(1, 1, 2)], vec![double]);
        assert!(matches!(mixed_types, Err(DbError::Integrity { .. })));
    }

    #[test]
    fn sequential_chunks_are_sorted_by_time() {
        let set = ChunkSet::new("s", vec![seq(2, 50, 60), seq(1, 1, 10)], vec![]).unwrap();
        let mins: Vec<_> = set.sequential().iter().map(|c| c.min_time()).collect();
        assert_eq!(mins, vec![1, 50]);
    }
}
