//! Heap-based k-way merge over the chunks of one overlap group, with last-writer-wins
//! deduplication by write-order version.

use crate::chunk::ChunkReader;
use crate::error::DbError;
use crate::filter::TimeFilter;
use crate::selector::{ChunkSet, OverlapGroup};
use crate::telemetry::db_metrics;
use crate::types::{Point, Timestamp, Version};

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Counters kept by one merge iterator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Points emitted, one per distinct timestamp.
    pub emitted: u64,
    /// Points shadowed by a higher version at the same timestamp.
    pub duplicates_discarded: u64,
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    timestamp: Timestamp,
    version: Version,
    source: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: smallest timestamp first, then highest version.
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| self.version.cmp(&other.version))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Merges several chunk readers into one strictly increasing, duplicate-free point stream.
///
/// At each step every cursor positioned at the smallest timestamp is advanced; the one from
/// the chunk with the highest version supplies the emitted value. Memory is one heap entry
/// per reader. Exhausted readers are dropped immediately, which releases their handles.
///
/// Yields `Result<Point, DbError>` and stops after the first error.
#[derive(Debug)]
pub struct PriorityMergeIterator {
    series: String,
    readers: Vec<Option<ChunkReader>>,
    heap: BinaryHeap<HeapEntry>,
    stats: MergeStats,
    failed: bool,
}

impl PriorityMergeIterator {
    /// Builds a merge over already-positioned readers. Input order does not matter.
    pub fn new(series: &str, readers: Vec<ChunkReader>) -> Self {
        let mut heap = BinaryHeap::with_capacity(readers.len());
        let mut slots = Vec::with_capacity(readers.len());
        for (source, reader) in readers.into_iter().enumerate() {
            match reader.peek_timestamp() {
                Some(timestamp) => {
                    heap.push(HeapEntry {
                        timestamp,
                        version: reader.version(),
                        source,
                    });
                    slots.push(Some(reader));
                }
                None => slots.push(None),
            }
        }
        Self {
            series: series.to_string(),
            readers: slots,
            heap,
            stats: MergeStats::default(),
            failed: false,
        }
    }

    /// Opens a reader for every chunk in `group`, skipping points before the filter start.
    pub fn from_group(
        set: &ChunkSet,
        group: &OverlapGroup,
        filter: &TimeFilter,
    ) -> Result<Self, DbError> {
        let mut readers = Vec::with_capacity(group.len());
        for chunk in group.chunks() {
            let mut reader = set.open_reader(chunk)?;
            reader.skip_before(filter.start())?;
            readers.push(reader);
        }
        Ok(Self::new(set.series(), readers))
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    /// Readers that still hold a chunk handle.
    pub fn open_readers(&self) -> usize {
        self.readers.iter().filter(|r| r.is_some()).count()
    }

    fn step(&mut self) -> Result<Option<Point>, DbError> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        let point = self.readers[top.source]
            .as_ref()
            .and_then(|r| r.peek().copied())
            .ok_or_else(|| DbError::Internal("merge heap entry without a point".to_string()))?;
        self.advance_source(top.source)?;

        while let Some(next) = self.heap.peek().copied() {
            if next.timestamp != top.timestamp {
                break;
            }
            self.heap.pop();
            if next.version == top.version {
                return Err(DbError::integrity(
                    &self.series,
                    format!(
                        "two chunks with version {} both hold timestamp {}",
                        top.version, top.timestamp
                    ),
                ));
            }
            self.stats.duplicates_discarded += 1;
            self.advance_source(next.source)?;
        }

        self.stats.emitted += 1;
        Ok(Some(point))
    }

    fn advance_source(&mut self, source: usize) -> Result<(), DbError> {
        let Some(reader) = self.readers[source].as_mut() else {
            return Ok(());
        };
        reader.advance()?;
        match reader.peek_timestamp() {
            Some(timestamp) => self.heap.push(HeapEntry {
                timestamp,
                version: reader.version(),
                source,
            }),
            None => self.readers[source] = None,
        }
        Ok(())
    }

    fn release_all(&mut self) {
        self.heap.clear();
        self.readers.clear();
    }
}

impl Iterator for PriorityMergeIterator {
    type Item = Result<Point, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(Some(p)) => Some(Ok(p)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                self.release_all();
                Some(Err(e))
            }
        }
    }
}

impl Drop for PriorityMergeIterator {
    fn drop(&mut self) {
        db_metrics::record_merge(self.stats.emitted, self.stats.duplicates_discarded);
    }
}

/// How one overlap group is being read.
#[derive(Debug)]
enum GroupSource {
    /// Singleton group read straight from its chunk.
    Direct(ChunkReader),
    Merged(PriorityMergeIterator),
}

/// Filtered point stream for one overlap group.
///
/// Points before the filter start are skipped when the readers are opened; the stream ends
/// at the first point past the filter end and releases its readers right away.
#[derive(Debug)]
pub struct GroupCursor {
    source: Option<GroupSource>,
    end: Timestamp,
}

impl GroupCursor {
    /// Opens `group`. With `direct_singletons`, a single-chunk group bypasses the merge.
    pub fn open(
        set: &ChunkSet,
        group: &OverlapGroup,
        filter: &TimeFilter,
        direct_singletons: bool,
    ) -> Result<Self, DbError> {
        let source = if direct_singletons && group.is_singleton() {
            let mut reader = set.open_reader(&group.chunks()[0])?;
            reader.skip_before(filter.start())?;
            GroupSource::Direct(reader)
        } else {
            GroupSource::Merged(PriorityMergeIterator::from_group(set, group, filter)?)
        };
        Ok(Self {
            source: Some(source),
            end: filter.end(),
        })
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.source, Some(GroupSource::Direct(_)))
    }
}

impl Iterator for GroupCursor {
    type Item = Result<Point, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = match self.source.as_mut()? {
            GroupSource::Direct(reader) => reader.next(),
            GroupSource::Merged(merge) => merge.next(),
        };
        match item {
            Some(Ok(p)) if p.timestamp <= self.end => Some(Ok(p)),
            Some(Ok(_)) | None => {
                self.source = None;
                None
            }
            Some(Err(e)) => {
                self.source = None;
                Some(Err(e))
            }
        }
    }
}
