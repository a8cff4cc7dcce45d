//! Immutable chunks, their flush-time statistics, and lazy readers with tracked read handles.

use crate::encoding::{encode_block, read_header, BlockCursor, BlockError, BlockHeader};
use crate::error::DbError;
use crate::types::{ChunkKind, DataType, Point, Timestamp, Value, Version};

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Summary of a chunk computed when it is flushed. Lets non-overlapping chunks that lie
/// entirely inside a predicate be aggregated without decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkStatistics {
    pub count: u64,
    /// `None` for boolean chunks.
    pub sum: Option<f64>,
    pub min: Value,
    pub max: Value,
    pub first: Point,
    pub last: Point,
}

impl ChunkStatistics {
    /// Computes statistics over a non-empty, sorted slice.
    fn from_points(points: &[Point]) -> Option<Self> {
        let first = *points.first()?;
        let last = *points.last()?;
        let mut min = first.value;
        let mut max = first.value;
        let mut sum = first.value.data_type().is_numeric().then_some(0.0);
        for p in points {
            if p.value.total_cmp(&min).is_lt() {
                min = p.value;
            }
            if p.value.total_cmp(&max).is_gt() {
                max = p.value;
            }
            if let (Some(s), Some(v)) = (sum.as_mut(), p.value.as_f64()) {
                *s += v;
            }
        }
        Some(Self {
            count: points.len() as u64,
            sum,
            min,
            max,
            first,
            last,
        })
    }
}

/// Everything the selector and aggregator need to know about a chunk without reading it.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub series: String,
    pub kind: ChunkKind,
    pub version: Version,
    pub data_type: DataType,
    /// Inclusive.
    pub min_time: Timestamp,
    /// Inclusive.
    pub max_time: Timestamp,
    pub count: usize,
    pub statistics: Option<ChunkStatistics>,
}

/// An immutable, time-ordered batch of points for one series.
///
/// Chunks are shared through `Arc`; the storage layer may drop its reference while queries
/// still hold theirs.
#[derive(Debug)]
pub struct Chunk {
    meta: ChunkMeta,
    block: Vec<u8>,
}

impl Chunk {
    /// Encodes `points` into a new chunk.
    ///
    /// # Errors
    /// * `EmptyChunk` if `points` is empty.
    /// * `TypeMismatch` if the points do not share one data type.
    /// * `Integrity` if timestamps are not strictly increasing.
    pub fn encode(
        series: &str,
        kind: ChunkKind,
        version: Version,
        points: &[Point],
    ) -> Result<Self, DbError> {
        let Some(first) = points.first() else {
            return Err(DbError::EmptyChunk(series.to_string()));
        };
        let data_type = first.value.data_type();
        for p in points {
            let actual = p.value.data_type();
            if actual != data_type {
                return Err(DbError::TypeMismatch {
                    series: series.to_string(),
                    expected: data_type,
                    actual,
                });
            }
        }

        let block = encode_block(data_type, points).map_err(|e| match e {
            BlockError::NonMonotonic { previous, next } => DbError::integrity(
                series,
                format!(
                    "timestamps must be strictly increasing within a chunk: {} then {}",
                    previous, next
                ),
            ),
            BlockError::Corrupt(details) => DbError::Internal(details),
        })?;

        let statistics = ChunkStatistics::from_points(points);
        let meta = ChunkMeta {
            series: series.to_string(),
            kind,
            version,
            data_type,
            min_time: first.timestamp,
            max_time: points[points.len() - 1].timestamp,
            count: points.len(),
            statistics,
        };
        Ok(Self { meta, block })
    }

    /// Assembles a chunk from metadata and an already-encoded block, as a storage layer does
    /// when loading from disk. The block is only validated when read.
    pub fn from_parts(meta: ChunkMeta, block: Vec<u8>) -> Self {
        Self { meta, block }
    }

    pub fn meta(&self) -> &ChunkMeta {
        &self.meta
    }

    pub fn series(&self) -> &str {
        &self.meta.series
    }

    pub fn kind(&self) -> ChunkKind {
        self.meta.kind
    }

    pub fn version(&self) -> Version {
        self.meta.version
    }

    pub fn data_type(&self) -> DataType {
        self.meta.data_type
    }

    pub fn min_time(&self) -> Timestamp {
        self.meta.min_time
    }

    pub fn max_time(&self) -> Timestamp {
        self.meta.max_time
    }

    /// Number of points in the chunk.
    pub fn len(&self) -> usize {
        self.meta.count
    }

    pub fn is_empty(&self) -> bool {
        self.meta.count == 0
    }

    pub fn statistics(&self) -> Option<&ChunkStatistics> {
        self.meta.statistics.as_ref()
    }

    pub fn encoded_len(&self) -> usize {
        self.block.len()
    }

    /// True if the two inclusive time ranges share at least one timestamp.
    pub fn overlaps(&self, other: &Chunk) -> bool {
        self.min_time() <= other.max_time() && other.min_time() <= self.max_time()
    }

    /// The encoded block, as a storage layer would persist it next to [`Chunk::meta`].
    pub fn block(&self) -> &[u8] {
        &self.block
    }

    /// Checks the block header, size and checksum against the metadata without decoding any
    /// point.
    ///
    /// # Errors
    /// `Decode` if the block is damaged or disagrees with the metadata on type or count.
    pub fn verify(&self) -> Result<(), DbError> {
        self.checked_header().map(|_| ())
    }

    fn checked_header(&self) -> Result<BlockHeader, DbError> {
        let version = self.version();
        let header = read_header(&self.block).map_err(|e| block_error(self, e))?;
        if header.data_type != self.data_type() {
            return Err(DbError::decode(
                version,
                format!(
                    "block data type {:?} does not match metadata {:?}",
                    header.data_type,
                    self.data_type()
                ),
            ));
        }
        if header.count != self.len() {
            return Err(DbError::decode(
                version,
                format!(
                    "block holds {} points, metadata declares {}",
                    header.count,
                    self.len()
                ),
            ));
        }
        Ok(header)
    }
}

/// Counts chunk read handles handed out to readers and returned by them.
#[derive(Debug, Default)]
pub struct ReadHandleTracker {
    acquired: AtomicU64,
    released: AtomicU64,
}

impl ReadHandleTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquires a read handle on `chunk`. The handle is released when dropped.
    pub fn acquire(self: &Arc<Self>, chunk: &Arc<Chunk>) -> ChunkHandle {
        self.acquired.fetch_add(1, Ordering::AcqRel);
        ChunkHandle {
            chunk: Arc::clone(chunk),
            tracker: Arc::clone(self),
        }
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// Handles currently held by readers.
    pub fn live(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

/// Scoped read access to one chunk.
#[derive(Debug)]
pub struct ChunkHandle {
    chunk: Arc<Chunk>,
    tracker: Arc<ReadHandleTracker>,
}

impl Deref for ChunkHandle {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        &self.chunk
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        self.tracker.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// Lazy cursor over one chunk's points in ascending timestamp order.
///
/// The reader decodes one point ahead so callers can `peek` without consuming. It also
/// implements `Iterator<Item = Result<Point, DbError>>` and stops after the first error.
#[derive(Debug)]
pub struct ChunkReader {
    handle: ChunkHandle,
    cursor: BlockCursor,
    current: Option<Point>,
    failed: bool,
}

impl ChunkReader {
    /// Opens a reader, verifying the block header and checksum against the chunk metadata
    /// and positioning on the first point.
    pub fn open(handle: ChunkHandle) -> Result<Self, DbError> {
        let version = handle.version();
        let header = handle.checked_header()?;

        let mut reader = Self {
            cursor: BlockCursor::new(header),
            handle,
            current: None,
            failed: false,
        };
        reader.decode_next()?;
        match reader.current {
            Some(p) if p.timestamp == reader.handle.min_time() => Ok(reader),
            Some(p) => Err(DbError::integrity(
                reader.handle.series(),
                format!(
                    "chunk v{} starts at {} but metadata says {}",
                    version,
                    p.timestamp,
                    reader.handle.min_time()
                ),
            )),
            None => Err(DbError::decode(version, "block holds no points")),
        }
    }

    pub fn version(&self) -> Version {
        self.handle.version()
    }

    pub fn kind(&self) -> ChunkKind {
        self.handle.kind()
    }

    pub fn has_next(&self) -> bool {
        self.current.is_some()
    }

    pub fn peek(&self) -> Option<&Point> {
        self.current.as_ref()
    }

    pub fn peek_timestamp(&self) -> Option<Timestamp> {
        self.current.map(|p| p.timestamp)
    }

    /// Moves past the current point.
    pub fn advance(&mut self) -> Result<(), DbError> {
        if self.current.is_none() {
            return Ok(());
        }
        let previous = self.current.map(|p| p.timestamp);
        self.decode_next()?;
        if self.current.is_none() && previous != Some(self.handle.max_time()) {
            return Err(DbError::integrity(
                self.handle.series(),
                format!(
                    "chunk v{} ends at {:?} but metadata says {}",
                    self.handle.version(),
                    previous,
                    self.handle.max_time()
                ),
            ));
        }
        Ok(())
    }

    /// Takes the current point and advances.
    pub fn next_point(&mut self) -> Result<Option<Point>, DbError> {
        let Some(p) = self.current else {
            return Ok(None);
        };
        self.advance()?;
        Ok(Some(p))
    }

    /// Advances until the current timestamp is `>= t`.
    pub fn skip_before(&mut self, t: Timestamp) -> Result<(), DbError> {
        while matches!(self.current, Some(p) if p.timestamp < t) {
            self.advance()?;
        }
        Ok(())
    }

    fn decode_next(&mut self) -> Result<(), DbError> {
        match self.cursor.next_point(self.handle.block()) {
            Ok(p) => {
                self.current = p;
                Ok(())
            }
            Err(e) => {
                self.current = None;
                self.failed = true;
                Err(block_error(&self.handle, e))
            }
        }
    }

    /// Points not yet returned, including the current one.
    pub fn remaining(&self) -> usize {
        self.cursor.remaining() + usize::from(self.current.is_some())
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Point, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_point() {
            Ok(Some(p)) => Some(Ok(p)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn block_error(chunk: &Chunk, err: BlockError) -> DbError {
    match err {
        BlockError::Corrupt(details) => DbError::decode(chunk.version(), details),
        BlockError::NonMonotonic { previous, next } => DbError::integrity(
            chunk.series(),
            format!(
                "non-monotonic timestamps in chunk v{}: {} then {}",
                chunk.version(),
                previous,
                next
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_chunk(version: Version, ts: &[Timestamp]) -> Arc<Chunk> {
        let points: Vec<Point> = ts
            .iter()
            .map(|&t| Point::new(t, Value::Int32(t as i32)))
            .collect();
        Arc::new(Chunk::encode("root.sg.d0.s0", ChunkKind::Sequential, version, &points).unwrap())
    }

    #[test]
    fn encode_computes_range_and_statistics() {
        let points = vec![
            Point::new(5, Value::Double(2.5)),
            Point::new(7, Value::Double(-1.0)),
            Point::new(9, Value::Double(4.0)),
        ];
        let chunk = Chunk::encode("s", ChunkKind::Unsequential, 3, &points).unwrap();
        assert_eq!((chunk.min_time(), chunk.max_time()), (5, 9));
        assert_eq!(chunk.len(), 3);
        let stats = chunk.statistics().unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.sum, Some(5.5));
        assert_eq!(stats.min, Value::Double(-1.0));
        assert_eq!(stats.max, Value::Double(4.0));
        assert_eq!(stats.first, points[0]);
        assert_eq!(stats.last, points[2]);
    }

    #[test]
    fn encode_rejects_bad_input() {
        assert!(matches!(
            Chunk::encode("s", ChunkKind::Sequential, 1, &[]),
            Err(DbError::EmptyChunk(_))
        ));
        let unsorted = vec![Point::new(2, Value::Int32(1)), Point::new(1, Value::Int32(1))];
        assert!(matches!(
            Chunk::encode("s", ChunkKind::Sequential, 1, &unsorted),
            Err(DbError::Integrity { .. })
        ));
        let mixed = vec![Point::new(1, Value::Int32(1)), Point::new(2, Value::Int64(1))];
        assert!(matches!(
            Chunk::encode("s", ChunkKind::Sequential, 1, &mixed),
            Err(DbError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn reader_peeks_advances_and_skips() {
        let tracker = ReadHandleTracker::new();
        let chunk = int_chunk(1, &[1, 3, 5, 7]);
        let mut reader = ChunkReader::open(tracker.acquire(&chunk)).unwrap();
        assert_eq!(reader.peek_timestamp(), Some(1));
        reader.advance().unwrap();
        assert_eq!(reader.peek_timestamp(), Some(3));
        reader.skip_before(6).unwrap();
        assert_eq!(reader.peek(), Some(&Point::new(7, Value::Int32(7))));
        assert_eq!(reader.remaining(), 1);
        reader.advance().unwrap();
        assert!(!reader.has_next());
        reader.advance().unwrap();
        assert!(!reader.has_next());
    }

    #[test]
    fn handles_are_released_on_drop() {
        let tracker = ReadHandleTracker::new();
        let chunk = int_chunk(1, &[1, 2, 3]);
        {
            let mut reader = ChunkReader::open(tracker.acquire(&chunk)).unwrap();
            assert_eq!(tracker.live(), 1);
            reader.advance().unwrap();
        }
        assert_eq!(tracker.acquired(), 1);
        assert_eq!(tracker.released(), 1);
        assert_eq!(tracker.live(), 0);

        let collected: Result<Vec<_>, _> =
            ChunkReader::open(tracker.acquire(&chunk)).unwrap().collect();
        assert_eq!(collected.unwrap().len(), 3);
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.released(), 2);
    }

    #[test]
    fn corrupted_block_is_a_decode_error() {
        let good = int_chunk(4, &[1, 2, 3]);
        let mut block = good.block().to_vec();
        let last = block.len() - 1;
        block[last] ^= 0x55;
        let bad = Arc::new(Chunk::from_parts(good.meta().clone(), block));

        let tracker = ReadHandleTracker::new();
        let err = ChunkReader::open(tracker.acquire(&bad)).unwrap_err();
        assert!(matches!(err, DbError::Decode { chunk: 4, .. }));
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn metadata_disagreement_is_detected() {
        let good = int_chunk(2, &[10, 20, 30]);

        let mut wrong_count = good.meta().clone();
        wrong_count.count = 4;
        let chunk = Arc::new(Chunk::from_parts(wrong_count, good.block().to_vec()));
        let tracker = ReadHandleTracker::new();
        assert!(matches!(
            ChunkReader::open(tracker.acquire(&chunk)),
            Err(DbError::Decode { .. })
        ));

        let mut wrong_max = good.meta().clone();
        wrong_max.max_time = 40;
        let chunk = Arc::new(Chunk::from_parts(wrong_max, good.block().to_vec()));
        let results: Vec<_> = ChunkReader::open(tracker.acquire(&chunk)).unwrap().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(DbError::Integrity { .. })));
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn overlap_is_inclusive() {
        let a = int_chunk(1, &[1, 5]);
        let b = int_chunk(2, &[5, 9]);
        let c = int_chunk(3, &[6, 9]);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
