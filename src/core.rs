//! Engine: write path, flush classification, snapshots and the query entry points.

use crate::aggregate::{AggregateKind, AggregateOptions, AggregateValue, Aggregator};
use crate::buffer::WriteBuffer;
use crate::chunk::{Chunk, ReadHandleTracker};
use crate::error::DbError;
use crate::filter::TimeFilter;
use crate::query::execute_query;
use crate::selector::ChunkSet;
use crate::storage::ChunkStore;
use crate::telemetry::{db_metrics, noop_event_listener, EngineEvent, EngineEventListener};
use crate::types::{ChunkKind, DataType, Point, Timestamp, Value, Version};

use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Configuration options for the [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// A memtable is flushed into a chunk once its estimated size reaches this many bytes.
    pub memtable_size_threshold: usize,
    /// Read-path switches used by `aggregate` and `query`.
    pub aggregate: AggregateOptions,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn EngineEventListener>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            memtable_size_threshold: crate::DEFAULT_MEMTABLE_SIZE_THRESHOLD,
            aggregate: AggregateOptions::default(),
            event_listener: noop_event_listener(),
        }
    }
}

/// Chunk engine for sequential and unsequential data.
///
/// Writes are staged in per-series memtables and flushed into immutable chunks that carry a
/// global write-order version. Reads take a snapshot of the flushed chunks plus the unflushed
/// memtables and resolve overlaps by version.
///
/// Lock order is write buffer, then chunk store.
#[derive(Debug)]
pub struct Engine {
    store: Arc<RwLock<ChunkStore>>,
    write_buffer: Arc<Mutex<WriteBuffer>>,
    /// Next write-order version handed to a flushed or compacted chunk.
    next_version: Arc<AtomicU64>,
    config: EngineConfig,
}

impl Engine {
    /// Creates an engine with `config`.
    ///
    /// # Errors
    /// `ConfigError` if the memtable threshold is zero.
    pub fn with_config(config: EngineConfig) -> Result<Self, DbError> {
        if config.memtable_size_threshold == 0 {
            return Err(DbError::ConfigError(
                "memtable_size_threshold must be greater than zero".to_string(),
            ));
        }
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        Engine {
            store: Arc::new(RwLock::new(ChunkStore::default())),
            write_buffer: Arc::new(Mutex::new(WriteBuffer::new(config.memtable_size_threshold))),
            next_version: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    /// Declares a series and fixes its data type.
    pub fn create_series(&self, series: &str, data_type: DataType) -> Result<(), DbError> {
        self.store.write()?.register_series(series, data_type)
    }

    /// Writes one point. The series is created on first write with the value's type.
    ///
    /// If the target memtable reaches the size threshold it is flushed before returning.
    ///
    /// # Errors
    /// `TypeMismatch` if the value's type differs from the series type.
    pub fn insert(&self, series: &str, timestamp: Timestamp, value: Value) -> Result<(), DbError> {
        self.ensure_series(series, value.data_type())?;
        let mut buffer = self.write_buffer.lock()?;
        if let Some(full) = buffer.stage(series, Point::new(timestamp, value)) {
            self.flush_memtable(&mut buffer, series, full)?;
        }
        Ok(())
    }

    /// Writes points in order, with the same semantics as repeated `insert` calls.
    pub fn insert_batch(&self, series: &str, points: &[Point]) -> Result<(), DbError> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        let data_type = first.value.data_type();
        if let Some(p) = points.iter().find(|p| p.value.data_type() != data_type) {
            return Err(DbError::TypeMismatch {
                series: series.to_string(),
                expected: data_type,
                actual: p.value.data_type(),
            });
        }
        self.ensure_series(series, data_type)?;

        let mut buffer = self.write_buffer.lock()?;
        for p in points {
            if let Some(full) = buffer.stage(series, *p) {
                self.flush_memtable(&mut buffer, series, full)?;
            }
        }
        Ok(())
    }

    fn ensure_series(&self, series: &str, data_type: DataType) -> Result<(), DbError> {
        if self.store.read()?.data_type(series) == Some(data_type) {
            return Ok(());
        }
        self.store.write()?.register_series(series, data_type)
    }

    /// Flushes every non-empty memtable into a chunk.
    pub fn flush(&self) -> Result<(), DbError> {
        let mut buffer = self.write_buffer.lock()?;
        for (series, kind) in buffer.pending() {
            self.flush_memtable(&mut buffer, &series, kind)?;
        }
        Ok(())
    }

    fn flush_memtable(
        &self,
        buffer: &mut WriteBuffer,
        series: &str,
        kind: ChunkKind,
    ) -> Result<Option<Version>, DbError> {
        let Some(points) = buffer.drain(series, kind) else {
            return Ok(None);
        };
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let chunk = Chunk::encode(series, kind, version, &points)?;
        self.store.write()?.add_chunk(chunk)?;

        db_metrics::record_flush(kind);
        self.config.event_listener.on_event(EngineEvent::ChunkFlushed {
            series: series.to_string(),
            kind,
            version,
            points: points.len(),
        });
        Ok(Some(version))
    }

    /// Snapshot of the series including its unflushed memtables.
    ///
    /// Memtable contents become transient chunks whose versions sit above every flushed
    /// version; the two memtables never share a timestamp, so their relative order is free.
    pub fn snapshot(&self, series: &str) -> Result<ChunkSet, DbError> {
        self.capture(series)?.build()
    }

    /// Copies what a snapshot needs while the write buffer is locked. Encoding the memtables
    /// happens in [`PendingSnapshot::build`], after the lock is released.
    fn capture(&self, series: &str) -> Result<PendingSnapshot, DbError> {
        let buffer = self.write_buffer.lock()?;
        let base_version = self.next_version.load(Ordering::Relaxed);
        let memtables = buffer.snapshot(series);
        let flushed = self.store.read()?.snapshot(series)?;
        Ok(PendingSnapshot {
            flushed,
            memtables,
            base_version,
        })
    }

    /// Every visible point of `series` satisfying `filter`, in timestamp order.
    pub fn query(&self, series: &str, filter: &TimeFilter) -> Result<Vec<Point>, DbError> {
        let started = Instant::now();
        let result = self
            .snapshot(series)
            .and_then(|set| execute_query(&set, filter, self.config.aggregate.direct_singletons));
        self.finish_query(series, started, result)
    }

    /// Computes `kind` over the visible points of `series` satisfying `filter`.
    ///
    /// An empty selection yields the identity value (`COUNT` 0, `SUM` 0.0, otherwise null).
    ///
    /// # Errors
    /// * `SeriesNotFound` for an unknown series.
    /// * `UnsupportedAggregate` for a numeric aggregate on a boolean series.
    /// * `Decode` / `Integrity` if stored data is corrupt; the query is aborted.
    pub fn aggregate(
        &self,
        series: &str,
        filter: &TimeFilter,
        kind: AggregateKind,
    ) -> Result<AggregateValue, DbError> {
        let started = Instant::now();
        let result = self.aggregate_inner(series, filter, kind);
        self.finish_query(series, started, result)
    }

    fn aggregate_inner(
        &self,
        series: &str,
        filter: &TimeFilter,
        kind: AggregateKind,
    ) -> Result<AggregateValue, DbError> {
        let data_type = self
            .store
            .read()?
            .data_type(series)
            .ok_or_else(|| DbError::SeriesNotFound(series.to_string()))?;
        kind.check_type(data_type)?;
        let set = self.snapshot(series)?;
        Aggregator::new(kind, *filter, self.config.aggregate).aggregate(&set)
    }

    /// Computes `kind` for several series in parallel. Each series succeeds or fails on its own.
    pub fn aggregate_many(
        &self,
        series: &[&str],
        filter: &TimeFilter,
        kind: AggregateKind,
    ) -> Vec<Result<AggregateValue, DbError>> {
        series
            .par_iter()
            .map(|s| self.aggregate(s, filter, kind))
            .collect()
    }

    fn finish_query<T>(
        &self,
        series: &str,
        started: Instant,
        result: Result<T, DbError>,
    ) -> Result<T, DbError> {
        db_metrics::record_query(started.elapsed(), result.is_ok());
        if let Err(e) = &result {
            self.config.event_listener.on_event(EngineEvent::QueryAborted {
                series: series.to_string(),
                error: e.to_string(),
            });
        }
        result
    }

    /// Rewrites every flushed chunk of `series` into one sequential chunk with a new version.
    ///
    /// Returns the new version, or `None` when there was nothing to merge. Queries that
    /// already hold a snapshot keep reading the old chunks.
    pub fn compact(&self, series: &str) -> Result<Option<Version>, DbError> {
        // Held for the whole rewrite so no flush lands between snapshot and install.
        let _buffer = self.write_buffer.lock()?;
        let set = self.store.read()?.snapshot(series)?;
        if set.len() < 2 {
            return Ok(None);
        }
        let removed: Vec<Version> = set.iter().map(|c| c.version()).collect();
        let points = execute_query(&set, &TimeFilter::all(), true)?;
        drop(set);

        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let chunk = Chunk::encode(series, ChunkKind::Sequential, version, &points)?;
        self.store.write()?.replace_chunks(series, &removed, chunk)?;

        self.config.event_listener.on_event(EngineEvent::ChunksCompacted {
            series: series.to_string(),
            inputs: removed.len(),
            version,
            points: points.len(),
        });
        Ok(Some(version))
    }

    /// Number of flushed chunks held for `series`.
    pub fn chunk_count(&self, series: &str) -> Result<usize, DbError> {
        Ok(self.store.read()?.chunk_count(series))
    }

    pub fn series_names(&self) -> Result<Vec<String>, DbError> {
        Ok(self.store.read()?.series_names())
    }

    /// Counters of chunk read handles opened and released by queries on this engine.
    pub fn read_handles(&self) -> Result<Arc<ReadHandleTracker>, DbError> {
        Ok(Arc::clone(self.store.read()?.handles()))
    }
}

/// Flushed chunks and copied memtable points of one series, taken under the write buffer lock.
#[derive(Debug)]
struct PendingSnapshot {
    flushed: ChunkSet,
    memtables: Vec<(ChunkKind, Vec<Point>)>,
    base_version: Version,
}

impl PendingSnapshot {
    fn build(self) -> Result<ChunkSet, DbError> {
        let series = self.flushed.series().to_string();
        let transient = self
            .memtables
            .into_iter()
            .enumerate()
            .map(|(i, (kind, points))| {
                Chunk::encode(&series, kind, self.base_version + i as Version, &points)
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>, DbError>>()?;
        self.flushed.with_transient(transient)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::build(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Default)]
    struct Recorder(StdMutex<Vec<EngineEvent>>);

    impl EngineEventListener for Recorder {
        fn on_event(&self, event: EngineEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn engine_with(threshold: usize) -> (Engine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let config = EngineConfig {
            memtable_size_threshold: threshold,
            event_listener: recorder.clone(),
            ..EngineConfig::default()
        };
        (Engine::with_config(config).unwrap(), recorder)
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let config = EngineConfig {
            memtable_size_threshold: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::with_config(config),
            Err(DbError::ConfigError(_))
        ));
    }

    #[test]
    fn unflushed_points_are_visible() {
        let engine = Engine::default();
        engine.insert("s", 2, Value::Int64(20)).unwrap();
        engine.insert("s", 1, Value::Int64(10)).unwrap();
        assert_eq!(engine.chunk_count("s").unwrap(), 0);

        let points = engine.query("s", &TimeFilter::all()).unwrap();
        assert_eq!(
            points,
            vec![Point::new(1, Value::Int64(10)), Point::new(2, Value::Int64(20))]
        );
    }

    #[test]
    fn late_writes_overwrite_flushed_values() {
        let (engine, recorder) = engine_with(usize::MAX);
        engine.insert("s", 5, Value::Int32(1)).unwrap();
        engine.insert("s", 6, Value::Int32(1)).unwrap();
        engine.flush().unwrap();
        engine.insert("s", 5, Value::Int32(2)).unwrap();

        let before = engine.query("s", &TimeFilter::all()).unwrap();
        engine.flush().unwrap();
        let after = engine.query("s", &TimeFilter::all()).unwrap();
        assert_eq!(before, after);
        assert_eq!(after[0], Point::new(5, Value::Int32(2)));
        assert_eq!(engine.chunk_count("s").unwrap(), 2);

        let events = recorder.0.lock().unwrap();
        assert!(matches!(
            events[1],
            EngineEvent::ChunkFlushed {
                kind: ChunkKind::Unsequential,
                version: 2,
                points: 1,
                ..
            }
        ));
    }

    #[test]
    fn threshold_triggers_flush_on_insert() {
        // Int64 points are charged 16 bytes each.
        let (engine, _) = engine_with(64);
        for t in 1..=8 {
            engine.insert("s", t, Value::Int64(t)).unwrap();
        }
        assert_eq!(engine.chunk_count("s").unwrap(), 2);
    }

    #[test]
    fn type_is_enforced() {
        let engine = Engine::default();
        engine.create_series("flag", DataType::Boolean).unwrap();
        assert!(matches!(
            engine.insert("flag", 1, Value::Int32(1)),
            Err(DbError::TypeMismatch { .. })
        ));
        assert!(engine
            .insert_batch("x", &[Point::new(1, Value::Int32(1)), Point::new(2, Value::Float(1.0))])
            .is_err());
        assert!(matches!(
            engine.aggregate("flag", &TimeFilter::all(), AggregateKind::Sum),
            Err(DbError::UnsupportedAggregate { .. })
        ));
    }

    #[test]
    fn unknown_series_reports_not_found_and_event() {
        let (engine, recorder) = engine_with(usize::MAX);
        let err = engine
            .aggregate("missing", &TimeFilter::all(), AggregateKind::Count)
            .unwrap_err();
        assert!(matches!(err, DbError::SeriesNotFound(_)));
        assert!(matches!(
            recorder.0.lock().unwrap()[0],
            EngineEvent::QueryAborted { .. }
        ));
    }

    #[test]
    fn empty_series_yields_identity() {
        let engine = Engine::default();
        engine.create_series("e", DataType::Double).unwrap();
        assert_eq!(
            engine.aggregate("e", &TimeFilter::all(), AggregateKind::Count).unwrap(),
            AggregateValue::Count(0)
        );
        assert_eq!(
            engine.aggregate("e", &TimeFilter::all(), AggregateKind::Max).unwrap(),
            AggregateValue::Scalar(None)
        );
    }

    #[test]
    fn compaction_preserves_results() {
        let (engine, recorder) = engine_with(usize::MAX);
        for t in 1..=10 {
            engine.insert("s", t, Value::Double(t as f64)).unwrap();
        }
        engine.flush().unwrap();
        for t in 3..=7 {
            engine.insert("s", t, Value::Double(-1.0)).unwrap();
        }
        engine.flush().unwrap();
        engine.insert("s", 11, Value::Double(11.0)).unwrap();
        engine.flush().unwrap();

        let filter = TimeFilter::all();
        let before = engine.query("s", &filter).unwrap();
        let sum_before = engine.aggregate("s", &filter, AggregateKind::Sum).unwrap();

        let version = engine.compact("s").unwrap();
        assert_eq!(version, Some(4));
        assert_eq!(engine.chunk_count("s").unwrap(), 1);
        assert_eq!(engine.query("s", &filter).unwrap(), before);
        assert_eq!(engine.aggregate("s", &filter, AggregateKind::Sum).unwrap(), sum_before);
        assert_eq!(engine.compact("s").unwrap(), None);

        assert!(recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, EngineEvent::ChunksCompacted { inputs: 3, .. })));

        // Newer late writes still win over the compacted chunk.
        engine.insert("s", 4, Value::Double(100.0)).unwrap();
        let points = engine.query("s", &TimeFilter::eq(4)).unwrap();
        assert_eq!(points, vec![Point::new(4, Value::Double(100.0))]);
    }

    #[test]
    fn aggregate_many_fails_independently() {
        let engine = Engine::default();
        engine.insert("a", 1, Value::Int32(1)).unwrap();
        engine.insert("b", 1, Value::Int32(1)).unwrap();
        engine.insert("b", 2, Value::Int32(1)).unwrap();

        let results = engine.aggregate_many(&["a", "missing", "b"], &TimeFilter::all(), AggregateKind::Count);
        assert_eq!(results[0].as_ref().unwrap(), &AggregateValue::Count(1));
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), &AggregateValue::Count(2));
    }

    #[test]
    fn snapshot_encodes_memtables_after_releasing_the_write_buffer() {
        let engine = Engine::default();
        for t in 1..=100 {
            engine.insert("a", t, Value::Int64(t)).unwrap();
        }
        let pending = engine.capture("a").unwrap();
        assert!(engine.write_buffer.try_lock().is_ok());

        engine.insert("b", 1, Value::Int64(1)).unwrap();
        engine.insert("a", 101, Value::Int64(101)).unwrap();
        let set = pending.build().unwrap();
        assert_eq!(execute_query(&set, &TimeFilter::all(), true).unwrap().len(), 100);
        assert_eq!(engine.query("a", &TimeFilter::all()).unwrap().len(), 101);
    }

    #[test]
    fn writers_to_other_series_proceed_during_queries() {
        let engine = Engine::default();
        let points: Vec<Point> = (0..50_000).map(|t| Point::new(t, Value::Int64(t))).collect();
        engine.insert_batch("a", &points).unwrap();

        std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                for _ in 0..20 {
                    let count = engine
                        .aggregate("a", &TimeFilter::all(), AggregateKind::Count)
                        .unwrap();
                    assert_eq!(count, AggregateValue::Count(50_000));
                }
            });
            for t in 0..2_000 {
                engine.insert("b", t, Value::Int64(t)).unwrap();
            }
            reader.join().unwrap();
        });
        assert_eq!(
            engine.aggregate("b", &TimeFilter::all(), AggregateKind::Count).unwrap(),
            AggregateValue::Count(2_000)
        );
    }

    #[test]
    fn handles_are_balanced_after_queries() {
        let engine = Engine::default();
        for t in 1..=5 {
            engine.insert("s", t, Value::Int32(1)).unwrap();
        }
        engine.flush().unwrap();
        engine.insert("s", 2, Value::Int32(2)).unwrap();
        engine.query("s", &TimeFilter::all()).unwrap();
        engine
            .aggregate("s", &TimeFilter::lt(4), AggregateKind::Count)
            .unwrap();

        let handles = engine.read_handles().unwrap();
        assert!(handles.acquired() > 0);
        assert_eq!(handles.live(), 0);
    }
}
