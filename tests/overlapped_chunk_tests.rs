//! Late writes flushed as many small overlapping unsequential chunks next to one sequential chunk.

use chunkmerge::*;
use std::sync::{Arc, Mutex};

const SERIES: &str = "root.vehicle.d0.s0";

#[derive(Debug, Default)]
struct FlushLog(Mutex<Vec<(ChunkKind, Version)>>);

impl EngineEventListener for FlushLog {
    fn on_event(&self, event: EngineEvent) {
        if let EngineEvent::ChunkFlushed { kind, version, .. } = event {
            self.0.lock().unwrap().push((kind, version));
        }
    }
}

/// One sequential chunk at t=1000000, then t=1..1000 and overwrites of t=2..1000 that flush
/// every 1024 bytes into overlapping unsequential chunks.
fn overlapped_engine(options: AggregateOptions) -> (Engine, Arc<FlushLog>) {
    let log = Arc::new(FlushLog::default());
    let engine = Engine::with_config(EngineConfig {
        memtable_size_threshold: 1024,
        aggregate: options,
        event_listener: log.clone(),
    })
    .unwrap();

    engine.insert(SERIES, 1_000_000, Value::Int32(1_000_000)).unwrap();
    engine.flush().unwrap();

    for t in 1..=1000 {
        engine.insert(SERIES, t, Value::Int32(t as i32)).unwrap();
    }
    for t in 2..=1000 {
        engine.insert(SERIES, t, Value::Int32(1000)).unwrap();
    }
    engine.flush().unwrap();
    (engine, log)
}

#[test]
fn count_under_overlap_is_distinct_timestamps() {
    let (engine, log) = overlapped_engine(AggregateOptions::default());

    let flushed = log.0.lock().unwrap().clone();
    assert_eq!(flushed[0], (ChunkKind::Sequential, 1));
    assert!(flushed.len() > 10, "expected many small chunks, got {}", flushed.len());
    assert!(flushed[1..].iter().all(|(k, _)| *k == ChunkKind::Unsequential));

    let count = engine
        .aggregate(SERIES, &TimeFilter::lt(1_000_000), AggregateKind::Count)
        .unwrap();
    assert_eq!(count, AggregateValue::Count(1000));

    let all = engine
        .aggregate(SERIES, &TimeFilter::all(), AggregateKind::Count)
        .unwrap();
    assert_eq!(all, AggregateValue::Count(1001));
}

#[test]
fn overwritten_values_win() {
    let (engine, _) = overlapped_engine(AggregateOptions::default());
    let filter = TimeFilter::lt(1_000_000);

    assert_eq!(
        engine.aggregate(SERIES, &filter, AggregateKind::First).unwrap(),
        AggregateValue::Scalar(Some(Value::Int32(1)))
    );
    assert_eq!(
        engine.aggregate(SERIES, &filter, AggregateKind::Last).unwrap(),
        AggregateValue::Scalar(Some(Value::Int32(1000)))
    );
    assert_eq!(
        engine.aggregate(SERIES, &filter, AggregateKind::Min).unwrap(),
        AggregateValue::Scalar(Some(Value::Int32(1)))
    );
    assert_eq!(
        engine.aggregate(SERIES, &filter, AggregateKind::Sum).unwrap(),
        AggregateValue::Double(Some(1.0 + 999.0 * 1000.0))
    );
    assert_eq!(
        engine.aggregate(SERIES, &filter, AggregateKind::MaxTime).unwrap(),
        AggregateValue::Time(Some(1000))
    );
    assert_eq!(
        engine.aggregate(SERIES, &TimeFilter::all(), AggregateKind::Max).unwrap(),
        AggregateValue::Scalar(Some(Value::Int32(1_000_000)))
    );

    let points = engine.query(SERIES, &TimeFilter::between(1, 3)).unwrap();
    assert_eq!(
        points,
        vec![
            Point::new(1, Value::Int32(1)),
            Point::new(2, Value::Int32(1000)),
            Point::new(3, Value::Int32(1000)),
        ]
    );
}

#[test]
fn merge_only_path_agrees_with_fast_paths() {
    let (fast, _) = overlapped_engine(AggregateOptions::default());
    let (slow, _) = overlapped_engine(AggregateOptions::merge_only());

    let filters = [
        TimeFilter::all(),
        TimeFilter::lt(1_000_000),
        TimeFilter::between(500, 1_000_000),
        TimeFilter::gt(1000),
        TimeFilter::eq(1),
    ];
    let kinds = [
        AggregateKind::Count,
        AggregateKind::Sum,
        AggregateKind::Avg,
        AggregateKind::Min,
        AggregateKind::Max,
        AggregateKind::First,
        AggregateKind::Last,
        AggregateKind::MinTime,
        AggregateKind::MaxTime,
    ];
    for filter in &filters {
        for kind in kinds {
            assert_eq!(
                fast.aggregate(SERIES, filter, kind).unwrap(),
                slow.aggregate(SERIES, filter, kind).unwrap(),
                "{} where {}",
                kind.name(),
                filter
            );
        }
        assert_eq!(
            fast.query(SERIES, filter).unwrap(),
            slow.query(SERIES, filter).unwrap()
        );
    }
}

#[test]
fn repeated_queries_are_identical_and_release_handles() {
    let (engine, _) = overlapped_engine(AggregateOptions::default());
    let filter = TimeFilter::lt(1_000_000);

    let first = engine.query(SERIES, &filter).unwrap();
    let second = engine.query(SERIES, &filter).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 1000);
    assert!(first.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    let handles = engine.read_handles().unwrap();
    assert!(handles.acquired() > 0);
    assert_eq!(handles.acquired(), handles.released());
}

#[test]
fn compaction_collapses_overlap() {
    let (engine, _) = overlapped_engine(AggregateOptions::default());
    let before = engine.query(SERIES, &TimeFilter::all()).unwrap();
    let chunks_before = engine.chunk_count(SERIES).unwrap();
    assert!(chunks_before > 2);

    engine.compact(SERIES).unwrap();
    assert_eq!(engine.chunk_count(SERIES).unwrap(), 1);
    assert_eq!(engine.query(SERIES, &TimeFilter::all()).unwrap(), before);
    assert_eq!(
        engine
            .aggregate(SERIES, &TimeFilter::lt(1_000_000), AggregateKind::Count)
            .unwrap(),
        AggregateValue::Count(1000)
    );
}

#[test]
fn selector_sees_one_group_for_the_late_data() {
    let (engine, _) = overlapped_engine(AggregateOptions::default());
    let set = engine.snapshot(SERIES).unwrap();
    let groups = select(&set, &TimeFilter::all());

    // The unsequential chunks chain into one group; the sequential chunk stands alone.
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].min_time(), 1);
    assert_eq!(groups[0].max_time(), 1000);
    assert!(groups[1].is_singleton());
    assert_eq!(groups[1].min_time(), 1_000_000);
}
