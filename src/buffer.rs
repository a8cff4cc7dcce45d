use crate::types::{ChunkKind, Point, Timestamp, Value};
use std::collections::{BTreeMap, HashMap};

/// Bytes charged per point on top of the value width (the timestamp).
const TIMESTAMP_BYTES: usize = 8;

/// Sorted in-memory points awaiting flush. A second write to the same timestamp replaces
/// the first.
#[derive(Debug, Default, Clone)]
pub struct MemTable {
    points: BTreeMap<Timestamp, Value>,
}

impl MemTable {
    pub fn insert(&mut self, point: Point) {
        self.points.insert(point.timestamp, point.value);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Estimated size in bytes for values of `value_width` bytes.
    pub fn estimated_bytes(&self, value_width: usize) -> usize {
        self.points.len() * (TIMESTAMP_BYTES + value_width)
    }

    pub fn max_time(&self) -> Option<Timestamp> {
        self.points.keys().next_back().copied()
    }

    /// Points in ascending timestamp order.
    pub fn to_points(&self) -> Vec<Point> {
        self.points
            .iter()
            .map(|(&t, &v)| Point::new(t, v))
            .collect()
    }

    fn take(&mut self) -> Vec<Point> {
        let points = self.to_points();
        self.points.clear();
        points
    }
}

/// The two memtables of one series plus the time that separates them.
#[derive(Debug, Default)]
struct SeriesMemTables {
    sequential: MemTable,
    unsequential: MemTable,
    /// Largest timestamp flushed in a sequential chunk so far.
    last_flushed_time: Option<Timestamp>,
}

impl SeriesMemTables {
    fn table(&self, kind: ChunkKind) -> &MemTable {
        match kind {
            ChunkKind::Sequential => &self.sequential,
            ChunkKind::Unsequential => &self.unsequential,
        }
    }

    fn table_mut(&mut self, kind: ChunkKind) -> &mut MemTable {
        match kind {
            ChunkKind::Sequential => &mut self.sequential,
            ChunkKind::Unsequential => &mut self.unsequential,
        }
    }
}

/// Staging area for incoming points, one pair of memtables per series.
///
/// A point whose timestamp is not after the series' last flushed sequential time is late data
/// and goes to the unsequential memtable; everything else goes to the sequential one.
#[derive(Debug)]
pub struct WriteBuffer {
    series: HashMap<String, SeriesMemTables>,
    size_threshold: usize,
}

impl WriteBuffer {
    /// Memtables are reported as full once their estimated size reaches `size_threshold` bytes.
    pub fn new(size_threshold: usize) -> Self {
        Self {
            series: HashMap::new(),
            size_threshold,
        }
    }

    /// Classifies a timestamp against the series' flushed sequential data.
    pub fn classify(&self, series: &str, timestamp: Timestamp) -> ChunkKind {
        match self.series.get(series).and_then(|s| s.last_flushed_time) {
            Some(flushed) if timestamp <= flushed => ChunkKind::Unsequential,
            _ => ChunkKind::Sequential,
        }
    }

    /// Stages a point. Returns the kind of memtable that reached the size threshold, if any.
    pub fn stage(&mut self, series: &str, point: Point) -> Option<ChunkKind> {
        let kind = self.classify(series, point.timestamp);
        let width = point.value.data_type().width();
        let tables = self.series.entry(series.to_string()).or_default();
        let table = tables.table_mut(kind);
        table.insert(point);
        (table.estimated_bytes(width) >= self.size_threshold).then_some(kind)
    }

    /// Removes and returns the contents of one memtable. Draining the sequential memtable
    /// advances the series' flushed time.
    pub fn drain(&mut self, series: &str, kind: ChunkKind) -> Option<Vec<Point>> {
        let tables = self.series.get_mut(series)?;
        let table = tables.table_mut(kind);
        if table.is_empty() {
            return None;
        }
        if kind == ChunkKind::Sequential {
            let max = table.max_time();
            tables.last_flushed_time = tables.last_flushed_time.max(max);
        }
        Some(tables.table_mut(kind).take())
    }

    /// Every non-empty memtable, in a stable order (series name, sequential first).
    pub fn pending(&self) -> Vec<(String, ChunkKind)> {
        let mut out: Vec<(String, ChunkKind)> = Vec::new();
        for (name, tables) in &self.series {
            for kind in [ChunkKind::Sequential, ChunkKind::Unsequential] {
                if !tables.table(kind).is_empty() {
                    out.push((name.clone(), kind));
                }
            }
        }
        out.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| (a.1 == ChunkKind::Unsequential).cmp(&(b.1 == ChunkKind::Unsequential)))
        });
        out
    }

    /// Copies of the series' unflushed points, by memtable kind.
    pub fn snapshot(&self, series: &str) -> Vec<(ChunkKind, Vec<Point>)> {
        let Some(tables) = self.series.get(series) else {
            return Vec::new();
        };
        [ChunkKind::Sequential, ChunkKind::Unsequential]
            .into_iter()
            .filter(|&k| !tables.table(k).is_empty())
            .map(|k| (k, tables.table(k).to_points()))
            .collect()
    }

    pub fn last_flushed_time(&self, series: &str) -> Option<Timestamp> {
        self.series.get(series).and_then(|s| s.last_flushed_time)
    }

    /// Total number of unflushed points across all series.
    pub fn len(&self) -> usize {
        self.series
            .values()
            .map(|s| s.sequential.len() + s.unsequential.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
