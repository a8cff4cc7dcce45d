//! Incremental aggregation over the deduplicated point stream of a `ChunkSet`.
//!
//! Each overlap group is aggregated on its own and the partial results are merged in time
//! order. A group is read through one of three paths:
//!
//! - **statistics**: a single chunk whose whole range satisfies the predicate is answered from
//!   its flush-time statistics without decoding;
//! - **direct**: any other single-chunk group is read straight from its chunk reader;
//! - **merged**: groups of two or more chunks go through the priority merge iterator.
//!
//! All three give identical results.

use crate::chunk::ChunkStatistics;
use crate::error::DbError;
use crate::filter::TimeFilter;
use crate::merge::GroupCursor;
use crate::selector::{select, ChunkSet, OverlapGroup};
use crate::telemetry::db_metrics;
use crate::types::{DataType, Point, Timestamp, Value};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Aggregate functions. Serde: snake_case string (e.g. `"min_time"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    MinTime,
    MaxTime,
}

impl AggregateKind {
    pub fn name(self) -> &'static str {
        match self {
            AggregateKind::Count => "count",
            AggregateKind::Sum => "sum",
            AggregateKind::Avg => "avg",
            AggregateKind::Min => "min_value",
            AggregateKind::Max => "max_value",
            AggregateKind::First => "first_value",
            AggregateKind::Last => "last_value",
            AggregateKind::MinTime => "min_time",
            AggregateKind::MaxTime => "max_time",
        }
    }

    /// Rejects kinds that have no meaning for `data_type`.
    /// True for aggregates settled by the earliest matching point. Groups are then read in
    /// time order and reading stops at the first group that settles the result, so damage in
    /// later groups is not seen.
    pub fn settles_early(self) -> bool {
        matches!(self, AggregateKind::First | AggregateKind::MinTime)
    }

    pub fn check_type(self, data_type: DataType) -> Result<(), DbError> {
        let needs_order = matches!(
            self,
            AggregateKind::Sum | AggregateKind::Avg | AggregateKind::Min | AggregateKind::Max
        );
        if needs_order && !data_type.is_numeric() {
            return Err(DbError::UnsupportedAggregate {
                aggregate: self.name(),
                data_type,
            });
        }
        Ok(())
    }
}

impl FromStr for AggregateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Ok(AggregateKind::Count),
            "sum" => Ok(AggregateKind::Sum),
            "avg" => Ok(AggregateKind::Avg),
            "min" | "min_value" => Ok(AggregateKind::Min),
            "max" | "max_value" => Ok(AggregateKind::Max),
            "first" | "first_value" => Ok(AggregateKind::First),
            "last" | "last_value" => Ok(AggregateKind::Last),
            "min_time" => Ok(AggregateKind::MinTime),
            "max_time" => Ok(AggregateKind::MaxTime),
            other => Err(format!("unknown aggregate {:?}", other)),
        }
    }
}

/// Final value of an aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateValue {
    Count(u64),
    Double(Option<f64>),
    Scalar(Option<Value>),
    Time(Option<Timestamp>),
}

impl fmt::Display for AggregateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateValue::Count(n) => write!(f, "{}", n),
            AggregateValue::Double(Some(v)) => write!(f, "{}", v),
            AggregateValue::Scalar(Some(v)) => write!(f, "{}", v),
            AggregateValue::Time(Some(t)) => write!(f, "{}", t),
            AggregateValue::Double(None)
            | AggregateValue::Scalar(None)
            | AggregateValue::Time(None) => write!(f, "null"),
        }
    }
}

/// Running state for one aggregate. Points must be pushed in ascending timestamp order.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Count(u64),
    Sum(f64),
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    MinTime(Option<Timestamp>),
    MaxTime(Option<Timestamp>),
}

impl Accumulator {
    pub fn new(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Count => Accumulator::Count(0),
            AggregateKind::Sum => Accumulator::Sum(0.0),
            AggregateKind::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggregateKind::Min => Accumulator::Min(None),
            AggregateKind::Max => Accumulator::Max(None),
            AggregateKind::First => Accumulator::First(None),
            AggregateKind::Last => Accumulator::Last(None),
            AggregateKind::MinTime => Accumulator::MinTime(None),
            AggregateKind::MaxTime => Accumulator::MaxTime(None),
        }
    }

    pub fn push(&mut self, p: &Point) {
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(s) => *s += p.value.as_f64().unwrap_or(0.0),
            Accumulator::Avg { sum, count } => {
                *sum += p.value.as_f64().unwrap_or(0.0);
                *count += 1;
            }
            Accumulator::Min(m) => keep_if(m, p.value, |new, cur| new.total_cmp(cur).is_lt()),
            Accumulator::Max(m) => keep_if(m, p.value, |new, cur| new.total_cmp(cur).is_gt()),
            Accumulator::First(v) => {
                v.get_or_insert(p.value);
            }
            Accumulator::Last(v) => *v = Some(p.value),
            Accumulator::MinTime(t) => {
                t.get_or_insert(p.timestamp);
            }
            Accumulator::MaxTime(t) => *t = Some(p.timestamp),
        }
    }

    /// Folds a whole chunk's statistics in, as if each of its points had been pushed.
    pub fn push_statistics(&mut self, stats: &ChunkStatistics) {
        match self {
            Accumulator::Count(n) => *n += stats.count,
            Accumulator::Sum(s) => *s += stats.sum.unwrap_or(0.0),
            Accumulator::Avg { sum, count } => {
                *sum += stats.sum.unwrap_or(0.0);
                *count += stats.count;
            }
            Accumulator::Min(m) => keep_if(m, stats.min, |new, cur| new.total_cmp(cur).is_lt()),
            Accumulator::Max(m) => keep_if(m, stats.max, |new, cur| new.total_cmp(cur).is_gt()),
            Accumulator::First(v) => {
                v.get_or_insert(stats.first.value);
            }
            Accumulator::Last(v) => *v = Some(stats.last.value),
            Accumulator::MinTime(t) => {
                t.get_or_insert(stats.first.timestamp);
            }
            Accumulator::MaxTime(t) => *t = Some(stats.last.timestamp),
        }
    }

    /// Merges the partial result of a later, disjoint time range.
    pub fn merge(&mut self, later: Accumulator) {
        match (self, later) {
            (Accumulator::Count(a), Accumulator::Count(b)) => *a += b,
            (Accumulator::Sum(a), Accumulator::Sum(b)) => *a += b,
            (Accumulator::Avg { sum, count }, Accumulator::Avg { sum: s, count: c }) => {
                *sum += s;
                *count += c;
            }
            (Accumulator::Min(a), Accumulator::Min(Some(b))) => {
                keep_if(a, b, |new, cur| new.total_cmp(cur).is_lt())
            }
            (Accumulator::Max(a), Accumulator::Max(Some(b))) => {
                keep_if(a, b, |new, cur| new.total_cmp(cur).is_gt())
            }
            (Accumulator::First(a), Accumulator::First(b)) => {
                if a.is_none() {
                    *a = b;
                }
            }
            (Accumulator::MinTime(a), Accumulator::MinTime(b)) => {
                if a.is_none() {
                    *a = b;
                }
            }
            (Accumulator::Last(a), Accumulator::Last(b @ Some(_))) => *a = b,
            (Accumulator::MaxTime(a), Accumulator::MaxTime(b @ Some(_))) => *a = b,
            _ => {}
        }
    }

    /// True once no later point can change the result.
    pub fn is_saturated(&self) -> bool {
        matches!(
            self,
            Accumulator::First(Some(_)) | Accumulator::MinTime(Some(_))
        )
    }

    pub fn finish(&self) -> AggregateValue {
        match self {
            Accumulator::Count(n) => AggregateValue::Count(*n),
            Accumulator::Sum(s) => AggregateValue::Double(Some(*s)),
            Accumulator::Avg { sum, count } => {
                AggregateValue::Double((*count > 0).then(|| sum / *count as f64))
            }
            Accumulator::Min(v)
            | Accumulator::Max(v)
            | Accumulator::First(v)
            | Accumulator::Last(v) => AggregateValue::Scalar(*v),
            Accumulator::MinTime(t) | Accumulator::MaxTime(t) => AggregateValue::Time(*t),
        }
    }
}

fn keep_if(slot: &mut Option<Value>, candidate: Value, better: impl Fn(&Value, &Value) -> bool) {
    match slot {
        Some(cur) if !better(&candidate, cur) => {}
        _ => *slot = Some(candidate),
    }
}

/// Which read path a group took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPath {
    Statistics,
    Direct,
    Merged,
}

/// Switches for the fast paths and group parallelism. All on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateOptions {
    /// Read single-chunk groups without the merge iterator.
    pub direct_singletons: bool,
    /// Answer single-chunk groups fully inside the predicate from chunk statistics.
    pub use_statistics: bool,
    /// Aggregate overlap groups on the rayon pool. Ignored for `FIRST` and `MIN_TIME`, which
    /// always read groups in time order and stop once settled.
    pub parallel_groups: bool,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            direct_singletons: true,
            use_statistics: true,
            parallel_groups: true,
        }
    }
}

impl AggregateOptions {
    /// Every group through the merge iterator, sequentially.
    pub fn merge_only() -> Self {
        Self {
            direct_singletons: false,
            use_statistics: false,
            parallel_groups: false,
        }
    }
}

/// Result of aggregating one `ChunkSet`, with the path each group took.
#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    pub accumulator: Accumulator,
    pub paths: Vec<GroupPath>,
}

impl AggregateOutcome {
    pub fn value(&self) -> AggregateValue {
        self.accumulator.finish()
    }
}

/// Computes one aggregate under one time predicate.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    kind: AggregateKind,
    filter: TimeFilter,
    options: AggregateOptions,
}

impl Aggregator {
    pub fn new(kind: AggregateKind, filter: TimeFilter, options: AggregateOptions) -> Self {
        Self {
            kind,
            filter,
            options,
        }
    }

    pub fn kind(&self) -> AggregateKind {
        self.kind
    }

    pub fn filter(&self) -> &TimeFilter {
        &self.filter
    }

    /// Aggregates the whole set. An empty selection yields the identity value.
    ///
    /// # Errors
    /// Any decode or integrity error aborts the aggregate; no partial value is returned.
    pub fn aggregate(&self, set: &ChunkSet) -> Result<AggregateValue, DbError> {
        self.run(set).map(|o| o.value())
    }

    pub fn run(&self, set: &ChunkSet) -> Result<AggregateOutcome, DbError> {
        if let Some(dt) = set.data_type() {
            self.kind.check_type(dt)?;
        }
        let groups = select(set, &self.filter);

        let parallel =
            self.options.parallel_groups && groups.len() > 1 && !self.kind.settles_early();
        let partials: Vec<(Accumulator, GroupPath)> = if parallel {
            groups
                .par_iter()
                .map(|g| self.aggregate_group(set, g))
                .collect::<Result<Vec<_>, DbError>>()?
        } else {
            let mut out = Vec::with_capacity(groups.len());
            for g in &groups {
                let (acc, path) = self.aggregate_group(set, g)?;
                let saturated = acc.is_saturated();
                out.push((acc, path));
                if saturated {
                    break;
                }
            }
            out
        };

        let mut accumulator = Accumulator::new(self.kind);
        let mut paths = Vec::with_capacity(partials.len());
        for (acc, path) in partials {
            db_metrics::record_group(path);
            accumulator.merge(acc);
            paths.push(path);
        }
        Ok(AggregateOutcome { accumulator, paths })
    }

    /// Aggregates one overlap group on its own.
    pub fn aggregate_group(
        &self,
        set: &ChunkSet,
        group: &OverlapGroup,
    ) -> Result<(Accumulator, GroupPath), DbError> {
        let mut acc = Accumulator::new(self.kind);

        if self.options.use_statistics && group.is_singleton() {
            let chunk = &group.chunks()[0];
            if self.filter.contains_range(chunk.min_time(), chunk.max_time()) {
                if let Some(stats) = chunk.statistics() {
                    chunk.verify()?;
                    acc.push_statistics(stats);
                    return Ok((acc, GroupPath::Statistics));
                }
            }
        }

        let cursor = GroupCursor::open(set, group, &self.filter, self.options.direct_singletons)?;
        let path = if cursor.is_direct() {
            GroupPath::Direct
        } else {
            GroupPath::Merged
        };
        self.consume(&mut acc, cursor)?;
        Ok((acc, path))
    }

    /// Pushes every point that satisfies the predicate, stopping early once the predicate can
    /// no longer match or the result is settled.
    pub fn consume<I>(&self, acc: &mut Accumulator, points: I) -> Result<(), DbError>
    where
        I: IntoIterator<Item = Result<Point, DbError>>,
    {
        for item in points {
            let p = item?;
            if p.timestamp > self.filter.end() {
                break;
            }
            if !self.filter.satisfies(p.timestamp) {
                continue;
            }
            acc.push(&p);
            if acc.is_saturated() {
                break;
            }
        }
        Ok(())
    }
}
