//! Time predicates, normalised to a closed interval.

use crate::types::Timestamp;
use std::fmt;

/// A time predicate over a closed interval `[start, end]`.
///
/// All supported predicates (`time < T`, `time >= T`, ranges, conjunctions) reduce to one
/// interval. An interval with `start > end` matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeFilter {
    start: Timestamp,
    end: Timestamp,
}

impl TimeFilter {
    /// Unrestricted predicate.
    pub const fn all() -> Self {
        Self {
            start: Timestamp::MIN,
            end: Timestamp::MAX,
        }
    }

    /// `time < t`
    pub fn lt(t: Timestamp) -> Self {
        match t.checked_sub(1) {
            Some(end) => Self {
                start: Timestamp::MIN,
                end,
            },
            None => Self::none(),
        }
    }

    /// `time <= t`
    pub fn lt_eq(t: Timestamp) -> Self {
        Self {
            start: Timestamp::MIN,
            end: t,
        }
    }

    /// `time > t`
    pub fn gt(t: Timestamp) -> Self {
        match t.checked_add(1) {
            Some(start) => Self {
                start,
                end: Timestamp::MAX,
            },
            None => Self::none(),
        }
    }

    /// `time >= t`
    pub fn gt_eq(t: Timestamp) -> Self {
        Self {
            start: t,
            end: Timestamp::MAX,
        }
    }

    /// `time = t`
    pub fn eq(t: Timestamp) -> Self {
        Self { start: t, end: t }
    }

    /// `start <= time <= end`
    pub fn between(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    fn none() -> Self {
        Self {
            start: Timestamp::MAX,
            end: Timestamp::MIN,
        }
    }

    /// Conjunction of two predicates.
    pub fn and(self, other: TimeFilter) -> Self {
        Self {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        }
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    #[inline]
    pub fn satisfies(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }

    /// True if any timestamp in `[min, max]` satisfies the predicate.
    #[inline]
    pub fn intersects(&self, min: Timestamp, max: Timestamp) -> bool {
        !self.is_empty() && min <= self.end && self.start <= max
    }

    /// True if every timestamp in `[min, max]` satisfies the predicate.
    #[inline]
    pub fn contains_range(&self, min: Timestamp, max: Timestamp) -> bool {
        !self.is_empty() && self.start <= min && max <= self.end
    }
}

impl Default for TimeFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Display for TimeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "false");
        }
        match (self.start, self.end) {
            (Timestamp::MIN, Timestamp::MAX) => write!(f, "true"),
            (Timestamp::MIN, end) => write!(f, "time <= {}", end),
            (start, Timestamp::MAX) => write!(f, "time >= {}", start),
            (start, end) => write!(f, "{} <= time <= {}", start, end),
        }
    }
}
