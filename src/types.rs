use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type (signed, unit chosen by the writer).
pub type Timestamp = i64;

/// Write-order version assigned to a chunk at flush time. Higher means more recent.
pub type Version = u64;

/// Scalar type of a series. Serde: lowercase string (e.g. `"int32"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float,
    Double,
}

impl DataType {
    /// Encoded width of one value in bytes.
    pub const fn width(self) -> usize {
        match self {
            DataType::Boolean => 1,
            DataType::Int32 | DataType::Float => 4,
            DataType::Int64 | DataType::Double => 8,
        }
    }

    pub(crate) const fn code(self) -> u8 {
        match self {
            DataType::Boolean => 1,
            DataType::Int32 => 2,
            DataType::Int64 => 3,
            DataType::Float => 4,
            DataType::Double => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DataType::Boolean),
            2 => Some(DataType::Int32),
            3 => Some(DataType::Int64),
            4 => Some(DataType::Float),
            5 => Some(DataType::Double),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, DataType::Boolean)
    }
}

/// A typed scalar value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
        }
    }

    /// Numeric view used by SUM and AVG. `None` for booleans.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Boolean(_) => None,
            Value::Int32(v) => Some(v as f64),
            Value::Int64(v) => Some(v as f64),
            Value::Float(v) => Some(v as f64),
            Value::Double(v) => Some(v),
        }
    }

    /// Total order between two values of the same type. Mixed types and booleans
    /// compare through their numeric view.
    pub(crate) fn total_cmp(&self, other: &Value) -> std::cmp::Ordering {
        match (self, other) {
            (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (a, b) => a
                .as_f64()
                .unwrap_or(0.0)
                .total_cmp(&b.as_f64().unwrap_or(0.0)),
        }
    }

    /// Parses `raw` as a value of type `data_type`.
    pub fn parse(data_type: DataType, raw: &str) -> Option<Value> {
        match data_type {
            DataType::Boolean => raw.parse().ok().map(Value::Boolean),
            DataType::Int32 => raw.parse().ok().map(Value::Int32),
            DataType::Int64 => raw.parse().ok().map(Value::Int64),
            DataType::Float => raw.parse().ok().map(Value::Float),
            DataType::Double => raw.parse().ok().map(Value::Double),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
        }
    }
}

/// A single (timestamp, value) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Point {
    pub fn new(timestamp: Timestamp, value: Value) -> Self {
        Self { timestamp, value }
    }
}

/// Whether a chunk was flushed in global timestamp order relative to prior flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Sequential,
    Unsequential,
}
