#![doc = include_str!("../README.md")]
// Declare modules
pub mod aggregate;
pub mod buffer;
pub mod chunk;
pub mod core;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod merge;
pub mod query;
pub mod selector;
pub mod storage;
pub mod telemetry;
pub mod types;

/// Aggregate functions, their results and read-path switches.
pub use crate::aggregate::{AggregateKind, AggregateOptions, AggregateValue, Aggregator};
/// Immutable chunk, its reader and the handle counters.
pub use crate::chunk::{Chunk, ChunkReader, ChunkStatistics, ReadHandleTracker};
/// Configuration options for the engine.
pub use crate::core::EngineConfig;
/// Main entry point for writing and querying series.
pub use crate::core::Engine;
/// Error type for engine operations.
pub use crate::error::DbError;
/// Closed time predicate.
pub use crate::filter::TimeFilter;
/// K-way merge over one overlap group.
pub use crate::merge::PriorityMergeIterator;
/// Chunk snapshot of one series and its overlap groups.
pub use crate::selector::{select, ChunkSet, OverlapGroup};
/// Structured event hook for observability.
pub use crate::telemetry::{EngineEvent, EngineEventListener};
/// Core data model.
pub use crate::types::{ChunkKind, DataType, Point, Timestamp, Value, Version};

/// The default memtable flush threshold (16 MiB).
pub const DEFAULT_MEMTABLE_SIZE_THRESHOLD: usize = 16 * 1024 * 1024;
