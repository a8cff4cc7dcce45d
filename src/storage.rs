use crate::chunk::{Chunk, ReadHandleTracker};
use crate::error::DbError;
use crate::selector::ChunkSet;
use crate::types::{ChunkKind, DataType, Version};
use std::collections::HashMap;
use std::sync::Arc;

/// Chunks of one series, split by origin kind.
#[derive(Debug)]
struct SeriesChunks {
    data_type: DataType,
    sequential: Vec<Arc<Chunk>>,
    unsequential: Vec<Arc<Chunk>>,
}

impl SeriesChunks {
    fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            sequential: Vec::new(),
            unsequential: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.sequential.len() + self.unsequential.len()
    }
}

/// In-memory registry of flushed chunks per series.
///
/// Queries take snapshots by cloning `Arc`s, so replacing chunks during compaction never
/// invalidates a running query; a removed chunk is freed when the last snapshot holding it
/// is dropped.
#[derive(Debug, Default)]
pub struct ChunkStore {
    series_data: HashMap<String, SeriesChunks>,
    handles: Arc<ReadHandleTracker>,
}

impl ChunkStore {
    /// Registers a series with its data type. Registering again with the same type is a no-op.
    pub fn register_series(&mut self, series: &str, data_type: DataType) -> Result<(), DbError> {
        match self.series_data.get(series) {
            Some(existing) if existing.data_type != data_type => Err(DbError::TypeMismatch {
                series: series.to_string(),
                expected: existing.data_type,
                actual: data_type,
            }),
            Some(_) => Ok(()),
            None => {
                self.series_data
                    .insert(series.to_string(), SeriesChunks::new(data_type));
                Ok(())
            }
        }
    }

    pub fn data_type(&self, series: &str) -> Option<DataType> {
        self.series_data.get(series).map(|s| s.data_type)
    }

    /// Adds a freshly flushed chunk. The series is registered on first use.
    pub fn add_chunk(&mut self, chunk: Chunk) -> Result<Arc<Chunk>, DbError> {
        let series = chunk.series().to_string();
        self.register_series(&series, chunk.data_type())?;
        let entry = self
            .series_data
            .get_mut(&series)
            .ok_or_else(|| DbError::SeriesNotFound(series.clone()))?;
        let chunk = Arc::new(chunk);
        match chunk.kind() {
            ChunkKind::Sequential => entry.sequential.push(Arc::clone(&chunk)),
            ChunkKind::Unsequential => entry.unsequential.push(Arc::clone(&chunk)),
        }
        Ok(chunk)
    }

    /// Immutable view of the series' flushed chunks.
    pub fn snapshot(&self, series: &str) -> Result<ChunkSet, DbError> {
        let entry = self
            .series_data
            .get(series)
            .ok_or_else(|| DbError::SeriesNotFound(series.to_string()))?;
        ChunkSet::with_tracker(
            series,
            entry.sequential.clone(),
            entry.unsequential.clone(),
            Arc::clone(&self.handles),
        )
    }

    /// Swaps `removed` chunks for `replacement` in one step.
    ///
    /// # Errors
    /// `Integrity` if any of the versions is not present.
    pub fn replace_chunks(
        &mut self,
        series: &str,
        removed: &[Version],
        replacement: Chunk,
    ) -> Result<Arc<Chunk>, DbError> {
        let entry = self
            .series_data
            .get_mut(series)
            .ok_or_else(|| DbError::SeriesNotFound(series.to_string()))?;
        let present = entry
            .sequential
            .iter()
            .chain(entry.unsequential.iter())
            .filter(|c| removed.contains(&c.version()))
            .count();
        if present != removed.len() {
            return Err(DbError::integrity(
                series,
                format!(
                    "compaction input changed: expected {} chunks, found {}",
                    removed.len(),
                    present
                ),
            ));
        }
        entry.sequential.retain(|c| !removed.contains(&c.version()));
        entry.unsequential.retain(|c| !removed.contains(&c.version()));
        self.add_chunk(replacement)
    }

    pub fn chunk_count(&self, series: &str) -> usize {
        self.series_data.get(series).map(|s| s.len()).unwrap_or(0)
    }

    pub fn series_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series_data.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn handles(&self) -> &Arc<ReadHandleTracker> {
        &self.handles
    }
}
