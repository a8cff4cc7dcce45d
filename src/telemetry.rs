use crate::types::{ChunkKind, Version};

use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library and never prints. Callers that want flush, compaction or query
/// failure events forwarded to `tracing`, `log` or a metrics sink supply an implementation.
pub trait EngineEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: EngineEvent);
}

/// Structured events emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ChunkFlushed {
        series: String,
        kind: ChunkKind,
        version: Version,
        points: usize,
    },
    ChunksCompacted {
        series: String,
        inputs: usize,
        version: Version,
        points: usize,
    },
    QueryAborted {
        series: String,
        error: String,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl EngineEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: EngineEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn EngineEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation through the `metrics` facade.
///
/// Emitting is effectively a no-op until a recorder is installed. With the `prometheus`
/// feature, [`InProcessPrometheus`] installs one and renders the exposition text in-process.
pub mod db_metrics {
    use crate::aggregate::GroupPath;
    use crate::types::ChunkKind;

    use ::metrics::{describe_counter, describe_histogram, Unit};
    use std::time::Duration;

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
    #[cfg(feature = "prometheus")]
    use std::sync::atomic::{AtomicBool, Ordering};
    #[cfg(feature = "prometheus")]
    use std::sync::{Arc, Mutex};
    #[cfg(feature = "prometheus")]
    use std::thread::JoinHandle;

    // --- metric names ---
    //
    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const MERGE_POINTS_EMITTED: &str = "chunkmerge_merge_points_emitted";
    pub const MERGE_DUPLICATES_DISCARDED: &str = "chunkmerge_merge_duplicates_discarded";
    pub const GROUPS_AGGREGATED: &str = "chunkmerge_groups_aggregated";
    pub const CHUNKS_FLUSHED: &str = "chunkmerge_chunks_flushed";
    pub const QUERY_DURATION_SECONDS: &str = "chunkmerge_query_duration_seconds";
    pub const QUERIES_ABORTED: &str = "chunkmerge_queries_aborted";

    /// Handle to the in-process Prometheus recorder. Does **not** start an HTTP server.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global recorder (once per process) plus a thread that runs exporter upkeep.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("chunkmerge-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_merge(emitted: u64, duplicates: u64) {
        if emitted > 0 {
            ::metrics::counter!(MERGE_POINTS_EMITTED).increment(emitted);
        }
        if duplicates > 0 {
            ::metrics::counter!(MERGE_DUPLICATES_DISCARDED).increment(duplicates);
        }
    }

    #[inline]
    pub fn record_group(path: GroupPath) {
        let label = match path {
            GroupPath::Statistics => "statistics",
            GroupPath::Direct => "direct",
            GroupPath::Merged => "merged",
        };
        ::metrics::counter!(GROUPS_AGGREGATED, "path" => label).increment(1);
    }

    #[inline]
    pub fn record_flush(kind: ChunkKind) {
        let label = match kind {
            ChunkKind::Sequential => "sequential",
            ChunkKind::Unsequential => "unsequential",
        };
        ::metrics::counter!(CHUNKS_FLUSHED, "kind" => label).increment(1);
    }

    #[inline]
    pub fn record_query(duration: Duration, ok: bool) {
        ::metrics::histogram!(QUERY_DURATION_SECONDS).record(duration.as_secs_f64());
        if !ok {
            ::metrics::counter!(QUERIES_ABORTED).increment(1);
        }
    }

    /// Registers descriptions with the installed recorder.
    pub fn describe_all() {
        describe_counter!(
            MERGE_POINTS_EMITTED,
            Unit::Count,
            "Points emitted by priority merge iterators (one per distinct timestamp)."
        );
        describe_counter!(
            MERGE_DUPLICATES_DISCARDED,
            Unit::Count,
            "Points shadowed by a newer chunk version at the same timestamp."
        );
        describe_counter!(
            GROUPS_AGGREGATED,
            Unit::Count,
            "Overlap groups aggregated, labelled by read path."
        );
        describe_counter!(
            CHUNKS_FLUSHED,
            Unit::Count,
            "Chunks produced by memtable flushes, labelled by kind."
        );
        describe_counter!(
            QUERIES_ABORTED,
            Unit::Count,
            "Queries aborted by a decode or integrity error."
        );
        describe_histogram!(
            QUERY_DURATION_SECONDS,
            Unit::Seconds,
            "Time to aggregate or scan one series."
        );
    }
}
