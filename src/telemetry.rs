use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not acceptable for
/// production. Instead, callers can provide an implementation that forwards these events to
/// `tracing`, `log`, metrics, or custom sinks.
pub trait SeriesEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: SeriesEvent);
}

/// Which per-key column map an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Flat,
    Cumulative,
}

/// Structured events emitted by a series.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesEvent {
    /// Every column of the series got a fresh tail chunk.
    ChunksRolled {
        series_id: u64,
        generation: usize,
        keys: usize,
    },
    /// A per-key column was created, backfilled with `backfilled` empty chunks.
    KeyCreated {
        series_id: u64,
        kind: KeyKind,
        backfilled: usize,
    },
    SampleRejected {
        series_id: u64,
        reason: &'static str,
    },
    EncoderFailed {
        series_id: u64,
        column: String,
        error: String,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl SeriesEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: SeriesEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn SeriesEventListener> {
    Arc::new(NoopEventListener)
}

/// Monotonic counter bumped once per successfully appended sample.
pub trait SampleCounter: std::fmt::Debug + Send + Sync + 'static {
    fn inc(&self);
}

#[derive(Debug)]
pub struct NoopSampleCounter;

impl SampleCounter for NoopSampleCounter {
    #[inline]
    fn inc(&self) {}
}

pub fn noop_sample_counter() -> Arc<dyn SampleCounter> {
    Arc::new(NoopSampleCounter)
}

/// Metrics instrumentation through the `metrics` facade.
///
/// Emitting is effectively a no-op until a recorder is installed. With the `prometheus` feature,
/// [`series_metrics::SeriesPrometheus`] renders the exposition text in-process.
pub mod series_metrics {
    use super::*;

    use ::metrics::{describe_counter, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.
    pub const SAMPLES_APPENDED: &str = "profseries_samples_appended";
    pub const SAMPLES_REJECTED: &str = "profseries_samples_rejected";
    pub const CHUNK_ROLLS: &str = "profseries_chunk_rolls";

    /// [`SampleCounter`] backed by the global `metrics` recorder.
    #[derive(Debug, Default)]
    pub struct MetricsSampleCounter;

    impl SampleCounter for MetricsSampleCounter {
        #[inline]
        fn inc(&self) {
            ::metrics::counter!(SAMPLES_APPENDED).increment(1);
        }
    }

    pub fn metrics_sample_counter() -> Arc<dyn SampleCounter> {
        Arc::new(MetricsSampleCounter)
    }

    /// [`SeriesEventListener`] that turns rejections and rolls into counters.
    #[derive(Debug, Default)]
    pub struct MetricsEventListener;

    impl SeriesEventListener for MetricsEventListener {
        fn on_event(&self, event: SeriesEvent) {
            match event {
                SeriesEvent::SampleRejected { reason, .. } => {
                    ::metrics::counter!(SAMPLES_REJECTED, "reason" => reason).increment(1);
                }
                SeriesEvent::ChunksRolled { .. } => {
                    ::metrics::counter!(CHUNK_ROLLS).increment(1);
                }
                SeriesEvent::KeyCreated { .. } | SeriesEvent::EncoderFailed { .. } => {}
            }
        }
    }

    pub fn describe_all() {
        describe_counter!(
            SAMPLES_APPENDED,
            Unit::Count,
            "Total number of profile samples appended to in-memory series."
        );
        describe_counter!(
            SAMPLES_REJECTED,
            Unit::Count,
            "Total number of samples rejected by series validation, by reason."
        );
        describe_counter!(
            CHUNK_ROLLS,
            Unit::Count,
            "Total number of times a series rolled every column onto a new chunk."
        );
    }

    /// Global Prometheus recorder scoped to the series counters.
    ///
    /// Only counters are emitted, so no upkeep is needed; [`SeriesPrometheus::render`] scrapes
    /// in-process without an HTTP listener.
    #[cfg(feature = "prometheus")]
    #[derive(Debug, Clone)]
    pub struct SeriesPrometheus {
        handle: PrometheusHandle,
    }

    #[cfg(feature = "prometheus")]
    impl SeriesPrometheus {
        /// Installs the process-wide recorder and registers the series counter descriptions.
        pub fn install() -> Result<Self, MetricsInitError> {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| match e {
                    BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                    other => MetricsInitError::Install(other.to_string()),
                })?;
            describe_all();
            Ok(Self { handle })
        }

        /// Text exposition of every series counter.
        pub fn render(&self) -> String {
            self.handle.render()
        }

        /// Current value of `counter`, summed over its label sets. Zero when never incremented.
        pub fn counter_total(&self, counter: &str) -> u64 {
            let total = format!("{}_total", counter);
            self.render()
                .lines()
                .filter(|line| !line.starts_with('#'))
                .filter_map(|line| {
                    let (key, value) = line.rsplit_once(' ')?;
                    let name = key.split('{').next().unwrap_or(key);
                    if name == counter || name == total {
                        value.parse::<f64>().ok()
                    } else {
                        None
                    }
                })
                .sum::<f64>() as u64
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
    }
}
