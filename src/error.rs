use crate::chunk::Encoding;
use crate::types::{Timestamp, ValueType};
use thiserror::Error;

/// Errors returned by [`crate::MemSeriesAppender::append`] and series construction.
#[derive(Error, Debug)]
pub enum SeriesError {
    #[error("Out of order sample: timestamp={timestamp}, max_time={max_time}")]
    OutOfOrderSample {
        timestamp: Timestamp,
        max_time: Timestamp,
    },

    #[error("Period type mismatch: expected {expected}, got {got}")]
    PeriodTypeMismatch { expected: ValueType, got: ValueType },

    #[error("Sample type mismatch: expected {expected}, got {got}")]
    SampleTypeMismatch { expected: ValueType, got: ValueType },

    /// The chunk layer could not produce a chunk or a write cursor. Fatal for the series.
    #[error("Encoder failure on {column} column during {operation}: {source}")]
    EncoderFailure {
        column: String,
        operation: &'static str,
        #[source]
        source: ChunkError,
    },

    #[error("Lock acquisition failed: {0}")]
    LockError(String),
}

impl SeriesError {
    /// True for rejections the ingestion layer is expected to count and move past
    /// (ordering and type mismatches). Encoder and lock failures are not recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SeriesError::OutOfOrderSample { .. }
                | SeriesError::PeriodTypeMismatch { .. }
                | SeriesError::SampleTypeMismatch { .. }
        )
    }

    /// True when the series refused the write because an earlier encoder failure disabled it.
    pub fn is_series_failed(&self) -> bool {
        matches!(
            self,
            SeriesError::EncoderFailure {
                source: ChunkError::SeriesFailed,
                ..
            }
        )
    }

    pub(crate) fn encoder(column: impl Into<String>, operation: &'static str, source: ChunkError) -> Self {
        SeriesError::EncoderFailure {
            column: column.into(),
            operation,
            source,
        }
    }

    /// Short label used for metrics and events.
    pub fn reason(&self) -> &'static str {
        match self {
            SeriesError::OutOfOrderSample { .. } => "out_of_order",
            SeriesError::PeriodTypeMismatch { .. } => "period_type_mismatch",
            SeriesError::SampleTypeMismatch { .. } => "sample_type_mismatch",
            SeriesError::EncoderFailure {
                source: ChunkError::SeriesFailed,
                ..
            } => "series_failed",
            SeriesError::EncoderFailure { .. } => "encoder_failure",
            SeriesError::LockError(_) => "lock_error",
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for SeriesError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SeriesError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

/// Errors produced by the chunk encoding layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Corrupt {encoding} chunk: {details}")]
    Corrupt { encoding: Encoding, details: String },

    #[error("Unsupported chunk operation: {0}")]
    Unsupported(String),

    #[error("Series is unusable after an earlier encoder failure")]
    SeriesFailed,
}
