#![doc = include_str!("../README.md")]
// Declare modules
pub mod chunk;
pub mod column;
pub mod error;
pub mod series;
pub mod telemetry;
pub mod tree;
pub mod types;

/// Number of sample slots in every chunk.
pub use crate::chunk::SAMPLES_PER_CHUNK;
/// Shared handle to one encoded chunk and its write cursor.
pub use crate::chunk::{Chunk, ChunkAppender, ChunkFactory, ChunkStats, Encoding};
/// Addresses one column of a series for introspection.
pub use crate::column::{ColumnId, TimeWindow};
/// Error types for series and chunk operations.
pub use crate::error::{ChunkError, SeriesError};
/// The in-memory series, its write handle, and its configuration.
pub use crate::series::{
    MemSeries, MemSeriesAppender, MemSeriesStats, NodeLabels, SeriesConfig, SeriesHead,
    ValueStats,
};
/// Structured event hook and sample counter capabilities.
pub use crate::telemetry::{SampleCounter, SeriesEvent, SeriesEventListener};
/// Profile value trees.
pub use crate::tree::{FlatSample, NodeKey, Profile, ProfileTree, ProfileTreeNode};
/// Series labels, value types and profile metadata.
pub use crate::types::{Label, Labels, ProfileMeta, Timestamp, Value, ValueType};
