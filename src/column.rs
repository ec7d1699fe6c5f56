//! Chunked columns: ordered chunk sequences where only the tail is writable.

use crate::chunk::{Chunk, ChunkFactory, ChunkStats, Encoding};
use crate::error::ChunkError;
use crate::tree::NodeKey;
use crate::types::{Timestamp, Value};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Addresses one column of a series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnId {
    Timestamps,
    Durations,
    Periods,
    Flat(NodeKey),
    Cumulative(NodeKey),
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnId::Timestamps => f.write_str("timestamps"),
            ColumnId::Durations => f.write_str("durations"),
            ColumnId::Periods => f.write_str("periods"),
            ColumnId::Flat(key) => write!(f, "flat[{}]", key),
            ColumnId::Cumulative(key) => write!(f, "cumulative[{}]", key),
        }
    }
}

/// A growable chunk sequence. There is always a tail chunk.
#[derive(Debug, Clone)]
pub(crate) struct ChunkedColumn {
    encoding: Encoding,
    sealed: Vec<Chunk>,
    tail: Chunk,
}

impl ChunkedColumn {
    pub(crate) fn new(factory: &dyn ChunkFactory, encoding: Encoding) -> Result<Self, ChunkError> {
        Self::backfilled(factory, encoding, 1)
    }

    /// A column of `chunks` chunks (at least one); all but the tail stay empty.
    pub(crate) fn backfilled(
        factory: &dyn ChunkFactory,
        encoding: Encoding,
        chunks: usize,
    ) -> Result<Self, ChunkError> {
        let mut sealed = Vec::with_capacity(chunks.saturating_sub(1));
        for _ in 1..chunks {
            sealed.push(factory.new_chunk(encoding)?);
        }
        Ok(Self {
            encoding,
            sealed,
            tail: factory.new_chunk(encoding)?,
        })
    }

    pub(crate) fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub(crate) fn tail(&self) -> &Chunk {
        &self.tail
    }

    /// Seals the current tail and makes `chunk` the new tail.
    pub(crate) fn push(&mut self, chunk: Chunk) {
        let prev = std::mem::replace(&mut self.tail, chunk);
        self.sealed.push(prev);
    }

    pub(crate) fn len(&self) -> usize {
        self.sealed.len() + 1
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.sealed.iter().chain(std::iter::once(&self.tail))
    }

    pub(crate) fn stats(&self) -> Vec<ChunkStats> {
        self.iter().map(Chunk::stats).collect()
    }

    pub(crate) fn values(&self) -> Result<Vec<Vec<Value>>, ChunkError> {
        self.iter().map(Chunk::values).collect()
    }
}

/// Inclusive time bounds of one timestamp chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub min_time: Timestamp,
    pub max_time: Timestamp,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            min_time: Timestamp::MAX,
            max_time: Timestamp::MIN,
        }
    }
}

impl TimeWindow {
    pub fn is_empty(&self) -> bool {
        self.min_time > self.max_time
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.min_time <= ts && ts <= self.max_time
    }

    fn observe(&mut self, ts: Timestamp) {
        self.min_time = self.min_time.min(ts);
        self.max_time = self.max_time.max(ts);
    }
}

/// Timestamp column with a time window per chunk.
#[derive(Debug, Clone)]
pub(crate) struct TimestampColumn {
    column: ChunkedColumn,
    windows: Vec<TimeWindow>,
}

impl TimestampColumn {
    pub(crate) fn new(factory: &dyn ChunkFactory) -> Result<Self, ChunkError> {
        Ok(Self {
            column: ChunkedColumn::new(factory, Encoding::Delta)?,
            windows: vec![TimeWindow::default()],
        })
    }

    pub(crate) fn column(&self) -> &ChunkedColumn {
        &self.column
    }

    pub(crate) fn tail(&self) -> &Chunk {
        self.column.tail()
    }

    pub(crate) fn push(&mut self, chunk: Chunk) {
        self.column.push(chunk);
        self.windows.push(TimeWindow::default());
    }

    /// Widens the tail chunk's window to include `ts`.
    pub(crate) fn observe(&mut self, ts: Timestamp) {
        if let Some(window) = self.windows.last_mut() {
            window.observe(ts);
        }
    }

    pub(crate) fn windows(&self) -> &[TimeWindow] {
        &self.windows
    }

    pub(crate) fn len(&self) -> usize {
        self.column.len()
    }
}
