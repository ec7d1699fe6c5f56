//! In-memory series: fixed timestamp/duration/period columns plus lazily created per-stack-node
//! value columns, all kept index-parallel across chunk rolls.
//!
//! Concurrency contract: single writer, many readers. All mutable series state sits behind one
//! `RwLock`; readers (`stats`, introspection) take it shared. Only one [`MemSeriesAppender`] may
//! be appending to a series at a time; the owning index guarantees this. Positional writes into
//! the fixed columns go through cursors that take only the target chunk's lock.

use crate::chunk::{
    default_chunk_factory, Chunk, ChunkAppender, ChunkFactory, ChunkStats, Encoding,
    SAMPLES_PER_CHUNK,
};
use crate::column::{ChunkedColumn, ColumnId, TimeWindow, TimestampColumn};
use crate::error::{ChunkError, SeriesError};
use crate::telemetry::{
    noop_event_listener, noop_sample_counter, KeyKind, SampleCounter, SeriesEvent,
    SeriesEventListener,
};
use crate::tree::{FlatSample, NodeKey, Profile, TreeEntries};
use crate::types::{Labels, ProfileMeta, Timestamp, Value, ValueType};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Collaborators injected into a series.
#[derive(Debug, Clone)]
pub struct SeriesConfig {
    /// Source of fresh chunks for every column.
    pub chunk_factory: Arc<dyn ChunkFactory>,
    /// Bumped once per appended sample (no-op by default).
    pub samples_appended: Arc<dyn SampleCounter>,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn SeriesEventListener>,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        SeriesConfig {
            chunk_factory: default_chunk_factory(),
            samples_appended: noop_sample_counter(),
            event_listener: noop_event_listener(),
        }
    }
}

/// Descriptive labels recorded for one stack-node key. Not chunk-encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLabels {
    pub labels: BTreeMap<String, Vec<String>>,
    pub num_labels: BTreeMap<String, Vec<i64>>,
    pub num_units: BTreeMap<String, Vec<String>>,
}

/// Per-chunk statistics of one per-key value column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueStats {
    pub key: NodeKey,
    pub chunks: Vec<ChunkStats>,
}

/// Point-in-time statistics snapshot of a series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemSeriesStats {
    pub samples: u64,
    /// Chunk count of the fixed columns.
    pub chunks: usize,
    pub cumulatives: Vec<ValueStats>,
    pub flat: Vec<ValueStats>,
}

/// Series-wide bookkeeping snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesHead {
    pub num_samples: u64,
    pub min_time: Option<Timestamp>,
    pub max_time: Option<Timestamp>,
    pub period_type: Option<ValueType>,
    pub sample_type: Option<ValueType>,
    /// Number of chunk rolls so far; every column holds `generation + 1` chunks.
    pub generation: usize,
}

/// The sample history of one label combination.
#[derive(Debug)]
pub struct MemSeries {
    labels: Labels,
    id: u64,
    config: SeriesConfig,
    state: RwLock<SeriesState>,
}

#[derive(Debug)]
struct SeriesState {
    period_type: Option<ValueType>,
    sample_type: Option<ValueType>,

    // 0 until the first nonzero timestamp.
    min_time: Timestamp,
    // Timestamp::MIN until the first sample.
    max_time: Timestamp,
    num_samples: u64,
    generation: usize,
    failed: bool,

    timestamps: TimestampColumn,
    durations: ChunkedColumn,
    periods: ChunkedColumn,

    flat_values: HashMap<NodeKey, ChunkedColumn>,
    cumulative_values: HashMap<NodeKey, ChunkedColumn>,
    labels: HashMap<NodeKey, BTreeMap<String, Vec<String>>>,
    num_labels: HashMap<NodeKey, BTreeMap<String, Vec<i64>>>,
    num_units: HashMap<NodeKey, BTreeMap<String, Vec<String>>>,
}

/// Write cursors for the fixed columns' tail chunks.
#[derive(Debug)]
struct FixedCursors {
    timestamps: ChunkAppender,
    durations: ChunkAppender,
    periods: ChunkAppender,
}

#[inline]
fn slot_for(num_samples: u64) -> u16 {
    (num_samples % SAMPLES_PER_CHUNK as u64) as u16
}

impl MemSeries {
    /// Creates an empty series with the default chunk encoders and no-op telemetry.
    pub fn new(labels: Labels, id: u64) -> Result<Self, SeriesError> {
        Self::with_config(labels, id, SeriesConfig::default())
    }

    /// Creates an empty series with one empty chunk per fixed column.
    ///
    /// # Errors
    /// Returns [`SeriesError::EncoderFailure`] if the chunk factory cannot produce the initial chunks.
    pub fn with_config(labels: Labels, id: u64, config: SeriesConfig) -> Result<Self, SeriesError> {
        let factory = &*config.chunk_factory;
        let timestamps = TimestampColumn::new(factory)
            .map_err(|e| SeriesError::encoder(ColumnId::Timestamps.to_string(), "create", e))?;
        let durations = ChunkedColumn::new(factory, Encoding::Rle)
            .map_err(|e| SeriesError::encoder(ColumnId::Durations.to_string(), "create", e))?;
        let periods = ChunkedColumn::new(factory, Encoding::Rle)
            .map_err(|e| SeriesError::encoder(ColumnId::Periods.to_string(), "create", e))?;

        let state = SeriesState {
            period_type: None,
            sample_type: None,
            min_time: 0,
            max_time: Timestamp::MIN,
            num_samples: 0,
            generation: 0,
            failed: false,
            timestamps,
            durations,
            periods,
            flat_values: HashMap::new(),
            cumulative_values: HashMap::new(),
            labels: HashMap::new(),
            num_labels: HashMap::new(),
            num_units: HashMap::new(),
        };

        Ok(Self {
            labels,
            id,
            config,
            state: RwLock::new(state),
        })
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Binds a write handle to the tail chunks of the fixed columns.
    ///
    /// # Errors
    /// Returns [`SeriesError::EncoderFailure`] if a tail chunk cannot produce a cursor. The series
    /// is then considered failed.
    pub fn appender(&self) -> Result<MemSeriesAppender<'_>, SeriesError> {
        let bound = {
            let state = self.state.read()?;
            if state.failed {
                return Err(SeriesError::encoder("series", "appender", ChunkError::SeriesFailed));
            }
            state.bind_cursors()
        };
        match bound {
            Ok(cursors) => Ok(MemSeriesAppender {
                series: self,
                cursors,
            }),
            Err(e) => {
                self.mark_failed(&e);
                Err(e)
            }
        }
    }

    /// Per-chunk sample counts and sizes for every per-key value column, taken under the
    /// shared lock. Keys are sorted.
    pub fn stats(&self) -> Result<MemSeriesStats, SeriesError> {
        let state = self.state.read()?;
        Ok(MemSeriesStats {
            samples: state.num_samples,
            chunks: state.timestamps.len(),
            cumulatives: value_stats(&state.cumulative_values),
            flat: value_stats(&state.flat_values),
        })
    }

    pub fn head(&self) -> Result<SeriesHead, SeriesError> {
        let state = self.state.read()?;
        Ok(SeriesHead {
            num_samples: state.num_samples,
            min_time: (state.min_time != 0).then_some(state.min_time),
            max_time: (state.num_samples > 0).then_some(state.max_time),
            period_type: state.period_type.clone(),
            sample_type: state.sample_type.clone(),
            generation: state.generation,
        })
    }

    pub fn num_samples(&self) -> Result<u64, SeriesError> {
        Ok(self.state.read()?.num_samples)
    }

    /// First nonzero timestamp ever accepted.
    pub fn min_time(&self) -> Result<Option<Timestamp>, SeriesError> {
        Ok(self.head()?.min_time)
    }

    /// Latest accepted timestamp.
    pub fn max_time(&self) -> Result<Option<Timestamp>, SeriesError> {
        Ok(self.head()?.max_time)
    }

    /// Whether an earlier encoder failure made the series unusable for writes.
    pub fn is_failed(&self) -> Result<bool, SeriesError> {
        Ok(self.state.read()?.failed)
    }

    /// Per-chunk statistics of one column, or `None` for an unknown key.
    pub fn chunk_stats(&self, column: &ColumnId) -> Result<Option<Vec<ChunkStats>>, SeriesError> {
        let state = self.state.read()?;
        Ok(state.column(column).map(ChunkedColumn::stats))
    }

    /// Decoded values of one column, chunk by chunk, or `None` for an unknown key.
    pub fn column_values(&self, column: &ColumnId) -> Result<Option<Vec<Vec<Value>>>, SeriesError> {
        let state = self.state.read()?;
        match state.column(column) {
            None => Ok(None),
            Some(col) => col
                .values()
                .map(Some)
                .map_err(|e| SeriesError::encoder(column.to_string(), "decode", e)),
        }
    }

    /// Time window of every timestamp chunk.
    pub fn timestamp_windows(&self) -> Result<Vec<TimeWindow>, SeriesError> {
        Ok(self.state.read()?.timestamps.windows().to_vec())
    }

    pub fn flat_keys(&self) -> Result<Vec<NodeKey>, SeriesError> {
        Ok(sorted_keys(&self.state.read()?.flat_values))
    }

    pub fn cumulative_keys(&self) -> Result<Vec<NodeKey>, SeriesError> {
        Ok(sorted_keys(&self.state.read()?.cumulative_values))
    }

    /// Descriptive labels recorded for `key`, if any were ever observed.
    pub fn node_labels(&self, key: &NodeKey) -> Result<Option<NodeLabels>, SeriesError> {
        let state = self.state.read()?;
        let labels = state.labels.get(key);
        let num_labels = state.num_labels.get(key);
        let num_units = state.num_units.get(key);
        if labels.is_none() && num_labels.is_none() && num_units.is_none() {
            return Ok(None);
        }
        Ok(Some(NodeLabels {
            labels: labels.cloned().unwrap_or_default(),
            num_labels: num_labels.cloned().unwrap_or_default(),
            num_units: num_units.cloned().unwrap_or_default(),
        }))
    }

    fn mark_failed(&self, err: &SeriesError) {
        if err.is_series_failed() {
            return;
        }
        if let SeriesError::EncoderFailure { column, source, .. } = err {
            self.state
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .failed = true;
            self.config.event_listener.on_event(SeriesEvent::EncoderFailed {
                series_id: self.id,
                column: column.clone(),
                error: source.to_string(),
            });
        }
    }
}

fn value_stats(columns: &HashMap<NodeKey, ChunkedColumn>) -> Vec<ValueStats> {
    let mut out: Vec<ValueStats> = columns
        .iter()
        .map(|(key, col)| ValueStats {
            key: key.clone(),
            chunks: col.stats(),
        })
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

fn sorted_keys(columns: &HashMap<NodeKey, ChunkedColumn>) -> Vec<NodeKey> {
    let mut keys: Vec<NodeKey> = columns.keys().cloned().collect();
    keys.sort();
    keys
}

/// Cursors staged for one per-key map, plus the columns that must be created to hold them.
struct StagedKeys {
    writes: Vec<(ChunkAppender, Value)>,
    created: Vec<(NodeKey, ChunkedColumn)>,
}

impl SeriesState {
    fn column(&self, id: &ColumnId) -> Option<&ChunkedColumn> {
        match id {
            ColumnId::Timestamps => Some(self.timestamps.column()),
            ColumnId::Durations => Some(&self.durations),
            ColumnId::Periods => Some(&self.periods),
            ColumnId::Flat(key) => self.flat_values.get(key),
            ColumnId::Cumulative(key) => self.cumulative_values.get(key),
        }
    }

    fn bind_cursors(&self) -> Result<FixedCursors, SeriesError> {
        bind_fixed(self.timestamps.tail(), self.durations.tail(), self.periods.tail())
    }

    /// Type and ordering checks. Never mutates.
    fn validate(&self, meta: &ProfileMeta) -> Result<(), SeriesError> {
        if let Some(expected) = &self.period_type {
            if *expected != meta.period_type {
                return Err(SeriesError::PeriodTypeMismatch {
                    expected: expected.clone(),
                    got: meta.period_type.clone(),
                });
            }
        }
        if let Some(expected) = &self.sample_type {
            if *expected != meta.sample_type {
                return Err(SeriesError::SampleTypeMismatch {
                    expected: expected.clone(),
                    got: meta.sample_type.clone(),
                });
            }
        }
        if meta.timestamp <= self.max_time {
            return Err(SeriesError::OutOfOrderSample {
                timestamp: meta.timestamp,
                max_time: self.max_time,
            });
        }
        Ok(())
    }

    /// Opens a new tail chunk on every fixed column and every known per-key column.
    ///
    /// All chunks and cursors are produced before anything is committed, so a factory failure
    /// leaves every column at its previous chunk count.
    /// Returns the rebound fixed-column cursors and the number of per-key columns rolled.
    fn roll(&mut self, factory: &dyn ChunkFactory) -> Result<(FixedCursors, usize), SeriesError> {
        let new_chunk = |id: ColumnId, encoding: Encoding| {
            factory
                .new_chunk(encoding)
                .map_err(|e| SeriesError::encoder(id.to_string(), "roll", e))
        };

        let timestamps = new_chunk(ColumnId::Timestamps, Encoding::Delta)?;
        let durations = new_chunk(ColumnId::Durations, Encoding::Rle)?;
        let periods = new_chunk(ColumnId::Periods, Encoding::Rle)?;
        let cursors = bind_fixed(&timestamps, &durations, &periods)?;

        let mut flat = Vec::with_capacity(self.flat_values.len());
        for (key, col) in &self.flat_values {
            flat.push((key.clone(), new_chunk(ColumnId::Flat(key.clone()), col.encoding())?));
        }
        let mut cumulative = Vec::with_capacity(self.cumulative_values.len());
        for (key, col) in &self.cumulative_values {
            cumulative.push((
                key.clone(),
                new_chunk(ColumnId::Cumulative(key.clone()), col.encoding())?,
            ));
        }

        let keys = flat.len() + cumulative.len();
        self.timestamps.push(timestamps);
        self.durations.push(durations);
        self.periods.push(periods);
        for (key, chunk) in flat {
            if let Some(col) = self.flat_values.get_mut(&key) {
                col.push(chunk);
            }
        }
        for (key, chunk) in cumulative {
            if let Some(col) = self.cumulative_values.get_mut(&key) {
                col.push(chunk);
            }
        }
        self.generation += 1;
        Ok((cursors, keys))
    }

    /// Writes one tree's per-key values at `slot`, creating unseen key columns backfilled to the
    /// current generation.
    fn insert_tree(
        &mut self,
        factory: &dyn ChunkFactory,
        slot: u16,
        entries: &TreeEntries,
        events: &mut Vec<(KeyKind, usize)>,
    ) -> Result<(), SeriesError> {
        let chunks = self.generation + 1;
        let cumulative = stage_keys(
            &self.cumulative_values,
            factory,
            chunks,
            KeyKind::Cumulative,
            entries.cumulative.iter().map(|(k, &v)| (k, v)),
        )?;
        let flat = stage_keys(
            &self.flat_values,
            factory,
            chunks,
            KeyKind::Flat,
            entries.flat.iter().map(|(k, s)| (k, s.value)),
        )?;

        for (key, col) in cumulative.created {
            events.push((KeyKind::Cumulative, chunks - 1));
            self.cumulative_values.insert(key, col);
        }
        for (key, col) in flat.created {
            events.push((KeyKind::Flat, chunks - 1));
            self.flat_values.insert(key, col);
        }
        for (mut cursor, value) in cumulative.writes.into_iter().chain(flat.writes) {
            cursor.append_at(slot, value);
        }
        for (key, sample) in &entries.flat {
            self.record_labels(key, sample);
        }
        Ok(())
    }

    fn record_labels(&mut self, key: &NodeKey, sample: &FlatSample) {
        if !sample.labels.is_empty() {
            merge_label_values(self.labels.entry(key.clone()).or_default(), &sample.labels);
        }
        if !sample.num_labels.is_empty() {
            merge_label_values(
                self.num_labels.entry(key.clone()).or_default(),
                &sample.num_labels,
            );
        }
        if !sample.num_units.is_empty() {
            merge_label_values(
                self.num_units.entry(key.clone()).or_default(),
                &sample.num_units,
            );
        }
    }
}

fn bind_fixed(timestamps: &Chunk, durations: &Chunk, periods: &Chunk) -> Result<FixedCursors, SeriesError> {
    Ok(FixedCursors {
        timestamps: timestamps
            .appender()
            .map_err(|e| SeriesError::encoder(ColumnId::Timestamps.to_string(), "appender", e))?,
        durations: durations
            .appender()
            .map_err(|e| SeriesError::encoder(ColumnId::Durations.to_string(), "appender", e))?,
        periods: periods
            .appender()
            .map_err(|e| SeriesError::encoder(ColumnId::Periods.to_string(), "appender", e))?,
    })
}

fn stage_keys<'e>(
    columns: &HashMap<NodeKey, ChunkedColumn>,
    factory: &dyn ChunkFactory,
    chunks: usize,
    kind: KeyKind,
    values: impl Iterator<Item = (&'e NodeKey, Value)>,
) -> Result<StagedKeys, SeriesError> {
    let column_id = |key: &NodeKey| match kind {
        KeyKind::Flat => ColumnId::Flat(key.clone()),
        KeyKind::Cumulative => ColumnId::Cumulative(key.clone()),
    };

    let mut staged = StagedKeys {
        writes: Vec::new(),
        created: Vec::new(),
    };
    for (key, value) in values {
        let cursor = match columns.get(key) {
            Some(col) => col
                .tail()
                .appender()
                .map_err(|e| SeriesError::encoder(column_id(key).to_string(), "appender", e))?,
            None => {
                let col = ChunkedColumn::backfilled(factory, Encoding::Xor, chunks)
                    .map_err(|e| SeriesError::encoder(column_id(key).to_string(), "create", e))?;
                let cursor = col
                    .tail()
                    .appender()
                    .map_err(|e| SeriesError::encoder(column_id(key).to_string(), "appender", e))?;
                staged.created.push((key.clone(), col));
                cursor
            }
        };
        staged.writes.push((cursor, value));
    }
    Ok(staged)
}

fn merge_label_values<T: Clone + PartialEq>(
    into: &mut BTreeMap<String, Vec<T>>,
    from: &BTreeMap<String, Vec<T>>,
) {
    for (name, values) in from {
        let seen = into.entry(name.clone()).or_default();
        for v in values {
            if !seen.contains(v) {
                seen.push(v.clone());
            }
        }
    }
}

/// Short-lived write handle for a series. The only way to mutate a series.
#[derive(Debug)]
pub struct MemSeriesAppender<'a> {
    series: &'a MemSeries,
    cursors: FixedCursors,
}

impl<'a> MemSeriesAppender<'a> {
    pub fn series(&self) -> &'a MemSeries {
        self.series
    }

    /// Appends one profile.
    ///
    /// Validation failures ([`SeriesError::OutOfOrderSample`], type mismatches) leave the series
    /// untouched. An [`SeriesError::EncoderFailure`] marks the series failed; later appends are
    /// refused until the owning index rebuilds it.
    pub fn append(&mut self, profile: &Profile) -> Result<(), SeriesError> {
        let mut created = Vec::new();
        let mut rolled = None;
        let res = self.append_inner(profile, &mut created, &mut rolled);

        let series = self.series;
        let listener = &series.config.event_listener;
        for (kind, backfilled) in created {
            listener.on_event(SeriesEvent::KeyCreated {
                series_id: series.id,
                kind,
                backfilled,
            });
        }
        // A committed roll is reported even when the rest of the append failed.
        if let Some((generation, keys)) = rolled {
            listener.on_event(SeriesEvent::ChunksRolled {
                series_id: series.id,
                generation,
                keys,
            });
        }
        match &res {
            Ok(()) => {}
            Err(e) if e.is_recoverable() || e.is_series_failed() => {
                listener.on_event(SeriesEvent::SampleRejected {
                    series_id: series.id,
                    reason: e.reason(),
                })
            }
            Err(e) => series.mark_failed(e),
        }
        res
    }

    /// Sets `rolled` to the new generation and the number of rolled per-key columns once a roll
    /// has been committed.
    fn append_inner(
        &mut self,
        profile: &Profile,
        created: &mut Vec<(KeyKind, usize)>,
        rolled: &mut Option<(usize, usize)>,
    ) -> Result<(), SeriesError> {
        let series = self.series;
        let meta = &profile.meta;

        {
            let state = series.state.read()?;
            if state.failed {
                return Err(SeriesError::encoder("series", "append", ChunkError::SeriesFailed));
            }
            state.validate(meta)?;
        }

        let entries = profile.tree.entries();
        let factory = &*series.config.chunk_factory;

        let slot = {
            let mut state = series.state.write()?;
            if state.timestamps.tail().is_full() {
                let (cursors, keys) = state.roll(factory)?;
                self.cursors = cursors;
                *rolled = Some((state.generation, keys));
            } else if !self.cursors.timestamps.chunk().same_block(state.timestamps.tail()) {
                // Another appender rolled the series since these cursors were bound.
                self.cursors = state.bind_cursors()?;
            }
            let slot = slot_for(state.num_samples);
            state.insert_tree(factory, slot, &entries, created)?;
            slot
        };

        self.cursors.timestamps.append_at(slot, meta.timestamp);
        self.cursors.durations.append_at(slot, meta.duration);
        self.cursors.periods.append_at(slot, meta.period);

        {
            let mut state = series.state.write()?;
            state.timestamps.observe(meta.timestamp);
            if state.num_samples == 0 {
                state.period_type = Some(meta.period_type.clone());
                state.sample_type = Some(meta.sample_type.clone());
            }
            if state.min_time == 0 && meta.timestamp != 0 {
                state.min_time = meta.timestamp;
            }
            state.max_time = meta.timestamp;
            state.num_samples += 1;
        }
        series.config.samples_appended.inc();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ProfileTree;

    fn cpu() -> ValueType {
        ValueType::new("cpu", "nanoseconds")
    }

    fn samples() -> ValueType {
        ValueType::new("samples", "count")
    }

    fn profile(ts: Timestamp, tree: ProfileTree) -> Profile {
        Profile {
            meta: ProfileMeta {
                timestamp: ts,
                duration: 10_000_000_000,
                period: 100,
                period_type: cpu(),
                sample_type: samples(),
            },
            tree,
        }
    }

    fn simple(ts: Timestamp) -> Profile {
        profile(ts, ProfileTree::from_stacks([(&[1u64, 2][..], 3)]))
    }

    fn series() -> MemSeries {
        MemSeries::new(Labels::from_pairs([("job", "a")]), 1).unwrap()
    }

    #[test]
    fn first_append_fixes_types_and_bounds() {
        let s = series();
        let mut app = s.appender().unwrap();
        app.append(&simple(100)).unwrap();

        let head = s.head().unwrap();
        assert_eq!(head.num_samples, 1);
        assert_eq!(head.min_time, Some(100));
        assert_eq!(head.max_time, Some(100));
        assert_eq!(head.period_type, Some(cpu()));
        assert_eq!(head.sample_type, Some(samples()));
        assert_eq!(head.generation, 0);
    }

    #[test]
    fn empty_series_reports_no_bounds() {
        let s = series();
        let head = s.head().unwrap();
        assert_eq!(head.num_samples, 0);
        assert_eq!(head.min_time, None);
        assert_eq!(head.max_time, None);
        assert_eq!(head.period_type, None);
        assert_eq!(s.labels().get("job"), Some("a"));
        assert_eq!(s.id(), 1);
    }

    #[test]
    fn zero_timestamp_does_not_set_min_time() {
        let s = series();
        let mut app = s.appender().unwrap();
        app.append(&simple(0)).unwrap();
        assert_eq!(s.min_time().unwrap(), None);
        assert_eq!(s.max_time().unwrap(), Some(0));

        app.append(&simple(5)).unwrap();
        app.append(&simple(9)).unwrap();
        assert_eq!(s.min_time().unwrap(), Some(5));
        assert_eq!(s.max_time().unwrap(), Some(9));
    }

    #[test]
    fn rejects_equal_timestamp() {
        let s = series();
        let mut app = s.appender().unwrap();
        app.append(&simple(100)).unwrap();
        let err = app.append(&simple(100)).unwrap_err();
        assert!(matches!(
            err,
            SeriesError::OutOfOrderSample {
                timestamp: 100,
                max_time: 100
            }
        ));
        assert!(err.is_recoverable());
        assert_eq!(s.num_samples().unwrap(), 1);
    }

    #[test]
    fn period_type_checked_before_sample_type() {
        let s = series();
        let mut app = s.appender().unwrap();
        app.append(&simple(1)).unwrap();

        let mut p = simple(2);
        p.meta.period_type = ValueType::new("space", "bytes");
        p.meta.sample_type = ValueType::new("alloc", "bytes");
        assert!(matches!(
            app.append(&p).unwrap_err(),
            SeriesError::PeriodTypeMismatch { .. }
        ));
    }

    #[test]
    fn type_mismatch_wins_over_ordering() {
        let s = series();
        let mut app = s.appender().unwrap();
        app.append(&simple(10)).unwrap();

        let mut p = simple(5);
        p.meta.sample_type = ValueType::new("alloc", "bytes");
        assert!(matches!(
            app.append(&p).unwrap_err(),
            SeriesError::SampleTypeMismatch { .. }
        ));
    }

    #[test]
    fn values_land_at_sample_slot() {
        let s = series();
        let mut app = s.appender().unwrap();
        app.append(&simple(1)).unwrap();
        app.append(&profile(2, ProfileTree::from_stacks([(&[1u64, 5][..], 8)])))
            .unwrap();
        app.append(&simple(3)).unwrap();

        let a = NodeKey::from_path(&[0, 1, 2]);
        let b = NodeKey::from_path(&[0, 1, 5]);
        assert_eq!(
            s.column_values(&ColumnId::Flat(a)).unwrap(),
            Some(vec![vec![3, 0, 3]])
        );
        assert_eq!(
            s.column_values(&ColumnId::Flat(b)).unwrap(),
            Some(vec![vec![0, 8]])
        );
        assert_eq!(
            s.column_values(&ColumnId::Cumulative(NodeKey::from_path(&[0, 1])))
                .unwrap(),
            Some(vec![vec![3, 8, 3]])
        );
        assert_eq!(
            s.column_values(&ColumnId::Timestamps).unwrap(),
            Some(vec![vec![1, 2, 3]])
        );
    }

    #[test]
    fn unknown_column_is_none() {
        let s = series();
        let missing = ColumnId::Flat(NodeKey::from_path(&[9]));
        assert_eq!(s.column_values(&missing).unwrap(), None);
        assert_eq!(s.chunk_stats(&missing).unwrap(), None);
    }

    #[test]
    fn labels_are_merged_per_key() {
        use crate::tree::FlatSample;

        let s = series();
        let mut app = s.appender().unwrap();
        for (ts, v) in [(1, 2), (2, 5)] {
            let mut tree = ProfileTree::new();
            tree.insert_stack(
                &[1],
                FlatSample::new(v)
                    .with_label("thread", "main")
                    .with_num_label("bytes", 64, "bytes"),
            );
            app.append(&profile(ts, tree)).unwrap();
        }

        let key = NodeKey::new("0|1", "thread=main,#bytes=64");
        let labels = s.node_labels(&key).unwrap().expect("labels recorded");
        assert_eq!(labels.labels["thread"], vec!["main".to_string()]);
        assert_eq!(labels.num_labels["bytes"], vec![64]);
        assert_eq!(labels.num_units["bytes"], vec!["bytes".to_string()]);
        assert_eq!(
            s.column_values(&ColumnId::Flat(key)).unwrap(),
            Some(vec![vec![2, 5]])
        );
        assert_eq!(s.node_labels(&NodeKey::from_path(&[0, 1])).unwrap(), None);
    }

    #[test]
    fn stats_are_sorted_by_key() {
        let s = series();
        let mut app = s.appender().unwrap();
        app.append(&profile(
            1,
            ProfileTree::from_stacks([(&[3u64][..], 1), (&[1][..], 1)]),
        ))
        .unwrap();

        let stats = s.stats().unwrap();
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.chunks, 1);
        let keys: Vec<_> = stats.flat.iter().map(|v| v.key.to_string()).collect();
        assert_eq!(keys, vec!["0|1", "0|3"]);
        assert_eq!(stats.cumulatives.len(), 3);
        assert!(stats
            .flat
            .iter()
            .all(|v| v.chunks.len() == 1 && v.chunks[0].samples == 1));
        assert_eq!(s.flat_keys().unwrap().len(), 2);
        assert_eq!(s.cumulative_keys().unwrap().len(), 3);
    }

    #[test]
    fn encoder_failure_marks_series_failed_through_poisoned_lock() {
        let s = series();
        let _ = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = s.state.write().unwrap();
                    panic!("poison the series lock");
                })
                .join()
        });
        assert!(s.state.is_poisoned());

        s.mark_failed(&SeriesError::encoder(
            "timestamps",
            "roll",
            ChunkError::Unsupported("test".to_string()),
        ));
        assert!(s.state.read().unwrap_or_else(PoisonError::into_inner).failed);
    }

    #[test]
    fn timestamp_windows_follow_rolls() {
        let s = series();
        let mut app = s.appender().unwrap();
        for ts in 1..=(SAMPLES_PER_CHUNK as i64 + 2) {
            app.append(&simple(ts * 10)).unwrap();
        }
        let windows = s.timestamp_windows().unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].min_time, 10);
        assert_eq!(windows[0].max_time, 1200);
        assert_eq!(windows[1].min_time, 1210);
        assert_eq!(windows[1].max_time, 1220);
    }
}
