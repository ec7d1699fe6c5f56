use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use profseries::{
    Chunk, ChunkError, ChunkFactory, ColumnId, Encoding, Labels, MemSeries, Profile, ProfileMeta,
    ProfileTree, SeriesConfig, SeriesError, SeriesEvent, SeriesEventListener, ValueType,
    SAMPLES_PER_CHUNK,
};

/// Hands out `budget` chunks, then fails every request.
#[derive(Debug)]
struct BudgetFactory {
    remaining: AtomicUsize,
}

impl BudgetFactory {
    fn new(budget: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(budget),
        })
    }
}

impl ChunkFactory for BudgetFactory {
    fn new_chunk(&self, encoding: Encoding) -> Result<Chunk, ChunkError> {
        let ok = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if ok {
            Ok(Chunk::new(encoding))
        } else {
            Err(ChunkError::Unsupported("chunk budget exhausted".to_string()))
        }
    }
}

/// Hands out chunks whose bytes cannot be decoded.
#[derive(Debug)]
struct CorruptFactory;

impl ChunkFactory for CorruptFactory {
    fn new_chunk(&self, encoding: Encoding) -> Result<Chunk, ChunkError> {
        Ok(Chunk::from_bytes(encoding, vec![0xFF], 1))
    }
}

#[derive(Debug, Default)]
struct RecordingListener {
    events: Mutex<Vec<SeriesEvent>>,
}

impl SeriesEventListener for RecordingListener {
    fn on_event(&self, event: SeriesEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn series_with(factory: Arc<dyn ChunkFactory>) -> MemSeries {
    let config = SeriesConfig {
        chunk_factory: factory,
        ..SeriesConfig::default()
    };
    MemSeries::with_config(Labels::from_pairs([("job", "enc")]), 3, config).expect("series")
}

fn profile(ts: i64, leaf: u64) -> Profile {
    Profile {
        meta: ProfileMeta {
            timestamp: ts,
            duration: 1,
            period: 1,
            period_type: ValueType::new("cpu", "nanoseconds"),
            sample_type: ValueType::new("samples", "count"),
        },
        tree: ProfileTree::from_stacks([(&[leaf][..], 2)]),
    }
}

fn chunk_count(series: &MemSeries, column: &ColumnId) -> usize {
    series
        .chunk_stats(column)
        .expect("stats")
        .expect("known column")
        .len()
}

#[test]
fn failed_roll_keeps_columns_aligned() {
    // 3 fixed columns + cumulative "0", cumulative "0|1" and flat "0|1".
    let series = series_with(BudgetFactory::new(6));
    let mut app = series.appender().expect("appender");
    for ts in 1..=SAMPLES_PER_CHUNK as i64 {
        app.append(&profile(ts, 1)).expect("append within budget");
    }

    let err = app
        .append(&profile(SAMPLES_PER_CHUNK as i64 + 1, 1))
        .unwrap_err();
    match &err {
        SeriesError::EncoderFailure {
            column,
            operation,
            source,
        } => {
            assert_eq!(column, "timestamps");
            assert_eq!(*operation, "roll");
            assert!(matches!(source, ChunkError::Unsupported(_)));
        }
        other => panic!("expected encoder failure, got {other:?}"),
    }
    assert!(!err.is_recoverable());
    assert_eq!(err.reason(), "encoder_failure");

    for column in [ColumnId::Timestamps, ColumnId::Durations, ColumnId::Periods] {
        assert_eq!(chunk_count(&series, &column), 1, "{column}");
    }
    let stats = series.stats().expect("stats");
    assert!(stats
        .flat
        .iter()
        .chain(stats.cumulatives.iter())
        .all(|v| v.chunks.len() == 1));
    assert_eq!(stats.samples, SAMPLES_PER_CHUNK as u64);
    assert_eq!(series.head().expect("head").generation, 0);
    assert!(series.is_failed().expect("flag"));

    let err = app
        .append(&profile(SAMPLES_PER_CHUNK as i64 + 2, 1))
        .unwrap_err();
    assert!(err.is_series_failed());
    assert_eq!(err.reason(), "series_failed");
    assert!(series.appender().unwrap_err().is_series_failed());
}

#[test]
fn failed_key_creation_commits_nothing() {
    let series = series_with(BudgetFactory::new(6));
    let mut app = series.appender().expect("appender");
    app.append(&profile(10, 1)).expect("first append");

    // Stack [2] needs two more columns and the budget is spent.
    let err = app.append(&profile(20, 2)).unwrap_err();
    match &err {
        SeriesError::EncoderFailure {
            column, operation, ..
        } => {
            assert!(
                column.starts_with("flat[") || column.starts_with("cumulative["),
                "unexpected column {column}"
            );
            assert_eq!(*operation, "create");
        }
        other => panic!("expected encoder failure, got {other:?}"),
    }

    assert_eq!(series.num_samples().expect("samples"), 1);
    assert_eq!(series.max_time().expect("max"), Some(10));
    assert_eq!(series.flat_keys().expect("keys").len(), 1);
    assert_eq!(series.cumulative_keys().expect("keys").len(), 2);
    assert_eq!(
        series.column_values(&ColumnId::Timestamps).expect("decode"),
        Some(vec![vec![10]])
    );
    assert!(series.is_failed().expect("flag"));
}

#[test]
fn initial_chunk_failure_surfaces_from_constructor() {
    let config = SeriesConfig {
        chunk_factory: BudgetFactory::new(1),
        ..SeriesConfig::default()
    };
    let err = MemSeries::with_config(Labels::default(), 9, config).unwrap_err();
    assert!(matches!(
        err,
        SeriesError::EncoderFailure {
            operation: "create",
            ..
        }
    ));
}

#[test]
fn corrupt_tail_chunk_fails_appender() {
    let series = series_with(Arc::new(CorruptFactory));
    let err = series.appender().unwrap_err();
    match &err {
        SeriesError::EncoderFailure {
            column,
            operation,
            source,
        } => {
            assert_eq!(column, "timestamps");
            assert_eq!(*operation, "appender");
            assert!(matches!(
                source,
                ChunkError::Corrupt {
                    encoding: Encoding::Delta,
                    ..
                }
            ));
        }
        other => panic!("expected encoder failure, got {other:?}"),
    }
    assert!(series.is_failed().expect("flag"));
    assert!(series.appender().unwrap_err().is_series_failed());
}

#[test]
fn committed_roll_is_reported_when_key_creation_fails() {
    // 6 chunks for the first sample, 6 more for the roll, none for the new stack.
    let listener = Arc::new(RecordingListener::default());
    let config = SeriesConfig {
        chunk_factory: BudgetFactory::new(12),
        event_listener: listener.clone(),
        ..SeriesConfig::default()
    };
    let series =
        MemSeries::with_config(Labels::from_pairs([("job", "enc")]), 3, config).expect("series");
    let mut app = series.appender().expect("appender");
    for ts in 1..=SAMPLES_PER_CHUNK as i64 {
        app.append(&profile(ts, 1)).expect("append within budget");
    }
    listener.events.lock().unwrap().clear();

    let err = app
        .append(&profile(SAMPLES_PER_CHUNK as i64 + 1, 2))
        .unwrap_err();
    assert!(matches!(
        err,
        SeriesError::EncoderFailure {
            operation: "create",
            ..
        }
    ));

    let head = series.head().expect("head");
    assert_eq!(head.generation, 1);
    assert_eq!(head.num_samples, SAMPLES_PER_CHUNK as u64);
    let stats = series.stats().expect("stats");
    assert_eq!(stats.chunks, 2);
    assert!(stats
        .flat
        .iter()
        .chain(stats.cumulatives.iter())
        .all(|v| v.chunks.len() == 2));

    let events = listener.events.lock().unwrap().clone();
    assert_eq!(
        events[0],
        SeriesEvent::ChunksRolled {
            series_id: 3,
            generation: 1,
            keys: 3,
        }
    );
    assert!(matches!(events[1], SeriesEvent::EncoderFailed { .. }));
    assert_eq!(events.len(), 2);
}
