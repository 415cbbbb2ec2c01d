//! End-to-end pipeline runs against in-memory source, probe and writer.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::{BufReader, Cursor, Write};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use arrow::array::{AsArray, RecordBatch};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use reelsync_core::StreamError;
use reelsync_imdb::{
    BatchWriter, ChangeDetector, DatasetConfig, DatasetOutcome, Destination, ExtractError,
    Extractor, FreshnessProbe, LoadError, LoadMode, OpenedSource, Pipeline, SourceOpener, Stage,
    actors, movies,
};
use reelsync_store::MetadataStore;

const ACTORS_TSV: &str = "nconst\tprimaryName\tbirthYear\tdeathYear\tprimaryProfession\tknownForTitles\n\
nm1\tFred Astaire\t1899\t1987\tactor,soundtrack\ttt1\n\
nm2\t\\N\t1924\t2014\tactress\ttt2\n\
nm3\tJohn Doe\t\\N\t\\N\tactor\ttt3\n\
nm4\tJane Roe\t\\N\t\\N\t\\N\ttt4\n\
nm5\tAnn Lee\t1990\t\\N\tactress\ttt5\n\
nm6\tBo Kim\t1985\t\\N\tdirector\ttt6\n";

const MOVIES_TSV: &str = "tconst\ttitleType\tprimaryTitle\toriginalTitle\tgenres\n\
tt1\tshort\tCarmencita\tCarmencita\tDocumentary,Short\n\
tt2\tshort\tLe clown et ses chiens\tLe clown et ses chiens\tAnimation,Short\n\
tt3\tmovie\tUntitled\tUntitled\t\\N\n";

const BAD_ACTORS_TSV: &str = "nconst\tprimaryName\tbirthYear\tdeathYear\tprimaryProfession\n\
nm1\tA\t1990\t\\N\tactor\n\
nm2\tB\t1991\t\\N\tactor\n\
nm3\tC\tnineteen\t\\N\tactor\n";

fn gzip(text: &str) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
    enc.write_all(text.as_bytes()).unwrap();
    enc.finish().unwrap()
}

/// Files served from memory, each with a fixed token. Clones share counters.
#[derive(Default, Clone)]
struct MemorySource {
    files: HashMap<String, (Vec<u8>, String)>,
    opens: Rc<Cell<usize>>,
}

impl MemorySource {
    fn with(mut self, filename: &str, text: &str, token: &str) -> Self {
        self.files
            .insert(filename.to_string(), (gzip(text), token.to_string()));
        self
    }
}

impl SourceOpener for MemorySource {
    fn open(&self, filename: &str) -> Result<OpenedSource, ExtractError> {
        self.opens.set(self.opens.get() + 1);
        let (bytes, token) = self.files.get(filename).ok_or_else(|| {
            ExtractError::Stream(StreamError::Http {
                status: Some(404),
                message: filename.to_string(),
            })
        })?;
        Ok(OpenedSource {
            reader: Box::new(BufReader::new(MultiGzDecoder::new(Cursor::new(bytes.clone())))),
            token: Some(token.clone()),
            total_bytes: Some(bytes.len() as u64),
            counter: Arc::new(AtomicU64::new(0)),
        })
    }
}

/// Probe answering from a filename → token table; unknown files time out.
struct TableProbe(HashMap<String, String>);

impl TableProbe {
    fn new(entries: &[(&str, &str)]) -> Self {
        Self(
            entries
                .iter()
                .map(|(f, t)| (f.to_string(), t.to_string()))
                .collect(),
        )
    }
}

impl FreshnessProbe for TableProbe {
    fn probe(&self, url: &str) -> Result<Option<String>, StreamError> {
        let filename = url.rsplit('/').next().unwrap_or(url);
        self.0.get(filename).cloned().map(Some).ok_or_else(|| {
            StreamError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "probe timed out",
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Written {
    table: String,
    mode: LoadMode,
    rows: usize,
}

#[derive(Default)]
struct Journal {
    writes: RefCell<Vec<Written>>,
    batches: RefCell<Vec<RecordBatch>>,
    connects: Cell<usize>,
    released: Cell<usize>,
}

struct MemoryDestination {
    journal: Rc<Journal>,
    reachable: bool,
}

struct MemoryWriter {
    journal: Rc<Journal>,
}

impl BatchWriter for MemoryWriter {
    fn write_batch(
        &mut self,
        cfg: &DatasetConfig,
        batch: &RecordBatch,
        mode: LoadMode,
    ) -> Result<u64, LoadError> {
        self.journal.writes.borrow_mut().push(Written {
            table: cfg.table.clone(),
            mode,
            rows: batch.num_rows(),
        });
        self.journal.batches.borrow_mut().push(batch.clone());
        Ok(batch.num_rows() as u64)
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.journal.released.set(self.journal.released.get() + 1);
    }
}

impl Destination for MemoryDestination {
    type Writer = MemoryWriter;

    fn connect(&self) -> Result<MemoryWriter, LoadError> {
        self.journal.connects.set(self.journal.connects.get() + 1);
        if !self.reachable {
            return Err(LoadError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        Ok(MemoryWriter {
            journal: self.journal.clone(),
        })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: MetadataStore,
    source: MemorySource,
    journal: Rc<Journal>,
}

impl Harness {
    fn new(source: MemorySource) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join("data/metadata.json"));
        Self {
            _dir: dir,
            store,
            source,
            journal: Rc::new(Journal::default()),
        }
    }

    fn pipeline(
        &self,
        probe: TableProbe,
        batch_size: usize,
        reachable: bool,
    ) -> Pipeline<TableProbe, MemorySource, MemoryDestination> {
        let detector = ChangeDetector::new(probe, "https://datasets.example/", self.store.load());
        Pipeline::new(
            detector,
            Extractor::new(self.source.clone(), batch_size),
            MemoryDestination {
                journal: self.journal.clone(),
                reachable,
            },
            self.store.clone(),
        )
    }

    fn writes(&self) -> Vec<Written> {
        self.journal.writes.borrow().clone()
    }
}

fn both() -> MemorySource {
    MemorySource::default()
        .with("name.basics.tsv.gz", ACTORS_TSV, "\"a1\"")
        .with("title.basics.tsv.gz", MOVIES_TSV, "\"m1\"")
}

fn probe_v1() -> TableProbe {
    TableProbe::new(&[
        ("name.basics.tsv.gz", "\"a1\""),
        ("title.basics.tsv.gz", "\"m1\""),
    ])
}

#[test]
fn first_run_loads_everything_and_records_tokens() {
    let h = Harness::new(both());
    let summary = h.pipeline(probe_v1(), 2, true).run_all(&[actors(), movies()]);

    assert_eq!(summary.loaded(), 2);
    assert_eq!(summary.failed(), 0);
    assert!(!summary.none_started());

    match &summary.outcomes[0] {
        (table, DatasetOutcome::Loaded { rows, dropped_rows, .. }) => {
            assert_eq!(table, "actors");
            // nm2 (no name), nm3 (no birth year), nm4 (no birth year/profession) dropped
            assert_eq!(*rows, 3);
            assert_eq!(*dropped_rows, 3);
        }
        other => panic!("unexpected {other:?}"),
    }

    let map = h.store.load();
    assert_eq!(map["name.basics.tsv.gz"].etag.as_deref(), Some("\"a1\""));
    assert_eq!(map["title.basics.tsv.gz"].etag.as_deref(), Some("\"m1\""));
    assert_eq!(h.journal.released.get(), 2);
}

#[test]
fn replace_then_append_per_table() {
    let h = Harness::new(both());
    h.pipeline(probe_v1(), 2, true).run_all(&[actors(), movies()]);

    let modes: Vec<(String, LoadMode)> = h
        .writes()
        .into_iter()
        .map(|w| (w.table, w.mode))
        .collect();
    assert_eq!(
        modes,
        [
            ("actors".to_string(), LoadMode::Replace),
            ("actors".to_string(), LoadMode::Append),
            ("movies".to_string(), LoadMode::Replace),
        ]
    );
}

#[test]
fn fully_filtered_batch_is_skipped() {
    // batch size 2: [nm1, nm2] keeps 1, [nm3, nm4] keeps 0, [nm5, nm6] keeps 2
    let h = Harness::new(both());
    let outcome = h.pipeline(probe_v1(), 2, true).run_dataset(&actors());

    match outcome {
        DatasetOutcome::Loaded {
            rows,
            batches,
            skipped_batches,
            ..
        } => {
            assert_eq!(rows, 3);
            assert_eq!(batches, 2);
            assert_eq!(skipped_batches, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    let rows: Vec<usize> = h.writes().iter().map(|w| w.rows).collect();
    assert_eq!(rows, [1, 2]);
}

#[test]
fn loaded_rows_use_canonical_schema() {
    let h = Harness::new(both());
    h.pipeline(probe_v1(), 100, true).run_dataset(&actors());

    let batches = h.journal.batches.borrow();
    let batch = &batches[0];
    assert_eq!(batch.schema(), actors().output_schema());
    let is_dead = batch.column_by_name("is_dead").unwrap().as_boolean();
    let names = batch.column_by_name("primary_name").unwrap().as_string::<i32>();
    assert_eq!(names.value(0), "Fred Astaire");
    assert!(is_dead.value(0));
    assert!(!is_dead.value(1));
}

#[test]
fn unchanged_token_skips_without_download() {
    let h = Harness::new(both());
    h.pipeline(probe_v1(), 100, true).run_all(&[actors(), movies()]);
    let opens = h.source.opens.get();
    let connects = h.journal.connects.get();

    let summary = h.pipeline(probe_v1(), 100, true).run_all(&[actors(), movies()]);
    assert_eq!(summary.skipped(), 2);
    assert_eq!(h.source.opens.get(), opens);
    assert_eq!(h.journal.connects.get(), connects);
}

#[test]
fn changed_token_reloads() {
    let h = Harness::new(both());
    h.pipeline(probe_v1(), 100, true).run_all(&[actors()]);

    let probe = TableProbe::new(&[("name.basics.tsv.gz", "\"a2\"")]);
    let summary = h.pipeline(probe, 100, true).run_all(&[actors()]);
    assert_eq!(summary.loaded(), 1);
}

#[test]
fn probe_failure_fails_open() {
    let h = Harness::new(both());
    h.pipeline(probe_v1(), 100, true).run_all(&[movies()]);

    // probe knows nothing → times out → download anyway
    let summary = h.pipeline(TableProbe::new(&[]), 100, true).run_all(&[movies()]);
    assert_eq!(summary.loaded(), 1);
}

#[test]
fn force_bypasses_detection() {
    let h = Harness::new(both());
    h.pipeline(probe_v1(), 100, true).run_all(&[movies()]);

    let summary = h
        .pipeline(probe_v1(), 100, true)
        .force(true)
        .run_all(&[movies()]);
    assert_eq!(summary.loaded(), 1);
}

#[test]
fn parse_error_fails_dataset_and_keeps_old_token() {
    let source = MemorySource::default().with("name.basics.tsv.gz", BAD_ACTORS_TSV, "\"bad\"");
    let h = Harness::new(source);
    h.store.save("name.basics.tsv.gz", Some("\"old\"")).unwrap();

    let probe = TableProbe::new(&[("name.basics.tsv.gz", "\"bad\"")]);
    let outcome = h.pipeline(probe, 2, true).run_dataset(&actors());

    match outcome {
        DatasetOutcome::Failed { stage, started, error } => {
            assert_eq!(stage, Stage::Extracting);
            assert!(started);
            assert!(format!("{error:#}").contains("birthYear"));
        }
        other => panic!("unexpected {other:?}"),
    }
    // first batch already landed; no rollback
    assert_eq!(h.writes().len(), 1);
    assert_eq!(h.journal.released.get(), 1);
    assert_eq!(
        h.store.get("name.basics.tsv.gz").unwrap().etag.as_deref(),
        Some("\"old\"")
    );
}

#[test]
fn failure_is_isolated_per_dataset() {
    let source = MemorySource::default()
        .with("name.basics.tsv.gz", BAD_ACTORS_TSV, "\"a1\"")
        .with("title.basics.tsv.gz", MOVIES_TSV, "\"m1\"");
    let h = Harness::new(source);
    let summary = h.pipeline(probe_v1(), 100, true).run_all(&[actors(), movies()]);

    assert!(summary.outcomes[0].1.is_failed());
    assert!(matches!(
        summary.outcomes[1].1,
        DatasetOutcome::Loaded { rows: 2, .. }
    ));
    assert!(!summary.none_started());
    assert!(h.store.get("name.basics.tsv.gz").is_none());
    assert!(h.store.get("title.basics.tsv.gz").is_some());
}

#[test]
fn unreachable_database_fails_without_starting() {
    let h = Harness::new(both());
    let summary = h.pipeline(probe_v1(), 100, false).run_all(&[actors(), movies()]);

    for (_, outcome) in &summary.outcomes {
        assert!(matches!(
            outcome,
            DatasetOutcome::Failed {
                stage: Stage::Connecting,
                started: false,
                ..
            }
        ));
    }
    assert!(summary.none_started());
    assert_eq!(h.source.opens.get(), 0);
    assert!(h.store.load().is_empty());
}

#[test]
fn missing_remote_file_fails_without_starting() {
    let source = MemorySource::default().with("title.basics.tsv.gz", MOVIES_TSV, "\"m1\"");
    let h = Harness::new(source);
    let outcome = h.pipeline(probe_v1(), 100, true).run_dataset(&actors());
    assert!(matches!(
        outcome,
        DatasetOutcome::Failed {
            stage: Stage::Extracting,
            started: false,
            ..
        }
    ));
    assert_eq!(h.journal.released.get(), 1);
}
