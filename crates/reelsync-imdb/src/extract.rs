//! Streaming extraction: gzip TSV → bounded Arrow batches
//!
//! The body is decompressed and parsed line by line; at most one batch of
//! rows is held in memory. Declared column types are applied while parsing,
//! so a bad value fails the batch it appears in.

use std::io::{self, BufRead};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use arrow::array::{ArrayRef, BooleanBuilder, Int32Builder, RecordBatch, StringBuilder};
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use reelsync_core::{ByteCounter, RetryPolicy, StreamError, open_gzip_reader, retry};

use crate::dataset::{ColumnSpec, ScalarType, raw_schema, source_url};

/// Literal "not available" marker used by the source files.
pub const NULL_SENTINEL: &str = "\\N";

/// `\N` or an empty field; both mean the value is missing.
pub fn is_null_token(raw: &str) -> bool {
    raw.is_empty() || raw == NULL_SENTINEL
}

/// Default row ceiling per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Error types for extraction
#[derive(Debug)]
pub enum ExtractError {
    /// Could not open the remote file
    Stream(StreamError),
    /// Read or decompression failure mid-stream
    Io(io::Error),
    /// Header row missing or lacking a requested column
    Header(String),
    /// A row does not match the header or a declared type
    Parse {
        line: u64,
        column: Option<String>,
        message: String,
    },
    /// Building a raw batch failed
    Arrow(ArrowError),
    /// Cleaning a raw batch failed
    Transform(ArrowError),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(e) => write!(f, "download failed: {e}"),
            Self::Io(e) => write!(f, "read failed: {e}"),
            Self::Header(msg) => write!(f, "bad header: {msg}"),
            Self::Parse {
                line,
                column: Some(column),
                message,
            } => write!(f, "line {line}, column {column}: {message}"),
            Self::Parse {
                line,
                column: None,
                message,
            } => write!(f, "line {line}: {message}"),
            Self::Arrow(e) => write!(f, "arrow error: {e}"),
            Self::Transform(e) => write!(f, "transform failed: {e}"),
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Stream(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Arrow(e) | Self::Transform(e) => Some(e),
            Self::Header(_) | Self::Parse { .. } => None,
        }
    }
}

impl From<StreamError> for ExtractError {
    fn from(e: StreamError) -> Self {
        Self::Stream(e)
    }
}

impl From<io::Error> for ExtractError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ArrowError> for ExtractError {
    fn from(e: ArrowError) -> Self {
        Self::Arrow(e)
    }
}

/// A decompressed source file ready to be read from the header row.
pub struct OpenedSource {
    pub reader: Box<dyn BufRead>,
    /// Freshness token observed when the file was opened
    pub token: Option<String>,
    /// Compressed size, if known
    pub total_bytes: Option<u64>,
    /// Compressed bytes consumed so far
    pub counter: ByteCounter,
}

/// Opens source files by name.
pub trait SourceOpener {
    fn open(&self, filename: &str) -> Result<OpenedSource, ExtractError>;
}

/// Remote files under a base URL. Opening (request + response headers) is
/// retried; the body stream is not.
#[derive(Debug, Clone)]
pub struct HttpSource {
    base_url: String,
    policy: RetryPolicy,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            base_url: base_url.into(),
            policy,
        }
    }
}

impl SourceOpener for HttpSource {
    fn open(&self, filename: &str) -> Result<OpenedSource, ExtractError> {
        let url = source_url(&self.base_url, filename);
        let stream = retry(&format!("GET {url}"), &self.policy, || open_gzip_reader(&url))?;
        log::debug!("{filename}: opened {stream:?}");
        Ok(OpenedSource {
            reader: Box::new(stream.reader),
            token: stream.token,
            total_bytes: stream.total_bytes,
            counter: stream.counter,
        })
    }
}

/// One parsed fragment of a source file.
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// 0-based position in the file, contiguous
    pub ordinal: usize,
    pub batch: RecordBatch,
}

/// Produces raw batches from a [`SourceOpener`].
pub struct Extractor<S> {
    source: S,
    batch_size: usize,
}

impl<S: SourceOpener> Extractor<S> {
    pub fn new(source: S, batch_size: usize) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
        }
    }

    /// Open `filename` and return a lazy batch sequence over `columns`.
    ///
    /// Each call streams from the start. Fails up front if the header lacks
    /// any requested column.
    pub fn read_chunks(
        &self,
        filename: &str,
        columns: &[ColumnSpec],
    ) -> Result<ChunkReader, ExtractError> {
        let opened = self.source.open(filename)?;
        ChunkReader::new(opened, columns, self.batch_size)
    }
}

/// Typed column builder for one retained column.
enum ColumnBuilder {
    Text(StringBuilder),
    Int(Int32Builder),
    Bool(BooleanBuilder),
}

impl ColumnBuilder {
    fn new(scalar: ScalarType, capacity: usize) -> Self {
        match scalar {
            ScalarType::Text => Self::Text(StringBuilder::with_capacity(capacity, capacity * 16)),
            ScalarType::Int => Self::Int(Int32Builder::with_capacity(capacity)),
            ScalarType::Bool => Self::Bool(BooleanBuilder::with_capacity(capacity)),
        }
    }

    /// Append one raw field; the error is a human-readable coercion message.
    fn append(&mut self, raw: &str) -> Result<(), String> {
        if is_null_token(raw) {
            match self {
                Self::Text(b) => b.append_null(),
                Self::Int(b) => b.append_null(),
                Self::Bool(b) => b.append_null(),
            }
            return Ok(());
        }
        match self {
            Self::Text(b) => b.append_value(raw),
            Self::Int(b) => {
                let v = raw
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| format!("expected integer, got {raw:?}"))?;
                b.append_value(v);
            }
            Self::Bool(b) => {
                let v = match raw.trim() {
                    "1" | "t" | "true" | "True" => true,
                    "0" | "f" | "false" | "False" => false,
                    _ => return Err(format!("expected boolean, got {raw:?}")),
                };
                b.append_value(v);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            Self::Text(b) => Arc::new(b.finish()),
            Self::Int(b) => Arc::new(b.finish()),
            Self::Bool(b) => Arc::new(b.finish()),
        }
    }
}

/// Buffers typed rows until a batch is full.
struct TsvAccumulator {
    schema: SchemaRef,
    builders: Vec<ColumnBuilder>,
    len: usize,
}

impl TsvAccumulator {
    fn new(columns: &[ColumnSpec], schema: SchemaRef, capacity: usize) -> Self {
        Self {
            schema,
            builders: columns
                .iter()
                .map(|c| ColumnBuilder::new(c.scalar, capacity))
                .collect(),
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn take_batch(&mut self) -> Result<RecordBatch, ArrowError> {
        let arrays: Vec<ArrayRef> = self.builders.iter_mut().map(ColumnBuilder::finish).collect();
        self.len = 0;
        RecordBatch::try_new(self.schema.clone(), arrays)
    }
}

/// Lazy iterator of [`RawBatch`]es over one opened file.
///
/// Yields `Err` at most once; the sequence ends after an error.
pub struct ChunkReader {
    reader: Box<dyn BufRead>,
    token: Option<String>,
    total_bytes: Option<u64>,
    counter: ByteCounter,
    /// File column index → retained column slot
    slots: Vec<Option<usize>>,
    /// Retained column slot → source name (for error messages)
    names: Vec<String>,
    acc: TsvAccumulator,
    batch_size: usize,
    line: String,
    line_no: u64,
    next_ordinal: usize,
    done: bool,
}

impl std::fmt::Debug for ChunkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkReader")
            .field("token", &self.token)
            .field("line_no", &self.line_no)
            .field("next_ordinal", &self.next_ordinal)
            .finish_non_exhaustive()
    }
}

impl ChunkReader {
    fn new(
        mut opened: OpenedSource,
        columns: &[ColumnSpec],
        batch_size: usize,
    ) -> Result<Self, ExtractError> {
        let mut header = String::new();
        if opened.reader.read_line(&mut header)? == 0 {
            return Err(ExtractError::Header("file is empty".to_string()));
        }
        let header: Vec<&str> = trim_line_end(&header).split('\t').collect();

        let mut slots = vec![None; header.len()];
        for (slot, col) in columns.iter().enumerate() {
            let idx = header.iter().position(|h| *h == col.source).ok_or_else(|| {
                ExtractError::Header(format!(
                    "column '{}' not found (header has: {})",
                    col.source,
                    header.join(", ")
                ))
            })?;
            slots[idx] = Some(slot);
        }

        let schema = raw_schema(columns);
        Ok(Self {
            reader: opened.reader,
            token: opened.token,
            total_bytes: opened.total_bytes,
            counter: opened.counter,
            slots,
            names: columns.iter().map(|c| c.source.clone()).collect(),
            acc: TsvAccumulator::new(columns, schema, batch_size.min(DEFAULT_BATCH_SIZE)),
            batch_size,
            line: String::with_capacity(4096),
            line_no: 1,
            next_ordinal: 0,
            done: false,
        })
    }

    /// Freshness token observed when the stream was opened.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Compressed bytes consumed so far.
    pub fn bytes_read(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Shared handle to the compressed byte count, for progress reporting.
    pub fn counter(&self) -> ByteCounter {
        self.counter.clone()
    }

    /// Compressed size, if the server reported one.
    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    /// Lines read so far, including the header.
    pub fn lines_read(&self) -> u64 {
        self.line_no
    }

    fn parse_error(&self, slot: Option<usize>, message: String) -> ExtractError {
        ExtractError::Parse {
            line: self.line_no,
            column: slot.map(|s| self.names[s].clone()),
            message,
        }
    }

    fn push_line(&mut self) -> Result<(), ExtractError> {
        let line = trim_line_end(&self.line);
        let fields = line.bytes().filter(|&b| b == b'\t').count() + 1;
        if fields != self.slots.len() {
            return Err(self.parse_error(
                None,
                format!("expected {} fields, found {fields}", self.slots.len()),
            ));
        }

        for (idx, raw) in line.split('\t').enumerate() {
            if let Some(slot) = self.slots[idx] {
                if let Err(msg) = self.acc.builders[slot].append(raw) {
                    let err = ExtractError::Parse {
                        line: self.line_no,
                        column: Some(self.names[slot].clone()),
                        message: msg,
                    };
                    return Err(err);
                }
            }
        }
        self.acc.len += 1;
        Ok(())
    }

    fn fill_batch(&mut self) -> Result<Option<RawBatch>, ExtractError> {
        while self.acc.len() < self.batch_size {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                self.done = true;
                break;
            }
            self.line_no += 1;
            if trim_line_end(&self.line).is_empty() {
                continue;
            }
            self.push_line()?;
        }

        if self.acc.is_empty() {
            return Ok(None);
        }
        let batch = self.acc.take_batch()?;
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        Ok(Some(RawBatch { ordinal, batch }))
    }
}

impl Iterator for ChunkReader {
    type Item = Result<RawBatch, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn trim_line_end(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{actors, movies};
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::Int32Type;
    use std::io::{Cursor, Write};
    use std::sync::atomic::AtomicU64;

    /// Serves a fixed plain-text body for any filename.
    struct TextSource(&'static str);

    impl SourceOpener for TextSource {
        fn open(&self, _filename: &str) -> Result<OpenedSource, ExtractError> {
            Ok(OpenedSource {
                reader: Box::new(Cursor::new(self.0.as_bytes().to_vec())),
                token: Some("\"t1\"".to_string()),
                total_bytes: Some(self.0.len() as u64),
                counter: Arc::new(AtomicU64::new(0)),
            })
        }
    }

    /// Serves a gzip-compressed body, decompressed the way downloads are.
    struct GzipSource(Vec<u8>);

    impl GzipSource {
        fn new(text: &str) -> Self {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
            enc.write_all(text.as_bytes()).unwrap();
            Self(enc.finish().unwrap())
        }
    }

    impl SourceOpener for GzipSource {
        fn open(&self, _filename: &str) -> Result<OpenedSource, ExtractError> {
            let gz = flate2::read::MultiGzDecoder::new(Cursor::new(self.0.clone()));
            Ok(OpenedSource {
                reader: Box::new(io::BufReader::new(gz)),
                token: None,
                total_bytes: None,
                counter: Arc::new(AtomicU64::new(0)),
            })
        }
    }

    const ACTORS_TSV: &str = "nconst\tprimaryName\tbirthYear\tdeathYear\tprimaryProfession\tknownForTitles\n\
        nm1\tFred Astaire\t1899\t1987\tactor,soundtrack\ttt1\n\
        nm2\tLauren Bacall\t1924\t2014\tactress\ttt2\n\
        nm3\t\\N\t\\N\t\\N\tactor\ttt3\n";

    fn collect(reader: ChunkReader) -> Vec<RawBatch> {
        reader.map(|b| b.unwrap()).collect()
    }

    #[test]
    fn selects_and_types_columns() {
        let extractor = Extractor::new(TextSource(ACTORS_TSV), 100);
        let cfg = actors();
        let batches = collect(extractor.read_chunks(&cfg.filename, &cfg.columns).unwrap());
        assert_eq!(batches.len(), 1);

        let batch = &batches[0].batch;
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 5);
        assert_eq!(batch.schema().field(0).name(), "nconst");

        let birth = batch.column(2).as_primitive::<Int32Type>();
        assert_eq!(birth.value(0), 1899);
        assert!(birth.is_null(2));

        let names = batch.column(1).as_string::<i32>();
        assert_eq!(names.value(1), "Lauren Bacall");
        assert!(names.is_null(2));
    }

    #[test]
    fn splits_into_bounded_batches_with_contiguous_ordinals() {
        let extractor = Extractor::new(TextSource(ACTORS_TSV), 2);
        let cfg = actors();
        let batches = collect(extractor.read_chunks(&cfg.filename, &cfg.columns).unwrap());
        let sizes: Vec<usize> = batches.iter().map(|b| b.batch.num_rows()).collect();
        let ordinals: Vec<usize> = batches.iter().map(|b| b.ordinal).collect();
        assert_eq!(sizes, [2, 1]);
        assert_eq!(ordinals, [0, 1]);
    }

    #[test]
    fn reads_gzip_body() {
        let extractor = Extractor::new(GzipSource::new(ACTORS_TSV), 100);
        let cfg = actors();
        let batches = collect(extractor.read_chunks(&cfg.filename, &cfg.columns).unwrap());
        assert_eq!(batches[0].batch.num_rows(), 3);
    }

    #[test]
    fn reports_token_from_open() {
        let extractor = Extractor::new(TextSource(ACTORS_TSV), 100);
        let cfg = actors();
        let reader = extractor.read_chunks(&cfg.filename, &cfg.columns).unwrap();
        assert_eq!(reader.token(), Some("\"t1\""));
    }

    #[test]
    fn non_numeric_year_fails_with_location() {
        let tsv = "nconst\tprimaryName\tbirthYear\tdeathYear\tprimaryProfession\n\
            nm1\tA\t1990\t\\N\tactor\n\
            nm2\tB\tabcd\t\\N\tactor\n";
        let extractor = Extractor::new(TextSource(tsv), 100);
        let cfg = actors();
        let mut reader = extractor.read_chunks(&cfg.filename, &cfg.columns).unwrap();
        match reader.next() {
            Some(Err(ExtractError::Parse { line, column, .. })) => {
                assert_eq!(line, 3);
                assert_eq!(column.as_deref(), Some("birthYear"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn empty_int_field_is_null() {
        let tsv = "nconst\tprimaryName\tbirthYear\tdeathYear\tprimaryProfession\n\
            nm1\tA\t1990\t\tactor\n";
        let extractor = Extractor::new(TextSource(tsv), 100);
        let cfg = actors();
        let batches = collect(extractor.read_chunks(&cfg.filename, &cfg.columns).unwrap());
        let death = batches[0].batch.column(3).as_primitive::<Int32Type>();
        assert!(death.is_null(0));
        assert_eq!(batches[0].batch.column(2).as_primitive::<Int32Type>().value(0), 1990);
    }

    #[test]
    fn empty_text_field_is_null() {
        let tsv = "tconst\tprimaryTitle\toriginalTitle\tgenres\ntt1\tA\tA\t\n";
        let extractor = Extractor::new(TextSource(tsv), 100);
        let cfg = movies();
        let batches = collect(extractor.read_chunks(&cfg.filename, &cfg.columns).unwrap());
        assert!(batches[0].batch.column(3).is_null(0));
    }

    #[test]
    fn field_count_mismatch_fails() {
        let tsv = "tconst\tprimaryTitle\toriginalTitle\tgenres\n\
            tt1\tA\tA\n";
        let extractor = Extractor::new(TextSource(tsv), 100);
        let cfg = movies();
        let mut reader = extractor.read_chunks(&cfg.filename, &cfg.columns).unwrap();
        assert!(matches!(
            reader.next(),
            Some(Err(ExtractError::Parse { line: 2, column: None, .. }))
        ));
    }

    #[test]
    fn missing_header_column_fails_up_front() {
        let tsv = "tconst\tprimaryTitle\tgenres\ntt1\tA\tDrama\n";
        let extractor = Extractor::new(TextSource(tsv), 100);
        let cfg = movies();
        let err = extractor.read_chunks(&cfg.filename, &cfg.columns).unwrap_err();
        assert!(matches!(err, ExtractError::Header(_)));
        assert!(err.to_string().contains("originalTitle"));
    }

    #[test]
    fn empty_file_fails() {
        let extractor = Extractor::new(TextSource(""), 100);
        let cfg = movies();
        assert!(matches!(
            extractor.read_chunks(&cfg.filename, &cfg.columns),
            Err(ExtractError::Header(_))
        ));
    }

    #[test]
    fn header_only_yields_nothing() {
        let extractor = Extractor::new(TextSource("tconst\tprimaryTitle\toriginalTitle\tgenres\n"), 100);
        let cfg = movies();
        let reader = extractor.read_chunks(&cfg.filename, &cfg.columns).unwrap();
        assert_eq!(reader.count(), 0);
    }

    #[test]
    fn tolerates_crlf_and_missing_final_newline() {
        let tsv = "tconst\tprimaryTitle\toriginalTitle\tgenres\r\ntt1\tA\tB\tDrama\r\ntt2\tC\tD\tComedy";
        let extractor = Extractor::new(TextSource(tsv), 100);
        let cfg = movies();
        let batches = collect(extractor.read_chunks(&cfg.filename, &cfg.columns).unwrap());
        let genres = batches[0].batch.column(3).as_string::<i32>();
        assert_eq!(genres.value(0), "Drama");
        assert_eq!(genres.value(1), "Comedy");
    }

    #[test]
    fn parses_bool_columns() {
        let mut builder = ColumnBuilder::new(ScalarType::Bool, 4);
        builder.append("1").unwrap();
        builder.append("0").unwrap();
        builder.append(NULL_SENTINEL).unwrap();
        builder.append("").unwrap();
        assert!(builder.append("maybe").is_err());
        let array = builder.finish();
        let bools = array.as_boolean();
        assert!(bools.value(0));
        assert!(!bools.value(1));
        assert!(bools.is_null(2));
        assert!(bools.is_null(3));
    }
}
