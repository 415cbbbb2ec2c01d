//! PostgreSQL writer: `COPY ... FROM STDIN` in text format
//!
//! Async tokio-postgres driven through the shared runtime, so the loader
//! stays a plain blocking loop.

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use arrow::array::{Array, BooleanArray, Int32Array, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Schema};
use bytes::Bytes;
use futures_util::SinkExt;
use pg_escape::quote_identifier;
use reelsync_core::SHARED_RUNTIME;
use tokio_postgres::{Client, CopyInSink, NoTls};

use crate::dataset::DatasetConfig;
use crate::load::{BatchWriter, LoadError, LoadMode};
use crate::runner::Destination;

/// COPY payload is sent in chunks of about this size.
const COPY_FLUSH_BYTES: usize = 4 * 1024 * 1024;

/// Connection settings for the destination database.
#[derive(Debug, Clone)]
pub struct PgDestination {
    url: String,
    connect_timeout: Duration,
    statement_timeout: Duration,
}

impl PgDestination {
    /// `url` is a libpq-style connection string or `postgres://` URL.
    pub fn new(url: impl Into<String>, connect_timeout: Duration, statement_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            statement_timeout,
        }
    }
}

impl Destination for PgDestination {
    type Writer = PgWriter;

    /// Open a connection. The returned writer closes it on drop.
    fn connect(&self) -> Result<PgWriter, LoadError> {
        let mut config: tokio_postgres::Config = self.url.parse()?;
        config.connect_timeout(self.connect_timeout);
        let statement_timeout = self.statement_timeout;
        let connect_timeout = self.connect_timeout;

        SHARED_RUNTIME.handle().block_on(async move {
            let (client, connection) =
                bounded("connect", connect_timeout, config.connect(NoTls)).await?;
            let connection = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    log::warn!("PostgreSQL connection error: {e}");
                }
            });

            let set_timeout = format!("SET statement_timeout = {}", statement_timeout.as_millis());
            bounded("SET statement_timeout", statement_timeout, client.batch_execute(&set_timeout))
                .await?;

            Ok(PgWriter {
                client,
                connection,
                statement_timeout,
            })
        })
    }
}

/// Await `fut` under `after`, mapping both failure kinds to [`LoadError`].
async fn bounded<T>(
    operation: &str,
    after: Duration,
    fut: impl Future<Output = Result<T, tokio_postgres::Error>>,
) -> Result<T, LoadError> {
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(LoadError::Database),
        Err(_) => Err(LoadError::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}

/// One open connection, scoped to a dataset run.
pub struct PgWriter {
    client: Client,
    connection: tokio::task::JoinHandle<()>,
    statement_timeout: Duration,
}

/// Stream `batch` through an open COPY sink; returns rows the server accepted.
async fn send_copy(
    sink: CopyInSink<Bytes>,
    batch: &RecordBatch,
    deadline: Duration,
) -> Result<u64, LoadError> {
    let columns = typed_columns(batch)?;
    let mut sink = Box::pin(sink);

    let mut buf = Vec::with_capacity(COPY_FLUSH_BYTES);
    let mut nul_bytes = 0;
    for row in 0..batch.num_rows() {
        nul_bytes += encode_row(&mut buf, &columns, row);
        if buf.len() >= COPY_FLUSH_BYTES {
            let chunk = std::mem::replace(&mut buf, Vec::with_capacity(COPY_FLUSH_BYTES));
            bounded("COPY send", deadline, sink.send(Bytes::from(chunk))).await?;
        }
    }
    if !buf.is_empty() {
        bounded("COPY send", deadline, sink.send(Bytes::from(buf))).await?;
    }
    if nul_bytes > 0 {
        log::debug!("COPY: dropped {nul_bytes} NUL byte(s) from text values");
    }
    bounded("COPY finish", deadline, sink.as_mut().finish()).await
}

impl BatchWriter for PgWriter {
    fn write_batch(
        &mut self,
        cfg: &DatasetConfig,
        batch: &RecordBatch,
        mode: LoadMode,
    ) -> Result<u64, LoadError> {
        let deadline = self.statement_timeout;
        let stmt = copy_statement(&cfg.table, &batch.schema());
        let client = &mut self.client;

        SHARED_RUNTIME.handle().block_on(async {
            match mode {
                LoadMode::Append => {
                    let sink = bounded("COPY start", deadline, client.copy_in(&stmt)).await?;
                    send_copy(sink, batch, deadline).await
                }
                LoadMode::Replace => {
                    let ddl = replace_table_sql(cfg)?;
                    let tx = bounded("BEGIN", deadline, client.transaction()).await?;
                    bounded("replace table", deadline, tx.batch_execute(&ddl)).await?;
                    let sink = bounded("COPY start", deadline, tx.copy_in(&stmt)).await?;
                    let rows = send_copy(sink, batch, deadline).await?;
                    bounded("COMMIT", deadline, tx.commit()).await?;
                    log::info!("{}: table recreated", cfg.table);
                    Ok(rows)
                }
            }
        })
    }
}

impl Drop for PgWriter {
    fn drop(&mut self) {
        // Dropping the client ends the connection task; abort covers a stuck peer.
        self.connection.abort();
        log::debug!("PostgreSQL connection released");
    }
}

fn sql_type(data_type: &DataType) -> Result<&'static str, LoadError> {
    match data_type {
        DataType::Utf8 => Ok("TEXT"),
        DataType::Int32 => Ok("INTEGER"),
        DataType::Int64 => Ok("BIGINT"),
        DataType::Boolean => Ok("BOOLEAN"),
        other => Err(LoadError::Schema(format!("no column type for {other}"))),
    }
}

/// `DROP` + `CREATE` for the dataset's full output schema.
pub fn replace_table_sql(cfg: &DatasetConfig) -> Result<String, LoadError> {
    let table = quote_identifier(&cfg.table);
    let schema = cfg.output_schema();
    let pk = cfg.primary_key_column();

    let mut columns = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let mut col = format!(
            "{} {}",
            quote_identifier(field.name()),
            sql_type(field.data_type())?
        );
        if field.name() == pk {
            col.push_str(" PRIMARY KEY");
        } else if !field.is_nullable() {
            col.push_str(" NOT NULL");
        }
        columns.push(col);
    }

    Ok(format!(
        "DROP TABLE IF EXISTS {table};\nCREATE TABLE {table} (\n    {}\n)",
        columns.join(",\n    ")
    ))
}

/// `COPY` statement naming the batch's columns.
pub fn copy_statement(table: &str, schema: &Schema) -> String {
    let columns = schema
        .fields()
        .iter()
        .map(|f| quote_identifier(f.name()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY {} ({columns}) FROM STDIN WITH (FORMAT text)",
        quote_identifier(table)
    )
}

/// Batch column downcast once per batch.
enum TypedColumn<'a> {
    Utf8(&'a StringArray),
    Int32(&'a Int32Array),
    Int64(&'a Int64Array),
    Boolean(&'a BooleanArray),
}

fn typed_columns(batch: &RecordBatch) -> Result<Vec<TypedColumn<'_>>, LoadError> {
    batch
        .columns()
        .iter()
        .map(|array| {
            let any = array.as_any();
            let typed = match array.data_type() {
                DataType::Utf8 => any.downcast_ref().map(TypedColumn::Utf8),
                DataType::Int32 => any.downcast_ref().map(TypedColumn::Int32),
                DataType::Int64 => any.downcast_ref().map(TypedColumn::Int64),
                DataType::Boolean => any.downcast_ref().map(TypedColumn::Boolean),
                _ => None,
            };
            typed.ok_or_else(|| {
                LoadError::Schema(format!("cannot COPY column of type {}", array.data_type()))
            })
        })
        .collect()
}

/// Append one row in COPY text format; returns the NUL bytes dropped.
///
/// Fields are tab separated, null is `\N`, text escapes backslash, tab,
/// newline and carriage return. PostgreSQL text cannot hold NUL, so those
/// bytes are dropped.
fn encode_row(buf: &mut Vec<u8>, columns: &[TypedColumn<'_>], row: usize) -> usize {
    let mut dropped = 0;
    for (pos, col) in columns.iter().enumerate() {
        if pos > 0 {
            buf.push(b'\t');
        }
        match col {
            TypedColumn::Utf8(a) if a.is_valid(row) => {
                for byte in a.value(row).bytes() {
                    match byte {
                        b'\\' => buf.extend_from_slice(b"\\\\"),
                        b'\t' => buf.extend_from_slice(b"\\t"),
                        b'\n' => buf.extend_from_slice(b"\\n"),
                        b'\r' => buf.extend_from_slice(b"\\r"),
                        0 => dropped += 1,
                        _ => buf.push(byte),
                    }
                }
            }
            // Writing into a Vec cannot fail
            TypedColumn::Int32(a) if a.is_valid(row) => {
                let _ = write!(buf, "{}", a.value(row));
            }
            TypedColumn::Int64(a) if a.is_valid(row) => {
                let _ = write!(buf, "{}", a.value(row));
            }
            TypedColumn::Boolean(a) if a.is_valid(row) => {
                buf.push(if a.value(row) { b't' } else { b'f' });
            }
            _ => buf.extend_from_slice(b"\\N"),
        }
    }
    buf.push(b'\n');
    dropped
}
