//! HTTP streaming with gzip decompression, read timeout, and freshness probes.
//!
//! Uses async reqwest internally with tokio::time::timeout for stall detection,
//! but presents a sync interface so the pipeline can pull batches with plain
//! iterators.

use std::io::{self, BufReader, Read};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, OnceLock};
use std::task::Context;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderMap, LAST_MODIFIED};
use tokio::io::{AsyncRead, ReadBuf};

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime-tunable HTTP limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpConfig {
    /// Seconds with no body data before the stream is considered stalled
    pub read_timeout: Duration,
    /// Upper bound for the header-only freshness probe
    pub probe_timeout: Duration,
    /// Attempts for the probe and for opening a download
    pub max_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

static HTTP_CONFIG: OnceLock<HttpConfig> = OnceLock::new();

/// Install process-wide HTTP limits. Only the first call takes effect.
pub fn set_http_config(config: HttpConfig) {
    if HTTP_CONFIG.set(config).is_err() {
        log::debug!("HTTP config already set, ignoring {config:?}");
    }
}

/// Current HTTP limits (defaults until [`set_http_config`] is called).
pub fn http_config() -> HttpConfig {
    HTTP_CONFIG.get().copied().unwrap_or_default()
}

/// Error types for stream operations
#[derive(Debug)]
pub enum StreamError {
    /// HTTP error with optional status code
    Http {
        status: Option<u16>,
        message: String,
    },
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Http {
                status: None,
                message,
            } => write!(f, "HTTP error: {message}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http { .. } => None,
            Self::Io(e) => Some(e),
        }
    }
}

impl StreamError {
    /// Create HTTP error from reqwest error
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        Self::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }

    fn timed_out(what: &str, after: Duration) -> Self {
        Self::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out after {}s", after.as_secs()),
        ))
    }

    /// Transient failures worth another attempt.
    ///
    /// Client errors are permanent except 408 (request timeout) and
    /// 429 (rate limited). Missing status means the connection itself failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status: None, .. } => true,
            Self::Http {
                status: Some(s), ..
            } => matches!(*s, 408 | 429) || *s >= 500,
            Self::Io(e) => e.kind() != std::io::ErrorKind::StorageFull,
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Shared async HTTP client with connection pooling.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(2)
        .build()
        .expect("failed to build HTTP client")
});

/// Shared tokio runtime for HTTP and database operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Opaque validator for a remote resource: `ETag`, else `Last-Modified`.
///
/// Compared for exact equality only; neither header admits ordering.
pub fn freshness_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .or_else(|| headers.get(LAST_MODIFIED))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Header-only request for the current freshness token of `url`.
///
/// Bounded by [`HttpConfig::probe_timeout`]. Non-2xx statuses are errors.
pub fn probe_freshness_token(url: &str) -> Result<Option<String>, StreamError> {
    let timeout = http_config().probe_timeout;
    SHARED_RUNTIME.handle().block_on(async {
        let request = SHARED_CLIENT.head(url).send();
        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| StreamError::timed_out("HEAD request", timeout))?
            .and_then(|r| r.error_for_status())
            .map_err(|e| StreamError::from_reqwest(&e))?;
        Ok(freshness_token(response.headers()))
    })
}

/// Buffer size for gzip stream reader (256KB)
const GZIP_BUF_SIZE: usize = 256 * 1024;

/// Buffered reader over a gzipped HTTP response body with byte counting
pub type GzipReader = BufReader<MultiGzDecoder<CountingReader<TimeoutReader>>>;

/// Shared byte counter for progress tracking
pub type ByteCounter = Arc<AtomicU64>;

/// An opened download: decompressed reader plus response metadata.
pub struct GzipStream {
    pub reader: GzipReader,
    /// Compressed bytes received so far
    pub counter: ByteCounter,
    /// `Content-Length` of the compressed body, if the server sent one
    pub total_bytes: Option<u64>,
    /// Freshness token observed on this response
    pub token: Option<String>,
}

impl std::fmt::Debug for GzipStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipStream")
            .field("total_bytes", &self.total_bytes)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// HTTP GET → gunzip → buffered reader with byte counter
///
/// Only the request/response handshake happens here; the body is pulled
/// lazily as the returned reader is consumed.
pub fn open_gzip_reader(url: &str) -> Result<GzipStream, StreamError> {
    let read_timeout = http_config().read_timeout;

    let (reader, total_bytes, token) = SHARED_RUNTIME.handle().block_on(async {
        let request = SHARED_CLIENT.get(url).send();
        let response = tokio::time::timeout(CONNECT_TIMEOUT + read_timeout, request)
            .await
            .map_err(|_| StreamError::timed_out("GET request", CONNECT_TIMEOUT + read_timeout))?
            .and_then(|r| r.error_for_status())
            .map_err(|e| StreamError::from_reqwest(&e))?;

        let total_bytes = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        let token = freshness_token(response.headers());

        // Convert response body stream to AsyncRead
        let stream = response.bytes_stream();
        let async_reader = tokio_util::io::StreamReader::new(
            stream.map(|result| result.map_err(io::Error::other)),
        );

        Ok::<_, StreamError>((
            TimeoutReader::new(Box::pin(async_reader), read_timeout),
            total_bytes,
            token,
        ))
    })?;

    let counter = Arc::new(AtomicU64::new(0));
    let counting_reader = CountingReader {
        inner: reader,
        count: counter.clone(),
    };
    let gz = MultiGzDecoder::new(counting_reader);
    let reader = BufReader::with_capacity(GZIP_BUF_SIZE, gz);

    Ok(GzipStream {
        reader,
        counter,
        total_bytes,
        token,
    })
}

/// Reader wrapper that tracks bytes read
pub struct CountingReader<R> {
    inner: R,
    count: ByteCounter,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, count: ByteCounter) -> Self {
        Self { inner, count }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Async-to-sync bridge with read timeout.
///
/// Each read has a deadline; if no data arrives in time the read fails with
/// `TimedOut`. Streaming is never retried, so this surfaces as an
/// extraction failure for the whole run.
pub struct TimeoutReader {
    inner: Pin<Box<dyn AsyncRead + Send + Sync>>,
    timeout: Duration,
}

impl TimeoutReader {
    fn new(inner: Pin<Box<dyn AsyncRead + Send + Sync>>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl Read for TimeoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.timeout;
        SHARED_RUNTIME.handle().block_on(async {
            let read_future = async {
                let mut read_buf = ReadBuf::new(buf);
                std::future::poll_fn(|cx: &mut Context<'_>| {
                    Pin::as_mut(&mut self.inner).poll_read(cx, &mut read_buf)
                })
                .await?;
                Ok::<_, io::Error>(read_buf.filled().len())
            };

            match tokio::time::timeout(timeout, read_future).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("read timeout ({}s with no data)", timeout.as_secs()),
                )),
            }
        })
    }
}
