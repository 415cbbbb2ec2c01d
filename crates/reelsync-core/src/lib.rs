//! Reelsync Core - Shared infrastructure for dataset sync pipelines
//!
//! HTTP streaming with gzip decompression, header-only freshness probes,
//! bounded retry, progress reporting, and logging setup.

pub mod logging;
pub mod progress;
pub mod retry;
pub mod shutdown;
pub mod stream;

// Re-exports for convenience
pub use logging::{IndicatifLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use retry::{RetryPolicy, retry};
pub use shutdown::{install_signal_handlers, is_shutdown_requested, request_shutdown};
pub use stream::{
    ByteCounter, GzipReader, GzipStream, HttpConfig, SHARED_RUNTIME, StreamError,
    http_config, open_gzip_reader, probe_freshness_token, set_http_config,
};
