//! Change detection: compare the remote freshness token with the stored one

use reelsync_core::{RetryPolicy, StreamError, probe_freshness_token, retry};
use reelsync_store::FreshnessMap;

use crate::dataset::source_url;

/// Header-only lookup of a remote file's current freshness token.
pub trait FreshnessProbe {
    fn probe(&self, url: &str) -> Result<Option<String>, StreamError>;
}

/// `HEAD` request with bounded retry.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    policy: RetryPolicy,
}

impl HttpProbe {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(RetryPolicy::from_http_config())
    }
}

impl FreshnessProbe for HttpProbe {
    fn probe(&self, url: &str) -> Result<Option<String>, StreamError> {
        retry(&format!("HEAD {url}"), &self.policy, || {
            probe_freshness_token(url)
        })
    }
}

/// Outcome of one freshness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Remote token equals the stored one
    Unchanged,
    /// Remote token differs from the stored one
    Changed { remote: Option<String> },
    /// Nothing stored for this file yet
    NoRecord { remote: Option<String> },
    /// Probe failed after retries; treated as changed
    ProbeFailed,
}

impl Decision {
    pub fn should_download(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }

    /// Token reported by the probe, if it succeeded.
    pub fn remote_token(&self) -> Option<&str> {
        match self {
            Self::Changed { remote } | Self::NoRecord { remote } => remote.as_deref(),
            Self::Unchanged | Self::ProbeFailed => None,
        }
    }
}

/// Decides per source file whether re-extraction is necessary.
///
/// Fails open: any probe error means "download".
pub struct ChangeDetector<P> {
    probe: P,
    base_url: String,
    records: FreshnessMap,
}

impl<P: FreshnessProbe> ChangeDetector<P> {
    /// `records` is the metadata snapshot read at the start of the run.
    pub fn new(probe: P, base_url: impl Into<String>, records: FreshnessMap) -> Self {
        Self {
            probe,
            base_url: base_url.into(),
            records,
        }
    }

    pub fn check(&self, filename: &str) -> Decision {
        let url = source_url(&self.base_url, filename);
        let remote = match self.probe.probe(&url) {
            Ok(token) => token,
            Err(e) => {
                log::warn!("{filename}: freshness probe failed ({e}), assuming changed");
                return Decision::ProbeFailed;
            }
        };

        let stored = self.records.get(filename).and_then(|r| r.etag.as_deref());
        let Some(stored) = stored else {
            log::info!("{filename}: no previous sync recorded");
            return Decision::NoRecord { remote };
        };

        match remote.as_deref() {
            Some(current) if current == stored => {
                log::info!("{filename}: unchanged ({current})");
                Decision::Unchanged
            }
            Some(current) => {
                log::info!("{filename}: changed ({stored} -> {current})");
                Decision::Changed { remote }
            }
            None => {
                log::warn!("{filename}: server sent no validator, assuming changed");
                Decision::Changed { remote }
            }
        }
    }

    pub fn should_download(&self, filename: &str) -> bool {
        self.check(filename).should_download()
    }
}
