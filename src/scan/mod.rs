//! Malware scanning
//!
//! Scanners sit behind the [`Scanner`] trait. The [`ScanGateway`] adds the
//! timeout, the cached availability probe and the policy for uploads,
//! downloads, rescans and quarantine.

mod cache;
mod clamav;
mod gateway;

pub use cache::AvailabilityCache;
pub use clamav::ClamAvScanner;
pub use gateway::{
    DownloadScan, QuarantineOutcome, ScanBatchReport, ScanGateway, ScanOutcome, ScanSummary,
    UploadScan,
};

use crate::config::{ScannerBackend, ScannerConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of one completed scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub clean: bool,
    /// Threat name when infected, otherwise a short status
    pub result: String,
    pub elapsed_ms: u64,
}

impl ScanReport {
    pub fn clean(elapsed_ms: u64) -> Self {
        ScanReport {
            clean: true,
            result: "clean".to_string(),
            elapsed_ms,
        }
    }

    pub fn infected(threat: impl Into<String>, elapsed_ms: u64) -> Self {
        ScanReport {
            clean: false,
            result: threat.into(),
            elapsed_ms,
        }
    }
}

/// An external malware scanner
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Whether the scanner can run at all
    async fn probe(&self) -> bool;

    /// Scan one file
    ///
    /// Fails with [`Error::ScannerUnavailable`] when the scanner is absent and
    /// [`Error::ScanError`] when it ran but produced no verdict.
    async fn scan(&self, path: &Path) -> Result<ScanReport>;
}

/// Build the scanner selected in the configuration
pub fn from_config(config: &ScannerConfig) -> Arc<dyn Scanner> {
    match config.backend {
        ScannerBackend::ClamAv => Arc::new(ClamAvScanner::new(
            config.daemon_binary.clone(),
            config.binary.clone(),
        )),
        ScannerBackend::Disabled => Arc::new(UnavailableScanner),
    }
}

/// A scanner that is never available
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableScanner;

#[async_trait]
impl Scanner for UnavailableScanner {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn probe(&self) -> bool {
        false
    }

    async fn scan(&self, _path: &Path) -> Result<ScanReport> {
        Err(Error::ScannerUnavailable)
    }
}

/// Verdict returned by a [`FixedScanner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixedVerdict {
    Clean,
    Infected(String),
    Fail(String),
}

/// A scanner with a preset verdict, for embedding and tests
pub struct FixedScanner {
    verdict: Mutex<FixedVerdict>,
    delay: Option<Duration>,
    availability_delay: Option<Duration>,
    probes: AtomicUsize,
    scans: AtomicUsize,
}

impl FixedScanner {
    pub fn new(verdict: FixedVerdict) -> Self {
        FixedScanner {
            verdict: Mutex::new(verdict),
            delay: None,
            availability_delay: None,
            probes: AtomicUsize::new(0),
            scans: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every scan
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep this long before answering an availability check
    pub fn with_availability_delay(mut self, delay: Duration) -> Self {
        self.availability_delay = Some(delay);
        self
    }

    pub fn set_verdict(&self, verdict: FixedVerdict) {
        *self.verdict.lock() = verdict;
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for FixedScanner {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.availability_delay {
            tokio::time::sleep(delay).await;
        }
        true
    }

    async fn scan(&self, _path: &Path) -> Result<ScanReport> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let verdict = self.verdict.lock().clone();
        match verdict {
            FixedVerdict::Clean => Ok(ScanReport::clean(0)),
            FixedVerdict::Infected(threat) => Ok(ScanReport::infected(threat, 0)),
            FixedVerdict::Fail(msg) => Err(Error::ScanError(msg)),
        }
    }
}
