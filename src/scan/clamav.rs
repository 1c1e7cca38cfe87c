//! ClamAV command-line scanner
//!
//! Tries the daemon client first and falls back to the standalone scanner.
//! Exit code 0 is clean, 1 is infected, anything else is a failure.

use super::{ScanReport, Scanner};
use crate::error::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

fn threat_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?m): (.+) FOUND\s*$").ok())
        .as_ref()
}

/// Extract the threat name from scanner output
pub fn parse_threat(output: &str) -> Option<String> {
    threat_pattern()?
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Scanner driving `clamdscan` / `clamscan`
pub struct ClamAvScanner {
    daemon_binary: String,
    binary: String,
}

impl ClamAvScanner {
    pub fn new(daemon_binary: impl Into<String>, binary: impl Into<String>) -> Self {
        ClamAvScanner {
            daemon_binary: daemon_binary.into(),
            binary: binary.into(),
        }
    }

    async fn has_binary(binary: &str) -> bool {
        Command::new(binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn run(&self, binary: &str, path: &Path) -> Result<ScanReport> {
        let start = Instant::now();
        let output = Command::new(binary)
            .arg("--no-summary")
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::ScannerUnavailable,
                _ => Error::ScanError(format!("{} failed to start: {}", binary, e)),
            })?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match output.status.code() {
            Some(0) => Ok(ScanReport::clean(elapsed_ms)),
            Some(1) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let threat = parse_threat(&stdout).unwrap_or_else(|| "unknown threat".to_string());
                Ok(ScanReport::infected(threat, elapsed_ms))
            }
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(Error::ScanError(format!(
                    "{} exited with {:?}: {}",
                    binary,
                    code,
                    stderr.trim()
                )))
            }
        }
    }
}

#[async_trait]
impl Scanner for ClamAvScanner {
    fn name(&self) -> &str {
        "clamav"
    }

    async fn probe(&self) -> bool {
        Self::has_binary(&self.daemon_binary).await || Self::has_binary(&self.binary).await
    }

    async fn scan(&self, path: &Path) -> Result<ScanReport> {
        match self.run(&self.daemon_binary, path).await {
            Ok(report) => Ok(report),
            Err(e) => {
                debug!(error = %e, "Daemon scan failed, falling back to {}", self.binary);
                let result = self.run(&self.binary, path).await;
                if let Err(fallback) = &result {
                    warn!(daemon_error = %e, error = %fallback, "ClamAV scan failed");
                }
                result
            }
        }
    }
}
