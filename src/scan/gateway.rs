//! Scan policy for uploads, downloads, rescans and quarantine

use super::{AvailabilityCache, ScanReport, Scanner};
use crate::audit::{AuditAction, AuditEvent, AuditOutcome, AuditSink};
use crate::error::{Error, Result};
use crate::metadata::{MetadataStore, ScanStatus, StoredFile};
use crate::vault::Vault;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const QUARANTINE_REASON: &str = "quarantined";

/// Scan state to record for a new upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadScan {
    pub status: ScanStatus,
    pub result: Option<String>,
    pub scanned_at: Option<DateTime<Utc>>,
}

/// Result of the real-time scan before a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadScan {
    Clean,
    /// Scan was bypassed by the caller or disabled
    Skipped,
    /// Download allowed without a verdict
    Advisory(String),
}

impl DownloadScan {
    /// Advisory text to pass on to the caller
    pub fn advisory(&self) -> Option<&str> {
        match self {
            DownloadScan::Advisory(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Resolution of one rescan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ScanOutcome {
    Clean,
    Infected(String),
    Error(String),
    /// Scanner unavailable; status unchanged
    Skipped,
}

/// Counts from [`ScanGateway::scan_pending`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanBatchReport {
    pub total: usize,
    pub clean: usize,
    pub infected: usize,
    pub errors: usize,
    pub skipped: usize,
}

/// Scan summary of one file
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub status: ScanStatus,
    pub result: Option<String>,
    pub scan_at: Option<DateTime<Utc>>,
    pub scanner_available: bool,
    pub needs_scan: bool,
}

/// Result of a quarantine request
#[derive(Debug, Clone)]
pub enum QuarantineOutcome {
    Quarantined(StoredFile),
    AlreadyQuarantined(StoredFile),
}

impl QuarantineOutcome {
    pub fn file(&self) -> &StoredFile {
        match self {
            QuarantineOutcome::Quarantined(f) | QuarantineOutcome::AlreadyQuarantined(f) => f,
        }
    }
}

/// Malware scanning front door
pub struct ScanGateway {
    scanner: Arc<dyn Scanner>,
    cache: AvailabilityCache,
    timeout: Duration,
    scan_on_download: bool,
    store: MetadataStore,
    vault: Arc<Vault>,
    audit: Arc<dyn AuditSink>,
}

impl ScanGateway {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        availability_ttl: Duration,
        timeout: Duration,
        scan_on_download: bool,
        store: MetadataStore,
        vault: Arc<Vault>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        ScanGateway {
            scanner,
            cache: AvailabilityCache::new(availability_ttl),
            timeout,
            scan_on_download,
            store,
            vault,
            audit,
        }
    }

    /// Whether the scanner is present (cached)
    ///
    /// The check shares the scan timeout; an answer that does not arrive in
    /// time counts as unavailable.
    pub async fn is_available(&self) -> bool {
        let timeout = self.timeout;
        self.cache
            .get(|| async move {
                match tokio::time::timeout(timeout, self.scanner.probe()).await {
                    Ok(available) => available,
                    Err(_) => {
                        warn!(
                            scanner = self.scanner.name(),
                            timeout_secs = timeout.as_secs(),
                            "Scanner availability check timed out"
                        );
                        false
                    }
                }
            })
            .await
    }

    /// Scan one file within the configured timeout
    pub async fn scan(&self, path: &Path) -> Result<ScanReport> {
        if !self.is_available().await {
            return Err(Error::ScannerUnavailable);
        }

        debug!(scanner = self.scanner.name(), path = %path.display(), "Scanning");
        match tokio::time::timeout(self.timeout, self.scanner.scan(path)).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(Error::ScannerUnavailable)) => {
                self.cache.invalidate();
                Err(Error::ScannerUnavailable)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Scan timed out");
                Err(Error::ScanError(format!(
                    "scan timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }

    /// Scan staged plaintext before it is encrypted
    ///
    /// A detection rejects the upload. An absent or failing scanner lets it
    /// through as `pending`.
    pub async fn gate_upload(&self, plaintext: &Path) -> Result<UploadScan> {
        match self.scan(plaintext).await {
            Ok(report) if report.clean => Ok(UploadScan {
                status: ScanStatus::Clean,
                result: Some(report.result),
                scanned_at: Some(Utc::now()),
            }),
            Ok(report) => Err(Error::ScanInfected(report.result)),
            Err(Error::ScannerUnavailable) => Ok(UploadScan {
                status: ScanStatus::Pending,
                result: Some("scanner unavailable".to_string()),
                scanned_at: None,
            }),
            Err(Error::ScanError(msg)) => {
                warn!(error = %msg, "Upload scan failed, storing as pending");
                Ok(UploadScan {
                    status: ScanStatus::Pending,
                    result: Some(msg),
                    scanned_at: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Scan decrypted plaintext before its bytes are released
    ///
    /// A fresh detection is persisted so later attempts fail the access check
    /// without decrypting. Refusals are returned for the caller to audit;
    /// advisories are recorded here as failed scans.
    pub async fn gate_download(
        &self,
        file: &StoredFile,
        plaintext: &Path,
        skip: bool,
        actor: &str,
    ) -> Result<DownloadScan> {
        if skip || !self.scan_on_download {
            return Ok(DownloadScan::Skipped);
        }

        let advisory = match self.scan(plaintext).await {
            Ok(report) if report.clean => return Ok(DownloadScan::Clean),
            Ok(report) => {
                let threat = report.result;
                self.persist_verdict(
                    &file.id,
                    file.scan_status,
                    &ScanOutcome::Infected(threat.clone()),
                )?;
                warn!(file_id = %file.id, threat = %threat, "Download blocked by real-time scan");
                return Err(Error::ScanInfected(threat));
            }
            Err(Error::ScannerUnavailable) => "scanner unavailable".to_string(),
            Err(Error::ScanError(msg)) => format!("scan failed: {}", msg),
            Err(e) => return Err(e),
        };

        if file.scan_status == ScanStatus::Infected {
            let threat = file
                .scan_result
                .clone()
                .unwrap_or_else(|| "previously detected threat".to_string());
            return Err(Error::ScanInfected(threat));
        }

        self.audit.record(
            AuditEvent::new(actor, AuditAction::Scan, Some(file.id))
                .outcome(AuditOutcome::Failure)
                .details(json!({ "stage": "download", "advisory": advisory })),
        );
        Ok(DownloadScan::Advisory(advisory))
    }

    /// Record a scan outcome; `prior` is the status before the scan started
    fn persist_verdict(
        &self,
        file_id: &Uuid,
        prior: ScanStatus,
        outcome: &ScanOutcome,
    ) -> Result<StoredFile> {
        let now = Utc::now();
        self.store.update(file_id, |f| {
            match outcome {
                ScanOutcome::Clean => {
                    f.scan_status = ScanStatus::Clean;
                    f.scan_result = Some("clean".to_string());
                }
                ScanOutcome::Infected(threat) => {
                    f.scan_status = ScanStatus::Infected;
                    f.scan_result = Some(threat.clone());
                }
                ScanOutcome::Error(msg) => {
                    f.scan_status = prior.after_error();
                    if f.scan_status == ScanStatus::Error {
                        f.scan_result = Some(msg.clone());
                    }
                }
                ScanOutcome::Skipped => {
                    f.scan_status = match prior {
                        ScanStatus::Scanning => ScanStatus::Pending,
                        other => other,
                    };
                    return Ok(());
                }
            }
            f.scan_at = Some(now);
            Ok(())
        })
    }

    /// Decrypt, scan and record the verdict for one file
    pub async fn scan_and_update(&self, file_id: &Uuid, actor: &str) -> Result<ScanOutcome> {
        let file = self.store.require(file_id)?;
        if !self.is_available().await {
            info!(file_id = %file_id, "Scanner unavailable, file stays {}", file.scan_status);
            return Ok(ScanOutcome::Skipped);
        }

        let prior = file.scan_status;
        let file = self.store.update(file_id, |f| {
            f.scan_status = ScanStatus::Scanning;
            Ok(())
        })?;

        let outcome = match self.vault.open(&file).await {
            Ok(plaintext) => {
                let result = self.scan(plaintext.path()).await;
                plaintext.finish()?;
                match result {
                    Ok(report) if report.clean => ScanOutcome::Clean,
                    Ok(report) => ScanOutcome::Infected(report.result),
                    Err(Error::ScannerUnavailable) => ScanOutcome::Skipped,
                    Err(e) => ScanOutcome::Error(e.to_string()),
                }
            }
            Err(e) => ScanOutcome::Error(format!("could not decrypt for scanning: {}", e)),
        };

        let stored = self.persist_verdict(file_id, prior, &outcome)?;

        let audit_outcome = match outcome {
            ScanOutcome::Clean | ScanOutcome::Skipped => AuditOutcome::Success,
            ScanOutcome::Infected(_) => AuditOutcome::Blocked,
            ScanOutcome::Error(_) => AuditOutcome::Failure,
        };
        self.audit.record(
            AuditEvent::new(actor, AuditAction::Scan, Some(*file_id))
                .outcome(audit_outcome)
                .details(json!({
                    "outcome": outcome,
                    "status": stored.scan_status,
                })),
        );
        info!(file_id = %file_id, status = %stored.scan_status, "Scan complete");
        Ok(outcome)
    }

    /// Rescan every file whose status is `pending`
    pub async fn scan_pending(&self, actor: &str) -> Result<ScanBatchReport> {
        let pending = self
            .store
            .list_where(|f| f.scan_status == ScanStatus::Pending)?;
        let mut report = ScanBatchReport {
            total: pending.len(),
            ..Default::default()
        };

        for file in pending {
            match self.scan_and_update(&file.id, actor).await {
                Ok(ScanOutcome::Clean) => report.clean += 1,
                Ok(ScanOutcome::Infected(_)) => report.infected += 1,
                Ok(ScanOutcome::Error(_)) => report.errors += 1,
                Ok(ScanOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(file_id = %file.id, error = %e, "Pending scan failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            total = report.total,
            clean = report.clean,
            infected = report.infected,
            errors = report.errors,
            skipped = report.skipped,
            "Pending scan batch complete"
        );
        Ok(report)
    }

    /// Scan state of one file
    pub async fn scan_status(&self, file_id: &Uuid) -> Result<ScanSummary> {
        let file = self.store.require(file_id)?;
        Ok(ScanSummary {
            status: file.scan_status,
            result: file.scan_result,
            scan_at: file.scan_at,
            scanner_available: self.is_available().await,
            needs_scan: matches!(file.scan_status, ScanStatus::Pending | ScanStatus::Error),
        })
    }

    /// Move a file's ciphertext into quarantine and revoke it
    ///
    /// The record is claimed first, so concurrent requests move the bytes
    /// once. A failed move releases the claim.
    pub async fn quarantine(&self, file_id: &Uuid, actor: &str) -> Result<QuarantineOutcome> {
        let now = Utc::now();
        let mut already = false;
        let mut previous: Option<StoredFile> = None;

        let claimed = self.store.update(file_id, |f| {
            already = f.is_quarantined();
            if already {
                return Ok(());
            }
            previous = Some(f.clone());
            f.quarantined_at = Some(now);
            f.is_revoked = true;
            f.revoked_at = Some(now);
            f.revoked_by = Some(actor.to_string());
            f.revoke_reason = Some(QUARANTINE_REASON.to_string());
            f.clear_share();
            Ok(())
        })?;

        if already {
            info!(file_id = %file_id, "File already quarantined");
            return Ok(QuarantineOutcome::AlreadyQuarantined(claimed));
        }

        let moved = match self
            .vault
            .objects()
            .quarantine(file_id, &claimed.ciphertext_path)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                if let Some(previous) = previous {
                    self.store.update(file_id, |f| {
                        f.quarantined_at = None;
                        f.is_revoked = previous.is_revoked;
                        f.revoked_at = previous.revoked_at;
                        f.revoked_by = previous.revoked_by.clone();
                        f.revoke_reason = previous.revoke_reason.clone();
                        f.share_token = previous.share_token.clone();
                        f.share_expires_at = previous.share_expires_at;
                        f.verification_code = previous.verification_code.clone();
                        f.verification_code_expires_at = previous.verification_code_expires_at;
                        Ok(())
                    })?;
                }
                self.audit.record(
                    AuditEvent::new(actor, AuditAction::Quarantine, Some(*file_id))
                        .outcome(AuditOutcome::Failure)
                        .details(json!({ "error": e.to_string() })),
                );
                return Err(e);
            }
        };

        let file = self.store.update(file_id, |f| {
            f.ciphertext_path = moved.clone();
            Ok(())
        })?;

        warn!(file_id = %file_id, path = %moved.display(), "File quarantined");
        self.audit.record(
            AuditEvent::new(actor, AuditAction::Quarantine, Some(*file_id))
                .details(json!({ "path": moved, "scan_result": file.scan_result })),
        );
        Ok(QuarantineOutcome::Quarantined(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::Config;
    use crate::crypto::{AlgorithmPolicy, KeyManager, MasterKey, KEY_SIZE, SALT_SIZE};
    use crate::scan::{FixedScanner, FixedVerdict, UnavailableScanner};
    use crate::storage::ObjectStore;

    struct Fixture {
        dir: tempfile::TempDir,
        store: MetadataStore,
        vault: Arc<Vault>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        let objects = ObjectStore::new(&config);
        objects.ensure_dirs().unwrap();
        let keys = Arc::new(KeyManager::new(MasterKey::from_bytes(
            [3u8; KEY_SIZE],
            [4u8; SALT_SIZE],
        )));
        let vault = Arc::new(Vault::new(keys, objects, 4096, AlgorithmPolicy::Random));
        Fixture {
            dir,
            store: MetadataStore::temporary().unwrap(),
            vault,
            audit: Arc::new(MemoryAuditSink::new()),
        }
    }

    fn gateway(fx: &Fixture, scanner: Arc<dyn Scanner>, timeout: Duration) -> ScanGateway {
        ScanGateway::new(
            scanner,
            Duration::from_secs(300),
            timeout,
            true,
            fx.store.clone(),
            fx.vault.clone(),
            fx.audit.clone(),
        )
    }

    async fn stored(fx: &Fixture, status: ScanStatus) -> StoredFile {
        let plain = fx.dir.path().join("plain");
        std::fs::write(&plain, b"some document").unwrap();
        let id = Uuid::new_v4();
        let sealed = fx.vault.seal(id, &plain).await.unwrap();
        let mut file = StoredFile::new(
            id,
            "alice",
            "doc.txt",
            "text/plain",
            13,
            sealed.path,
            sealed.encryption.algorithm,
            sealed.encryption.iv,
            sealed.encryption.auth_tag,
            sealed.chunk_size,
            sealed.content_hash,
            Utc::now(),
        );
        file.scan_status = status;
        fx.store.insert(&file).unwrap();
        file
    }

    #[tokio::test]
    async fn test_scan_timeout_is_scan_error() {
        let fx = fixture();
        let scanner = Arc::new(
            FixedScanner::new(FixedVerdict::Clean).with_delay(Duration::from_secs(5)),
        );
        let gw = gateway(&fx, scanner, Duration::from_millis(50));
        let result = gw.scan(fx.dir.path()).await;
        assert!(matches!(result, Err(Error::ScanError(_))));
    }

    #[tokio::test]
    async fn test_hung_availability_check_counts_as_unavailable() {
        let fx = fixture();
        let scanner = Arc::new(
            FixedScanner::new(FixedVerdict::Clean)
                .with_availability_delay(Duration::from_secs(3600)),
        );
        let gw = gateway(&fx, scanner.clone(), Duration::from_millis(50));
        let path = fx.dir.path().join("upload");
        std::fs::write(&path, b"x").unwrap();

        let started = std::time::Instant::now();
        assert!(!gw.is_available().await);
        let upload = gw.gate_upload(&path).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(upload.status, ScanStatus::Pending);
        assert_eq!(scanner.scan_count(), 0);
    }

    #[tokio::test]
    async fn test_availability_probed_once() {
        let fx = fixture();
        let scanner = Arc::new(FixedScanner::new(FixedVerdict::Clean));
        let gw = gateway(&fx, scanner.clone(), Duration::from_secs(5));
        for _ in 0..3 {
            gw.scan(fx.dir.path()).await.unwrap();
        }
        assert_eq!(scanner.probe_count(), 1);
        assert_eq!(scanner.scan_count(), 3);
    }

    #[tokio::test]
    async fn test_upload_gate() {
        let fx = fixture();
        let path = fx.dir.path().join("upload");
        std::fs::write(&path, b"x").unwrap();

        let infected = gateway(
            &fx,
            Arc::new(FixedScanner::new(FixedVerdict::Infected("Eicar".into()))),
            Duration::from_secs(5),
        );
        assert!(matches!(
            infected.gate_upload(&path).await,
            Err(Error::ScanInfected(t)) if t == "Eicar"
        ));

        let absent = gateway(&fx, Arc::new(UnavailableScanner), Duration::from_secs(5));
        assert_eq!(
            absent.gate_upload(&path).await.unwrap().status,
            ScanStatus::Pending
        );

        let failing = gateway(
            &fx,
            Arc::new(FixedScanner::new(FixedVerdict::Fail("crashed".into()))),
            Duration::from_secs(5),
        );
        assert_eq!(
            failing.gate_upload(&path).await.unwrap().status,
            ScanStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_error_never_clears_detection() {
        let fx = fixture();
        let scanner = Arc::new(FixedScanner::new(FixedVerdict::Infected("Eicar".into())));
        let gw = gateway(&fx, scanner.clone(), Duration::from_secs(5));
        let file = stored(&fx, ScanStatus::Pending).await;

        let outcome = gw.scan_and_update(&file.id, "admin").await.unwrap();
        assert_eq!(outcome, ScanOutcome::Infected("Eicar".into()));

        scanner.set_verdict(FixedVerdict::Fail("boom".into()));
        let outcome = gw.scan_and_update(&file.id, "admin").await.unwrap();
        assert!(matches!(outcome, ScanOutcome::Error(_)));

        let stored = fx.store.require(&file.id).unwrap();
        assert_eq!(stored.scan_status, ScanStatus::Infected);
        assert_eq!(stored.scan_result.as_deref(), Some("Eicar"));
    }

    #[tokio::test]
    async fn test_unavailable_leaves_pending() {
        let fx = fixture();
        let gw = gateway(&fx, Arc::new(UnavailableScanner), Duration::from_secs(5));
        let file = stored(&fx, ScanStatus::Pending).await;

        assert_eq!(
            gw.scan_and_update(&file.id, "admin").await.unwrap(),
            ScanOutcome::Skipped
        );
        assert_eq!(
            fx.store.require(&file.id).unwrap().scan_status,
            ScanStatus::Pending
        );

        let report = gw.scan_pending("admin").await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_scan_pending_counts() {
        let fx = fixture();
        let gw = gateway(
            &fx,
            Arc::new(FixedScanner::new(FixedVerdict::Clean)),
            Duration::from_secs(5),
        );
        stored(&fx, ScanStatus::Pending).await;
        stored(&fx, ScanStatus::Pending).await;
        stored(&fx, ScanStatus::Clean).await;

        let report = gw.scan_pending("admin").await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.clean, 2);

        let summary = gw.scan_status(&stored(&fx, ScanStatus::Error).await.id).await.unwrap();
        assert!(summary.needs_scan);
        assert!(summary.scanner_available);
    }

    #[tokio::test]
    async fn test_download_gate_persists_detection() {
        let fx = fixture();
        let gw = gateway(
            &fx,
            Arc::new(FixedScanner::new(FixedVerdict::Infected("Trojan".into()))),
            Duration::from_secs(5),
        );
        let file = stored(&fx, ScanStatus::Clean).await;

        let result = gw.gate_download(&file, fx.dir.path(), false, "alice").await;
        assert!(matches!(result, Err(Error::ScanInfected(_))));
        assert_eq!(
            fx.store.require(&file.id).unwrap().scan_status,
            ScanStatus::Infected
        );
        assert_eq!(
            gw.gate_download(&file, fx.dir.path(), true, "alice")
                .await
                .unwrap(),
            DownloadScan::Skipped
        );
    }

    #[tokio::test]
    async fn test_download_gate_advisory_when_unavailable() {
        let fx = fixture();
        let gw = gateway(&fx, Arc::new(UnavailableScanner), Duration::from_secs(5));
        let mut file = stored(&fx, ScanStatus::Clean).await;

        let scan = gw
            .gate_download(&file, fx.dir.path(), false, "alice")
            .await
            .unwrap();
        assert_eq!(scan.advisory(), Some("scanner unavailable"));
        assert!(fx.audit.contains(AuditAction::Scan, AuditOutcome::Failure));

        file.scan_status = ScanStatus::Infected;
        let result = gw.gate_download(&file, fx.dir.path(), false, "alice").await;
        assert!(matches!(result, Err(Error::ScanInfected(_))));
    }

    #[tokio::test]
    async fn test_quarantine_is_idempotent() {
        let fx = fixture();
        let gw = gateway(&fx, Arc::new(UnavailableScanner), Duration::from_secs(5));
        let file = stored(&fx, ScanStatus::Infected).await;

        let first = gw.quarantine(&file.id, "admin").await.unwrap();
        assert!(matches!(first, QuarantineOutcome::Quarantined(_)));
        let moved = first.file();
        assert!(moved.is_revoked);
        assert_eq!(moved.revoke_reason.as_deref(), Some("quarantined"));
        assert!(fx.vault.objects().is_quarantine_path(&moved.ciphertext_path));
        assert!(!file.ciphertext_path.exists());

        let second = gw.quarantine(&file.id, "admin").await.unwrap();
        assert!(matches!(second, QuarantineOutcome::AlreadyQuarantined(_)));
        assert!(second.file().ciphertext_path.exists());
    }

    #[tokio::test]
    async fn test_failed_quarantine_releases_claim() {
        let fx = fixture();
        let gw = gateway(&fx, Arc::new(UnavailableScanner), Duration::from_secs(5));
        let file = stored(&fx, ScanStatus::Infected).await;
        std::fs::remove_file(&file.ciphertext_path).unwrap();

        let result = gw.quarantine(&file.id, "admin").await;
        assert!(matches!(result, Err(Error::FileMissing(_))));
        let stored = fx.store.require(&file.id).unwrap();
        assert!(!stored.is_quarantined());
        assert!(!stored.is_revoked);
    }
}
