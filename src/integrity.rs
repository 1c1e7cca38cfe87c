//! Ciphertext integrity verification
//!
//! The SHA-256 digest of the ciphertext is recorded at upload. Verifying a
//! file re-hashes the bytes on disk, updates the record and emits an audit
//! event carrying both digests.

use crate::audit::{AuditAction, AuditEvent, AuditOutcome, AuditSink};
use crate::error::{Error, Result};
use crate::metadata::{MetadataStore, StoredFile};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use ring::digest::{Context, SHA256};
use serde::Serialize;
use serde_json::json;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Hex SHA-256 of a file, read in bounded chunks
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::FileMissing(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    let mut context = Context::new(&SHA256);
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        context.update(&buf[..n]);
    }
    Ok(hex::encode(context.finish().as_ref()))
}

/// [`hash_file`] on the blocking pool
pub async fn hash_path(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_file(&path)).await?
}

/// Outcome of verifying one file
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub file_id: Uuid,
    pub verified: bool,
    pub stored_digest: String,
    /// `None` when the ciphertext could not be read
    pub current_digest: Option<String>,
    pub missing: bool,
    pub checked_at: DateTime<Utc>,
}

/// Outcome of a batch verification
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemIntegrityReport {
    pub total: usize,
    pub verified: usize,
    pub failed: usize,
    pub missing: usize,
    pub results: Vec<IntegrityReport>,
}

/// Verifies stored ciphertext against recorded digests
pub struct IntegrityVerifier {
    store: MetadataStore,
    audit: Arc<dyn AuditSink>,
    concurrency: usize,
}

impl IntegrityVerifier {
    pub fn new(store: MetadataStore, audit: Arc<dyn AuditSink>, concurrency: usize) -> Self {
        IntegrityVerifier {
            store,
            audit,
            concurrency: concurrency.max(1),
        }
    }

    /// Verify one file by id
    ///
    /// A digest mismatch is a successful verification with `verified: false`.
    /// Missing ciphertext fails with [`Error::FileMissing`].
    pub async fn verify(&self, file_id: &Uuid, actor: &str) -> Result<IntegrityReport> {
        let file = self.store.require(file_id)?;
        let path = file.ciphertext_path.clone();
        let report = self.verify_record(file, actor).await?;
        if report.missing {
            return Err(Error::FileMissing(path));
        }
        Ok(report)
    }

    /// Re-check a file before its bytes are released
    pub async fn gate_download(&self, file: &StoredFile, actor: &str) -> Result<()> {
        let report = self.verify_record(file.clone(), actor).await?;
        if report.missing {
            return Err(Error::FileMissing(file.ciphertext_path.clone()));
        }
        if !report.verified {
            return Err(Error::IntegrityMismatch {
                stored: report.stored_digest,
                current: report.current_digest.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Verify every non-revoked file
    pub async fn verify_all(&self, actor: &str) -> Result<SystemIntegrityReport> {
        let files = self.store.list_where(|f| !f.is_revoked)?;
        let report = self.verify_batch(files, actor).await;

        info!(
            total = report.total,
            verified = report.verified,
            failed = report.failed,
            missing = report.missing,
            "System integrity check complete"
        );
        let outcome = if report.failed + report.missing == 0 {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.audit.record(
            AuditEvent::new(actor, AuditAction::SystemIntegrityCheck, None)
                .outcome(outcome)
                .details(json!({
                    "total": report.total,
                    "verified": report.verified,
                    "failed": report.failed,
                    "missing": report.missing,
                })),
        );
        Ok(report)
    }

    /// Verify every non-revoked file of one owner
    pub async fn verify_owner(&self, owner_id: &str, actor: &str) -> Result<SystemIntegrityReport> {
        let files = self
            .store
            .list_where(|f| f.owner_id == owner_id && !f.is_revoked)?;
        Ok(self.verify_batch(files, actor).await)
    }

    async fn verify_batch(&self, files: Vec<StoredFile>, actor: &str) -> SystemIntegrityReport {
        let total = files.len();
        let results: Vec<IntegrityReport> = stream::iter(files)
            .map(|file| async move {
                let fallback = IntegrityReport {
                    file_id: file.id,
                    verified: false,
                    stored_digest: file.content_hash.clone(),
                    current_digest: None,
                    missing: false,
                    checked_at: Utc::now(),
                };
                match self.verify_record(file, actor).await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(file_id = %fallback.file_id, error = %e, "Integrity check failed");
                        fallback
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = SystemIntegrityReport {
            total,
            ..Default::default()
        };
        for result in &results {
            if result.missing {
                report.missing += 1;
            } else if result.verified {
                report.verified += 1;
            } else {
                report.failed += 1;
            }
        }
        report.results = results;
        report
    }

    async fn verify_record(&self, file: StoredFile, actor: &str) -> Result<IntegrityReport> {
        let checked_at = Utc::now();
        let (current, missing) = match hash_path(file.ciphertext_path.clone()).await {
            Ok(digest) => (Some(digest), false),
            Err(Error::FileMissing(_)) => (None, true),
            Err(e) => return Err(e),
        };
        let verified = current.as_deref() == Some(file.content_hash.as_str());

        self.store.update(&file.id, |f| {
            f.integrity_verified = verified;
            f.last_integrity_check_at = Some(checked_at);
            Ok(())
        })?;

        if !verified {
            warn!(
                file_id = %file.id,
                missing,
                stored = %file.content_hash,
                current = ?current,
                "Integrity verification failed"
            );
        }
        self.audit.record(
            AuditEvent::new(actor, AuditAction::IntegrityCheck, Some(file.id))
                .outcome(if verified {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Failure
                })
                .details(json!({
                    "stored_digest": file.content_hash,
                    "current_digest": current,
                    "missing": missing,
                })),
        );

        Ok(IntegrityReport {
            file_id: file.id,
            verified,
            stored_digest: file.content_hash,
            current_digest: current,
            missing,
            checked_at,
        })
    }
}
