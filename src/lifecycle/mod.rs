//! File lifecycle state machine
//!
//! Revocation, expiration, password locks, download quotas and deletion.
//! Every transition is a single [`MetadataStore::update`] so concurrent
//! requests never lose each other's changes. Callers are expected to have
//! authorized the actor already.

mod expiry;

pub use expiry::{expiration_from, format_remaining, ExpiryUnit};

use crate::audit::{AuditAction, AuditEvent, AuditOutcome, AuditSink};
use crate::crypto::PasswordHasher;
use crate::error::{Error, Result};
use crate::metadata::{check_access, MetadataStore, StoredFile};
use crate::quota::QuotaLedger;
use crate::storage::ObjectStore;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Reason recorded when none is given
pub const DEFAULT_REVOKE_REASON: &str = "Revoked by owner";

/// Result of an expiry sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub errors: usize,
    pub reclaimed_bytes: u64,
}

/// Exclusive right to destroy one file; released on drop
struct DeleteClaim<'a> {
    claims: &'a Mutex<HashSet<Uuid>>,
    file_id: Uuid,
}

impl Drop for DeleteClaim<'_> {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.file_id);
    }
}

/// Lifecycle transitions over stored files
pub struct Lifecycle {
    store: MetadataStore,
    objects: ObjectStore,
    quota: Arc<dyn QuotaLedger>,
    audit: Arc<dyn AuditSink>,
    hasher: Arc<dyn PasswordHasher>,
    min_password_len: usize,
    deleting: Mutex<HashSet<Uuid>>,
}

impl Lifecycle {
    pub fn new(
        store: MetadataStore,
        objects: ObjectStore,
        quota: Arc<dyn QuotaLedger>,
        audit: Arc<dyn AuditSink>,
        hasher: Arc<dyn PasswordHasher>,
        min_password_len: usize,
    ) -> Self {
        Lifecycle {
            store,
            objects,
            quota,
            audit,
            hasher,
            min_password_len,
            deleting: Mutex::new(HashSet::new()),
        }
    }

    /// Revoke access; also severs any share link
    pub fn revoke(&self, file_id: &Uuid, actor: &str, reason: Option<&str>) -> Result<StoredFile> {
        let now = Utc::now();
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REVOKE_REASON);

        let file = self.store.update(file_id, |f| {
            f.is_revoked = true;
            f.revoked_at = Some(now);
            f.revoked_by = Some(actor.to_string());
            f.revoke_reason = Some(reason.to_string());
            f.clear_share();
            Ok(())
        })?;

        info!(file_id = %file_id, actor, reason, "File revoked");
        self.audit.record(
            AuditEvent::new(actor, AuditAction::Revoke, Some(*file_id))
                .details(json!({ "reason": reason })),
        );
        Ok(file)
    }

    /// Lift a revocation
    ///
    /// A quarantined file may only be restored by an admin, and its
    /// ciphertext stays in quarantine storage.
    pub async fn restore(&self, file_id: &Uuid, actor: &str, is_admin: bool) -> Result<StoredFile> {
        let current = self.store.require(file_id)?;
        if !current.is_revoked {
            return Err(Error::NotRevoked);
        }
        if current.is_quarantined() && !is_admin {
            return Err(Error::PermissionDenied(
                "only an administrator can restore a quarantined file".to_string(),
            ));
        }
        if !self.objects.exists(&current.ciphertext_path).await {
            return Err(Error::MissingOnDisk(current.ciphertext_path));
        }

        let file = self.store.update(file_id, |f| {
            if !f.is_revoked {
                return Err(Error::NotRevoked);
            }
            f.is_revoked = false;
            f.revoked_at = None;
            f.revoked_by = None;
            f.revoke_reason = None;
            Ok(())
        })?;

        info!(file_id = %file_id, actor, quarantined = file.is_quarantined(), "File restored");
        self.audit.record(
            AuditEvent::new(actor, AuditAction::Restore, Some(*file_id))
                .details(json!({ "quarantined": file.is_quarantined() })),
        );
        Ok(file)
    }

    /// Expire `value` units from now; a non-positive value clears expiration
    pub fn set_expiration(
        &self,
        file_id: &Uuid,
        value: i64,
        unit: ExpiryUnit,
        actor: &str,
    ) -> Result<StoredFile> {
        let expires_at = expiration_from(Utc::now(), value, unit)?;
        let file = self.store.update(file_id, |f| {
            f.expires_at = expires_at;
            Ok(())
        })?;

        info!(file_id = %file_id, expires_at = ?expires_at, "Expiration set");
        self.audit.record(
            AuditEvent::new(actor, AuditAction::SetExpiration, Some(*file_id))
                .details(json!({ "expires_at": expires_at, "value": value, "unit": unit.to_string() })),
        );
        Ok(file)
    }

    async fn hash_password(&self, password: &str) -> Result<String> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password)).await?
    }

    async fn verify_password(&self, password: &str, hash: &str) -> Result<bool> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash)).await?
    }

    /// Lock a file behind a password; locking again replaces the password
    pub async fn lock(&self, file_id: &Uuid, password: &str, actor: &str) -> Result<StoredFile> {
        if password.chars().count() < self.min_password_len {
            return Err(Error::PasswordTooShort {
                min: self.min_password_len,
            });
        }
        self.store.require(file_id)?;

        let hash = self.hash_password(password).await?;
        let now = Utc::now();
        let file = self.store.update(file_id, |f| {
            f.is_locked = true;
            f.lock_password_hash = Some(hash.clone());
            f.locked_at = Some(now);
            Ok(())
        })?;

        info!(file_id = %file_id, actor, "File locked");
        self.audit
            .record(AuditEvent::new(actor, AuditAction::Lock, Some(*file_id)));
        Ok(file)
    }

    /// Remove a lock after checking its password
    pub async fn unlock(&self, file_id: &Uuid, password: &str, actor: &str) -> Result<StoredFile> {
        let current = self.store.require(file_id)?;
        let hash = match (current.is_locked, current.lock_password_hash) {
            (true, Some(hash)) => hash,
            _ => return Err(Error::NotLocked),
        };

        if !self.verify_password(password, &hash).await? {
            warn!(file_id = %file_id, actor, "Unlock with wrong password");
            self.audit.record(
                AuditEvent::new(actor, AuditAction::Unlock, Some(*file_id))
                    .outcome(AuditOutcome::Blocked),
            );
            return Err(Error::InvalidPassword);
        }

        let file = self.store.update(file_id, |f| {
            if !f.is_locked {
                return Err(Error::NotLocked);
            }
            // Relocked with another password since we checked.
            if f.lock_password_hash.as_deref() != Some(hash.as_str()) {
                return Err(Error::InvalidPassword);
            }
            f.is_locked = false;
            f.lock_password_hash = None;
            f.locked_at = None;
            Ok(())
        })?;

        info!(file_id = %file_id, actor, "File unlocked");
        self.audit
            .record(AuditEvent::new(actor, AuditAction::Unlock, Some(*file_id)));
        Ok(file)
    }

    /// Check a password against a file's lock
    pub async fn verify_lock(&self, file_id: &Uuid, password: &str) -> Result<bool> {
        let file = self.store.require(file_id)?;
        match (file.is_locked, file.lock_password_hash) {
            (true, Some(hash)) => self.verify_password(password, &hash).await,
            _ => Err(Error::NotLocked),
        }
    }

    /// The lock gate: passes unlocked files, and locked ones with the right password
    pub async fn check_lock(&self, file: &StoredFile, password: Option<&str>) -> Result<()> {
        if !file.is_locked {
            return Ok(());
        }
        let hash = file.lock_password_hash.as_deref().ok_or(Error::Locked)?;
        match password {
            None => Err(Error::Locked),
            Some(password) => {
                if self.verify_password(password, hash).await? {
                    Ok(())
                } else {
                    Err(Error::InvalidPassword)
                }
            }
        }
    }

    /// Set or clear the download limit; `None` or zero clears it
    pub fn set_download_limit(
        &self,
        file_id: &Uuid,
        max: Option<u64>,
        actor: &str,
    ) -> Result<StoredFile> {
        let max = max.filter(|m| *m > 0);
        let file = self.store.update(file_id, |f| {
            f.max_downloads = max;
            Ok(())
        })?;

        info!(file_id = %file_id, max_downloads = ?max, "Download limit set");
        self.audit.record(
            AuditEvent::new(actor, AuditAction::SetDownloadLimit, Some(*file_id))
                .details(json!({ "max_downloads": max, "download_count": file.download_count })),
        );
        Ok(file)
    }

    /// Reserve one download slot
    ///
    /// Access is re-checked inside the same atomic update that bumps the
    /// counter, so a revoke or an exhausted quota always wins the race.
    pub fn record_download(&self, file_id: &Uuid, now: DateTime<Utc>) -> Result<StoredFile> {
        self.store.update(file_id, |f| {
            check_access(f, now)?;
            f.download_count += 1;
            Ok(())
        })
    }

    /// Delete a file: ciphertext, then quota, then metadata
    ///
    /// A delete that loses a race with another delete or the expiry sweep
    /// fails with [`Error::FileNotFound`] and releases nothing.
    pub async fn delete(&self, file_id: &Uuid, actor: &str) -> Result<StoredFile> {
        let file = self
            .destroy(file_id, true, |_| true)
            .await?
            .ok_or(Error::FileNotFound(*file_id))?;

        info!(file_id = %file_id, actor, "File deleted");
        self.audit.record(
            AuditEvent::new(actor, AuditAction::Delete, Some(*file_id))
                .details(json!({ "bytes": file.plaintext_size })),
        );
        Ok(file)
    }

    fn claim(&self, file_id: &Uuid) -> Result<DeleteClaim<'_>> {
        if !self.deleting.lock().insert(*file_id) {
            return Err(Error::FileNotFound(*file_id));
        }
        Ok(DeleteClaim {
            claims: &self.deleting,
            file_id: *file_id,
        })
    }

    /// Destroy the current record if `wanted` still holds for it
    ///
    /// Only the holder of the delete claim reads the record and releases
    /// its quota, so each file is released exactly once.
    async fn destroy(
        &self,
        file_id: &Uuid,
        remove_ciphertext: bool,
        wanted: impl Fn(&StoredFile) -> bool,
    ) -> Result<Option<StoredFile>> {
        let _claim = self.claim(file_id)?;
        let file = self.store.require(file_id)?;
        if !wanted(&file) {
            return Ok(None);
        }

        if remove_ciphertext && !self.objects.remove(&file.ciphertext_path).await? {
            warn!(file_id = %file.id, path = %file.ciphertext_path.display(), "Ciphertext already gone");
        }
        self.quota
            .increment_usage(&file.owner_id, -(file.plaintext_size as i64))
            .await?;
        self.store.remove(&file.id)?;
        Ok(Some(file))
    }

    /// Delete every non-revoked file whose expiration has passed
    pub async fn cleanup_expired(&self, delete_from_disk: bool, actor: &str) -> Result<SweepReport> {
        let now = Utc::now();
        let is_swept = |f: &StoredFile| !f.is_revoked && matches!(f.expires_at, Some(at) if at < now);
        let expired = self.store.list_where(is_swept)?;

        let mut report = SweepReport::default();
        for candidate in expired {
            match self.destroy(&candidate.id, delete_from_disk, is_swept).await {
                Ok(Some(file)) => {
                    report.deleted += 1;
                    report.reclaimed_bytes += file.plaintext_size;
                    self.audit.record(
                        AuditEvent::new(actor, AuditAction::ExpirySweep, Some(file.id))
                            .details(json!({ "expired_at": file.expires_at, "bytes": file.plaintext_size })),
                    );
                }
                // No longer expired, or deleted since the listing.
                Ok(None) | Err(Error::FileNotFound(_)) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(file_id = %candidate.id, error = %e, "Failed to remove expired file");
                    self.audit.record(
                        AuditEvent::new(actor, AuditAction::ExpirySweep, Some(candidate.id))
                            .outcome(AuditOutcome::Failure)
                            .details(json!({ "error": e.to_string() })),
                    );
                }
            }
        }

        info!(
            deleted = report.deleted,
            errors = report.errors,
            reclaimed_bytes = report.reclaimed_bytes,
            "Expiry sweep complete"
        );
        Ok(report)
    }

    /// Non-revoked files that expire within `within`, soonest first
    pub fn expiring_soon(&self, within: Duration) -> Result<Vec<StoredFile>> {
        let now = Utc::now();
        let horizon = now + within;
        let mut files = self.store.list_where(|f| {
            !f.is_revoked && matches!(f.expires_at, Some(at) if at > now && at <= horizon)
        })?;
        files.sort_by_key(|f| f.expires_at);
        Ok(files)
    }
}
