//! Stored file record
//!
//! One [`StoredFile`] exists per uploaded object. The record is the only
//! shared mutable state in the engine; every change goes through
//! [`MetadataStore::update`](super::MetadataStore::update).

use crate::crypto::Algorithm;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Digest algorithm recorded for every file
pub const HASH_ALGORITHM: &str = "sha256";

/// Malware scan state of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// Never scanned, or the scanner was unavailable
    Pending,
    /// A scan is in progress
    Scanning,
    /// Last scan found nothing
    Clean,
    /// Last conclusive scan found a threat
    Infected,
    /// Last scan failed
    Error,
}

impl ScanStatus {
    /// Status after a scan that failed to produce a verdict
    ///
    /// A detection is sticky: a failed rescan never clears it.
    pub fn after_error(self) -> ScanStatus {
        match self {
            ScanStatus::Infected => ScanStatus::Infected,
            _ => ScanStatus::Error,
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Clean => "clean",
            ScanStatus::Infected => "infected",
            ScanStatus::Error => "error",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One external access grant on a shared file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    /// Address the grant was issued to
    pub ip_address: String,
    /// When the verification code was accepted
    pub granted_at: DateTime<Utc>,
}

/// Metadata for one stored, encrypted file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: Uuid,
    pub owner_id: String,
    pub display_name: String,
    pub media_type: String,
    pub plaintext_size: u64,
    pub uploaded_at: DateTime<Utc>,

    // Encryption
    pub ciphertext_path: PathBuf,
    pub encryption_algorithm: Algorithm,
    pub iv: Vec<u8>,
    /// Tag of the final chunk (AEAD modes only)
    pub auth_tag: Option<Vec<u8>>,
    /// Chunk size the ciphertext was written with
    pub chunk_size: usize,

    // Integrity
    /// Hex SHA-256 of the ciphertext
    pub content_hash: String,
    pub hash_algorithm: String,
    pub integrity_verified: bool,
    pub last_integrity_check_at: Option<DateTime<Utc>>,

    // Scanning
    pub scan_status: ScanStatus,
    pub scan_result: Option<String>,
    pub scan_at: Option<DateTime<Utc>>,

    // Lifecycle
    pub expires_at: Option<DateTime<Utc>>,
    pub is_revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
    pub revoke_reason: Option<String>,
    pub quarantined_at: Option<DateTime<Utc>>,

    // Lock
    pub is_locked: bool,
    /// Argon2id PHC string
    pub lock_password_hash: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,

    // Quota
    pub download_count: u64,
    pub max_downloads: Option<u64>,

    // Sharing
    pub share_token: Option<String>,
    pub share_expires_at: Option<DateTime<Utc>>,
    pub verification_code: Option<String>,
    pub verification_code_expires_at: Option<DateTime<Utc>>,
    pub granted_access: Vec<AccessGrant>,
}

impl StoredFile {
    /// Create the record for a freshly encrypted upload
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        owner_id: impl Into<String>,
        display_name: impl Into<String>,
        media_type: impl Into<String>,
        plaintext_size: u64,
        ciphertext_path: PathBuf,
        encryption_algorithm: Algorithm,
        iv: Vec<u8>,
        auth_tag: Option<Vec<u8>>,
        chunk_size: usize,
        content_hash: String,
        now: DateTime<Utc>,
    ) -> Self {
        StoredFile {
            id,
            owner_id: owner_id.into(),
            display_name: display_name.into(),
            media_type: media_type.into(),
            plaintext_size,
            uploaded_at: now,
            ciphertext_path,
            encryption_algorithm,
            iv,
            auth_tag,
            chunk_size,
            content_hash,
            hash_algorithm: HASH_ALGORITHM.to_string(),
            integrity_verified: true,
            last_integrity_check_at: Some(now),
            scan_status: ScanStatus::Pending,
            scan_result: None,
            scan_at: None,
            expires_at: None,
            is_revoked: false,
            revoked_at: None,
            revoked_by: None,
            revoke_reason: None,
            quarantined_at: None,
            is_locked: false,
            lock_password_hash: None,
            locked_at: None,
            download_count: 0,
            max_downloads: None,
            share_token: None,
            share_expires_at: None,
            verification_code: None,
            verification_code_expires_at: None,
            granted_access: Vec::new(),
        }
    }

    /// Whether the ciphertext lives in quarantine storage
    pub fn is_quarantined(&self) -> bool {
        self.quarantined_at.is_some()
    }

    /// Whether `expires_at` has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }

    /// Downloads left before the quota is reached, if limited
    pub fn remaining_downloads(&self) -> Option<u64> {
        self.max_downloads
            .map(|max| max.saturating_sub(self.download_count))
    }

    /// Drop the share token and any pending verification code
    pub fn clear_share(&mut self) {
        self.share_token = None;
        self.share_expires_at = None;
        self.clear_verification_code();
    }

    /// Drop a pending verification code
    pub fn clear_verification_code(&mut self) {
        self.verification_code = None;
        self.verification_code_expires_at = None;
    }

    /// Serialize for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from storage
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Check whether a record may release bytes at `now`
///
/// Conditions are checked in a fixed order, so the error names the first
/// one that fails: revoked, expired, infected, download quota. The lock is
/// a separate gate and is not checked here.
pub fn check_access(file: &StoredFile, now: DateTime<Utc>) -> Result<()> {
    if file.is_revoked {
        return Err(Error::Revoked);
    }
    if file.is_expired(now) {
        return Err(Error::Expired);
    }
    if file.scan_status == ScanStatus::Infected {
        return Err(Error::ScanInfected(
            file.scan_result
                .clone()
                .unwrap_or_else(|| "previously detected threat".to_string()),
        ));
    }
    if let Some(max) = file.max_downloads {
        if file.download_count >= max {
            return Err(Error::DownloadLimitExceeded);
        }
    }
    Ok(())
}

/// Boolean form of [`check_access`]
pub fn is_accessible(file: &StoredFile, now: DateTime<Utc>) -> bool {
    check_access(file, now).is_ok()
}

#[cfg(test)]
pub(crate) fn sample(owner: &str) -> StoredFile {
    StoredFile::new(
        Uuid::new_v4(),
        owner,
        "report.pdf",
        "application/pdf",
        1234,
        PathBuf::from("/tmp/objects/ab/file.enc"),
        Algorithm::Aes256Gcm,
        vec![0u8; 12],
        Some(vec![0u8; 16]),
        crate::config::DEFAULT_CHUNK_SIZE,
        "00".repeat(32),
        Utc::now(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    #[test]
    fn test_new_record_is_accessible() {
        let file = sample("alice");
        assert!(is_accessible(&file, Utc::now()));
        assert_eq!(file.scan_status, ScanStatus::Pending);
        assert_eq!(file.hash_algorithm, HASH_ALGORITHM);
    }

    #[test]
    fn test_error_order() {
        let now = Utc::now();
        let mut file = sample("alice");
        file.is_revoked = true;
        file.expires_at = Some(now - Duration::seconds(1));
        file.scan_status = ScanStatus::Infected;
        file.max_downloads = Some(0);
        assert!(matches!(check_access(&file, now), Err(Error::Revoked)));

        file.is_revoked = false;
        assert!(matches!(check_access(&file, now), Err(Error::Expired)));

        file.expires_at = None;
        assert!(matches!(check_access(&file, now), Err(Error::ScanInfected(_))));

        file.scan_status = ScanStatus::Clean;
        assert!(matches!(
            check_access(&file, now),
            Err(Error::DownloadLimitExceeded)
        ));
    }

    #[test]
    fn test_lock_is_not_part_of_access() {
        let mut file = sample("alice");
        file.is_locked = true;
        assert!(is_accessible(&file, Utc::now()));
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let mut file = sample("alice");
        file.expires_at = Some(now);
        assert!(!is_accessible(&file, now));
        assert!(is_accessible(&file, now - Duration::milliseconds(1)));
    }

    #[test]
    fn test_error_status_keeps_detection() {
        assert_eq!(ScanStatus::Infected.after_error(), ScanStatus::Infected);
        assert_eq!(ScanStatus::Clean.after_error(), ScanStatus::Error);
        assert_eq!(ScanStatus::Pending.after_error(), ScanStatus::Error);
    }

    #[test]
    fn test_bytes_roundtrip_keeps_optionals() {
        let mut file = sample("alice");
        file.share_token = Some("ab".repeat(16));
        file.granted_access.push(AccessGrant {
            ip_address: "10.0.0.1".into(),
            granted_at: Utc::now(),
        });
        let decoded = StoredFile::from_bytes(&file.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, file);
    }

    fn status() -> impl Strategy<Value = ScanStatus> {
        prop_oneof![
            Just(ScanStatus::Pending),
            Just(ScanStatus::Scanning),
            Just(ScanStatus::Clean),
            Just(ScanStatus::Infected),
            Just(ScanStatus::Error),
        ]
    }

    proptest! {
        #[test]
        fn prop_accessible_matches_definition(
            revoked in any::<bool>(),
            expiry_offset in proptest::option::of(-100i64..100),
            scan in status(),
            count in 0u64..10,
            max in proptest::option::of(0u64..10),
            locked in any::<bool>(),
        ) {
            let now = Utc::now();
            let mut file = sample("owner");
            file.is_revoked = revoked;
            file.expires_at = expiry_offset.map(|s| now + Duration::seconds(s));
            file.scan_status = scan;
            file.download_count = count;
            file.max_downloads = max;
            file.is_locked = locked;

            let expected = !revoked
                && file.expires_at.map_or(true, |at| now < at)
                && scan != ScanStatus::Infected
                && max.map_or(true, |m| count < m);
            prop_assert_eq!(is_accessible(&file, now), expected);
        }
    }
}
