//! External sharing
//!
//! A share link carries a random token. A third party holding the token asks
//! for access, the owner is notified with a six-digit code, and the code
//! unlocks exactly one download within its window.

use crate::audit::{AuditAction, AuditEvent, AuditOutcome, AuditSink};
use crate::error::{Error, Result};
use crate::metadata::{check_access, AccessGrant, MetadataStore, StoredFile};
use crate::notify::{AccessRequestNotice, OwnerNotifier};
use chrono::{DateTime, Duration, Utc};
use rand::{Rng, RngCore};
use ring::digest;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const TOKEN_BYTES: usize = 16;

/// A freshly created share link
#[derive(Debug, Clone, Serialize)]
pub struct ShareLink {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// What a token holder may see before verifying
#[derive(Debug, Clone, Serialize)]
pub struct SharedFileInfo {
    pub display_name: String,
    pub media_type: String,
    pub size: u64,
    pub expires_at: DateTime<Utc>,
}

/// Answer to an access request; the code itself goes only to the owner
#[derive(Debug, Clone, Serialize)]
pub struct AccessRequest {
    pub code_expires_at: DateTime<Utc>,
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999u32).to_string()
}

/// Compares SHA-256 digests so the fold always runs over equal lengths
fn codes_match(expected: &str, given: &str) -> bool {
    let expected = digest::digest(&digest::SHA256, expected.as_bytes());
    let given = digest::digest(&digest::SHA256, given.trim().as_bytes());
    expected
        .as_ref()
        .iter()
        .zip(given.as_ref())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Token must still belong to the record and be inside its window
fn check_token(file: &StoredFile, token: &str, now: DateTime<Utc>) -> Result<()> {
    let owned = file.share_token.as_deref() == Some(token);
    let live = matches!(file.share_expires_at, Some(at) if now < at);
    if owned && live {
        Ok(())
    } else {
        Err(Error::InvalidOrExpiredShareToken)
    }
}

fn check_code(file: &StoredFile, code: &str, now: DateTime<Utc>) -> Result<()> {
    match (&file.verification_code, file.verification_code_expires_at) {
        (Some(expected), Some(at)) if now < at && codes_match(expected, code) => Ok(()),
        _ => Err(Error::InvalidVerificationCode),
    }
}

/// Share links and verification codes
pub struct ShareController {
    store: MetadataStore,
    notifier: Arc<dyn OwnerNotifier>,
    audit: Arc<dyn AuditSink>,
    link_ttl: Duration,
    code_ttl: Duration,
}

impl ShareController {
    pub fn new(
        store: MetadataStore,
        notifier: Arc<dyn OwnerNotifier>,
        audit: Arc<dyn AuditSink>,
        link_ttl: Duration,
        code_ttl: Duration,
    ) -> Self {
        ShareController {
            store,
            notifier,
            audit,
            link_ttl,
            code_ttl,
        }
    }

    /// Issue a new share token, replacing any previous one
    pub fn create_share_link(&self, file_id: &Uuid, actor: &str) -> Result<ShareLink> {
        let now = Utc::now();
        let token = generate_token();
        let expires_at = now + self.link_ttl;

        self.store.update(file_id, |f| {
            if f.is_locked {
                return Err(Error::Locked);
            }
            check_access(f, now)?;
            f.share_token = Some(token.clone());
            f.share_expires_at = Some(expires_at);
            f.clear_verification_code();
            Ok(())
        })?;

        info!(file_id = %file_id, expires_at = %expires_at, "Share link created");
        self.audit.record(
            AuditEvent::new(actor, AuditAction::ShareLinkCreated, Some(*file_id))
                .details(json!({ "expires_at": expires_at })),
        );
        Ok(ShareLink { token, expires_at })
    }

    fn resolve(&self, token: &str, now: DateTime<Utc>) -> Result<StoredFile> {
        let file = self
            .store
            .find_by_share_token(token)?
            .ok_or(Error::InvalidOrExpiredShareToken)?;
        check_token(&file, token, now)?;
        Ok(file)
    }

    /// Public details of a shared file
    pub fn share_info(&self, token: &str) -> Result<SharedFileInfo> {
        let file = self.resolve(token, Utc::now())?;
        let expires_at = file
            .share_expires_at
            .ok_or(Error::InvalidOrExpiredShareToken)?;
        Ok(SharedFileInfo {
            display_name: file.display_name,
            media_type: file.media_type,
            size: file.plaintext_size,
            expires_at,
        })
    }

    /// Issue a verification code and notify the owner
    pub async fn request_access(&self, token: &str, requester_ip: &str) -> Result<AccessRequest> {
        let now = Utc::now();
        let file = self.resolve(token, now)?;
        let code = generate_code();
        let code_expires_at = now + self.code_ttl;

        self.store.update(&file.id, |f| {
            check_token(f, token, now)?;
            f.verification_code = Some(code.clone());
            f.verification_code_expires_at = Some(code_expires_at);
            Ok(())
        })?;

        let notice = AccessRequestNotice {
            owner_id: file.owner_id.clone(),
            file_id: file.id,
            display_name: file.display_name.clone(),
            requester_ip: requester_ip.to_string(),
            verification_code: code.clone(),
            code_expires_at,
        };
        if let Err(e) = self.notifier.notify_access_request(&notice).await {
            warn!(file_id = %file.id, error = %e, "Failed to notify owner");
            // An undelivered code must not stay redeemable.
            self.store.update(&file.id, |f| {
                if f.verification_code.as_deref() == Some(code.as_str()) {
                    f.clear_verification_code();
                }
                Ok(())
            })?;
            self.audit.record(
                AuditEvent::new(requester_ip, AuditAction::AccessRequested, Some(file.id))
                    .outcome(AuditOutcome::Failure)
                    .details(json!({ "reason": e.to_string() })),
            );
            return Err(e);
        }

        self.audit.record(
            AuditEvent::new(requester_ip, AuditAction::AccessRequested, Some(file.id))
                .details(json!({ "code_expires_at": code_expires_at })),
        );
        Ok(AccessRequest { code_expires_at })
    }

    /// Accept a verification code and record the grant
    pub fn verify_access(&self, token: &str, code: &str, requester_ip: &str) -> Result<AccessGrant> {
        let now = Utc::now();
        let file = self.resolve(token, now)?;
        let grant = AccessGrant {
            ip_address: requester_ip.to_string(),
            granted_at: now,
        };

        let result = self.store.update(&file.id, |f| {
            check_token(f, token, now)?;
            check_code(f, code, now)?;
            f.granted_access.push(grant.clone());
            Ok(())
        });

        match result {
            Ok(_) => {
                info!(file_id = %file.id, requester_ip, "Share access granted");
                self.audit.record(
                    AuditEvent::new(requester_ip, AuditAction::AccessGranted, Some(file.id)),
                );
                Ok(grant)
            }
            Err(e) => {
                self.audit.record(
                    AuditEvent::new(requester_ip, AuditAction::AccessGranted, Some(file.id))
                        .outcome(AuditOutcome::Blocked)
                        .details(json!({ "reason": e.to_string() })),
                );
                Err(e)
            }
        }
    }

    /// Check everything a shared download needs, without consuming the code
    pub fn authorize_download(&self, token: &str, code: &str, now: DateTime<Utc>) -> Result<StoredFile> {
        let file = self.resolve(token, now)?;
        check_code(&file, code, now)?;
        check_access(&file, now)?;
        if file.is_locked {
            return Err(Error::Locked);
        }
        Ok(file)
    }

    /// Re-check and consume the code as the bytes are released
    ///
    /// The code is cleared in the same atomic update, so two downloads with
    /// one code cannot both pass.
    pub fn consume_code(
        &self,
        file_id: &Uuid,
        token: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<StoredFile> {
        self.store.update(file_id, |f| {
            check_token(f, token, now)?;
            check_code(f, code, now)?;
            check_access(f, now)?;
            if f.is_locked {
                return Err(Error::Locked);
            }
            f.clear_verification_code();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::metadata::sample;
    use crate::notify::MemoryNotifier;

    fn controller() -> (MetadataStore, ShareController) {
        let (store, controller, _) = controller_with_notifier();
        (store, controller)
    }

    fn controller_with_notifier() -> (MetadataStore, ShareController, Arc<MemoryNotifier>) {
        let store = MetadataStore::temporary().unwrap();
        let notifier = Arc::new(MemoryNotifier::new());
        let controller = ShareController::new(
            store.clone(),
            notifier.clone(),
            Arc::new(MemoryAuditSink::new()),
            Duration::days(7),
            Duration::minutes(30),
        );
        (store, controller, notifier)
    }

    #[test]
    fn test_token_and_code_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        for _ in 0..100 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.parse::<u32>().unwrap() >= 100_000);
        }
    }

    #[test]
    fn test_locked_file_cannot_be_shared() {
        let (store, shares) = controller();
        let mut file = sample("alice");
        file.is_locked = true;
        store.insert(&file).unwrap();

        assert!(matches!(
            shares.create_share_link(&file.id, "alice"),
            Err(Error::Locked)
        ));
        assert!(store.require(&file.id).unwrap().share_token.is_none());
    }

    #[test]
    fn test_new_link_replaces_old() {
        let (store, shares) = controller();
        let file = sample("alice");
        store.insert(&file).unwrap();

        let first = shares.create_share_link(&file.id, "alice").unwrap();
        let second = shares.create_share_link(&file.id, "alice").unwrap();
        assert!(matches!(
            shares.share_info(&first.token),
            Err(Error::InvalidOrExpiredShareToken)
        ));
        assert_eq!(shares.share_info(&second.token).unwrap().size, file.plaintext_size);
    }

    #[test]
    fn test_codes_match() {
        assert!(codes_match("123456", "123456"));
        assert!(codes_match("123456", " 123456\n"));
        assert!(!codes_match("123456", "123457"));
        assert!(!codes_match("123456", "12345"));
        assert!(!codes_match("123456", ""));
    }

    #[tokio::test]
    async fn test_request_and_verify() {
        let (store, shares, notifier) = controller_with_notifier();
        let file = sample("alice");
        store.insert(&file).unwrap();
        let link = shares.create_share_link(&file.id, "alice").unwrap();

        shares.request_access(&link.token, "10.1.1.1").await.unwrap();
        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].owner_id, "alice");
        assert_eq!(notices[0].requester_ip, "10.1.1.1");
        let code = notifier.last_code_for(&file.id).unwrap();

        assert!(matches!(
            shares.verify_access(&link.token, "000000", "10.1.1.1"),
            Err(Error::InvalidVerificationCode)
        ));

        let grant = shares
            .verify_access(&link.token, &code, "10.1.1.1")
            .unwrap();
        assert_eq!(grant.ip_address, "10.1.1.1");
        assert_eq!(store.require(&file.id).unwrap().granted_access.len(), 1);
    }

    #[tokio::test]
    async fn test_code_is_single_use_and_time_bound() {
        let (store, shares, notifier) = controller_with_notifier();
        let file = sample("alice");
        store.insert(&file).unwrap();
        let link = shares.create_share_link(&file.id, "alice").unwrap();
        let request = shares.request_access(&link.token, "10.1.1.1").await.unwrap();
        let code = notifier.last_code_for(&file.id).unwrap();

        let late = request.code_expires_at + Duration::seconds(1);
        assert!(matches!(
            shares.authorize_download(&link.token, &code, late),
            Err(Error::InvalidVerificationCode)
        ));

        let now = Utc::now();
        shares.authorize_download(&link.token, &code, now).unwrap();
        shares.consume_code(&file.id, &link.token, &code, now).unwrap();
        assert!(matches!(
            shares.consume_code(&file.id, &link.token, &code, now),
            Err(Error::InvalidVerificationCode)
        ));
    }

    #[tokio::test]
    async fn test_request_fails_when_owner_unreachable() {
        let (store, shares, notifier) = controller_with_notifier();
        let file = sample("alice");
        store.insert(&file).unwrap();
        let link = shares.create_share_link(&file.id, "alice").unwrap();
        notifier.set_failing(true);

        assert!(matches!(
            shares.request_access(&link.token, "10.1.1.1").await,
            Err(Error::NotificationFailed(_))
        ));
        let stored = store.require(&file.id).unwrap();
        assert!(stored.verification_code.is_none());
        assert!(stored.verification_code_expires_at.is_none());
    }

    #[test]
    fn test_expired_link_rejected() {
        let (store, shares) = controller();
        let file = sample("alice");
        store.insert(&file).unwrap();
        let link = shares.create_share_link(&file.id, "alice").unwrap();

        store
            .update(&file.id, |f| {
                f.share_expires_at = Some(Utc::now() - Duration::seconds(1));
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            shares.share_info(&link.token),
            Err(Error::InvalidOrExpiredShareToken)
        ));
    }
}
