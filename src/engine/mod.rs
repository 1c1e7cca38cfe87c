//! The secure file lifecycle engine
//!
//! [`Engine`] is the public entry point. It authorizes the caller, then
//! drives the vault, scan gateway, integrity verifier, lifecycle state
//! machine and share controller for each operation.

mod download;

pub use download::{Download, DownloadOptions};

use crate::audit::{AuditAction, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use crate::config::Config;
use crate::crypto::{Argon2PasswordHasher, KeyManager, MasterKey, PasswordHasher};
use crate::error::{Error, Result};
use crate::integrity::{IntegrityReport, IntegrityVerifier, SystemIntegrityReport};
use crate::lifecycle::{ExpiryUnit, Lifecycle, SweepReport};
use crate::metadata::{AccessGrant, MetadataStore, StoredFile};
use crate::notify::{LogNotifier, OwnerNotifier};
use crate::quota::{QuotaLedger, SledQuotaLedger};
use crate::scan::{self, QuarantineOutcome, ScanBatchReport, ScanGateway, ScanOutcome, ScanSummary, Scanner};
use crate::share::{AccessRequest, ShareController, ShareLink, SharedFileInfo};
use crate::storage::ObjectStore;
use crate::vault::Vault;
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Role of the calling user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

/// Authenticated identity of whoever is calling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

impl Caller {
    pub fn user(user_id: impl Into<String>) -> Self {
        Caller {
            user_id: user_id.into(),
            role: Role::User,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Caller {
            user_id: user_id.into(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owners manage their own files; admins manage everything
    pub fn can_manage(&self, file: &StoredFile) -> bool {
        self.is_admin() || file.owner_id == self.user_id
    }
}

/// Client-supplied description of an upload
#[derive(Debug, Clone)]
pub struct UploadMeta {
    pub display_name: String,
    pub media_type: String,
}

impl UploadMeta {
    pub fn new(display_name: impl Into<String>, media_type: impl Into<String>) -> Self {
        UploadMeta {
            display_name: display_name.into(),
            media_type: media_type.into(),
        }
    }
}

/// Storage usage of one user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub used: u64,
    pub limit: u64,
}

/// Builds an [`Engine`], with optional replacements for its collaborators
pub struct EngineBuilder {
    config: Config,
    master: MasterKey,
    store: Option<MetadataStore>,
    scanner: Option<Arc<dyn Scanner>>,
    audit: Option<Arc<dyn AuditSink>>,
    quota: Option<Arc<dyn QuotaLedger>>,
    notifier: Option<Arc<dyn OwnerNotifier>>,
    hasher: Option<Arc<dyn PasswordHasher>>,
}

impl EngineBuilder {
    pub fn store(mut self, store: MetadataStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn quota(mut self, quota: Arc<dyn QuotaLedger>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn OwnerNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn password_hasher(mut self, hasher: Arc<dyn PasswordHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Validate the configuration, prepare directories and wire everything up
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let objects = ObjectStore::new(&config);
        objects.ensure_dirs()?;

        let store = match self.store {
            Some(store) => store,
            None => MetadataStore::open(&config.metadata_path())?,
        };
        let quota = match self.quota {
            Some(quota) => quota,
            None => Arc::new(SledQuotaLedger::new(
                store.usage_tree()?,
                config.storage.default_storage_limit,
            )),
        };
        let hasher = match self.hasher {
            Some(hasher) => hasher,
            None => Arc::new(Argon2PasswordHasher::from_config(&config.lifecycle)?),
        };
        let scanner = self
            .scanner
            .unwrap_or_else(|| scan::from_config(&config.scanner));
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        let vault = Arc::new(Vault::new(
            Arc::new(KeyManager::new(self.master)),
            objects.clone(),
            config.encryption.chunk_size,
            config.encryption.algorithm,
        ));
        let integrity = IntegrityVerifier::new(
            store.clone(),
            audit.clone(),
            config.lifecycle.integrity_concurrency,
        );
        let scan = ScanGateway::new(
            scanner,
            std::time::Duration::from_secs(config.scanner.availability_ttl_secs),
            std::time::Duration::from_secs(config.scanner.timeout_secs),
            config.scanner.scan_on_download,
            store.clone(),
            vault.clone(),
            audit.clone(),
        );
        let lifecycle = Lifecycle::new(
            store.clone(),
            objects,
            quota.clone(),
            audit.clone(),
            hasher,
            config.lifecycle.min_lock_password_len,
        );
        let shares = ShareController::new(
            store.clone(),
            notifier,
            audit.clone(),
            Duration::days(config.share.link_ttl_days),
            Duration::minutes(config.share.code_ttl_minutes),
        );

        info!(data_dir = %config.data_dir.display(), files = store.len(), "Engine ready");
        Ok(Engine {
            config,
            store,
            vault,
            integrity,
            scan,
            lifecycle,
            shares,
            quota,
            audit,
        })
    }
}

/// Secure file lifecycle engine
pub struct Engine {
    config: Config,
    store: MetadataStore,
    vault: Arc<Vault>,
    integrity: IntegrityVerifier,
    scan: ScanGateway,
    lifecycle: Lifecycle,
    shares: ShareController,
    quota: Arc<dyn QuotaLedger>,
    audit: Arc<dyn AuditSink>,
}

impl Engine {
    /// Start building an engine around a master key
    pub fn builder(config: Config, master: MasterKey) -> EngineBuilder {
        EngineBuilder {
            config,
            master,
            store: None,
            scanner: None,
            audit: None,
            quota: None,
            notifier: None,
            hasher: None,
        }
    }

    /// Derive the master key from a passphrase and build with defaults
    ///
    /// The configuration must already carry the key salt written at init.
    pub async fn open(config: Config, passphrase: &str) -> Result<Self> {
        if config.encryption.salt.is_empty() {
            return Err(Error::Config(
                "no key salt configured; initialize the store first".to_string(),
            ));
        }
        let encryption = config.encryption.clone();
        let passphrase = passphrase.as_bytes().to_vec();
        let master = tokio::task::spawn_blocking(move || {
            MasterKey::from_password(&passphrase, &encryption)
        })
        .await??;
        Self::builder(config, master).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn blocked(&self, actor: &str, action: AuditAction, file_id: Option<Uuid>, err: &Error) {
        self.audit.record(
            AuditEvent::new(actor, action, file_id)
                .outcome(AuditOutcome::Blocked)
                .details(json!({ "reason": err.to_string() })),
        );
    }

    /// Give back bytes reserved for an upload that did not complete
    async fn release_reservation(&self, actor: &str, bytes: u64) {
        if let Err(e) = self.quota.increment_usage(actor, -(bytes as i64)).await {
            error!(user_id = actor, bytes, error = %e, "Failed to release reserved storage");
        }
    }

    /// Load a file the caller may manage
    fn authorize(&self, caller: &Caller, file_id: &Uuid) -> Result<StoredFile> {
        let file = self.store.require(file_id)?;
        if !caller.can_manage(&file) {
            warn!(file_id = %file_id, user_id = %caller.user_id, "Access to another user's file denied");
            return Err(Error::PermissionDenied(format!(
                "{} does not own {}",
                caller.user_id, file_id
            )));
        }
        Ok(file)
    }

    fn require_admin(&self, caller: &Caller) -> Result<()> {
        if caller.is_admin() {
            Ok(())
        } else {
            Err(Error::PermissionDenied(
                "administrator role required".to_string(),
            ))
        }
    }

    /// Store a new file
    ///
    /// The plaintext is staged, reserved against the quota, scanned, encrypted
    /// and hashed before any metadata is written. A rejected upload leaves
    /// nothing behind and gives its reservation back.
    pub async fn upload<R>(&self, caller: &Caller, reader: R, meta: UploadMeta) -> Result<StoredFile>
    where
        R: AsyncRead + Unpin,
    {
        let actor = caller.user_id.as_str();
        let staged = self
            .vault
            .objects()
            .stage_upload(reader, self.config.storage.max_upload_size)
            .await?;

        let size = staged.len;
        if let Err(e) = self.quota.reserve(actor, size).await {
            self.blocked(actor, AuditAction::Upload, None, &e);
            return Err(e);
        }

        let scan = match self.scan.gate_upload(&staged.path).await {
            Ok(scan) => scan,
            Err(e) => {
                warn!(user_id = actor, file = %meta.display_name, error = %e, "Upload rejected by scan");
                self.release_reservation(actor, size).await;
                self.blocked(actor, AuditAction::Upload, None, &e);
                return Err(e);
            }
        };

        let id = Uuid::new_v4();
        let sealed = match self.vault.seal(id, &staged.path).await {
            Ok(sealed) => sealed,
            Err(e) => {
                self.release_reservation(actor, size).await;
                self.audit.record(
                    AuditEvent::new(actor, AuditAction::Upload, Some(id))
                        .outcome(AuditOutcome::Failure)
                        .details(json!({ "reason": e.to_string() })),
                );
                return Err(e);
            }
        };
        drop(staged);

        let mut file = StoredFile::new(
            id,
            actor,
            meta.display_name,
            meta.media_type,
            size,
            sealed.path.clone(),
            sealed.encryption.algorithm,
            sealed.encryption.iv,
            sealed.encryption.auth_tag,
            sealed.chunk_size,
            sealed.content_hash,
            Utc::now(),
        );
        file.scan_status = scan.status;
        file.scan_result = scan.result;
        file.scan_at = scan.scanned_at;

        if let Err(e) = self.store.insert(&file) {
            let _ = self.vault.objects().remove(&sealed.path).await;
            self.release_reservation(actor, size).await;
            return Err(e);
        }

        info!(
            file_id = %id,
            owner = actor,
            bytes = size,
            algorithm = %file.encryption_algorithm,
            scan_status = %file.scan_status,
            "File uploaded"
        );
        self.audit.record(
            AuditEvent::new(actor, AuditAction::Upload, Some(id)).details(json!({
                "bytes": size,
                "algorithm": file.encryption_algorithm,
                "scan_status": file.scan_status,
            })),
        );
        Ok(file)
    }

    /// Metadata of one file
    pub fn get(&self, caller: &Caller, file_id: &Uuid) -> Result<StoredFile> {
        self.authorize(caller, file_id)
    }

    /// Files owned by the caller, newest first
    pub fn list_owned(&self, caller: &Caller) -> Result<Vec<StoredFile>> {
        self.store.list_owned(&caller.user_id)
    }

    pub async fn delete(&self, caller: &Caller, file_id: &Uuid) -> Result<StoredFile> {
        self.authorize(caller, file_id)?;
        self.lifecycle.delete(file_id, &caller.user_id).await
    }

    pub fn set_expiration(
        &self,
        caller: &Caller,
        file_id: &Uuid,
        value: i64,
        unit: ExpiryUnit,
    ) -> Result<StoredFile> {
        self.authorize(caller, file_id)?;
        self.lifecycle
            .set_expiration(file_id, value, unit, &caller.user_id)
    }

    pub fn revoke(&self, caller: &Caller, file_id: &Uuid, reason: Option<&str>) -> Result<StoredFile> {
        self.authorize(caller, file_id)?;
        self.lifecycle.revoke(file_id, &caller.user_id, reason)
    }

    pub async fn restore(&self, caller: &Caller, file_id: &Uuid) -> Result<StoredFile> {
        self.authorize(caller, file_id)?;
        self.lifecycle
            .restore(file_id, &caller.user_id, caller.is_admin())
            .await
    }

    pub async fn lock(&self, caller: &Caller, file_id: &Uuid, password: &str) -> Result<StoredFile> {
        self.authorize(caller, file_id)?;
        self.lifecycle.lock(file_id, password, &caller.user_id).await
    }

    pub async fn unlock(&self, caller: &Caller, file_id: &Uuid, password: &str) -> Result<StoredFile> {
        self.authorize(caller, file_id)?;
        self.lifecycle
            .unlock(file_id, password, &caller.user_id)
            .await
    }

    pub async fn verify_lock(&self, caller: &Caller, file_id: &Uuid, password: &str) -> Result<bool> {
        self.authorize(caller, file_id)?;
        self.lifecycle.verify_lock(file_id, password).await
    }

    pub fn set_download_limit(
        &self,
        caller: &Caller,
        file_id: &Uuid,
        max: Option<u64>,
    ) -> Result<StoredFile> {
        self.authorize(caller, file_id)?;
        self.lifecycle
            .set_download_limit(file_id, max, &caller.user_id)
    }

    pub fn create_share_link(&self, caller: &Caller, file_id: &Uuid) -> Result<ShareLink> {
        self.authorize(caller, file_id)?;
        self.shares.create_share_link(file_id, &caller.user_id)
    }

    pub fn share_info(&self, token: &str) -> Result<SharedFileInfo> {
        self.shares.share_info(token)
    }

    pub async fn request_access(&self, token: &str, requester_ip: &str) -> Result<AccessRequest> {
        self.shares.request_access(token, requester_ip).await
    }

    pub fn verify_access(&self, token: &str, code: &str, requester_ip: &str) -> Result<AccessGrant> {
        self.shares.verify_access(token, code, requester_ip)
    }

    pub async fn verify_integrity(&self, caller: &Caller, file_id: &Uuid) -> Result<IntegrityReport> {
        self.authorize(caller, file_id)?;
        self.integrity.verify(file_id, &caller.user_id).await
    }

    /// Verify every non-revoked file of one owner
    pub async fn verify_owner_files(
        &self,
        caller: &Caller,
        owner_id: &str,
    ) -> Result<SystemIntegrityReport> {
        if owner_id != caller.user_id {
            self.require_admin(caller)?;
        }
        self.integrity.verify_owner(owner_id, &caller.user_id).await
    }

    pub async fn run_system_integrity_check(&self, caller: &Caller) -> Result<SystemIntegrityReport> {
        self.require_admin(caller)?;
        self.integrity.verify_all(&caller.user_id).await
    }

    pub async fn scan_and_update(&self, caller: &Caller, file_id: &Uuid) -> Result<ScanOutcome> {
        self.authorize(caller, file_id)?;
        self.scan.scan_and_update(file_id, &caller.user_id).await
    }

    pub async fn scan_pending(&self, caller: &Caller) -> Result<ScanBatchReport> {
        self.require_admin(caller)?;
        self.scan.scan_pending(&caller.user_id).await
    }

    pub async fn scan_status(&self, caller: &Caller, file_id: &Uuid) -> Result<ScanSummary> {
        self.authorize(caller, file_id)?;
        self.scan.scan_status(file_id).await
    }

    pub async fn quarantine(&self, caller: &Caller, file_id: &Uuid) -> Result<QuarantineOutcome> {
        self.require_admin(caller)?;
        self.scan.quarantine(file_id, &caller.user_id).await
    }

    pub async fn cleanup_expired(&self, caller: &Caller, delete_from_disk: bool) -> Result<SweepReport> {
        self.require_admin(caller)?;
        self.lifecycle
            .cleanup_expired(delete_from_disk, &caller.user_id)
            .await
    }

    /// Files expiring within `within`; admins see everyone's
    pub fn expiring_soon(&self, caller: &Caller, within: Duration) -> Result<Vec<StoredFile>> {
        let mut files = self.lifecycle.expiring_soon(within)?;
        if !caller.is_admin() {
            files.retain(|f| f.owner_id == caller.user_id);
        }
        Ok(files)
    }

    pub async fn usage(&self, caller: &Caller) -> Result<Usage> {
        Ok(Usage {
            used: self.quota.usage(&caller.user_id).await?,
            limit: self.quota.limit(&caller.user_id),
        })
    }

    /// Flush metadata to disk
    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }
}
