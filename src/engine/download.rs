//! Owner and shared downloads

use super::{Caller, Engine};
use crate::audit::{AuditAction, AuditEvent};
use crate::error::{Error, Result};
use crate::metadata::{check_access, StoredFile};
use crate::storage::DecryptedStream;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

/// Options for an owner download
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Lock password, required when the file is locked
    pub password: Option<String>,
    /// Skip the real-time scan (administrators only)
    pub skip_scan: bool,
}

/// Decrypted file ready to be streamed out
pub struct Download {
    /// Record as it stands after this download was counted
    pub file: StoredFile,
    pub stream: DecryptedStream,
    /// Set when the scan could not run and the bytes were released anyway
    pub advisory: Option<String>,
}

impl Engine {
    /// Download a file as its owner (or an administrator)
    ///
    /// Gates run in order: access, lock, integrity, decrypt, real-time scan.
    /// Every refusal is audited as a blocked download. The download slot is
    /// claimed only after every gate passed, with the access check repeated
    /// atomically.
    pub async fn download(
        &self,
        caller: &Caller,
        file_id: &Uuid,
        options: DownloadOptions,
    ) -> Result<Download> {
        let actor = caller.user_id.as_str();
        let file = self.authorize(caller, file_id)?;
        if options.skip_scan && !caller.is_admin() {
            return Err(Error::PermissionDenied(
                "only administrators may skip the download scan".to_string(),
            ));
        }

        let gated = async {
            check_access(&file, Utc::now())?;
            self.lifecycle
                .check_lock(&file, options.password.as_deref())
                .await?;
            if self.config.lifecycle.verify_integrity_on_download {
                self.integrity.gate_download(&file, actor).await?;
            }
            Ok::<_, Error>(())
        };
        if let Err(e) = gated.await {
            self.blocked(actor, AuditAction::Download, Some(*file_id), &e);
            return Err(e);
        }

        let stream = match self.vault.open(&file).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(file_id = %file_id, error = %e, "Could not decrypt file for download");
                self.blocked(actor, AuditAction::Download, Some(*file_id), &e);
                return Err(e);
            }
        };
        let scan = match self
            .scan
            .gate_download(&file, stream.path(), options.skip_scan, actor)
            .await
        {
            Ok(scan) => scan,
            Err(e) => {
                self.blocked(actor, AuditAction::Download, Some(*file_id), &e);
                return Err(e);
            }
        };

        let file = match self.lifecycle.record_download(file_id, Utc::now()) {
            Ok(file) => file,
            Err(e) => {
                self.blocked(actor, AuditAction::Download, Some(*file_id), &e);
                return Err(e);
            }
        };
        let advisory = scan.advisory().map(str::to_string);

        info!(
            file_id = %file_id,
            user_id = actor,
            download_count = file.download_count,
            "File downloaded"
        );
        self.audit.record(
            AuditEvent::new(actor, AuditAction::Download, Some(*file_id)).details(json!({
                "download_count": file.download_count,
                "max_downloads": file.max_downloads,
                "scan_skipped": options.skip_scan,
                "advisory": advisory,
            })),
        );
        Ok(Download {
            file,
            stream,
            advisory,
        })
    }

    /// Download through a share link with a verified code
    ///
    /// Does not count against the owner's download limit. The code is
    /// consumed when the bytes are released.
    pub async fn download_shared(
        &self,
        token: &str,
        code: &str,
        requester_ip: &str,
    ) -> Result<Download> {
        let file = match self.shares.authorize_download(token, code, Utc::now()) {
            Ok(file) => file,
            Err(e) => {
                self.blocked(requester_ip, AuditAction::SharedDownload, None, &e);
                return Err(e);
            }
        };

        if self.config.lifecycle.verify_integrity_on_download {
            if let Err(e) = self.integrity.gate_download(&file, requester_ip).await {
                self.blocked(requester_ip, AuditAction::SharedDownload, Some(file.id), &e);
                return Err(e);
            }
        }

        let stream = match self.vault.open(&file).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(file_id = %file.id, error = %e, "Could not decrypt shared file");
                self.blocked(requester_ip, AuditAction::SharedDownload, Some(file.id), &e);
                return Err(e);
            }
        };
        let scan = match self
            .scan
            .gate_download(&file, stream.path(), false, requester_ip)
            .await
        {
            Ok(scan) => scan,
            Err(e) => {
                self.blocked(requester_ip, AuditAction::SharedDownload, Some(file.id), &e);
                return Err(e);
            }
        };

        let file = match self.shares.consume_code(&file.id, token, code, Utc::now()) {
            Ok(file) => file,
            Err(e) => {
                self.blocked(requester_ip, AuditAction::SharedDownload, Some(file.id), &e);
                return Err(e);
            }
        };
        let advisory = scan.advisory().map(str::to_string);

        info!(file_id = %file.id, requester_ip, "Shared file downloaded");
        self.audit.record(
            AuditEvent::new(requester_ip, AuditAction::SharedDownload, Some(file.id))
                .details(json!({ "advisory": advisory })),
        );
        Ok(Download {
            file,
            stream,
            advisory,
        })
    }
}
