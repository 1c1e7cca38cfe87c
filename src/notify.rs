//! Owner notification for share access requests
//!
//! The notifier is the only channel that carries a verification code. A
//! requester never sees it; the owner relays it out of band.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

/// Log target for owner-facing notices
pub const OWNER_NOTICE_TARGET: &str = "filewarden::owner_notice";

/// A third party asked to download a shared file
#[derive(Debug, Clone)]
pub struct AccessRequestNotice {
    pub owner_id: String,
    pub file_id: Uuid,
    pub display_name: String,
    pub requester_ip: String,
    /// The code the owner relays to the requester
    pub verification_code: String,
    pub code_expires_at: DateTime<Utc>,
}

/// Delivers access requests to file owners
#[async_trait]
pub trait OwnerNotifier: Send + Sync {
    async fn notify_access_request(&self, notice: &AccessRequestNotice) -> Result<()>;
}

/// Delivers access requests on the owner notice log target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl OwnerNotifier for LogNotifier {
    async fn notify_access_request(&self, notice: &AccessRequestNotice) -> Result<()> {
        info!(
            target: OWNER_NOTICE_TARGET,
            owner_id = %notice.owner_id,
            file_id = %notice.file_id,
            file = %notice.display_name,
            requester_ip = %notice.requester_ip,
            code = %notice.verification_code,
            expires_at = %notice.code_expires_at,
            "Access requested for shared file"
        );
        Ok(())
    }
}

/// Keeps notices in memory; can be told to fail delivery
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<AccessRequestNotice>>,
    failing: Mutex<bool>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent deliveries fail
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn notices(&self) -> Vec<AccessRequestNotice> {
        self.notices.lock().clone()
    }

    /// Most recent code delivered for a file
    pub fn last_code_for(&self, file_id: &Uuid) -> Option<String> {
        self.notices
            .lock()
            .iter()
            .rev()
            .find(|n| &n.file_id == file_id)
            .map(|n| n.verification_code.clone())
    }
}

#[async_trait]
impl OwnerNotifier for MemoryNotifier {
    async fn notify_access_request(&self, notice: &AccessRequestNotice) -> Result<()> {
        if *self.failing.lock() {
            return Err(Error::NotificationFailed(format!(
                "could not reach owner {}",
                notice.owner_id
            )));
        }
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}
