//! Per-user storage quota

use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::debug;

/// Tracks how many plaintext bytes each user holds
///
/// A file is charged its plaintext size; encryption overhead is not counted.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Atomically charge `bytes` if they fit and return the new usage
    ///
    /// Fails with [`Error::StorageQuotaExceeded`] and charges nothing when
    /// the limit would be exceeded. Undo with a negative
    /// [`QuotaLedger::increment_usage`].
    async fn reserve(&self, user_id: &str, bytes: u64) -> Result<u64>;

    /// Add `delta` (negative to release) and return the new usage
    async fn increment_usage(&self, user_id: &str, delta: i64) -> Result<u64>;

    /// Current usage in bytes
    async fn usage(&self, user_id: &str) -> Result<u64>;

    /// Limit in bytes
    fn limit(&self, user_id: &str) -> u64;
}

/// Quota ledger stored in a sled tree, one big-endian u64 per user
pub struct SledQuotaLedger {
    tree: sled::Tree,
    limit: u64,
}

impl SledQuotaLedger {
    pub fn new(tree: sled::Tree, limit: u64) -> Self {
        SledQuotaLedger { tree, limit }
    }
}

fn decode(bytes: Option<&[u8]>) -> u64 {
    match bytes {
        Some(b) if b.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(b);
            u64::from_be_bytes(buf)
        }
        _ => 0,
    }
}

#[async_trait]
impl QuotaLedger for SledQuotaLedger {
    async fn reserve(&self, user_id: &str, bytes: u64) -> Result<u64> {
        let limit = self.limit;
        let mut refused = None;
        let updated = self.tree.update_and_fetch(user_id.as_bytes(), |old| {
            let current = decode(old);
            match current.checked_add(bytes) {
                Some(next) if next <= limit => {
                    refused = None;
                    Some(next.to_be_bytes().to_vec())
                }
                _ => {
                    refused = Some(current);
                    old.map(|b| b.to_vec())
                }
            }
        })?;

        if let Some(used) = refused {
            return Err(Error::StorageQuotaExceeded {
                used,
                requested: bytes,
                limit,
            });
        }
        let usage = decode(updated.as_deref());
        debug!(user_id, bytes, usage, "Storage reserved");
        Ok(usage)
    }

    async fn increment_usage(&self, user_id: &str, delta: i64) -> Result<u64> {
        let updated = self.tree.update_and_fetch(user_id.as_bytes(), |old| {
            let current = decode(old);
            let next = if delta >= 0 {
                current.saturating_add(delta as u64)
            } else {
                current.saturating_sub(delta.unsigned_abs())
            };
            Some(next.to_be_bytes().to_vec())
        })?;
        let usage = decode(updated.as_deref());
        debug!(user_id, delta, usage, "Storage usage updated");
        Ok(usage)
    }

    async fn usage(&self, user_id: &str) -> Result<u64> {
        Ok(decode(self.tree.get(user_id.as_bytes())?.as_deref()))
    }

    fn limit(&self, _user_id: &str) -> u64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;

    fn ledger(limit: u64) -> SledQuotaLedger {
        let store = MetadataStore::temporary().unwrap();
        SledQuotaLedger::new(store.usage_tree().unwrap(), limit)
    }

    #[tokio::test]
    async fn test_increment_and_release() {
        let ledger = ledger(1000);
        assert_eq!(ledger.increment_usage("alice", 300).await.unwrap(), 300);
        assert_eq!(ledger.increment_usage("alice", -100).await.unwrap(), 200);
        assert_eq!(ledger.usage("alice").await.unwrap(), 200);
        assert_eq!(ledger.usage("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_saturates_at_zero() {
        let ledger = ledger(1000);
        ledger.increment_usage("alice", 10).await.unwrap();
        assert_eq!(ledger.increment_usage("alice", -50).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_capacity_check() {
        let ledger = ledger(1000);
        ledger.increment_usage("alice", 900).await.unwrap();

        let err = ledger.reserve("alice", 101).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StorageQuotaExceeded {
                used: 900,
                requested: 101,
                limit: 1000
            }
        ));
        assert_eq!(ledger.reserve("alice", 100).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_reserve_refuses_without_charging() {
        let ledger = ledger(1000);
        assert_eq!(ledger.reserve("alice", 600).await.unwrap(), 600);

        let err = ledger.reserve("alice", 401).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StorageQuotaExceeded {
                used: 600,
                requested: 401,
                limit: 1000
            }
        ));
        assert_eq!(ledger.usage("alice").await.unwrap(), 600);
        assert_eq!(ledger.reserve("alice", 400).await.unwrap(), 1000);
        assert!(ledger.reserve("bob", 1001).await.is_err());
        assert_eq!(ledger.usage("bob").await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_stay_within_limit() {
        let ledger = std::sync::Arc::new(ledger(1000));
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.reserve("alice", 300).await.is_ok() })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(ledger.usage("alice").await.unwrap(), 900);
    }
}
