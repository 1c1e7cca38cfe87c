//! Cached scanner availability
//!
//! Probing a scanner spawns processes, so the answer is kept for a TTL.
//! Readers never wait on a refresh while an older answer exists; only one
//! probe runs at a time.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Time-bounded cache for a single boolean probe
pub struct AvailabilityCache {
    ttl: Duration,
    value: RwLock<Option<(bool, Instant)>>,
    refresh: Mutex<()>,
    probes: AtomicU64,
}

impl AvailabilityCache {
    pub fn new(ttl: Duration) -> Self {
        AvailabilityCache {
            ttl,
            value: RwLock::new(None),
            refresh: Mutex::new(()),
            probes: AtomicU64::new(0),
        }
    }

    fn fresh(&self) -> Option<bool> {
        let cached = *self.value.read();
        match cached {
            Some((available, at)) if at.elapsed() < self.ttl => Some(available),
            _ => None,
        }
    }

    /// Cached answer, running `probe` when it is missing or stale
    pub async fn get<F, Fut>(&self, probe: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        if let Some(available) = self.fresh() {
            return available;
        }

        let cached = *self.value.read();
        let stale = cached.map(|(available, _)| available);
        let _guard = match self.refresh.try_lock() {
            Ok(guard) => guard,
            Err(_) => match stale {
                // Someone else is refreshing; the old answer will do.
                Some(available) => return available,
                None => self.refresh.lock().await,
            },
        };

        // A concurrent refresh may have finished while we waited.
        if let Some(available) = self.fresh() {
            return available;
        }

        let available = probe().await;
        *self.value.write() = Some((available, Instant::now()));
        self.probes.fetch_add(1, Ordering::Relaxed);
        available
    }

    /// Forget the cached answer
    pub fn invalidate(&self) {
        *self.value.write() = None;
    }

    /// Number of probes run so far
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_probes_once_within_ttl() {
        let cache = AvailabilityCache::new(Duration::from_secs(300));
        for _ in 0..5 {
            assert!(cache.get(|| async { true }).await);
        }
        assert_eq!(cache.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_value_is_refreshed() {
        let cache = AvailabilityCache::new(Duration::from_millis(10));
        assert!(cache.get(|| async { true }).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!cache.get(|| async { false }).await);
        assert_eq!(cache.probe_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_probe() {
        let cache = AvailabilityCache::new(Duration::from_secs(300));
        cache.get(|| async { true }).await;
        cache.invalidate();
        assert!(!cache.get(|| async { false }).await);
        assert_eq!(cache.probe_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_probe_runs_once() {
        let cache = Arc::new(AvailabilityCache::new(Duration::from_secs(300)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .get(|| async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            true
                        })
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(cache.probe_count(), 1);
    }
}
