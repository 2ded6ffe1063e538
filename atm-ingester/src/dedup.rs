use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use atm_common::health::HealthHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Tracks recently seen message fingerprints so a redelivered notification
/// is not processed twice within the expiration window.
///
/// Purely in-memory and not persisted across restarts: a redelivery right
/// after a restart is tolerated, reconciliation is idempotent by natural
/// key. Shared between the ingestion loop and the purge task, so all
/// access goes through the mutex.
pub struct DedupCache {
    entries: Mutex<HashMap<String, Instant>>,
    expiration_window: Duration,
}

impl DedupCache {
    pub fn new(expiration_window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expiration_window,
        }
    }

    pub fn expiration_window(&self) -> Duration {
        self.expiration_window
    }

    /// Whether the fingerprint was recorded within the expiration window.
    /// Expired entries still waiting for the next purge do not count.
    pub fn seen(&self, fingerprint: &str) -> bool {
        let entries = self.entries.lock().expect("poisoned DedupCache lock");
        match entries.get(fingerprint) {
            Some(seen_at) => seen_at.elapsed() < self.expiration_window,
            None => false,
        }
    }

    /// Record a fingerprint sighting. Recording an already present
    /// fingerprint refreshes its timestamp, keeping hot entries alive
    /// across redelivery storms.
    pub fn record(&self, fingerprint: &str) {
        let mut entries = self.entries.lock().expect("poisoned DedupCache lock");
        entries.insert(fingerprint.to_owned(), Instant::now());
    }

    /// Drop every entry whose sighting is at least one expiration window
    /// before `now`.
    pub fn purge_expired(&self, now: Instant) {
        let mut entries = self.entries.lock().expect("poisoned DedupCache lock");
        let before = entries.len();
        entries.retain(|_, seen_at| now.duration_since(*seen_at) < self.expiration_window);
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, remaining = entries.len(), "purged dedup entries");
        }
        metrics::gauge!("ingest_dedup_cache_entries").set(entries.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("poisoned DedupCache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodic maintenance task for the dedup cache. Ticks on the expiration
/// window itself, so the cache holds at most about two windows of traffic
/// between purges. Stops when the shutdown token is cancelled.
pub async fn purge_loop(
    cache: std::sync::Arc<DedupCache>,
    liveness: HealthHandle,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(cache.expiration_window());
    // The first tick fires immediately; an empty purge is harmless.
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("dedup purge task shutting down");
                return;
            }
            _ = interval.tick() => {
                cache.purge_expired(Instant::now());
                liveness.report_healthy();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unseen_fingerprint_is_not_seen() {
        let cache = DedupCache::new(Duration::from_secs(60));
        assert!(!cache.seen("abc123"));
    }

    #[test]
    fn record_is_idempotent() {
        let cache = DedupCache::new(Duration::from_secs(60));

        cache.record("abc123");
        cache.record("abc123");
        cache.record("abc123");

        assert!(cache.seen("abc123"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn seen_has_no_side_effect() {
        let cache = DedupCache::new(Duration::from_secs(60));

        assert!(!cache.seen("abc123"));
        assert!(!cache.seen("abc123"));
        assert!(cache.is_empty());
    }

    #[test]
    fn entries_expire_at_the_window_boundary() {
        let window = Duration::from_millis(50);
        let cache = DedupCache::new(window);

        cache.record("abc123");
        assert!(cache.seen("abc123"));

        // Just inside the window: purge keeps the entry.
        cache.purge_expired(Instant::now());
        assert!(cache.seen("abc123"));
        assert_eq!(cache.len(), 1);

        std::thread::sleep(window + Duration::from_millis(10));

        // `seen` stops matching as soon as the window has passed, even
        // before the purge runs.
        assert!(!cache.seen("abc123"));
        cache.purge_expired(Instant::now());
        assert!(cache.is_empty());
    }

    #[test]
    fn purge_only_drops_expired_entries() {
        let cache = DedupCache::new(Duration::from_millis(50));

        cache.record("old");
        std::thread::sleep(Duration::from_millis(70));
        cache.record("fresh");

        cache.purge_expired(Instant::now());
        assert!(!cache.seen("old"));
        assert!(cache.seen("fresh"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn purge_loop_stops_on_cancellation() {
        let cache = Arc::new(DedupCache::new(Duration::from_secs(3600)));
        let registry = atm_common::health::HealthRegistry::new("test");
        let liveness = registry.register("purger", chrono::Duration::seconds(30));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(purge_loop(cache, liveness, shutdown.clone()));
        shutdown.cancel();
        handle.await.expect("purge task panicked");
    }
}
