//! TTL-aware credential cache
//!
//! One entry per session id. Fetches are serialized per session so concurrent
//! misses for the same session share a single fetcher call; hits never wait.
//! The background sweep refreshes entries that are about to expire and evicts
//! the ones that already have.

use super::{Credential, CredentialError, CredentialFetcher};
use crate::config::CredentialCacheConfig;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A credential plus its validity window
#[derive(Debug, Clone, PartialEq)]
pub struct CachedCredential {
    pub credential: Credential,
    pub expires_at: Instant,
    pub last_refreshed_at: Instant,
}

impl CachedCredential {
    fn new(credential: Credential, now: Instant) -> Self {
        let ttl = Duration::from_secs(u64::from(credential.ttl_seconds));
        Self {
            credential,
            expires_at: now + ttl,
            last_refreshed_at: now,
        }
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        !self.is_valid_at(now)
    }

    /// Still valid, but within `buffer` of expiry
    pub fn needs_refresh_at(&self, now: Instant, buffer: Duration) -> bool {
        self.is_valid_at(now) && now + buffer >= self.expires_at
    }
}

struct RefreshTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    fetcher: Arc<dyn CredentialFetcher>,
    entries: Mutex<HashMap<String, CachedCredential>>,
    /// Per-session fetch gates; held across the fetcher call
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    refresh_interval: Duration,
    refresh_buffer: Duration,
    refresh_task: Mutex<Option<RefreshTask>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

/// Credential cache handle; clones share the same entries
#[derive(Clone)]
pub struct CredentialCache {
    inner: Arc<Inner>,
}

impl CredentialCache {
    pub fn new(fetcher: Arc<dyn CredentialFetcher>, config: &CredentialCacheConfig) -> Self {
        Self::with_timing(fetcher, config.refresh_interval(), config.refresh_buffer())
    }

    pub fn with_timing(
        fetcher: Arc<dyn CredentialFetcher>,
        refresh_interval: Duration,
        refresh_buffer: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                entries: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                refresh_interval,
                refresh_buffer,
                refresh_task: Mutex::new(None),
            }),
        }
    }

    /// Return the cached credential if still valid, otherwise fetch and cache it.
    ///
    /// Concurrent callers that miss on the same session wait for the first
    /// fetch and receive its result.
    pub async fn get_credentials(&self, session_id: &str) -> Result<Credential, CredentialError> {
        if let Some(credential) = self.valid_credential(session_id) {
            debug!("Credential cache hit for session {}", session_id);
            return Ok(credential);
        }

        let gate = self.gate(session_id);
        let guard = gate.lock().await;

        // Another caller may have fetched while we waited
        if let Some(credential) = self.valid_credential(session_id) {
            debug!("Credential for session {} fetched by concurrent caller", session_id);
            return Ok(credential);
        }

        info!("Fetching TURN credentials for session {}", session_id);
        match self.inner.fetcher.fetch(session_id).await {
            Ok(credential) => {
                let entry = CachedCredential::new(credential.clone(), Instant::now());
                self.inner.entries.lock().insert(session_id.to_string(), entry);
                Ok(credential)
            }
            Err(e) => {
                // No entry will ever evict this gate
                drop(guard);
                drop(gate);
                self.release_gate(session_id);
                Err(e)
            }
        }
    }

    /// Remove one entry; no-op when absent
    pub fn clear_cache(&self, session_id: &str) {
        if self.inner.entries.lock().remove(session_id).is_some() {
            debug!("Cleared cached credential for session {}", session_id);
        }
        self.release_gate(session_id);
    }

    /// Remove every entry
    pub fn clear_all_cache(&self) {
        let sessions: Vec<String> = self.inner.entries.lock().drain().map(|(id, _)| id).collect();
        for session_id in &sessions {
            self.release_gate(session_id);
        }
        debug!("Cleared {} cached credentials", sessions.len());
    }

    /// Remaining validity, zero when absent or expired
    pub fn get_time_to_expiry(&self, session_id: &str) -> Duration {
        let now = Instant::now();
        self.inner
            .entries
            .lock()
            .get(session_id)
            .map(|entry| entry.expires_at.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// True iff an entry exists and has not expired
    pub fn is_cached(&self, session_id: &str) -> bool {
        self.valid_credential(session_id).is_some()
    }

    /// Snapshot of the entry for a session, expired or not
    pub fn cached_entry(&self, session_id: &str) -> Option<CachedCredential> {
        self.inner.entries.lock().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic refresh sweep. Must be called from within a tokio
    /// runtime; calling it while a sweep is running does nothing.
    pub fn start_auto_refresh(&self) {
        let mut task = self.inner.refresh_task.lock();
        if let Some(existing) = task.as_ref() {
            if !existing.handle.is_finished() {
                return;
            }
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.refresh_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let cache = CredentialCache { inner };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = cache.refresh_expiring() => {}
                }
            }
            debug!("Credential auto-refresh stopped");
        });

        info!("Credential auto-refresh started (every {:?})", period);
        *task = Some(RefreshTask { cancel, handle });
    }

    /// Stop the periodic sweep; no-op when not running
    pub fn stop_auto_refresh(&self) {
        if let Some(task) = self.inner.refresh_task.lock().take() {
            task.cancel.cancel();
            info!("Credential auto-refresh stopping");
        }
    }

    pub fn is_auto_refresh_running(&self) -> bool {
        self.inner
            .refresh_task
            .lock()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// One sweep: refresh entries inside the refresh buffer, then evict
    /// expired ones. A failed refresh keeps the previous entry until it
    /// expires naturally.
    pub async fn refresh_expiring(&self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.needs_refresh_at(now, self.inner.refresh_buffer))
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in due {
            self.refresh_entry(&session_id).await;
        }

        self.evict_expired();
    }

    async fn refresh_entry(&self, session_id: &str) {
        let gate = self.gate(session_id);
        let _guard = gate.lock().await;

        let still_due = self
            .inner
            .entries
            .lock()
            .get(session_id)
            .map(|entry| entry.needs_refresh_at(Instant::now(), self.inner.refresh_buffer))
            .unwrap_or(false);
        if !still_due {
            return;
        }

        match self.inner.fetcher.fetch(session_id).await {
            Ok(credential) => {
                let mut entries = self.inner.entries.lock();
                // Skip sessions cleared while the fetch was in flight
                if let Some(slot) = entries.get_mut(session_id) {
                    *slot = CachedCredential::new(credential, Instant::now());
                    info!("Refreshed TURN credentials for session {}", session_id);
                }
            }
            Err(e) => {
                warn!(
                    "Credential refresh for session {} failed, keeping previous until expiry: {}",
                    session_id, e
                );
            }
        }
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut entries = self.inner.entries.lock();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired_at(now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                entries.remove(id);
            }
            expired
        };

        for session_id in &expired {
            debug!("Evicted expired credential for session {}", session_id);
            self.release_gate(session_id);
        }

        // Gates left by fetches that never produced an entry
        let entries = self.inner.entries.lock();
        self.inner
            .gates
            .lock()
            .retain(|id, gate| entries.contains_key(id) || Arc::strong_count(gate) > 1);
    }

    fn valid_credential(&self, session_id: &str) -> Option<Credential> {
        let now = Instant::now();
        self.inner
            .entries
            .lock()
            .get(session_id)
            .filter(|entry| entry.is_valid_at(now))
            .map(|entry| entry.credential.clone())
    }

    fn gate(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .gates
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the gate unless someone is holding or waiting on it
    fn release_gate(&self, session_id: &str) {
        let mut gates = self.inner.gates.lock();
        if gates.get(session_id).map(|g| Arc::strong_count(g) == 1).unwrap_or(false) {
            gates.remove(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        ttl: u32,
        delay: Duration,
        fail: AtomicBool,
    }

    impl CountingFetcher {
        fn new(ttl: u32) -> Arc<Self> {
            Self::slow(ttl, Duration::ZERO)
        }

        fn slow(ttl: u32, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                ttl,
                delay,
                fail: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialFetcher for CountingFetcher {
        async fn fetch(&self, session_id: &str) -> Result<Credential, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(CredentialError::Server(503));
            }
            Ok(Credential {
                username: format!("{}:{}", n, session_id),
                secret: format!("secret-{}", n),
                ttl_seconds: self.ttl,
                server_uris: vec!["turn:turn.example.com:3478?transport=udp".to_string()],
            })
        }
    }

    fn cache_for(fetcher: Arc<CountingFetcher>) -> CredentialCache {
        CredentialCache::new(fetcher, &CredentialCacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_get_hits_cache() {
        let fetcher = CountingFetcher::new(3600);
        let cache = cache_for(fetcher.clone());

        let first = cache.get_credentials("abc").await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let second = cache.get_credentials("abc").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_cold_misses_fetch_once() {
        let fetcher = CountingFetcher::slow(3600, Duration::from_millis(200));
        let cache = cache_for(fetcher.clone());

        let calls = (0..16).map(|_| {
            let cache = cache.clone();
            async move { cache.get_credentials("abc").await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(fetcher.calls(), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert_eq!(result.as_ref().unwrap(), first);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_independent() {
        let fetcher = CountingFetcher::new(3600);
        let cache = cache_for(fetcher.clone());

        cache.get_credentials("a").await.unwrap();
        cache.get_credentials("b").await.unwrap();
        assert_eq!(fetcher.calls(), 2);

        cache.clear_cache("a");
        assert!(!cache.is_cached("a"));
        assert!(cache.is_cached("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refetched() {
        let fetcher = CountingFetcher::new(60);
        let cache = cache_for(fetcher.clone());

        cache.get_credentials("abc").await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!cache.is_cached("abc"));

        let refreshed = cache.get_credentials("abc").await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert!(refreshed.username.starts_with("2:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_to_expiry_counts_down() {
        let fetcher = CountingFetcher::new(3600);
        let cache = cache_for(fetcher.clone());
        assert_eq!(cache.get_time_to_expiry("abc"), Duration::ZERO);

        cache.get_credentials("abc").await.unwrap();
        let t1 = cache.get_time_to_expiry("abc");
        assert_eq!(t1, Duration::from_secs(3600));

        tokio::time::advance(Duration::from_secs(100)).await;
        let t2 = cache.get_time_to_expiry("abc");
        assert!(t2 <= t1);
        assert_eq!(t2, Duration::from_secs(3500));

        tokio::time::advance(Duration::from_secs(4000)).await;
        assert_eq!(cache.get_time_to_expiry("abc"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_is_surfaced() {
        let fetcher = CountingFetcher::new(3600);
        fetcher.fail.store(true, Ordering::SeqCst);
        let cache = cache_for(fetcher.clone());

        let err = cache.get_credentials("abc").await.unwrap_err();
        assert!(matches!(err, CredentialError::Server(503)));
        assert!(!cache.is_cached("abc"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetches_leave_no_gates() {
        let fetcher = CountingFetcher::new(3600);
        fetcher.fail.store(true, Ordering::SeqCst);
        let cache = cache_for(fetcher.clone());

        for n in 0..100 {
            assert!(cache.get_credentials(&format!("session-{}", n)).await.is_err());
        }
        assert!(cache.is_empty());
        assert!(cache.inner.gates.lock().is_empty());

        fetcher.fail.store(false, Ordering::SeqCst);
        cache.get_credentials("session-0").await.unwrap();
        assert!(cache.is_cached("session-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_is_idempotent() {
        let fetcher = CountingFetcher::new(3600);
        let cache = cache_for(fetcher.clone());
        cache.clear_cache("missing");
        cache.clear_all_cache();

        cache.get_credentials("a").await.unwrap();
        cache.get_credentials("b").await.unwrap();
        cache.clear_all_cache();
        cache.clear_all_cache();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_refreshes_inside_buffer() {
        let fetcher = CountingFetcher::new(3600);
        let cache = cache_for(fetcher.clone());

        cache.get_credentials("abc").await.unwrap();
        tokio::time::advance(Duration::from_secs(3000)).await;
        assert!(cache.is_cached("abc"));

        // Outside the 5 minute buffer: nothing to do
        cache.refresh_expiring().await;
        assert_eq!(fetcher.calls(), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        cache.refresh_expiring().await;
        assert_eq!(fetcher.calls(), 2);
        assert!(cache.get_time_to_expiry("abc") <= Duration::from_secs(3600));

        tokio::time::advance(Duration::from_secs(399)).await;
        assert!(cache.is_cached("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_entry_until_expiry() {
        let fetcher = CountingFetcher::new(3600);
        let cache = cache_for(fetcher.clone());

        let original = cache.get_credentials("abc").await.unwrap();
        tokio::time::advance(Duration::from_secs(3301)).await;

        fetcher.fail.store(true, Ordering::SeqCst);
        cache.refresh_expiring().await;
        assert_eq!(fetcher.calls(), 2);
        assert!(cache.is_cached("abc"));
        assert_eq!(cache.get_credentials("abc").await.unwrap(), original);

        // Retried on the next sweep while still inside the buffer
        tokio::time::advance(Duration::from_secs(60)).await;
        cache.refresh_expiring().await;
        assert_eq!(fetcher.calls(), 3);

        tokio::time::advance(Duration::from_secs(339)).await;
        assert!(!cache.is_cached("abc"));
        cache.refresh_expiring().await;
        assert!(cache.cached_entry("abc").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_refresh_runs_on_interval() {
        let fetcher = CountingFetcher::new(360);
        let cache = cache_for(fetcher.clone());
        cache.get_credentials("abc").await.unwrap();

        cache.start_auto_refresh();
        cache.start_auto_refresh();
        assert!(cache.is_auto_refresh_running());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fetcher.calls(), 2);

        cache.stop_auto_refresh();
        cache.stop_auto_refresh();
        assert!(!cache.is_auto_refresh_running());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fetcher.calls(), 2);
    }
}
