//! Reconnection state machine
//!
//! Tracks `Stable -> Reconnecting -> (Stable | Reconnecting | Failed)` for one
//! call. Each failure notification from the engine becomes at most one
//! recovery attempt: back off, then hand a strategy to the caller's `recover`
//! closure. `Failed` is terminal until [`ReconnectionCoordinator::reset`].

use crate::config::ReconnectionConfig;
use crate::engine::{ConnectionState, EngineEvent};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconnectionState {
    /// Connection is healthy
    Stable,
    /// Recovery attempt pending or in progress
    Reconnecting,
    /// Retries exhausted or fatal failure
    Failed,
}

/// Severity of a connectivity failure, classified by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureType {
    /// ICE restart can fix it (candidate pair lost)
    Minor,
    /// The connection has to be rebuilt
    Major,
    /// Not recoverable (relay authentication rejected)
    Fatal,
}

impl FailureType {
    pub fn from_connection_state(state: ConnectionState) -> Option<Self> {
        match state {
            ConnectionState::Disconnected => Some(FailureType::Minor),
            ConnectionState::Failed => Some(FailureType::Major),
            _ => None,
        }
    }

    pub fn from_event(event: &EngineEvent) -> Option<Self> {
        match event {
            EngineEvent::StateChanged(state) => Self::from_connection_state(*state),
            EngineEvent::AuthenticationFailed(_) => Some(FailureType::Fatal),
            EngineEvent::LocalCandidate(_) => None,
        }
    }
}

/// What the `recover` closure is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconnectionStrategy {
    /// Restart ICE, keep the peer connection
    IceRestart,
    /// Create a new peer connection
    FullReconnection,
}

/// Result of one `handle_failure` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Another attempt was in flight; notification ignored
    Dropped,
    /// Retry budget already spent; state is `Failed`
    Exhausted,
    /// Fatal failure; state is `Failed`, `recover` not invoked
    Fatal,
    /// `recover` succeeded; state is `Stable`
    Recovered,
    /// `recover` failed with budget left; state stays `Reconnecting`
    RetryPending,
    /// `recover` failed on the last allowed attempt; state is `Failed`
    Failed,
    /// Reset or shutdown abandoned the attempt
    Cancelled,
}

/// Record of the attempt in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectionAttempt {
    pub attempt_number: u32,
    pub failure_type: FailureType,
    pub started_at: Instant,
}

struct Session {
    state: ReconnectionState,
    retry_count: u32,
    current_attempt: Option<ReconnectionAttempt>,
    /// Bumped by `reset` so a stale attempt cannot write back
    epoch: u64,
    attempt_cancel: Option<CancellationToken>,
}

pub struct ReconnectionCoordinator {
    max_retry_attempts: u32,
    backoff_table: Vec<Duration>,
    session: Mutex<Session>,
    state_tx: watch::Sender<ReconnectionState>,
    shutdown: CancellationToken,
}

impl Default for ReconnectionCoordinator {
    fn default() -> Self {
        Self::new(&ReconnectionConfig::default())
    }
}

impl ReconnectionCoordinator {
    pub fn new(config: &ReconnectionConfig) -> Self {
        Self::with_policy(config.max_retry_attempts, config.backoff_table())
    }

    /// An empty table falls back to a single one second step
    pub fn with_policy(max_retry_attempts: u32, backoff_table: Vec<Duration>) -> Self {
        let backoff_table = if backoff_table.is_empty() {
            vec![Duration::from_secs(1)]
        } else {
            backoff_table
        };
        let (state_tx, _) = watch::channel(ReconnectionState::Stable);

        Self {
            max_retry_attempts,
            backoff_table,
            session: Mutex::new(Session {
                state: ReconnectionState::Stable,
                retry_count: 0,
                current_attempt: None,
                epoch: 0,
                attempt_cancel: None,
            }),
            state_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Run one recovery attempt for a failure notification.
    ///
    /// The dedup check and retry-count increment happen under one lock, so a
    /// second notification arriving mid-attempt is dropped. The backoff wait
    /// and the `recover` future are abandoned if [`reset`](Self::reset) or
    /// [`shutdown`](Self::shutdown) is called meanwhile.
    pub async fn handle_failure<F, Fut, E>(&self, failure_type: FailureType, recover: F) -> ReconnectOutcome
    where
        F: FnOnce(ReconnectionStrategy) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let (attempt_number, epoch, token) = {
            let mut s = self.session.lock();

            if self.shutdown.is_cancelled() {
                return ReconnectOutcome::Cancelled;
            }

            if s.current_attempt.is_some() {
                debug!("Reconnection already in progress, dropping {:?} failure", failure_type);
                return ReconnectOutcome::Dropped;
            }

            if s.retry_count >= self.max_retry_attempts {
                self.transition(&mut s, ReconnectionState::Failed);
                return ReconnectOutcome::Exhausted;
            }

            self.transition(&mut s, ReconnectionState::Reconnecting);
            s.retry_count += 1;
            let attempt_number = s.retry_count;

            if failure_type == FailureType::Fatal {
                warn!("Fatal connection failure, not retrying");
                self.transition(&mut s, ReconnectionState::Failed);
                return ReconnectOutcome::Fatal;
            }

            s.current_attempt = Some(ReconnectionAttempt {
                attempt_number,
                failure_type,
                started_at: Instant::now(),
            });
            let token = self.shutdown.child_token();
            s.attempt_cancel = Some(token.clone());
            (attempt_number, s.epoch, token)
        };
        let mut guard = AttemptGuard {
            coordinator: self,
            epoch,
            armed: true,
        };

        let strategy = match failure_type {
            FailureType::Minor => ReconnectionStrategy::IceRestart,
            _ => ReconnectionStrategy::FullReconnection,
        };
        let delay = self.delay_for_attempt(attempt_number);
        info!(
            "Reconnection attempt {}/{} ({:?}) in {:?}",
            attempt_number, self.max_retry_attempts, strategy, delay
        );

        tokio::select! {
            _ = token.cancelled() => {
                debug!("Reconnection attempt {} cancelled during backoff", attempt_number);
                return ReconnectOutcome::Cancelled;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let result = tokio::select! {
            _ = token.cancelled() => {
                debug!("Reconnection attempt {} cancelled during recovery", attempt_number);
                return ReconnectOutcome::Cancelled;
            }
            result = recover(strategy) => result,
        };

        guard.armed = false;
        let mut s = self.session.lock();
        if s.epoch != epoch || token.is_cancelled() {
            return ReconnectOutcome::Cancelled;
        }
        s.current_attempt = None;
        s.attempt_cancel = None;

        match result {
            Ok(()) => {
                info!("Reconnection attempt {} succeeded", attempt_number);
                s.retry_count = 0;
                self.transition(&mut s, ReconnectionState::Stable);
                ReconnectOutcome::Recovered
            }
            Err(e) => {
                warn!("Reconnection attempt {} failed: {}", attempt_number, e);
                if s.retry_count >= self.max_retry_attempts {
                    self.transition(&mut s, ReconnectionState::Failed);
                    ReconnectOutcome::Failed
                } else {
                    ReconnectOutcome::RetryPending
                }
            }
        }
    }

    /// Back to `Stable` with no retries used; cancels any attempt in flight
    pub fn reset(&self) {
        let mut s = self.session.lock();
        if let Some(token) = s.attempt_cancel.take() {
            token.cancel();
        }
        s.epoch = s.epoch.wrapping_add(1);
        s.retry_count = 0;
        s.current_attempt = None;
        self.transition(&mut s, ReconnectionState::Stable);
    }

    /// Call teardown: abandon the attempt in flight and ignore later failures
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Delay the next attempt would wait
    pub fn get_current_backoff_delay(&self) -> Duration {
        let retry_count = self.session.lock().retry_count;
        self.delay_for_attempt(retry_count + 1)
    }

    pub fn can_reconnect(&self) -> bool {
        let s = self.session.lock();
        s.retry_count < self.max_retry_attempts && s.state != ReconnectionState::Failed
    }

    pub fn state(&self) -> ReconnectionState {
        self.session.lock().state
    }

    pub fn retry_count(&self) -> u32 {
        self.session.lock().retry_count
    }

    pub fn current_attempt(&self) -> Option<ReconnectionAttempt> {
        self.session.lock().current_attempt
    }

    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconnectionState> {
        self.state_tx.subscribe()
    }

    /// Table entry for attempts it covers, then doubling from the last entry
    pub fn delay_for_attempt(&self, attempt_number: u32) -> Duration {
        let index = attempt_number.max(1) as usize - 1;
        if let Some(delay) = self.backoff_table.get(index) {
            return *delay;
        }
        let last = self.backoff_table[self.backoff_table.len() - 1];
        let beyond = (attempt_number as usize - self.backoff_table.len()).min(20) as u32;
        last.saturating_mul(1u32 << beyond)
    }

    fn transition(&self, s: &mut Session, next: ReconnectionState) {
        if s.state != next {
            info!("Reconnection state {:?} -> {:?}", s.state, next);
            s.state = next;
        }
        self.state_tx.send_replace(next);
    }
}

/// Frees the in-flight slot if a `handle_failure` future is dropped early
struct AttemptGuard<'a> {
    coordinator: &'a ReconnectionCoordinator,
    epoch: u64,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut s = self.coordinator.session.lock();
        if s.epoch == self.epoch {
            debug!("Reconnection attempt abandoned by its caller");
            s.current_attempt = None;
            s.attempt_cancel = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn fail_once(coordinator: &ReconnectionCoordinator) -> ReconnectOutcome {
        coordinator
            .handle_failure(FailureType::Minor, |_| async { Err::<(), _>("still down") })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_table() {
        let coordinator = ReconnectionCoordinator::default();
        assert_eq!(coordinator.get_current_backoff_delay(), Duration::from_secs(1));

        assert_eq!(fail_once(&coordinator).await, ReconnectOutcome::RetryPending);
        assert_eq!(coordinator.get_current_backoff_delay(), Duration::from_secs(2));

        assert_eq!(fail_once(&coordinator).await, ReconnectOutcome::RetryPending);
        assert_eq!(coordinator.get_current_backoff_delay(), Duration::from_secs(4));

        assert_eq!(fail_once(&coordinator).await, ReconnectOutcome::Failed);
        assert_eq!(coordinator.retry_count(), 3);
        assert_eq!(coordinator.get_current_backoff_delay(), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_grows_past_table() {
        let coordinator = ReconnectionCoordinator::default();
        assert_eq!(coordinator.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(coordinator.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(coordinator.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(coordinator.delay_for_attempt(5), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_is_terminal_after_max_attempts() {
        let coordinator = ReconnectionCoordinator::default();
        for _ in 0..3 {
            fail_once(&coordinator).await;
        }
        assert_eq!(coordinator.state(), ReconnectionState::Failed);
        assert!(!coordinator.can_reconnect());

        let calls = AtomicUsize::new(0);
        let outcome = coordinator
            .handle_failure(FailureType::Minor, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), String>(()) }
            })
            .await;
        assert_eq!(outcome, ReconnectOutcome::Exhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.state(), ReconnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_never_invokes_recover() {
        let coordinator = ReconnectionCoordinator::default();
        let calls = AtomicUsize::new(0);
        let outcome = coordinator
            .handle_failure(FailureType::Fatal, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), String>(()) }
            })
            .await;
        assert_eq!(outcome, ReconnectOutcome::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.state(), ReconnectionState::Failed);
        assert!(!coordinator.can_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_after_prior_retry() {
        let coordinator = ReconnectionCoordinator::default();
        fail_once(&coordinator).await;
        assert_eq!(coordinator.state(), ReconnectionState::Reconnecting);

        let outcome = coordinator
            .handle_failure(FailureType::Fatal, |_| async { Ok::<(), String>(()) })
            .await;
        assert_eq!(outcome, ReconnectOutcome::Fatal);
        assert_eq!(coordinator.state(), ReconnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_backoff() {
        let coordinator = ReconnectionCoordinator::default();

        let start = Instant::now();
        let outcome = coordinator
            .handle_failure(FailureType::Minor, |strategy| async move {
                assert_eq!(strategy, ReconnectionStrategy::IceRestart);
                Ok::<(), String>(())
            })
            .await;
        assert_eq!(outcome, ReconnectOutcome::Recovered);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(coordinator.state(), ReconnectionState::Stable);
        assert_eq!(coordinator.retry_count(), 0);
        assert!(coordinator.current_attempt().is_none());

        let start = Instant::now();
        coordinator
            .handle_failure(FailureType::Major, |strategy| async move {
                assert_eq!(strategy, ReconnectionStrategy::FullReconnection);
                Ok::<(), String>(())
            })
            .await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_during_attempt_is_dropped() {
        let coordinator = Arc::new(ReconnectionCoordinator::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                coordinator
                    .handle_failure(FailureType::Minor, move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), String>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(coordinator.state(), ReconnectionState::Reconnecting);
        assert_eq!(coordinator.current_attempt().map(|a| a.attempt_number), Some(1));

        let second = coordinator
            .handle_failure(FailureType::Major, |_| async { Ok::<(), String>(()) })
            .await;
        assert_eq!(second, ReconnectOutcome::Dropped);
        assert_eq!(coordinator.retry_count(), 1);

        assert_eq!(first.await.unwrap(), ReconnectOutcome::Recovered);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_attempt_frees_the_slot() {
        let coordinator = ReconnectionCoordinator::default();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(500),
            coordinator.handle_failure(FailureType::Minor, |_| async { Ok::<(), String>(()) }),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(coordinator.current_attempt().is_none());
        assert_eq!(coordinator.state(), ReconnectionState::Reconnecting);

        let outcome = coordinator
            .handle_failure(FailureType::Major, |strategy| async move {
                assert_eq!(strategy, ReconnectionStrategy::FullReconnection);
                Ok::<(), String>(())
            })
            .await;
        assert_eq!(outcome, ReconnectOutcome::Recovered);
        assert_eq!(coordinator.state(), ReconnectionState::Stable);
        assert_eq!(coordinator.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_pending_attempt() {
        let coordinator = Arc::new(ReconnectionCoordinator::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let pending = {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                coordinator
                    .handle_failure(FailureType::Major, move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>("unreachable")
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        coordinator.reset();

        assert_eq!(pending.await.unwrap(), ReconnectOutcome::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.state(), ReconnectionState::Stable);
        assert_eq!(coordinator.retry_count(), 0);
        assert!(coordinator.can_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_and_ignores() {
        let coordinator = Arc::new(ReconnectionCoordinator::default());

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .handle_failure(FailureType::Minor, |_| async { Ok::<(), String>(()) })
                    .await
            })
        };
        tokio::task::yield_now().await;
        coordinator.shutdown();
        assert_eq!(pending.await.unwrap(), ReconnectOutcome::Cancelled);

        let later = coordinator
            .handle_failure(FailureType::Minor, |_| async { Ok::<(), String>(()) })
            .await;
        assert_eq!(later, ReconnectOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_is_published() {
        let coordinator = ReconnectionCoordinator::default();
        let mut rx = coordinator.subscribe();
        assert_eq!(*rx.borrow(), ReconnectionState::Stable);

        fail_once(&coordinator).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ReconnectionState::Reconnecting);

        coordinator.reset();
        assert_eq!(*rx.borrow_and_update(), ReconnectionState::Stable);
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(FailureType::from_connection_state(ConnectionState::Disconnected), Some(FailureType::Minor));
        assert_eq!(FailureType::from_connection_state(ConnectionState::Failed), Some(FailureType::Major));
        assert_eq!(FailureType::from_connection_state(ConnectionState::Connected), None);
        assert_eq!(
            FailureType::from_event(&EngineEvent::AuthenticationFailed("401".into())),
            Some(FailureType::Fatal)
        );
    }
}
