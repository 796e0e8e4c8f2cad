//! Lifetime wiring for one call
//!
//! A [`CallSession`] owns the background tasks of a call:
//! - engine events: local candidates are published, failures go to the
//!   reconnection coordinator
//! - signaling observers: remote answers/offers and ICE candidates
//! - the quality monitor, publishing a [`QualityReport`] per stats interval
//!
//! Renegotiation is caller driven. A caller recovers by sending a fresh offer
//! (after an ICE restart or a rebuild); a callee rebuilds if needed and waits
//! for the caller's offer to bring the connection back.

use super::usecases::{negotiate_answer, AddIceCandidateUseCase, AnswerCallUseCase, CreateOfferUseCase, EndCallUseCase};
use super::CallError;
use crate::config::Config;
use crate::credentials::CredentialCache;
use crate::engine::{ConnectionState, EngineEvent, PeerConnectionEngine, SessionDescription};
use crate::quality::{QualityReport, StatsSampler};
use crate::reconnect::{
    FailureType, ReconnectOutcome, ReconnectionCoordinator, ReconnectionState, ReconnectionStrategy,
};
use crate::signaling::{AnswerMessage, IceCandidateMessage, OfferMessage, SignalingTransport};
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Creates the offer and drives renegotiation
    Caller,
    /// Answers offers
    Callee,
}

struct SessionInner {
    session_id: String,
    user_id: String,
    engine: Arc<dyn PeerConnectionEngine>,
    signaling: Arc<dyn SignalingTransport>,
    credentials: CredentialCache,
    coordinator: ReconnectionCoordinator,
    candidates: AddIceCandidateUseCase,
    stats_interval: Duration,
    recovery_timeout: Duration,
    role: Mutex<Option<CallRole>>,
    connection_tx: watch::Sender<ConnectionState>,
    quality_tx: watch::Sender<Option<QualityReport>>,
    /// Candidate lines we published; the shared collection echoes them back
    local_candidates: Mutex<HashSet<String>>,
    /// Remote candidates that arrived before a remote description
    pending_candidates: Mutex<Vec<IceCandidateMessage>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    owns_auto_refresh: AtomicBool,
    ended: AtomicBool,
}

pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        engine: Arc<dyn PeerConnectionEngine>,
        signaling: Arc<dyn SignalingTransport>,
        credentials: CredentialCache,
        config: &Config,
    ) -> Self {
        let (connection_tx, _) = watch::channel(ConnectionState::New);
        let (quality_tx, _) = watch::channel(None);

        Self {
            inner: Arc::new(SessionInner {
                session_id: session_id.into(),
                user_id: user_id.into(),
                candidates: AddIceCandidateUseCase::new(engine.clone(), signaling.clone()),
                engine,
                signaling,
                credentials,
                coordinator: ReconnectionCoordinator::new(&config.reconnection),
                stats_interval: config.stats.interval(),
                recovery_timeout: config.reconnection.recovery_timeout(),
                role: Mutex::new(None),
                connection_tx,
                quality_tx,
                local_candidates: Mutex::new(HashSet::new()),
                pending_candidates: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                owns_auto_refresh: AtomicBool::new(false),
                ended: AtomicBool::new(false),
            }),
        }
    }

    /// Place the call: send an offer and apply the answer when it arrives
    pub async fn start_as_caller(&self) -> Result<SessionDescription, CallError> {
        self.begin(CallRole::Caller)?;
        let inner = &self.inner;

        let answers = inner.signaling.observe_answer(&inner.session_id);
        inner.spawn(run_answers(inner.clone(), answers));

        let use_case = CreateOfferUseCase::new(inner.engine.clone(), inner.signaling.clone(), inner.credentials.clone());
        use_case.execute(&inner.session_id, &inner.user_id).await
    }

    /// Wait for the caller's offer, answer it, then answer every renegotiation
    pub async fn start_as_callee(&self) -> Result<SessionDescription, CallError> {
        self.begin(CallRole::Callee)?;
        let inner = &self.inner;

        let mut offers = inner.signaling.observe_offer(&inner.session_id);
        let offer = tokio::select! {
            _ = inner.cancel.cancelled() => return Err(CallError::Ended),
            offer = offers.next() => offer.ok_or(CallError::NoOffer)?,
        };

        let use_case = AnswerCallUseCase::new(inner.engine.clone(), inner.signaling.clone(), inner.credentials.clone());
        let answer = use_case.execute(&inner.session_id, &inner.user_id, &offer).await?;
        inner.flush_pending_candidates().await;

        inner.spawn(run_offers(inner.clone(), offers));
        Ok(answer)
    }

    /// Tear the call down. Idempotent; only the first call touches the engine.
    pub async fn end(&self, graceful: bool) -> Result<(), CallError> {
        if !self.inner.shutdown() {
            return Ok(());
        }
        self.inner.credentials.clear_cache(&self.inner.session_id);

        let use_case = EndCallUseCase::new(self.inner.engine.clone(), self.inner.signaling.clone());
        use_case.execute(&self.inner.session_id, graceful).await
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn role(&self) -> Option<CallRole> {
        *self.inner.role.lock()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_tx.borrow()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_tx.subscribe()
    }

    pub fn reconnection_state(&self) -> ReconnectionState {
        self.inner.coordinator.state()
    }

    pub fn subscribe_reconnection_state(&self) -> watch::Receiver<ReconnectionState> {
        self.inner.coordinator.subscribe()
    }

    pub fn coordinator(&self) -> &ReconnectionCoordinator {
        &self.inner.coordinator
    }

    pub fn latest_quality(&self) -> Option<QualityReport> {
        self.inner.quality_tx.borrow().clone()
    }

    pub fn subscribe_quality(&self) -> watch::Receiver<Option<QualityReport>> {
        self.inner.quality_tx.subscribe()
    }

    fn begin(&self, role: CallRole) -> Result<(), CallError> {
        let inner = &self.inner;
        if inner.ended.load(Ordering::SeqCst) {
            return Err(CallError::Ended);
        }
        {
            let mut current = inner.role.lock();
            if current.is_some() {
                return Err(CallError::AlreadyStarted);
            }
            *current = Some(role);
        }
        info!("Starting call {} as {:?} ({})", inner.session_id, role, inner.user_id);

        if !inner.credentials.is_auto_refresh_running() {
            inner.credentials.start_auto_refresh();
            inner.owns_auto_refresh.store(true, Ordering::SeqCst);
        }

        // Subscribe before the engine is initialized so no candidate is missed
        let events = inner.engine.subscribe();
        inner.spawn(run_events(inner.clone(), events));

        let remote = inner.signaling.observe_ice_candidates(&inner.session_id);
        inner.spawn(run_remote_candidates(inner.clone(), remote));

        inner.spawn(run_quality_monitor(inner.clone()));
        Ok(())
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl SessionInner {
    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(tokio::spawn(future));
    }

    fn role(&self) -> CallRole {
        self.role.lock().unwrap_or(CallRole::Caller)
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Stop background work; false if already shut down
    fn shutdown(&self) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Ending call {}", self.session_id);
        self.cancel.cancel();
        self.coordinator.shutdown();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        if self.owns_auto_refresh.swap(false, Ordering::SeqCst) {
            self.credentials.stop_auto_refresh();
        }
        true
    }

    /// Drive recovery for one failure until it succeeds or gives up
    async fn recover_from(self: Arc<Self>, failure: FailureType) {
        loop {
            let generation = self.engine.generation();
            let outcome = self
                .coordinator
                .handle_failure(failure, |strategy| self.recover(strategy, generation))
                .await;

            match outcome {
                ReconnectOutcome::RetryPending => continue,
                ReconnectOutcome::Recovered => {
                    info!("Call {} recovered", self.session_id);
                }
                ReconnectOutcome::Failed | ReconnectOutcome::Exhausted | ReconnectOutcome::Fatal => {
                    error!("Call {} could not be recovered ({:?})", self.session_id, outcome);
                }
                ReconnectOutcome::Dropped | ReconnectOutcome::Cancelled => {}
            }
            break;
        }
    }

    async fn recover(&self, strategy: ReconnectionStrategy, generation: u64) -> Result<(), CallError> {
        if self.is_ended() {
            return Err(CallError::Ended);
        }
        if self.engine.generation() != generation {
            debug!("Connection for call {} already replaced", self.session_id);
            return Ok(());
        }

        match (self.role(), strategy) {
            (CallRole::Caller, ReconnectionStrategy::IceRestart) => {
                let offer = self.engine.restart_ice().await?;
                self.send_offer(offer).await
            }
            (CallRole::Caller, ReconnectionStrategy::FullReconnection) => {
                self.rebuild().await?;
                let offer = self.engine.create_offer().await?;
                self.engine.set_local_description(offer.clone()).await?;
                self.send_offer(offer).await
            }
            (CallRole::Callee, ReconnectionStrategy::IceRestart) => self.await_connected().await,
            (CallRole::Callee, ReconnectionStrategy::FullReconnection) => {
                self.rebuild().await?;
                self.await_connected().await
            }
        }
    }

    /// Fresh credentials and a new peer connection
    async fn rebuild(&self) -> Result<(), CallError> {
        self.credentials.clear_cache(&self.session_id);
        let credential = self.credentials.get_credentials(&self.session_id).await?;
        self.pending_candidates.lock().clear();
        self.engine.rebuild(credential.ice_servers()).await?;
        Ok(())
    }

    async fn send_offer(&self, offer: SessionDescription) -> Result<(), CallError> {
        let message = OfferMessage::new(&self.session_id, offer.sdp, &self.user_id);
        self.signaling.send_offer(&self.session_id, message).await?;
        info!("Sent renegotiation offer for call {}", self.session_id);
        Ok(())
    }

    async fn await_connected(&self) -> Result<(), CallError> {
        let mut state = self.connection_tx.subscribe();
        let waited = tokio::time::timeout(
            self.recovery_timeout,
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .map(|connected| connected.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CallError::Ended),
            Err(_) => Err(CallError::RecoveryTimedOut(self.recovery_timeout)),
        }
    }

    async fn apply_answer(&self, answer: AnswerMessage) {
        match self.engine.set_remote_description(answer.description()).await {
            Ok(()) => {
                debug!("Applied answer from {} for call {}", answer.callee_id, self.session_id);
                self.flush_pending_candidates().await;
            }
            Err(e) => warn!("Failed to apply answer for call {}: {}", self.session_id, e),
        }
    }

    async fn answer_renegotiation(&self, offer: OfferMessage) {
        let result = async {
            let answer = negotiate_answer(self.engine.as_ref(), &offer).await?;
            let message = AnswerMessage::new(&self.session_id, answer.sdp, &self.user_id);
            self.signaling.send_answer(&self.session_id, message).await?;
            Ok::<(), CallError>(())
        }
        .await;

        match result {
            Ok(()) => {
                debug!("Answered renegotiation for call {}", self.session_id);
                self.flush_pending_candidates().await;
            }
            Err(e) => warn!("Failed to answer renegotiation for call {}: {}", self.session_id, e),
        }
    }

    async fn apply_remote_candidate(&self, candidate: IceCandidateMessage) {
        if self.local_candidates.lock().contains(&candidate.sdp_candidate) {
            return;
        }
        if let Err(e) = self.candidates.execute(&candidate).await {
            debug!("Deferring remote ICE candidate for call {}: {}", self.session_id, e);
            self.pending_candidates.lock().push(candidate);
        }
    }

    async fn flush_pending_candidates(&self) {
        let pending: Vec<_> = self.pending_candidates.lock().drain(..).collect();
        for candidate in pending {
            if let Err(e) = self.candidates.execute(&candidate).await {
                warn!("Dropping remote ICE candidate for call {}: {}", self.session_id, e);
            }
        }
    }

    async fn publish_local_candidate(&self, candidate: crate::engine::IceCandidate) {
        self.local_candidates.lock().insert(candidate.candidate.clone());
        if let Err(e) = self.candidates.signal_local_candidate(&self.session_id, &candidate).await {
            warn!("Failed to signal local ICE candidate for call {}: {}", self.session_id, e);
        }
    }
}

async fn run_events(inner: Arc<SessionInner>, mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(EngineEvent::LocalCandidate(candidate)) => inner.publish_local_candidate(candidate).await,
            Ok(event) => {
                if let EngineEvent::StateChanged(state) = &event {
                    debug!("Call {} connection state {:?}", inner.session_id, state);
                    inner.connection_tx.send_replace(*state);
                }
                if let Some(failure) = FailureType::from_event(&event) {
                    info!("Call {} connection failure: {:?}", inner.session_id, failure);
                    inner.spawn(inner.clone().recover_from(failure));
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Call {} missed {} engine events", inner.session_id, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_answers(inner: Arc<SessionInner>, mut answers: futures::stream::BoxStream<'static, AnswerMessage>) {
    loop {
        let answer = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            answer = answers.next() => answer,
        };
        match answer {
            Some(answer) => inner.apply_answer(answer).await,
            None => break,
        }
    }
}

async fn run_offers(inner: Arc<SessionInner>, mut offers: futures::stream::BoxStream<'static, OfferMessage>) {
    loop {
        let offer = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            offer = offers.next() => offer,
        };
        match offer {
            Some(offer) => inner.answer_renegotiation(offer).await,
            None => break,
        }
    }
}

async fn run_remote_candidates(
    inner: Arc<SessionInner>,
    mut remote: futures::stream::BoxStream<'static, IceCandidateMessage>,
) {
    loop {
        let candidate = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            candidate = remote.next() => candidate,
        };
        match candidate {
            Some(candidate) => inner.apply_remote_candidate(candidate).await,
            None => break,
        }
    }
}

async fn run_quality_monitor(inner: Arc<SessionInner>) {
    let mut ticker = tokio::time::interval(inner.stats_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sampler = StatsSampler::new();

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match inner.engine.stats().await {
            Ok(snapshot) => {
                let report = sampler.sample(&snapshot, Instant::now());
                debug!(
                    "Call {} quality {} ({})",
                    inner.session_id,
                    report.quality_score(),
                    report.quality_state().as_str()
                );
                inner.quality_tx.send_replace(Some(report));
            }
            Err(e) => {
                debug!("Stats unavailable for call {}: {}", inner.session_id, e);
                sampler.reset();
            }
        }
    }
}
