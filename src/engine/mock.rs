//! Scripted engine for tests

use super::{
    ConnectionState, EngineError, EngineEvent, IceCandidate, IceServer, PeerConnectionEngine,
    SessionDescription,
};
use crate::quality::StatsSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

#[derive(Default)]
struct MockState {
    calls: Vec<&'static str>,
    initialized: bool,
    capturing: bool,
    ice_servers: Vec<IceServer>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    offers_created: u32,
    fail_restart: bool,
    fail_rebuild: bool,
    fail_initialize: bool,
    stats: StatsSnapshot,
}

pub(crate) struct MockEngine {
    state: Mutex<MockState>,
    events: broadcast::Sender<EngineEvent>,
    generation: AtomicU64,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            state: Mutex::new(MockState::default()),
            events,
            generation: AtomicU64::new(0),
        }
    }

    /// Deliver an event as if the native stack raised it
    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn call_count(&self, name: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == name).count()
    }

    pub(crate) fn set_fail_restart(&self, fail: bool) {
        self.state.lock().fail_restart = fail;
    }

    pub(crate) fn set_fail_rebuild(&self, fail: bool) {
        self.state.lock().fail_rebuild = fail;
    }

    pub(crate) fn set_fail_initialize(&self, fail: bool) {
        self.state.lock().fail_initialize = fail;
    }

    pub(crate) fn set_stats(&self, stats: StatsSnapshot) {
        self.state.lock().stats = stats;
    }

    pub(crate) fn ice_servers(&self) -> Vec<IceServer> {
        self.state.lock().ice_servers.clone()
    }

    pub(crate) fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub(crate) fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub(crate) fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub(crate) fn is_capturing(&self) -> bool {
        self.state.lock().capturing
    }

    fn record(&self, call: &'static str) -> parking_lot::MutexGuard<'_, MockState> {
        let mut state = self.state.lock();
        state.calls.push(call);
        state
    }

    fn next_offer(state: &mut MockState, label: &str) -> SessionDescription {
        state.offers_created += 1;
        SessionDescription::offer(format!("v=0 {}-{}", label, state.offers_created))
    }
}

#[async_trait]
impl PeerConnectionEngine for MockEngine {
    async fn initialize(&self, _session_id: &str, ice_servers: Vec<IceServer>) -> Result<(), EngineError> {
        let mut state = self.record("initialize");
        if state.fail_initialize {
            return Err(EngineError::ConnectionFailed("scripted failure".to_string()));
        }
        state.initialized = true;
        state.ice_servers = ice_servers;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let mut state = self.record("create_offer");
        if !state.initialized {
            return Err(EngineError::NotInitialized);
        }
        Ok(Self::next_offer(&mut state, "offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let state = self.record("create_answer");
        if state.remote.is_none() {
            return Err(EngineError::SdpError("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.record("set_local_description").local = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        let mut state = self.record("set_remote_description");
        if !state.initialized {
            return Err(EngineError::NotInitialized);
        }
        state.remote = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let mut state = self.record("add_ice_candidate");
        if !state.initialized {
            return Err(EngineError::NotInitialized);
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn start_local_capture(&self) -> Result<(), EngineError> {
        self.record("start_local_capture").capturing = true;
        Ok(())
    }

    async fn stop_local_capture(&self) -> Result<(), EngineError> {
        self.record("stop_local_capture").capturing = false;
        Ok(())
    }

    async fn restart_ice(&self) -> Result<SessionDescription, EngineError> {
        let mut state = self.record("restart_ice");
        if state.fail_restart {
            return Err(EngineError::IceError("scripted restart failure".to_string()));
        }
        let offer = Self::next_offer(&mut state, "restart");
        state.local = Some(offer.clone());
        Ok(offer)
    }

    async fn rebuild(&self, ice_servers: Vec<IceServer>) -> Result<(), EngineError> {
        let mut state = self.record("rebuild");
        if state.fail_rebuild {
            return Err(EngineError::ConnectionFailed("scripted rebuild failure".to_string()));
        }
        state.ice_servers = ice_servers;
        state.local = None;
        state.remote = None;
        state.remote_candidates.clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self) -> Result<StatsSnapshot, EngineError> {
        Ok(self.state.lock().stats.clone())
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut state = self.record("close");
        state.initialized = false;
        state.capturing = false;
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(EngineEvent::StateChanged(ConnectionState::Closed));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
