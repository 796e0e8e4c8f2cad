//! Peer-connection engine interface
//!
//! The call core drives a WebRTC engine through [`PeerConnectionEngine`]:
//! - SDP offer/answer creation and description exchange
//! - ICE candidate addition and ICE restart
//! - Local media capture
//! - Connection-state and local-candidate notifications over a broadcast channel
//! - Periodic statistics snapshots for quality assessment

#[cfg(feature = "webrtc-engine")]
pub mod rtc;

#[cfg(test)]
pub(crate) mod mock;

use crate::quality::StatsSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Engine errors
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Peer connection creation failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// SDP processing failed
    #[error("SDP error: {0}")]
    SdpError(String),
    /// ICE candidate processing failed
    #[error("ICE error: {0}")]
    IceError(String),
    /// Media track error
    #[error("Media error: {0}")]
    MediaError(String),
    /// Operation requires an initialized connection
    #[error("Peer connection not initialized")]
    NotInitialized,
    /// Stats collection failed
    #[error("Stats error: {0}")]
    StatsError(String),
}

/// Connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, awaiting offer/answer
    New,
    /// ICE in progress
    Connecting,
    /// Media flowing
    Connected,
    /// Transient loss of connectivity
    Disconnected,
    /// ICE/DTLS failed
    Failed,
    /// Intentionally terminated
    Closed,
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP payload, opaque to the call core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate line with its media section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
    pub candidate: String,
}

/// STUN/TURN server entry handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Notifications emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Aggregate peer connection state changed
    StateChanged(ConnectionState),
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    /// The relay rejected our credentials; not recoverable by retrying
    AuthenticationFailed(String),
}

/// WebRTC engine as seen by the call core.
///
/// Implementations own the native peer connection. `generation` changes every
/// time the underlying connection is recreated or closed, so callers holding
/// on to a failure notification can tell whether it still refers to the live
/// connection.
#[async_trait]
pub trait PeerConnectionEngine: Send + Sync {
    /// Create the peer connection with the given ICE servers
    async fn initialize(&self, session_id: &str, ice_servers: Vec<IceServer>) -> Result<(), EngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Attach local audio/video tracks
    async fn start_local_capture(&self) -> Result<(), EngineError>;

    async fn stop_local_capture(&self) -> Result<(), EngineError>;

    /// Re-run ICE on the existing connection; returns the restart offer, already
    /// applied as local description
    async fn restart_ice(&self) -> Result<SessionDescription, EngineError>;

    /// Tear down and recreate the connection with fresh ICE servers
    async fn rebuild(&self, ice_servers: Vec<IceServer>) -> Result<(), EngineError>;

    /// Current statistics snapshot
    async fn stats(&self) -> Result<StatsSnapshot, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;

    /// Subscribe to engine notifications
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// Identity of the current underlying connection
    fn generation(&self) -> u64;
}
