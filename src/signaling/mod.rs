//! Call signaling
//!
//! Offers, answers and ICE candidates are exchanged through a document store
//! addressed by session id. Messages are JSON objects tagged by `type`:
//!
//! ```json
//! {"type":"offer","sessionId":"abc","sdp":"v=0...","callerId":"alice","timestamp":1737910400000}
//! ```

pub mod memory;

pub use memory::MemorySignaling;

use crate::credentials::Credential;
use crate::engine::{IceCandidate, SessionDescription};
use crate::quality::unix_millis;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signaling errors
#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    #[error("Invalid signaling message: {0}")]
    InvalidMessage(String),
    #[error("Signaling transport error: {0}")]
    Transport(String),
}

/// SDP offer from the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferMessage {
    pub session_id: String,
    pub sdp: String,
    pub caller_id: String,
    pub timestamp: u64,
}

impl OfferMessage {
    pub fn new(session_id: &str, sdp: impl Into<String>, caller_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            sdp: sdp.into(),
            caller_id: caller_id.to_string(),
            timestamp: unix_millis(),
        }
    }

    pub fn description(&self) -> SessionDescription {
        SessionDescription::offer(self.sdp.clone())
    }
}

/// SDP answer from the callee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerMessage {
    pub session_id: String,
    pub sdp: String,
    pub callee_id: String,
    pub timestamp: u64,
}

impl AnswerMessage {
    pub fn new(session_id: &str, sdp: impl Into<String>, callee_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            sdp: sdp.into(),
            callee_id: callee_id.to_string(),
            timestamp: unix_millis(),
        }
    }

    pub fn description(&self) -> SessionDescription {
        SessionDescription::answer(self.sdp.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateMessage {
    pub session_id: String,
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    pub sdp_candidate: String,
    pub timestamp: u64,
}

impl IceCandidateMessage {
    pub fn from_candidate(session_id: &str, candidate: &IceCandidate) -> Self {
        Self {
            session_id: session_id.to_string(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            sdp_candidate: candidate.candidate.clone(),
            timestamp: unix_millis(),
        }
    }

    pub fn to_candidate(&self) -> IceCandidate {
        IceCandidate {
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
            candidate: self.sdp_candidate.clone(),
        }
    }
}

/// TURN credentials pushed to the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCredentialMessage {
    pub session_id: String,
    pub username: String,
    pub password: String,
    pub ttl: u32,
    pub urls: Vec<String>,
    pub timestamp: u64,
}

impl TurnCredentialMessage {
    pub fn from_credential(session_id: &str, credential: &Credential) -> Self {
        Self {
            session_id: session_id.to_string(),
            username: credential.username.clone(),
            password: credential.secret.clone(),
            ttl: credential.ttl_seconds,
            urls: credential.server_uris.clone(),
            timestamp: unix_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HangupMessage {
    pub session_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: u64,
}

/// Signaling message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "offer")]
    Offer(OfferMessage),
    #[serde(rename = "answer")]
    Answer(AnswerMessage),
    #[serde(rename = "ice-candidate")]
    IceCandidate(IceCandidateMessage),
    #[serde(rename = "turn-credential")]
    TurnCredential(TurnCredentialMessage),
    #[serde(rename = "hangup")]
    Hangup(HangupMessage),
}

impl SignalingMessage {
    /// Parse a signaling message from JSON
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }

    /// Wire value of the `type` tag
    pub fn message_type(&self) -> &'static str {
        match self {
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::IceCandidate(_) => "ice-candidate",
            SignalingMessage::TurnCredential(_) => "turn-credential",
            SignalingMessage::Hangup(_) => "hangup",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SignalingMessage::Offer(m) => &m.session_id,
            SignalingMessage::Answer(m) => &m.session_id,
            SignalingMessage::IceCandidate(m) => &m.session_id,
            SignalingMessage::TurnCredential(m) => &m.session_id,
            SignalingMessage::Hangup(m) => &m.session_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            SignalingMessage::Offer(m) => m.timestamp,
            SignalingMessage::Answer(m) => m.timestamp,
            SignalingMessage::IceCandidate(m) => m.timestamp,
            SignalingMessage::TurnCredential(m) => m.timestamp,
            SignalingMessage::Hangup(m) => m.timestamp,
        }
    }
}

/// Session-addressed document store used for signaling.
///
/// Observers are realtime: they yield the current value (if any) and then
/// every later write, and end when the session is deleted.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send_offer(&self, session_id: &str, offer: OfferMessage) -> Result<(), SignalingError>;

    async fn send_answer(&self, session_id: &str, answer: AnswerMessage) -> Result<(), SignalingError>;

    async fn send_ice_candidate(
        &self,
        session_id: &str,
        candidate_id: &str,
        candidate: IceCandidateMessage,
    ) -> Result<(), SignalingError>;

    fn observe_offer(&self, session_id: &str) -> BoxStream<'static, OfferMessage>;

    fn observe_answer(&self, session_id: &str) -> BoxStream<'static, AnswerMessage>;

    fn observe_ice_candidates(&self, session_id: &str) -> BoxStream<'static, IceCandidateMessage>;

    /// Remove the session document and its candidates
    async fn delete_session(&self, session_id: &str) -> Result<(), SignalingError>;
}
