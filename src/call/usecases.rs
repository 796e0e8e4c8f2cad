//! Single-step call flows

use super::CallError;
use crate::credentials::CredentialCache;
use crate::engine::{IceCandidate, PeerConnectionEngine, SessionDescription};
use crate::signaling::{AnswerMessage, IceCandidateMessage, OfferMessage, SignalingTransport};
use log::{debug, info};
use std::sync::Arc;

/// Caller side: credentials, connection, capture, offer, signal
pub struct CreateOfferUseCase {
    engine: Arc<dyn PeerConnectionEngine>,
    signaling: Arc<dyn SignalingTransport>,
    credentials: CredentialCache,
}

impl CreateOfferUseCase {
    pub fn new(
        engine: Arc<dyn PeerConnectionEngine>,
        signaling: Arc<dyn SignalingTransport>,
        credentials: CredentialCache,
    ) -> Self {
        Self { engine, signaling, credentials }
    }

    pub async fn execute(&self, session_id: &str, caller_id: &str) -> Result<SessionDescription, CallError> {
        let credential = self.credentials.get_credentials(session_id).await?;
        self.engine.initialize(session_id, credential.ice_servers()).await?;
        self.engine.start_local_capture().await?;

        let offer = self.engine.create_offer().await?;
        self.engine.set_local_description(offer.clone()).await?;
        self.signaling
            .send_offer(session_id, OfferMessage::new(session_id, offer.sdp.clone(), caller_id))
            .await?;

        info!("Sent offer for session {}", session_id);
        Ok(offer)
    }
}

/// Callee side: credentials, connection, capture, apply offer, answer, signal
pub struct AnswerCallUseCase {
    engine: Arc<dyn PeerConnectionEngine>,
    signaling: Arc<dyn SignalingTransport>,
    credentials: CredentialCache,
}

impl AnswerCallUseCase {
    pub fn new(
        engine: Arc<dyn PeerConnectionEngine>,
        signaling: Arc<dyn SignalingTransport>,
        credentials: CredentialCache,
    ) -> Self {
        Self { engine, signaling, credentials }
    }

    pub async fn execute(
        &self,
        session_id: &str,
        callee_id: &str,
        offer: &OfferMessage,
    ) -> Result<SessionDescription, CallError> {
        let credential = self.credentials.get_credentials(session_id).await?;
        self.engine.initialize(session_id, credential.ice_servers()).await?;
        self.engine.start_local_capture().await?;

        let answer = negotiate_answer(self.engine.as_ref(), offer).await?;
        self.signaling
            .send_answer(session_id, AnswerMessage::new(session_id, answer.sdp.clone(), callee_id))
            .await?;

        info!("Answered offer from {} for session {}", offer.caller_id, session_id);
        Ok(answer)
    }
}

/// Apply a remote offer and produce the local answer
pub(crate) async fn negotiate_answer(
    engine: &dyn PeerConnectionEngine,
    offer: &OfferMessage,
) -> Result<SessionDescription, CallError> {
    engine.set_remote_description(offer.description()).await?;
    let answer = engine.create_answer().await?;
    engine.set_local_description(answer.clone()).await?;
    Ok(answer)
}

/// Trickle ICE in both directions
pub struct AddIceCandidateUseCase {
    engine: Arc<dyn PeerConnectionEngine>,
    signaling: Arc<dyn SignalingTransport>,
}

impl AddIceCandidateUseCase {
    pub fn new(engine: Arc<dyn PeerConnectionEngine>, signaling: Arc<dyn SignalingTransport>) -> Self {
        Self { engine, signaling }
    }

    /// Apply a candidate received from the peer
    pub async fn execute(&self, candidate: &IceCandidateMessage) -> Result<(), CallError> {
        self.engine.add_ice_candidate(candidate.to_candidate()).await?;
        debug!("Added remote ICE candidate for session {}", candidate.session_id);
        Ok(())
    }

    /// Publish a locally gathered candidate; returns its document id
    pub async fn signal_local_candidate(
        &self,
        session_id: &str,
        candidate: &IceCandidate,
    ) -> Result<String, CallError> {
        let candidate_id = uuid::Uuid::new_v4().to_string();
        self.signaling
            .send_ice_candidate(
                session_id,
                &candidate_id,
                IceCandidateMessage::from_candidate(session_id, candidate),
            )
            .await?;
        Ok(candidate_id)
    }
}

/// Teardown: stop capture (graceful only), close, delete the session
pub struct EndCallUseCase {
    engine: Arc<dyn PeerConnectionEngine>,
    signaling: Arc<dyn SignalingTransport>,
}

impl EndCallUseCase {
    pub fn new(engine: Arc<dyn PeerConnectionEngine>, signaling: Arc<dyn SignalingTransport>) -> Self {
        Self { engine, signaling }
    }

    pub async fn execute(&self, session_id: &str, graceful: bool) -> Result<(), CallError> {
        if graceful {
            self.engine.stop_local_capture().await?;
        }
        self.engine.close().await?;
        self.signaling.delete_session(session_id).await?;
        info!("Ended call {} (graceful: {})", session_id, graceful);
        Ok(())
    }
}
