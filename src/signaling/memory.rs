//! In-process signaling store
//!
//! Mirrors the hosted layout: one `sessions/{id}` document holding `offer`
//! and `answer`, plus an `ice_candidates` collection keyed by candidate id.
//! Both peers of a call share one `MemorySignaling` (it is `Clone`).

use super::{AnswerMessage, IceCandidateMessage, OfferMessage, SignalingError, SignalingTransport};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

const CANDIDATE_CHANNEL_CAPACITY: usize = 64;

struct SessionDocument {
    offer: watch::Sender<Option<OfferMessage>>,
    answer: watch::Sender<Option<AnswerMessage>>,
    /// Insertion ordered, keyed by candidate id
    ice_candidates: Vec<(String, IceCandidateMessage)>,
    candidate_tx: broadcast::Sender<IceCandidateMessage>,
}

impl SessionDocument {
    fn new() -> Self {
        let (offer, _) = watch::channel(None);
        let (answer, _) = watch::channel(None);
        let (candidate_tx, _) = broadcast::channel(CANDIDATE_CHANNEL_CAPACITY);
        Self {
            offer,
            answer,
            ice_candidates: Vec::new(),
            candidate_tx,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemorySignaling {
    sessions: Arc<Mutex<HashMap<String, SessionDocument>>>,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_document<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionDocument) -> R) -> R {
        let mut sessions = self.sessions.lock();
        let doc = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionDocument::new);
        f(doc)
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    /// Stored offer, if any
    pub fn offer(&self, session_id: &str) -> Option<OfferMessage> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|doc| doc.offer.borrow().clone())
    }

    pub fn answer(&self, session_id: &str) -> Option<AnswerMessage> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|doc| doc.answer.borrow().clone())
    }

    pub fn candidate_ids(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|doc| doc.ice_candidates.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }
}

fn check_session(session_id: &str, message_session: &str) -> Result<(), SignalingError> {
    if session_id.is_empty() {
        return Err(SignalingError::Transport("empty session id".to_string()));
    }
    if session_id != message_session {
        return Err(SignalingError::InvalidMessage(format!(
            "message for session {} written to {}",
            message_session, session_id
        )));
    }
    Ok(())
}

/// Current value, then every change; ends when the sender is dropped
fn watch_stream<T>(rx: watch::Receiver<Option<T>>) -> BoxStream<'static, T>
where
    T: Clone + Send + Sync + 'static,
{
    stream::unfold((rx, true), |(mut rx, first)| async move {
        let mut first = first;
        loop {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            first = false;
            let value = rx.borrow_and_update().clone();
            if let Some(value) = value {
                return Some((value, (rx, false)));
            }
        }
    })
    .boxed()
}

fn candidate_stream(
    existing: Vec<IceCandidateMessage>,
    rx: broadcast::Receiver<IceCandidateMessage>,
) -> BoxStream<'static, IceCandidateMessage> {
    let live = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(candidate) => return Some((candidate, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("ICE candidate observer lagged, skipped {} candidates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    stream::iter(existing).chain(live).boxed()
}

#[async_trait]
impl SignalingTransport for MemorySignaling {
    async fn send_offer(&self, session_id: &str, offer: OfferMessage) -> Result<(), SignalingError> {
        check_session(session_id, &offer.session_id)?;
        debug!("Writing offer for session {}", session_id);
        self.with_document(session_id, |doc| {
            doc.offer.send_replace(Some(offer));
        });
        Ok(())
    }

    async fn send_answer(&self, session_id: &str, answer: AnswerMessage) -> Result<(), SignalingError> {
        check_session(session_id, &answer.session_id)?;
        debug!("Writing answer for session {}", session_id);
        self.with_document(session_id, |doc| {
            doc.answer.send_replace(Some(answer));
        });
        Ok(())
    }

    async fn send_ice_candidate(
        &self,
        session_id: &str,
        candidate_id: &str,
        candidate: IceCandidateMessage,
    ) -> Result<(), SignalingError> {
        check_session(session_id, &candidate.session_id)?;
        debug!("Writing ICE candidate {} for session {}", candidate_id, session_id);
        self.with_document(session_id, |doc| {
            match doc.ice_candidates.iter_mut().find(|(id, _)| id == candidate_id) {
                Some((_, slot)) => *slot = candidate.clone(),
                None => doc
                    .ice_candidates
                    .push((candidate_id.to_string(), candidate.clone())),
            }
            // No observers is not an error
            let _ = doc.candidate_tx.send(candidate);
        });
        Ok(())
    }

    fn observe_offer(&self, session_id: &str) -> BoxStream<'static, OfferMessage> {
        let rx = self.with_document(session_id, |doc| doc.offer.subscribe());
        watch_stream(rx)
    }

    fn observe_answer(&self, session_id: &str) -> BoxStream<'static, AnswerMessage> {
        let rx = self.with_document(session_id, |doc| doc.answer.subscribe());
        watch_stream(rx)
    }

    fn observe_ice_candidates(&self, session_id: &str) -> BoxStream<'static, IceCandidateMessage> {
        let (existing, rx) = self.with_document(session_id, |doc| {
            let existing: Vec<IceCandidateMessage> =
                doc.ice_candidates.iter().map(|(_, c)| c.clone()).collect();
            (existing, doc.candidate_tx.subscribe())
        });
        candidate_stream(existing, rx)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), SignalingError> {
        // Dropping the document closes every observer
        if self.sessions.lock().remove(session_id).is_some() {
            debug!("Deleted signaling session {}", session_id);
        }
        Ok(())
    }
}
