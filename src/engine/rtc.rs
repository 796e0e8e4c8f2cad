//! webrtc-rs backed engine
//!
//! Owns one `RTCPeerConnection` at a time. Local capture adds an Opus audio and
//! a VP8 video sample track; the application pushes media through
//! [`RtcEngine::audio_track`] and [`RtcEngine::video_track`].

use super::{
    ConnectionState, EngineError, EngineEvent, IceCandidate, IceServer, PeerConnectionEngine,
    SessionDescription, SdpType,
};
use crate::quality::StatsSnapshot;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const STREAM_ID: &str = "webrtclite";

struct Connection {
    pc: Arc<RTCPeerConnection>,
    senders: Vec<Arc<RTCRtpSender>>,
}

pub struct RtcEngine {
    api: API,
    connection: Mutex<Option<Connection>>,
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    capturing: Mutex<bool>,
    events: broadcast::Sender<EngineEvent>,
    generation: Arc<AtomicU64>,
}

impl RtcEngine {
    pub fn new() -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            format!("audio-{}", uuid::Uuid::new_v4()),
            STREAM_ID.to_string(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("video-{}", uuid::Uuid::new_v4()),
            STREAM_ID.to_string(),
        ));

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            api,
            connection: Mutex::new(None),
            audio,
            video,
            capturing: Mutex::new(false),
            events,
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        self.audio.clone()
    }

    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        self.video.clone()
    }

    async fn peer(&self) -> Result<Arc<RTCPeerConnection>, EngineError> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.pc.clone())
            .ok_or(EngineError::NotInitialized)
    }

    /// Create a peer connection and wire its callbacks to the event channel
    async fn create_connection(&self, ice_servers: Vec<IceServer>, capturing: bool) -> Result<Connection, EngineError> {
        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .into_iter()
                .map(|server| RTCIceServer {
                    urls: server.urls,
                    username: server.username.unwrap_or_default(),
                    credential: server.credential.unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| EngineError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?,
        );

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let events = self.events.clone();
        let current = self.generation.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            let current = current.clone();
            Box::pin(async move {
                if current.load(Ordering::SeqCst) != generation {
                    return;
                }
                debug!("Peer connection state: {}", state);
                let _ = events.send(EngineEvent::StateChanged(map_state(state)));
            })
        }));

        let events = self.events.clone();
        let current = self.generation.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events.clone();
            let current = current.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                if current.load(Ordering::SeqCst) != generation {
                    return;
                }
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(EngineEvent::LocalCandidate(IceCandidate {
                            sdp_mid: init.sdp_mid.unwrap_or_default(),
                            sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                            candidate: init.candidate,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let mut connection = Connection { pc, senders: Vec::new() };
        if capturing {
            self.attach_tracks(&mut connection).await?;
        }
        Ok(connection)
    }

    async fn attach_tracks(&self, connection: &mut Connection) -> Result<(), EngineError> {
        let tracks: [Arc<dyn TrackLocal + Send + Sync>; 2] = [self.audio.clone(), self.video.clone()];
        for track in tracks {
            let sender = connection
                .pc
                .add_track(track)
                .await
                .map_err(|e| EngineError::MediaError(format!("Failed to add track: {}", e)))?;
            connection.senders.push(sender);
        }
        Ok(())
    }

    fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
        match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| EngineError::SdpError(format!("Invalid SDP: {}", e)))
    }
}

/// Lost and received must come from the same stream's report
fn add_stream_loss(snapshot: &mut StatsSnapshot, packets_received: u64, packets_lost: i64) {
    snapshot.packets_received += packets_received;
    // Duplicates can drive the cumulative lost counter negative
    snapshot.packets_lost += packets_lost.max(0) as u64;
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

#[async_trait]
impl PeerConnectionEngine for RtcEngine {
    async fn initialize(&self, session_id: &str, ice_servers: Vec<IceServer>) -> Result<(), EngineError> {
        // Lock order: capturing, then connection
        let capturing = *self.capturing.lock().await;
        let mut slot = self.connection.lock().await;
        if let Some(old) = slot.take() {
            if let Err(e) = old.pc.close().await {
                warn!("Failed to close previous peer connection: {}", e);
            }
        }
        info!("Creating peer connection for session {} with {} ICE servers", session_id, ice_servers.len());
        *slot = Some(self.create_connection(ice_servers, capturing).await?);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .peer()
            .await?
            .create_offer(None)
            .await
            .map_err(|e| EngineError::SdpError(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .peer()
            .await?
            .create_answer(None)
            .await
            .map_err(|e| EngineError::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        let description = Self::to_rtc_description(description)?;
        self.peer()
            .await?
            .set_local_description(description)
            .await
            .map_err(|e| EngineError::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        let description = Self::to_rtc_description(description)?;
        self.peer()
            .await?
            .set_remote_description(description)
            .await
            .map_err(|e| EngineError::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.peer()
            .await?
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::IceError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn start_local_capture(&self) -> Result<(), EngineError> {
        let mut capturing = self.capturing.lock().await;
        if *capturing {
            return Ok(());
        }
        let mut slot = self.connection.lock().await;
        let connection = slot.as_mut().ok_or(EngineError::NotInitialized)?;
        self.attach_tracks(connection).await?;
        *capturing = true;
        Ok(())
    }

    async fn stop_local_capture(&self) -> Result<(), EngineError> {
        let mut capturing = self.capturing.lock().await;
        *capturing = false;
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_mut() {
            for sender in connection.senders.drain(..) {
                if let Err(e) = connection.pc.remove_track(&sender).await {
                    warn!("Failed to remove track: {}", e);
                }
            }
        }
        Ok(())
    }

    async fn restart_ice(&self) -> Result<SessionDescription, EngineError> {
        let pc = self.peer().await?;
        let options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };
        let offer = pc
            .create_offer(Some(options))
            .await
            .map_err(|e| EngineError::IceError(format!("Failed to create ICE restart offer: {}", e)))?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer)
            .await
            .map_err(|e| EngineError::SdpError(format!("Failed to set local description: {}", e)))?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn rebuild(&self, ice_servers: Vec<IceServer>) -> Result<(), EngineError> {
        let capturing = *self.capturing.lock().await;
        let mut slot = self.connection.lock().await;
        if let Some(old) = slot.take() {
            if let Err(e) = old.pc.close().await {
                warn!("Failed to close previous peer connection: {}", e);
            }
        }
        info!("Rebuilding peer connection with {} ICE servers", ice_servers.len());
        *slot = Some(self.create_connection(ice_servers, capturing).await?);
        Ok(())
    }

    async fn stats(&self) -> Result<StatsSnapshot, EngineError> {
        let report = self.peer().await?.get_stats().await;
        let mut snapshot = StatsSnapshot::default();

        for stat in report.reports.values() {
            match stat {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    snapshot.rtt_secs = snapshot.rtt_secs.max(pair.current_round_trip_time);
                }
                StatsReportType::InboundRTP(inbound) => {
                    snapshot.bytes_received += inbound.bytes_received;
                }
                StatsReportType::OutboundRTP(outbound) => {
                    snapshot.bytes_sent += outbound.bytes_sent;
                }
                // Inbound reports carry no lost counter, so loss comes from
                // the peer's receiver reports on our streams
                StatsReportType::RemoteInboundRTP(remote) => {
                    add_stream_loss(&mut snapshot, remote.packets_received, remote.packets_lost);
                }
                _ => {}
            }
        }

        Ok(snapshot)
    }

    async fn close(&self) -> Result<(), EngineError> {
        let connection = self.connection.lock().await.take();
        // Invalidate callbacks of the closed connection
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(connection) = connection {
            connection
                .pc
                .close()
                .await
                .map_err(|e| EngineError::ConnectionFailed(format!("Failed to close connection: {}", e)))?;
            let _ = self.events.send(EngineEvent::StateChanged(ConnectionState::Closed));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
