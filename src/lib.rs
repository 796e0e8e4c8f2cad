//! webrtclite-core - call core for peer-to-peer WebRTC calls
//!
//! TURN credential caching, reconnection with backoff and call quality
//! scoring, plus the signaling and orchestration glue around them.

pub mod config;
pub mod credentials;
pub mod reconnect;
pub mod quality;
pub mod engine;
pub mod signaling;
pub mod call;

// Re-exports
pub use config::Config;
pub use credentials::{Credential, CredentialCache, CredentialError, CredentialFetcher};
pub use reconnect::{FailureType, ReconnectionCoordinator, ReconnectionState, ReconnectionStrategy};
pub use quality::{calculate_quality_score, quality_state, QualityReport, QualityState};
pub use engine::{EngineEvent, PeerConnectionEngine};
pub use signaling::{MemorySignaling, SignalingMessage, SignalingTransport};
pub use call::{CallError, CallSession};
