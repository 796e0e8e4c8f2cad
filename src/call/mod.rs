//! Call orchestration
//!
//! Use cases sequence credentials, engine and signaling for one step of a
//! call; [`CallSession`] wires them together for the lifetime of a call and
//! feeds engine failures into the reconnection coordinator.

pub mod session;
pub mod usecases;

pub use session::{CallRole, CallSession};
pub use usecases::{AddIceCandidateUseCase, AnswerCallUseCase, CreateOfferUseCase, EndCallUseCase};

use crate::credentials::CredentialError;
use crate::engine::EngineError;
use crate::signaling::SignalingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("Call already started")]
    AlreadyStarted,

    #[error("Call has ended")]
    Ended,

    #[error("Signaling session closed before an offer arrived")]
    NoOffer,

    #[error("Connection did not recover within {0:?}")]
    RecoveryTimedOut(std::time::Duration),
}
