//! TURN/STUN credentials
//!
//! This module provides:
//! - The [`Credential`] value handed to the peer-connection engine
//! - The [`CredentialFetcher`] seam for network round trips
//! - A TTL-aware [`CredentialCache`] with background refresh
//! - Fetchers for the HTTP credential API, shared-secret TURN REST
//!   credentials and a STUN-only fallback

pub mod cache;
pub mod http;
pub mod secret;

pub use cache::CredentialCache;
pub use http::HttpCredentialFetcher;
pub use secret::SharedSecretFetcher;

use crate::config::TurnConfig;
use crate::engine::IceServer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// TURN/STUN credential as served by the credential API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    #[serde(rename = "password")]
    pub secret: String,
    #[serde(rename = "ttl")]
    pub ttl_seconds: u32,
    #[serde(rename = "uris")]
    pub server_uris: Vec<String>,
}

impl Credential {
    /// STUN-only credential used when no relay is available
    pub fn stun_only(stun_urls: &[String]) -> Self {
        Self {
            username: String::new(),
            secret: String::new(),
            ttl_seconds: STUN_ONLY_TTL_SECS,
            server_uris: stun_urls.to_vec(),
        }
    }

    /// One ICE server per URI; empty username/secret are omitted
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let username = (!self.username.is_empty()).then(|| self.username.clone());
        let credential = (!self.secret.is_empty()).then(|| self.secret.clone());
        self.server_uris
            .iter()
            .map(|url| IceServer {
                urls: vec![url.clone()],
                username: username.clone(),
                credential: credential.clone(),
            })
            .collect()
    }
}

const STUN_ONLY_TTL_SECS: u32 = 3600;

/// Credential fetch errors
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("Invalid TURN API URL: {0}")]
    InvalidUrl(String),
    #[error("Unauthorized to access TURN credential API")]
    Unauthorized,
    #[error("TURN credentials not found")]
    NotFound,
    #[error("TURN server error: HTTP {0}")]
    Server(u16),
    #[error("Failed to decode TURN credentials: {0}")]
    Decode(String),
    #[error("Failed to fetch TURN credentials: {0}")]
    FetchFailed(String),
    #[error("TURN credentials not configured: {0}")]
    NotConfigured(String),
}

/// Performs the round trip that produces fresh credentials.
///
/// Implementations may retry internally; the cache treats one call as one
/// atomic fetch.
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn fetch(&self, session_id: &str) -> Result<Credential, CredentialError>;
}

/// Serves STUN-only credentials without any network access
pub struct StunOnlyFetcher {
    stun_urls: Vec<String>,
}

impl StunOnlyFetcher {
    pub fn new(stun_urls: Vec<String>) -> Self {
        Self { stun_urls }
    }
}

#[async_trait]
impl CredentialFetcher for StunOnlyFetcher {
    async fn fetch(&self, _session_id: &str) -> Result<Credential, CredentialError> {
        if self.stun_urls.is_empty() {
            return Err(CredentialError::NotConfigured("no STUN servers".to_string()));
        }
        Ok(Credential::stun_only(&self.stun_urls))
    }
}

/// Pick a fetcher: HTTP API, then shared secret, then STUN-only
pub fn fetcher_from_config(config: &TurnConfig) -> Arc<dyn CredentialFetcher> {
    if !config.api_url.is_empty() {
        log::info!("Using TURN credential API at {}", config.api_url);
        Arc::new(HttpCredentialFetcher::new(config.clone()))
    } else if !config.shared_secret.is_empty() {
        log::info!("Generating TURN REST credentials for {}", config.server);
        Arc::new(SharedSecretFetcher::new(config.clone()))
    } else {
        log::info!("No TURN source configured, using STUN only");
        Arc::new(StunOnlyFetcher::new(config.stun_urls.clone()))
    }
}
