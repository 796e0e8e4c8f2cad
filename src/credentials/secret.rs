//! Locally generated TURN REST credentials
//!
//! Username is `<unix expiry>:<session>`, password is the base64 HMAC-SHA1
//! of the username keyed with the secret shared with the TURN server.

use super::{Credential, CredentialError, CredentialFetcher};
use crate::config::TurnConfig;
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

pub struct SharedSecretFetcher {
    config: TurnConfig,
}

impl SharedSecretFetcher {
    pub fn new(config: TurnConfig) -> Self {
        Self { config }
    }

    /// Credential valid until `now_unix + ttl`
    pub fn generate(&self, session_id: &str, now_unix: u64) -> Result<Credential, CredentialError> {
        if self.config.shared_secret.is_empty() {
            return Err(CredentialError::NotConfigured("TURN shared secret not set".to_string()));
        }
        if self.config.server.is_empty() {
            return Err(CredentialError::NotConfigured("TURN server not set".to_string()));
        }

        let ttl = self.config.credential_ttl_secs;
        let expiry = now_unix + u64::from(ttl);
        let username = format!("{}:{}", expiry, session_id);
        let password = hmac_sha1_base64(&self.config.shared_secret, &username)?;

        let server = &self.config.server;
        let server_uris = vec![
            format!("turn:{}:{}?transport=udp", server, self.config.port),
            format!("turn:{}:{}?transport=tcp", server, self.config.port),
            format!("turns:{}:{}?transport=tcp", server, self.config.tls_port),
        ];

        Ok(Credential {
            username,
            secret: password,
            ttl_seconds: ttl,
            server_uris,
        })
    }
}

#[async_trait]
impl CredentialFetcher for SharedSecretFetcher {
    async fn fetch(&self, session_id: &str) -> Result<Credential, CredentialError> {
        let now_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.generate(session_id, now_unix)
    }
}

fn hmac_sha1_base64(secret: &str, message: &str) -> Result<String, CredentialError> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .map_err(|e| CredentialError::NotConfigured(format!("invalid TURN secret: {}", e)))?;
    mac.update(message.as_bytes());
    let result = mac.finalize().into_bytes();
    Ok(base64::engine::general_purpose::STANDARD.encode(result))
}
