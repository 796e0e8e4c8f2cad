//! HTTP client for the TURN credential API
//!
//! `GET {api_url}/turn/credentials?session=<id>&service=turn`, answered with
//! `{"username", "password", "ttl", "uris"}`. `ureq` is blocking, so every
//! request runs inside `spawn_blocking`.

use super::{Credential, CredentialError, CredentialFetcher};
use crate::config::TurnConfig;
use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;

pub struct HttpCredentialFetcher {
    config: TurnConfig,
    agent: ureq::Agent,
}

impl HttpCredentialFetcher {
    pub fn new(config: TurnConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .build()
            .into();
        Self { config, agent }
    }

    fn endpoint(&self) -> Result<String, CredentialError> {
        let base = self.config.api_url.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(CredentialError::InvalidUrl(self.config.api_url.clone()));
        }
        Ok(format!("{}/turn/credentials", base))
    }

    async fn fetch_once(&self, session_id: &str) -> Result<Credential, CredentialError> {
        let url = self.endpoint()?;
        let agent = self.agent.clone();
        let api_key = self.config.api_key.clone();
        let session_id = session_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut request = agent
                .get(&url)
                .query("session", &session_id)
                .query("service", "turn")
                .header("Accept", "application/json");
            if !api_key.is_empty() {
                request = request.header("X-API-Key", api_key.as_str());
            }

            let response = request.call().map_err(map_ureq_error)?;
            let body = response
                .into_body()
                .read_to_string()
                .map_err(|e| CredentialError::FetchFailed(e.to_string()))?;
            parse_credential(&body)
        })
        .await
        .map_err(|e| CredentialError::FetchFailed(format!("request task failed: {}", e)))?
    }
}

#[async_trait]
impl CredentialFetcher for HttpCredentialFetcher {
    async fn fetch(&self, session_id: &str) -> Result<Credential, CredentialError> {
        let attempts = self.config.retry_count.max(1);
        let mut last_error = CredentialError::FetchFailed("max retries exceeded".to_string());

        for attempt in 1..=attempts {
            match self.fetch_once(session_id).await {
                Ok(credential) => {
                    debug!("TURN API returned credentials for session {} (attempt {})", session_id, attempt);
                    return Ok(credential);
                }
                Err(e @ (CredentialError::Unauthorized | CredentialError::InvalidUrl(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!("TURN API attempt {}/{} for session {} failed: {}", attempt, attempts, session_id, e);
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(retry_delay(attempt)).await;
                    }
                }
            }
        }

        if self.config.fallback_to_stun && !self.config.stun_urls.is_empty() {
            warn!("TURN API unavailable for session {}, falling back to STUN only", session_id);
            return Ok(Credential::stun_only(&self.config.stun_urls));
        }

        Err(last_error)
    }
}

/// 2s, 4s, 8s ... between attempts
fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(6))
}

fn map_ureq_error(err: ureq::Error) -> CredentialError {
    match err {
        ureq::Error::StatusCode(code) => status_error(code),
        other => CredentialError::FetchFailed(other.to_string()),
    }
}

fn status_error(code: u16) -> CredentialError {
    match code {
        401 => CredentialError::Unauthorized,
        404 => CredentialError::NotFound,
        500..=599 => CredentialError::Server(code),
        _ => CredentialError::FetchFailed(format!("HTTP {}", code)),
    }
}

fn parse_credential(body: &str) -> Result<Credential, CredentialError> {
    let credential: Credential =
        serde_json::from_str(body).map_err(|e| CredentialError::Decode(e.to_string()))?;
    if credential.server_uris.is_empty() {
        return Err(CredentialError::Decode("credential has no server URIs".to_string()));
    }
    Ok(credential)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(status_error(401), CredentialError::Unauthorized));
        assert!(matches!(status_error(404), CredentialError::NotFound));
        assert!(matches!(status_error(503), CredentialError::Server(503)));
        assert!(matches!(status_error(418), CredentialError::FetchFailed(_)));
    }

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(2), Duration::from_secs(4));
        assert_eq!(retry_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_parse_rejects_empty_uris() {
        let body = r#"{"username":"u","password":"p","ttl":600,"uris":[]}"#;
        assert!(matches!(parse_credential(body), Err(CredentialError::Decode(_))));
        assert!(matches!(parse_credential("not json"), Err(CredentialError::Decode(_))));
    }

    #[test]
    fn test_endpoint_requires_http_scheme() {
        let mut config = TurnConfig::default();
        config.api_url = "turn.example.com/api".to_string();
        let fetcher = HttpCredentialFetcher::new(config.clone());
        assert!(matches!(fetcher.endpoint(), Err(CredentialError::InvalidUrl(_))));

        config.api_url = "https://turn.example.com/api/".to_string();
        let fetcher = HttpCredentialFetcher::new(config);
        assert_eq!(fetcher.endpoint().unwrap(), "https://turn.example.com/api/turn/credentials");
    }

    #[tokio::test]
    async fn test_invalid_url_is_not_retried_or_masked() {
        let mut config = TurnConfig::default();
        config.api_url = "ftp://turn.example.com".to_string();
        let fetcher = HttpCredentialFetcher::new(config);
        assert!(matches!(fetcher.fetch("abc").await, Err(CredentialError::InvalidUrl(_))));
    }
}
