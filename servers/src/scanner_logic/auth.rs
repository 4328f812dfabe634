//! JWT verification against the issuer's published JWKS.
//!
//! Keys are fetched from the well-known endpoint and cached; the cache is
//! refreshed when it goes stale or when a token references an unknown `kid`
//! (key rotation). If the endpoint is unreachable the cached keys keep
//! serving until a token needs a key we have never seen.

use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::scanner_logic::config::Config;

#[derive(Debug, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[allow(dead_code)]
    pub exp: usize,
}

/// The identity attached to a connection. `subject` is `None` only when
/// authentication is disabled by configuration.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authentication token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("signing keys unavailable: {0}")]
    KeysUnavailable(String),
}

impl AuthError {
    /// WebSocket close code for handshake failures.
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::MissingToken => 4001,
            AuthError::InvalidToken(_) | AuthError::KeysUnavailable(_) => 4003,
        }
    }
}

struct CachedKeys {
    set: JwkSet,
    fetched_at: Instant,
}

pub struct Authenticator {
    enabled: bool,
    jwks_url: String,
    refresh_after: Duration,
    http: reqwest::Client,
    keys: RwLock<Option<CachedKeys>>,
}

impl Authenticator {
    pub fn new(config: &Config) -> Self {
        let enabled = config.auth_enabled && config.jwks_url.is_some();
        if config.auth_enabled && config.jwks_url.is_none() {
            log::warn!("SCANNER_JWKS_URL is not set; running with authentication disabled");
        }
        Self {
            enabled,
            jwks_url: config.jwks_url.clone().unwrap_or_default(),
            refresh_after: Duration::from_secs(config.jwks_refresh_secs),
            http: reqwest::Client::new(),
            keys: RwLock::new(None),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Handshake entry point: maps an absent token to the 4001 policy close.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Principal, AuthError> {
        if !self.enabled {
            return Ok(Principal { subject: None });
        }
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.verify(token).await
    }

    /// Verifies a JWT and returns its principal. Also used for the
    /// `refresh_token` message, where failure must not close the connection.
    pub async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if !self.enabled {
            return Ok(Principal { subject: None });
        }

        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("token header missing kid".into()))?;

        let jwk = self.key_for(&kid).await?;
        let key =
            DecodingKey::from_jwk(&jwk).map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let validation = Validation::new(Algorithm::RS256);
        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        Ok(Principal {
            subject: Some(data.claims.sub),
        })
    }

    async fn key_for(&self, kid: &str) -> Result<Jwk, AuthError> {
        {
            let cached = self.keys.read().await;
            if let Some(cached) = cached.as_ref() {
                if cached.fetched_at.elapsed() < self.refresh_after {
                    if let Some(jwk) = cached.set.find(kid) {
                        return Ok(jwk.clone());
                    }
                }
            }
        }

        // Stale cache or unknown kid: refetch the set.
        match self.fetch_keys().await {
            Ok(set) => {
                let jwk = set.find(kid).cloned();
                let mut cached = self.keys.write().await;
                *cached = Some(CachedKeys {
                    set,
                    fetched_at: Instant::now(),
                });
                jwk.ok_or_else(|| AuthError::InvalidToken("unknown signing key".into()))
            }
            Err(reason) => {
                // Degrade to whatever we still hold rather than failing hard.
                let cached = self.keys.read().await;
                if let Some(cached) = cached.as_ref() {
                    if let Some(jwk) = cached.set.find(kid) {
                        log::warn!(
                            "JWKS refresh failed ({}); verifying against cached keys",
                            reason
                        );
                        return Ok(jwk.clone());
                    }
                }
                log::warn!("JWKS endpoint unreachable: {}", reason);
                Err(AuthError::KeysUnavailable(reason))
            }
        }
    }

    async fn fetch_keys(&self) -> Result<JwkSet, String> {
        let response = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        response.json::<JwkSet>().await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn test_config(auth_enabled: &str, jwks: Option<&str>) -> Config {
        let mut args = vec![
            "server_scanner".to_string(),
            format!("--auth-enabled={}", auth_enabled),
        ];
        if let Some(url) = jwks {
            args.push(format!("--jwks-url={}", url));
        }
        Config::try_parse_from(args).unwrap()
    }

    #[tokio::test]
    async fn disabled_auth_yields_anonymous_principal() {
        let auth = Authenticator::new(&test_config("false", None));
        let principal = auth.authenticate(None).await.unwrap();
        assert!(principal.subject.is_none());
        // Even garbage tokens pass through when auth is off.
        let principal = auth.authenticate(Some("not-a-jwt")).await.unwrap();
        assert!(principal.subject.is_none());
    }

    #[tokio::test]
    async fn missing_jwks_url_disables_auth() {
        let auth = Authenticator::new(&test_config("true", None));
        assert!(!auth.enabled());
    }

    #[tokio::test]
    async fn missing_token_maps_to_policy_close_4001() {
        let auth = Authenticator::new(&test_config("true", Some("https://issuer/jwks.json")));
        let err = auth.authenticate(None).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingToken));
        assert_eq!(err.close_code(), 4001);

        let err = auth.authenticate(Some("")).await.unwrap_err();
        assert_eq!(err.close_code(), 4001);
    }

    #[tokio::test]
    async fn malformed_token_maps_to_4003() {
        let auth = Authenticator::new(&test_config("true", Some("https://issuer/jwks.json")));
        let err = auth.authenticate(Some("not-a-jwt")).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
        assert_eq!(err.close_code(), 4003);
    }
}
