//! JWT-based handshake authentication for the Collaboration Gateway.
//!
//! Clients present a bearer token on the websocket upgrade request; the
//! Gateway validates it here before admitting the connection into a
//! room. Token issuance itself is out of scope — this module only
//! verifies tokens minted by an external identity service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Claims carried by a validated access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the authenticated user's id
    pub sub: Uuid,
    /// Token issuer
    pub iss: String,
    /// Intended audience
    pub aud: String,
    /// Expiry, seconds since epoch
    pub exp: i64,
    /// Issued-at, seconds since epoch
    pub iat: i64,
    /// Display name, surfaced to other participants in a room
    pub name: Option<String>,
}

/// Information about the client derived from a validated token.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Authenticated user id
    pub user_id: Uuid,
    /// Display name, if the token carried one
    pub name: Option<String>,
    /// Token expiry
    pub expires_at: DateTime<Utc>,
}

/// Errors surfaced while verifying a handshake token.
#[derive(Debug, Error)]
pub enum JwtError {
    /// Token failed signature or claim validation
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    /// Token has expired
    #[error("token expired")]
    Expired,

    /// Authorization header missing or malformed
    #[error("missing or malformed authorization header")]
    MissingHeader,
}

/// Issuer/audience/secret configuration for verifying tokens.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// HMAC signing secret shared with the issuing identity service
    pub secret: String,
    /// Expected issuer claim
    pub issuer: String,
    /// Expected audience claim
    pub audience: String,
    /// Leeway, in seconds, applied to expiry checks
    pub leeway: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "change-me-in-production".to_string(),
            issuer: "colab-auth".to_string(),
            audience: "colab-gateway".to_string(),
            leeway: 30,
        }
    }
}

/// Running counters on token verification outcomes.
#[derive(Debug, Default)]
pub struct JwtStatistics {
    verified: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
}

impl JwtStatistics {
    fn record_verified(&self) {
        self.verified.fetch_add(1, Ordering::Relaxed);
    }
    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
    fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Tokens that passed validation.
    pub fn verified(&self) -> u64 {
        self.verified.load(Ordering::Relaxed)
    }
    /// Tokens rejected for any reason other than expiry.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
    /// Tokens rejected specifically for having expired.
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }
}

/// Verifies handshake tokens against a fixed issuer/audience/secret.
pub struct JwtManager {
    config: JwtConfig,
    stats: Arc<JwtStatistics>,
}

impl JwtManager {
    /// Build a manager from `config`.
    pub fn new(config: JwtConfig) -> Self {
        Self {
            config,
            stats: Arc::new(JwtStatistics::default()),
        }
    }

    /// Validate `token`, returning the authenticated client's info.
    pub fn verify(&self, token: &str) -> Result<ClientInfo, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&self.config.audience]);
        validation.set_issuer(&[&self.config.issuer]);
        validation.leeway = self.config.leeway;

        let decoded: Result<TokenData<TokenClaims>, _> = decode(
            token,
            &DecodingKey::from_secret(self.config.secret.as_bytes()),
            &validation,
        );

        match decoded {
            Ok(data) => {
                self.stats.record_verified();
                Ok(ClientInfo {
                    user_id: data.claims.sub,
                    name: data.claims.name,
                    expires_at: DateTime::from_timestamp(data.claims.exp, 0).unwrap_or_else(Utc::now),
                })
            }
            Err(e) if *e.kind() == jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                self.stats.record_expired();
                Err(JwtError::Expired)
            }
            Err(e) => {
                self.stats.record_rejected();
                Err(JwtError::InvalidToken(e))
            }
        }
    }

    /// Extract and verify the bearer token from an `Authorization` header value.
    pub fn verify_header(&self, header_value: &str) -> Result<ClientInfo, JwtError> {
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or(JwtError::MissingHeader)?;
        self.verify(token)
    }

    /// Current verification counters.
    pub fn statistics(&self) -> Arc<JwtStatistics> {
        self.stats.clone()
    }
}

/// Duration before expiry at which a client should be warned to refresh,
/// surfaced to the gateway so it can emit a `document-synced` notice
/// with a renewal hint rather than silently dropping the connection.
pub const TOKEN_REFRESH_WARNING: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn make_token(config: &JwtConfig, exp_offset_secs: i64) -> String {
        let claims = TokenClaims {
            sub: Uuid::new_v4(),
            iss: config.issuer.clone(),
            aud: config.audience.clone(),
            exp: (Utc::now().timestamp() + exp_offset_secs),
            iat: Utc::now().timestamp(),
            name: Some("ada".to_string()),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(config.secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_verify_accepts_valid_token() {
        let config = JwtConfig::default();
        let manager = JwtManager::new(config.clone());
        let token = make_token(&config, 3600);
        let info = manager.verify(&token).unwrap();
        assert_eq!(info.name.as_deref(), Some("ada"));
        assert_eq!(manager.statistics().verified(), 1);
    }

    #[test]
    fn test_verify_rejects_expired_token() {
        let config = JwtConfig::default();
        let manager = JwtManager::new(config.clone());
        let token = make_token(&config, -3600);
        let err = manager.verify(&token).unwrap_err();
        assert!(matches!(err, JwtError::Expired));
        assert_eq!(manager.statistics().expired(), 1);
    }

    #[test]
    fn test_verify_header_requires_bearer_prefix() {
        let manager = JwtManager::new(JwtConfig::default());
        let err = manager.verify_header("Basic abc123").unwrap_err();
        assert!(matches!(err, JwtError::MissingHeader));
    }
}
