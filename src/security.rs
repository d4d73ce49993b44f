//! Security validation for inbound negotiation requests
//!
//! Every inbound offer carries a claimed origin and a bearer token. The
//! origin is checked against a configured allow-list first; only then is the
//! token decoded and its claims compared. Failures are recorded to the fault
//! log and answered with `false`, so callers never see an `Err` from
//! validation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::FailureKind;
use crate::events::FaultLog;

/// Claims carried by a session bearer token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessClaims {
    /// Peer this token was issued to
    pub sub: String,

    /// Origin that issued the token
    pub iss: String,

    /// Expiration timestamp (Unix epoch)
    pub exp: i64,
}

impl AccessClaims {
    /// Create claims for a peer with the given time-to-live
    pub fn new(peer_id: &str, issuer: &str, ttl_seconds: i64) -> Self {
        let exp = (Utc::now() + Duration::seconds(ttl_seconds)).timestamp();

        Self {
            sub: peer_id.to_string(),
            iss: issuer.to_string(),
            exp,
        }
    }

    /// Check if the token has expired
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// Token decode/verification errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AuthError {
    #[error("Token has expired")]
    Expired,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Invalid token format: {0}")]
    InvalidFormat(String),

    #[error("Token generation failed: {0}")]
    Generation(String),
}

/// Decodes and verifies bearer tokens.
///
/// The production default is [`LocalTokenVerifier`]; deployments that defer
/// to an external authority implement this trait over their own call.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Decode the token and verify signature and expiry.
    ///
    /// Claim comparison against the requesting peer is the caller's job.
    async fn verify(&self, token: &str) -> Result<AccessClaims, AuthError>;
}

/// Local HS256 token verifier and issuer sharing one secret
pub struct LocalTokenVerifier {
    secret: String,
}

impl LocalTokenVerifier {
    /// Create a verifier with the given shared secret
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Generate a token for a peer
    pub fn generate(&self, peer_id: &str, issuer: &str, ttl_seconds: i64) -> Result<String, AuthError> {
        self.generate_with_claims(AccessClaims::new(peer_id, issuer, ttl_seconds))
    }

    /// Generate a token with custom claims
    pub fn generate_with_claims(&self, claims: AccessClaims) -> Result<String, AuthError> {
        let key = EncodingKey::from_secret(self.secret.as_bytes());

        encode(&Header::default(), &claims, &key).map_err(|e| AuthError::Generation(e.to_string()))
    }
}

#[async_trait]
impl TokenVerifier for LocalTokenVerifier {
    async fn verify(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let key = DecodingKey::from_secret(self.secret.as_bytes());
        let mut validation = Validation::default();
        // No leeway - tokens expire at exactly the exp time
        validation.leeway = 0;

        let token_data =
            decode::<AccessClaims>(token, &key, &validation).map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::InvalidFormat(e.to_string()),
            })?;

        Ok(token_data.claims)
    }
}

/// Validates inbound offers before any session state exists for them
pub struct SecurityValidator {
    allowed_origins: Vec<String>,
    local_origin: String,
    verifier: Arc<dyn TokenVerifier>,
    faults: FaultLog,
}

impl SecurityValidator {
    pub fn new(config: &ConnectionConfig, verifier: Arc<dyn TokenVerifier>, faults: FaultLog) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            local_origin: config.local_origin.clone(),
            verifier,
            faults,
        }
    }

    /// Check a claimed origin against the allow-list.
    ///
    /// Accepts an exact match or a claimed origin that is a prefix of an
    /// allow-list entry. Empty claims are rejected outright so the empty
    /// prefix cannot match everything.
    pub fn validate_origin(&self, peer_id: &str, claimed_origin: &str) -> bool {
        if claimed_origin.is_empty() {
            self.faults.record(
                FailureKind::ValidationFailure,
                Some(peer_id),
                "Offer carried an empty origin",
            );
            return false;
        }

        let allowed = self
            .allowed_origins
            .iter()
            .any(|entry| entry == claimed_origin || entry.starts_with(claimed_origin));

        if !allowed {
            self.faults.record(
                FailureKind::ValidationFailure,
                Some(peer_id),
                format!("Origin not in allow-list: {}", claimed_origin),
            );
        }

        allowed
    }

    /// Verify a bearer token for a peer.
    ///
    /// The token must decode, be unexpired, name `peer_id` as its subject,
    /// and name the local origin as its issuer.
    pub async fn validate_token(&self, peer_id: &str, token: &str) -> bool {
        let claims = match self.verifier.verify(token).await {
            Ok(claims) => claims,
            Err(e) => {
                self.faults.record(
                    FailureKind::ValidationFailure,
                    Some(peer_id),
                    format!("Token rejected: {}", e),
                );
                return false;
            }
        };

        if claims.sub != peer_id {
            self.faults.record(
                FailureKind::ValidationFailure,
                Some(peer_id),
                format!("Token subject mismatch: expected {}, got {}", peer_id, claims.sub),
            );
            return false;
        }

        if claims.iss != self.local_origin {
            self.faults.record(
                FailureKind::ValidationFailure,
                Some(peer_id),
                format!(
                    "Token issuer mismatch: expected {}, got {}",
                    self.local_origin, claims.iss
                ),
            );
            return false;
        }

        debug!(peer_id, "Token accepted");
        true
    }

    /// Full offer authorization: origin first, then token.
    ///
    /// A failed origin check short-circuits without touching the token.
    pub async fn authorize_offer(&self, peer_id: &str, origin: &str, token: &str) -> bool {
        if !self.validate_origin(peer_id, origin) {
            return false;
        }

        self.validate_token(peer_id, token).await
    }
}
