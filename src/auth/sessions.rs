use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::tokens::{hash_token, TokenIssuer};
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::db::{ClientBinding, RefreshToken, RefreshTokenStore, RotationOutcome};
use crate::error::{AuthError, TokenRejection};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenTtls {
    pub access: Duration,
    pub refresh: Duration,
}

impl From<&AuthConfig> for TokenTtls {
    fn from(config: &AuthConfig) -> Self {
        Self {
            access: config.access_ttl(),
            refresh: config.refresh_ttl(),
        }
    }
}

/// Freshly issued credentials. The raw refresh token exists only here.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub principal_id: Uuid,
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub jti: String,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Issues, rotates and ends refresh-token sessions. One live refresh token
/// per principal.
#[derive(Clone)]
pub struct SessionManager {
    issuer: Arc<TokenIssuer>,
    store: Arc<dyn RefreshTokenStore>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(
        issuer: Arc<TokenIssuer>,
        store: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            issuer,
            store,
            clock,
        }
    }

    /// Replaces every refresh token of the principal with a new pair.
    pub async fn start_session(
        &self,
        principal_id: Uuid,
        binding: &ClientBinding,
        attestation: Option<&str>,
        ttls: TokenTtls,
    ) -> Result<TokenPair> {
        let access = self
            .issuer
            .issue_access_token(principal_id, binding, attestation, ttls.access)?;

        let raw_refresh = self.issuer.generate_refresh_token();
        let stored = RefreshToken::new(
            principal_id,
            hash_token(&raw_refresh),
            binding,
            self.clock.now(),
            ttls.refresh,
        );
        let revoked = self.store.replace_for_principal(&stored).await?;
        if revoked > 0 {
            info!(
                principal_id = %principal_id,
                revoked,
                "Previous sessions revoked by new login"
            );
        }

        Ok(TokenPair {
            principal_id,
            access_token: access.token,
            access_expires_at: access.expires_at,
            jti: access.jti,
            refresh_token: raw_refresh,
            refresh_expires_at: stored.expires_at,
        })
    }

    /// Single-use rotation. The access token is signed before the old refresh
    /// token is consumed, and the store swaps old for new in one transaction,
    /// so a failure never leaves the caller without a usable refresh token.
    pub async fn refresh(
        &self,
        raw_token: &str,
        binding: &ClientBinding,
        attestation: Option<&str>,
        ttls: TokenTtls,
    ) -> Result<TokenPair> {
        let presented_hash = hash_token(raw_token);

        let principal_id = match self.store.find_by_hash(&presented_hash).await? {
            Some(token) => token.principal_id,
            None => return Err(reject(TokenRejection::Unknown, None)),
        };

        let access = self
            .issuer
            .issue_access_token(principal_id, binding, attestation, ttls.access)?;
        let raw_next = self.issuer.generate_refresh_token();

        let outcome = self
            .store
            .rotate(
                &presented_hash,
                binding,
                &hash_token(&raw_next),
                ttls.refresh,
                self.clock.now(),
            )
            .await?;

        match outcome {
            RotationOutcome::Rotated(next) => {
                debug!(principal_id = %principal_id, "Refresh token rotated");
                Ok(TokenPair {
                    principal_id,
                    access_token: access.token,
                    access_expires_at: access.expires_at,
                    jti: access.jti,
                    refresh_token: raw_next,
                    refresh_expires_at: next.expires_at,
                })
            }
            RotationOutcome::Rejected(rejection) => Err(reject(rejection, Some(principal_id))),
        }
    }

    /// Idempotent: an unknown token is not an error.
    pub async fn end_session(&self, raw_token: &str) -> Result<()> {
        let removed = self.store.delete_by_hash(&hash_token(raw_token)).await?;
        debug!(removed, "Logout processed");
        Ok(())
    }

    pub async fn end_all_sessions(&self, principal_id: Uuid) -> Result<u64> {
        self.store.delete_for_principal(principal_id).await
    }

    pub async fn cleanup(&self) -> Result<u64> {
        self.store.delete_expired(self.clock.now()).await
    }
}

fn reject(rejection: TokenRejection, principal_id: Option<Uuid>) -> crate::AppError {
    warn!(
        principal_id = ?principal_id,
        reason = %rejection,
        "Refresh token rejected"
    );
    AuthError::InvalidOrExpiredToken(rejection).into()
}
