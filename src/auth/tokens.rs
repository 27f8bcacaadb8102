use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, SecureRandom};
use crate::db::{ClientBinding, TokenBlacklistStore};
use crate::error::{AppError, AuthError, TokenRejection};
use crate::Result;

const REFRESH_TOKEN_BYTES: usize = 32;
const JTI_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Attestation fingerprint, present for attested mobile sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub att: Option<String>,
}

impl Claims {
    pub fn principal_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| {
            AppError::AuthError(AuthError::InvalidOrExpiredToken(TokenRejection::Malformed))
        })
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

/// SHA-256 hex digest; the only form in which refresh tokens are stored.
pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

fn read_key(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path).map_err(|e| {
        AppError::ConfigError(format!("Failed to read key {}: {}", path.display(), e))
    })
}

/// Signs access tokens with the RS256 private key and mints opaque refresh
/// tokens.
pub struct TokenIssuer {
    issuer: String,
    encoding_key: EncodingKey,
    clock: Arc<dyn Clock>,
    random: Arc<dyn SecureRandom>,
}

impl TokenIssuer {
    pub fn from_pem(
        issuer: impl Into<String>,
        private_key_pem: &[u8],
        clock: Arc<dyn Clock>,
        random: Arc<dyn SecureRandom>,
    ) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| AppError::ConfigError(format!("Invalid signing key: {}", e)))?;

        Ok(Self {
            issuer: issuer.into(),
            encoding_key,
            clock,
            random,
        })
    }

    pub fn from_file(
        issuer: impl Into<String>,
        private_key_path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn SecureRandom>,
    ) -> Result<Self> {
        let pem = read_key(private_key_path)?;
        Self::from_pem(issuer, &pem, clock, random)
    }

    pub fn issue_access_token(
        &self,
        principal_id: Uuid,
        binding: &ClientBinding,
        attestation: Option<&str>,
        ttl: Duration,
    ) -> Result<AccessToken> {
        let now = self.clock.now();
        let expires_at = now + ttl;
        let jti = self.random_hex(JTI_BYTES);

        let claims = Claims {
            iss: self.issuer.clone(),
            sub: principal_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: jti.clone(),
            ip: binding.ip().map(str::to_string),
            device_id: binding.device_id().map(str::to_string),
            att: attestation.filter(|a| !a.is_empty()).map(str::to_string),
        };

        let token = encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)?;

        Ok(AccessToken {
            token,
            jti,
            expires_at,
        })
    }

    /// 32 random bytes, base64url without padding.
    pub fn generate_refresh_token(&self) -> String {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        self.random.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn random_hex(&self, len: usize) -> String {
        let mut bytes = vec![0u8; len];
        self.random.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

/// Side-effect-free access token verification with the public key, plus the
/// `jti` blacklist for early revocation.
pub struct TokenVerifier {
    issuer: String,
    decoding_key: DecodingKey,
    blacklist: Arc<dyn TokenBlacklistStore>,
    clock: Arc<dyn Clock>,
}

impl TokenVerifier {
    pub fn from_pem(
        issuer: impl Into<String>,
        public_key_pem: &[u8],
        blacklist: Arc<dyn TokenBlacklistStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem)
            .map_err(|e| AppError::ConfigError(format!("Invalid verification key: {}", e)))?;

        Ok(Self {
            issuer: issuer.into(),
            decoding_key,
            blacklist,
            clock,
        })
    }

    pub fn from_file(
        issuer: impl Into<String>,
        public_key_path: impl AsRef<Path>,
        blacklist: Arc<dyn TokenBlacklistStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pem = read_key(public_key_path)?;
        Self::from_pem(issuer, &pem, blacklist, clock)
    }

    pub async fn verify(&self, token: &str) -> Result<Claims> {
        // Expiry is checked against the injected clock below.
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.validate_exp = false;

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                let rejection = match e.kind() {
                    ErrorKind::ExpiredSignature => TokenRejection::Expired,
                    _ => TokenRejection::Malformed,
                };
                debug!(reason = %rejection, error = %e, "Access token rejected");
                AppError::AuthError(AuthError::InvalidOrExpiredToken(rejection))
            })?
            .claims;

        let now = self.clock.now();
        if claims.exp <= now.timestamp() {
            debug!(reason = %TokenRejection::Expired, "Access token rejected");
            return Err(AuthError::InvalidOrExpiredToken(TokenRejection::Expired).into());
        }

        if self.blacklist.contains(&claims.jti, now).await? {
            warn!(jti = %claims.jti, sub = %claims.sub, "Blacklisted access token presented");
            return Err(AuthError::InvalidOrExpiredToken(TokenRejection::Blacklisted).into());
        }

        Ok(claims)
    }

    /// Blacklists `jti` until the token would have expired anyway.
    pub async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.blacklist.insert(jti, expires_at).await
    }
}

#[cfg(test)]
pub(crate) mod test_keys {
    pub const PRIVATE_KEY: &[u8] = include_bytes!("../../tests/fixtures/access_token_key.pem");
    pub const PUBLIC_KEY: &[u8] = include_bytes!("../../tests/fixtures/access_token_key.pub.pem");
}

#[cfg(test)]
mod tests {
    use super::test_keys::{PRIVATE_KEY, PUBLIC_KEY};
    use super::*;
    use crate::clock::{ManualClock, OsRandom};
    use crate::db::MemoryStore;

    fn issuer_and_verifier() -> (TokenIssuer, TokenVerifier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let issuer =
            TokenIssuer::from_pem("marketplace", PRIVATE_KEY, clock.clone(), Arc::new(OsRandom))
                .unwrap();
        let verifier = TokenVerifier::from_pem(
            "marketplace",
            PUBLIC_KEY,
            Arc::new(MemoryStore::new()),
            clock.clone(),
        )
        .unwrap();
        (issuer, verifier, clock)
    }

    #[test]
    fn test_hash_token_is_sha256_hex() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_refresh_tokens_are_unique_and_url_safe() {
        let (issuer, _, _) = issuer_and_verifier();
        let a = issuer.generate_refresh_token();
        let b = issuer.generate_refresh_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn test_issue_and_verify_carries_binding() {
        let (issuer, verifier, _) = issuer_and_verifier();
        let principal = Uuid::new_v4();

        let token = issuer
            .issue_access_token(
                principal,
                &ClientBinding::Device("D1".into()),
                Some("fp-123"),
                Duration::minutes(15),
            )
            .unwrap();
        let claims = verifier.verify(&token.token).await.unwrap();

        assert_eq!(claims.principal_id().unwrap(), principal);
        assert_eq!(claims.device_id.as_deref(), Some("D1"));
        assert_eq!(claims.ip, None);
        assert_eq!(claims.att.as_deref(), Some("fp-123"));
        assert_eq!(claims.jti, token.jti);
    }

    #[tokio::test]
    async fn test_empty_attestation_is_omitted() {
        let (issuer, verifier, _) = issuer_and_verifier();
        let token = issuer
            .issue_access_token(
                Uuid::new_v4(),
                &ClientBinding::Ip("1.1.1.1".into()),
                Some(""),
                Duration::minutes(15),
            )
            .unwrap();
        let claims = verifier.verify(&token.token).await.unwrap();
        assert_eq!(claims.att, None);
        assert_eq!(claims.ip.as_deref(), Some("1.1.1.1"));
    }

    #[tokio::test]
    async fn test_expired_access_token_is_rejected() {
        let (issuer, verifier, clock) = issuer_and_verifier();
        let token = issuer
            .issue_access_token(
                Uuid::new_v4(),
                &ClientBinding::Ip("1.1.1.1".into()),
                None,
                Duration::minutes(15),
            )
            .unwrap();

        clock.advance(Duration::minutes(16));
        let err = verifier.verify(&token.token).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::AuthError(AuthError::InvalidOrExpiredToken(TokenRejection::Expired))
        ));
    }

    #[tokio::test]
    async fn test_revoked_jti_is_rejected() {
        let (issuer, verifier, _) = issuer_and_verifier();
        let token = issuer
            .issue_access_token(
                Uuid::new_v4(),
                &ClientBinding::Ip("1.1.1.1".into()),
                None,
                Duration::minutes(15),
            )
            .unwrap();

        verifier.revoke(&token.jti, token.expires_at).await.unwrap();
        let err = verifier.verify(&token.token).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::AuthError(AuthError::InvalidOrExpiredToken(TokenRejection::Blacklisted))
        ));
    }

    #[tokio::test]
    async fn test_foreign_issuer_is_rejected() {
        let clock = Arc::new(ManualClock::default());
        let issuer =
            TokenIssuer::from_pem("someone-else", PRIVATE_KEY, clock.clone(), Arc::new(OsRandom))
                .unwrap();
        let (_, verifier, _) = issuer_and_verifier();

        let token = issuer
            .issue_access_token(
                Uuid::new_v4(),
                &ClientBinding::Ip("1.1.1.1".into()),
                None,
                Duration::minutes(15),
            )
            .unwrap();
        assert!(verifier.verify(&token.token).await.is_err());
    }

    #[test]
    fn test_bad_key_is_a_config_error() {
        let result = TokenIssuer::from_pem(
            "marketplace",
            b"not a key",
            Arc::new(ManualClock::default()),
            Arc::new(OsRandom),
        );
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
