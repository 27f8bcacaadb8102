use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::attestation::{encode_challenge, AttestationVerifier, ChallengeManager, IssuedChallenge};
use super::credentials::{verify_password, LoginCredentials, RfcTotpVerifier, TotpVerifier};
use super::rate_limit::RateLimiter;
use super::sessions::{SessionManager, TokenPair, TokenTtls};
use super::throttle::LoginThrottle;
use super::tokens::{Claims, TokenIssuer, TokenVerifier};
use super::verification::{Delivery, Destination, VerificationService};
use crate::clock::{Clock, SecureRandom};
use crate::config::{LockoutConfig, Settings};
use crate::db::{
    AttestationChallengeStore, ClientBinding, CredentialStore, LoginAttemptStore, Platform,
    Principal, PrincipalKind, RateLimitStore, RefreshTokenStore, TokenBlacklistStore,
    VerificationCodeStore,
};
use crate::error::AuthError;
use crate::Result;

/// Storage handles shared by every orchestrator.
#[derive(Clone)]
pub struct AuthStores {
    pub login_attempts: Arc<dyn LoginAttemptStore>,
    pub refresh_tokens: Arc<dyn RefreshTokenStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub verification_codes: Arc<dyn VerificationCodeStore>,
    pub challenges: Arc<dyn AttestationChallengeStore>,
    pub blacklist: Arc<dyn TokenBlacklistStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl AuthStores {
    /// Every auth table served by one backend, principals by another.
    pub fn shared<S>(store: Arc<S>, credentials: Arc<dyn CredentialStore>) -> Self
    where
        S: LoginAttemptStore
            + RefreshTokenStore
            + RateLimitStore
            + VerificationCodeStore
            + AttestationChallengeStore
            + TokenBlacklistStore
            + 'static,
    {
        Self {
            login_attempts: store.clone(),
            refresh_tokens: store.clone(),
            rate_limits: store.clone(),
            verification_codes: store.clone(),
            challenges: store.clone(),
            blacklist: store,
            credentials,
        }
    }
}

/// Everything the orchestrators are built from. Constructed once at startup.
#[derive(Clone)]
pub struct AuthContext {
    pub settings: Arc<Settings>,
    pub stores: AuthStores,
    pub issuer: Arc<TokenIssuer>,
    pub verifier: Arc<TokenVerifier>,
    pub delivery: Delivery,
    pub totp: Arc<dyn TotpVerifier>,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn SecureRandom>,
}

impl AuthContext {
    /// Loads the signing keys named in the settings.
    pub fn new(
        settings: Arc<Settings>,
        stores: AuthStores,
        delivery: Delivery,
        clock: Arc<dyn Clock>,
        random: Arc<dyn SecureRandom>,
    ) -> Result<Self> {
        let issuer = TokenIssuer::from_file(
            settings.auth.issuer.clone(),
            &settings.auth.private_key_path,
            clock.clone(),
            random.clone(),
        )?;
        let verifier = TokenVerifier::from_file(
            settings.auth.issuer.clone(),
            &settings.auth.public_key_path,
            stores.blacklist.clone(),
            clock.clone(),
        )?;

        Ok(Self {
            settings,
            stores,
            issuer: Arc::new(issuer),
            verifier: Arc::new(verifier),
            delivery,
            totp: Arc::new(RfcTotpVerifier),
            clock,
            random,
        })
    }

    pub fn with_totp_verifier(mut self, totp: Arc<dyn TotpVerifier>) -> Self {
        self.totp = totp;
        self
    }

    pub fn ttls(&self) -> TokenTtls {
        TokenTtls::from(&self.settings.auth)
    }

    pub fn sessions(&self) -> SessionManager {
        SessionManager::new(
            self.issuer.clone(),
            self.stores.refresh_tokens.clone(),
            self.clock.clone(),
        )
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.stores.rate_limits.clone(),
            self.settings.rate_limit.clone(),
            self.clock.clone(),
        )
    }

    pub fn challenges(&self) -> ChallengeManager {
        ChallengeManager::new(
            self.stores.challenges.clone(),
            self.clock.clone(),
            self.random.clone(),
            self.settings.attestation.challenge_ttl(),
        )
    }

    pub fn verification(&self, kind: PrincipalKind) -> VerificationService {
        VerificationService::new(
            kind,
            self.stores.verification_codes.clone(),
            self.stores.credentials.clone(),
            self.rate_limiter(),
            self.delivery.clone(),
            self.settings.verification.clone(),
            self.clock.clone(),
            self.random.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginSuccess {
    pub principal: Principal,
    pub tokens: TokenPair,
}

/// Login, refresh, logout and verification flows for one principal kind.
/// The kinds differ in lockout policy, credential material (admins add a
/// password) and whether mobile logins must be attested (workers).
#[derive(Clone)]
pub struct AuthService {
    kind: PrincipalKind,
    lockout: LockoutConfig,
    credentials: Arc<dyn CredentialStore>,
    throttle: LoginThrottle,
    sessions: SessionManager,
    verifier: Arc<TokenVerifier>,
    verification: VerificationService,
    challenges: ChallengeManager,
    totp: Arc<dyn TotpVerifier>,
    attestation: Option<Arc<dyn AttestationVerifier>>,
    clock: Arc<dyn Clock>,
}

impl AuthService {
    pub fn property_manager(ctx: &AuthContext) -> Self {
        Self::build(
            ctx,
            PrincipalKind::PropertyManager,
            ctx.settings.lockout.property_manager,
            None,
        )
    }

    pub fn worker(ctx: &AuthContext, attestation: Arc<dyn AttestationVerifier>) -> Self {
        Self::build(
            ctx,
            PrincipalKind::Worker,
            ctx.settings.lockout.worker,
            Some(attestation),
        )
    }

    pub fn admin(ctx: &AuthContext) -> Self {
        Self::build(ctx, PrincipalKind::Admin, ctx.settings.lockout.admin, None)
    }

    fn build(
        ctx: &AuthContext,
        kind: PrincipalKind,
        lockout: LockoutConfig,
        attestation: Option<Arc<dyn AttestationVerifier>>,
    ) -> Self {
        Self {
            kind,
            lockout,
            credentials: ctx.stores.credentials.clone(),
            throttle: LoginThrottle::new(ctx.stores.login_attempts.clone(), ctx.clock.clone()),
            sessions: ctx.sessions(),
            verifier: ctx.verifier.clone(),
            verification: ctx.verification(kind),
            challenges: ctx.challenges(),
            totp: ctx.totp.clone(),
            attestation,
            clock: ctx.clock.clone(),
        }
    }

    pub fn kind(&self) -> PrincipalKind {
        self.kind
    }

    pub async fn login(
        &self,
        credentials: &LoginCredentials,
        binding: &ClientBinding,
        ttls: TokenTtls,
    ) -> Result<LoginSuccess> {
        let principal = match self
            .credentials
            .find_by_identifier(self.kind, &credentials.identifier)
            .await?
        {
            Some(principal) if principal.is_active => principal,
            _ => {
                info!(kind = %self.kind, reason = "unknown_principal", "Login failed");
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        match self.throttle.is_locked(principal.id).await {
            Ok((true, until)) => {
                warn!(principal_id = %principal.id, kind = %self.kind, "Login attempt on locked account");
                let until = until.unwrap_or_else(|| self.clock.now());
                return Err(AuthError::AccountLocked { until }.into());
            }
            Ok((false, _)) => {}
            Err(e) => return Err(self.throttle_failure(principal.id, "lock_check", e)),
        }

        if !self.credentials_valid(&principal, credentials) {
            info!(principal_id = %principal.id, kind = %self.kind, reason = "bad_credentials", "Login failed");
            if let Err(e) = self.throttle.record_failure(principal.id, &self.lockout).await {
                return Err(self.throttle_failure(principal.id, "increment", e));
            }
            return Err(AuthError::InvalidCredentials.into());
        }

        let fingerprint = self.attest(&principal, credentials, binding).await?;

        if let Err(e) = self.throttle.reset(principal.id).await {
            return Err(self.throttle_failure(principal.id, "reset", e));
        }

        let tokens = self
            .sessions
            .start_session(principal.id, binding, fingerprint.as_deref(), ttls)
            .await?;

        info!(principal_id = %principal.id, kind = %self.kind, mobile = binding.is_mobile(), "Login succeeded");
        Ok(LoginSuccess { principal, tokens })
    }

    pub async fn refresh_token(
        &self,
        raw_token: &str,
        binding: &ClientBinding,
        ttls: TokenTtls,
        attestation: Option<&str>,
    ) -> Result<TokenPair> {
        self.sessions.refresh(raw_token, binding, attestation, ttls).await
    }

    pub async fn logout(&self, raw_token: &str) -> Result<()> {
        self.sessions.end_session(raw_token).await
    }

    /// `source_ip` is the caller's network address. It keys the per-source
    /// rate limit and must not come from a client-supplied header.
    pub async fn request_verification_code(
        &self,
        destination: &Destination,
        principal_id: Option<Uuid>,
        source_ip: &str,
    ) -> Result<()> {
        self.verification
            .request_code(destination, principal_id, source_ip)
            .await
    }

    pub async fn verify_verification_code(
        &self,
        destination: &Destination,
        code: &str,
        principal_id: Option<Uuid>,
        binding: &ClientBinding,
    ) -> Result<bool> {
        self.verification
            .verify_code(destination, code, principal_id, binding.identifier())
            .await
    }

    pub async fn is_currently_verified(
        &self,
        destination: &Destination,
        principal_id: Option<Uuid>,
        binding: &ClientBinding,
    ) -> Result<bool> {
        self.verification
            .is_currently_verified(destination, principal_id, binding.identifier())
            .await
    }

    pub async fn issue_challenge(&self, platform: Platform) -> Result<IssuedChallenge> {
        self.challenges.issue_challenge(platform).await
    }

    pub async fn verify_access_token(&self, token: &str) -> Result<Claims> {
        self.verifier.verify(token).await
    }

    /// Kills a still-valid access token before its natural expiry.
    pub async fn revoke_access_token(&self, claims: &Claims) -> Result<()> {
        info!(jti = %claims.jti, sub = %claims.sub, "Access token revoked");
        self.verifier.revoke(&claims.jti, claims.expires_at()).await
    }

    fn credentials_valid(&self, principal: &Principal, credentials: &LoginCredentials) -> bool {
        let now = self.clock.now();
        if self.kind == PrincipalKind::Admin {
            let password_ok = match (&credentials.password, &principal.password_hash) {
                (Some(password), Some(hash)) => verify_password(password, hash),
                _ => false,
            };
            // Both factors are always evaluated.
            let totp_ok = self
                .totp
                .validate(&principal.totp_secret, &credentials.totp_code, now);
            return password_ok && totp_ok;
        }

        self.totp
            .validate(&principal.totp_secret, &credentials.totp_code, now)
    }

    /// Mobile worker logins must present evidence over a fresh challenge.
    /// Returns the fingerprint to embed in the access token.
    async fn attest(
        &self,
        principal: &Principal,
        credentials: &LoginCredentials,
        binding: &ClientBinding,
    ) -> Result<Option<String>> {
        let verifier = match &self.attestation {
            Some(verifier) if binding.is_mobile() => verifier,
            _ => return Ok(None),
        };

        let proof = match &credentials.attestation {
            Some(proof) => proof,
            None => {
                warn!(principal_id = %principal.id, reason = "missing_proof", "Attestation failed");
                return Err(AuthError::VerificationFailed.into());
            }
        };

        let challenge = match self.challenges.consume(proof.challenge_id).await? {
            Some(challenge) => challenge,
            None => {
                warn!(principal_id = %principal.id, reason = "challenge_unavailable", "Attestation failed");
                return Err(AuthError::VerificationFailed.into());
            }
        };

        let encoded = encode_challenge(challenge.platform, &challenge.challenge);
        match verifier.verify(&challenge, &encoded, &proof.evidence).await {
            Ok(Some(fingerprint)) => Ok(Some(fingerprint)),
            Ok(None) => {
                warn!(principal_id = %principal.id, reason = "evidence_rejected", "Attestation failed");
                Err(AuthError::VerificationFailed.into())
            }
            Err(e) => {
                error!(principal_id = %principal.id, error = %e, "Attestation provider failure");
                Err(AuthError::ExternalServiceFailure(e.to_string()).into())
            }
        }
    }

    /// A throttle that cannot be consulted fails the login.
    fn throttle_failure(&self, principal_id: Uuid, step: &str, e: crate::AppError) -> crate::AppError {
        error!(
            principal_id = %principal_id,
            kind = %self.kind,
            step,
            error = %e,
            "Login throttle unavailable"
        );
        AuthError::InvalidCredentials.into()
    }
}
