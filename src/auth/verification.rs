use serde::Deserialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::rate_limit::RateLimiter;
use crate::clock::{Clock, SecureRandom};
use crate::config::VerificationConfig;
use crate::db::{Channel, CredentialStore, PrincipalKind, VerificationCode, VerificationCodeStore};
use crate::error::AuthError;
use crate::notify::{DeliverabilityValidator, Notifier};
use crate::Result;

/// Where a verification code is sent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawDestination")]
pub enum Destination {
    Email(String),
    Phone(String),
}

/// Wire form; normalized through the [`Destination`] constructors.
#[derive(Deserialize)]
#[serde(tag = "channel", content = "value", rename_all = "snake_case")]
enum RawDestination {
    Email(String),
    Phone(String),
}

impl From<RawDestination> for Destination {
    fn from(raw: RawDestination) -> Self {
        match raw {
            RawDestination::Email(address) => Destination::email(&address),
            RawDestination::Phone(number) => Destination::phone(&number),
        }
    }
}

impl Destination {
    /// Addresses compare case-insensitively.
    pub fn email(address: &str) -> Self {
        Destination::Email(address.trim().to_lowercase())
    }

    pub fn phone(number: &str) -> Self {
        Destination::Phone(number.trim().to_string())
    }

    pub fn channel(&self) -> Channel {
        match self {
            Destination::Email(_) => Channel::Email,
            Destination::Phone(_) => Channel::Sms,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Destination::Email(value) | Destination::Phone(value) => value,
        }
    }
}

/// Outbound collaborators of [`VerificationService`].
#[derive(Clone)]
pub struct Delivery {
    pub validator: Arc<dyn DeliverabilityValidator>,
    pub notifier: Arc<dyn Notifier>,
}

/// One-active-code-per-destination verification for a single principal
/// kind.
#[derive(Clone)]
pub struct VerificationService {
    kind: PrincipalKind,
    codes: Arc<dyn VerificationCodeStore>,
    credentials: Arc<dyn CredentialStore>,
    rate_limiter: RateLimiter,
    delivery: Delivery,
    config: VerificationConfig,
    clock: Arc<dyn Clock>,
    random: Arc<dyn SecureRandom>,
}

impl VerificationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: PrincipalKind,
        codes: Arc<dyn VerificationCodeStore>,
        credentials: Arc<dyn CredentialStore>,
        rate_limiter: RateLimiter,
        delivery: Delivery,
        config: VerificationConfig,
        clock: Arc<dyn Clock>,
        random: Arc<dyn SecureRandom>,
    ) -> Self {
        Self {
            kind,
            codes,
            credentials,
            rate_limiter,
            delivery,
            config,
            clock,
            random,
        }
    }

    pub async fn request_code(
        &self,
        destination: &Destination,
        principal_id: Option<Uuid>,
        source: &str,
    ) -> Result<()> {
        let channel = destination.channel();
        self.rate_limiter
            .check_rate_limits(channel, source, destination.as_str())
            .await?;

        self.ensure_deliverable(destination).await?;

        let now = self.clock.now();
        let code = if self.is_test_destination(destination) {
            debug!(kind = %self.kind, "Issuing fixed code for test destination");
            self.config.test_code.clone()
        } else {
            self.generate_code()
        };

        let row = VerificationCode {
            id: Uuid::new_v4(),
            kind: self.kind,
            channel,
            principal_id,
            destination: destination.as_str().to_string(),
            code,
            expires_at: now + self.config.code_ttl(),
            attempts: 0,
            verified: false,
            verified_at: None,
            verified_by: None,
            created_at: now,
        };
        self.codes.replace(&row).await?;

        self.dispatch(destination, &row.code).await?;
        info!(kind = %self.kind, channel = %channel, "Verification code sent");
        Ok(())
    }

    /// Wrong, expired, reused and unknown codes are indistinguishable to the
    /// caller.
    pub async fn verify_code(
        &self,
        destination: &Destination,
        submitted: &str,
        principal_id: Option<Uuid>,
        client: &str,
    ) -> Result<bool> {
        let channel = destination.channel();
        let row = match self
            .codes
            .latest(self.kind, channel, destination.as_str())
            .await?
        {
            Some(row) => row,
            None => {
                debug!(kind = %self.kind, reason = "not_found", "Verification failed");
                return Ok(false);
            }
        };

        if row.verified {
            debug!(kind = %self.kind, reason = "already_verified", "Verification failed");
            return Ok(false);
        }

        // Every submission spends an attempt before it is compared.
        if self
            .codes
            .claim_attempt(row.id, self.config.max_attempts)
            .await?
            .is_none()
        {
            warn!(
                kind = %self.kind,
                attempts = row.attempts,
                reason = "too_many_attempts",
                "Verification failed"
            );
            return Ok(false);
        }

        let now = self.clock.now();
        let matches: bool = submitted.trim().as_bytes().ct_eq(row.code.as_bytes()).into();
        let owner_ok = match principal_id {
            Some(id) => row.principal_id.map_or(true, |owner| owner == id),
            None => true,
        };

        if !matches || !owner_ok || row.is_expired(now) {
            debug!(
                kind = %self.kind,
                reason = if row.is_expired(now) { "expired" } else { "mismatch" },
                "Verification failed"
            );
            return Ok(false);
        }

        let consumed = if self
            .credentials
            .exists_for_destination(self.kind, channel, destination.as_str())
            .await?
        {
            self.codes.delete(row.id).await?
        } else {
            self.codes.mark_verified(row.id, now, client).await?
        };

        if !consumed {
            debug!(kind = %self.kind, reason = "consumed_concurrently", "Verification failed");
        }
        Ok(consumed)
    }

    /// Proof of a recent verification for registration, valid for the grace
    /// window.
    pub async fn is_currently_verified(
        &self,
        destination: &Destination,
        principal_id: Option<Uuid>,
        client: &str,
    ) -> Result<bool> {
        let row = match self
            .codes
            .latest(self.kind, destination.channel(), destination.as_str())
            .await?
        {
            Some(row) => row,
            None => return Ok(false),
        };

        if !row.verified_within(self.clock.now(), self.config.grace_window()) {
            return Ok(false);
        }

        Ok(match principal_id {
            Some(id) => row.principal_id == Some(id),
            None => row.verified_by.as_deref() == Some(client),
        })
    }

    pub async fn cleanup(&self) -> Result<u64> {
        let now = self.clock.now();
        self.codes
            .delete_expired(now, now - self.config.grace_window())
            .await
    }

    fn is_test_destination(&self, destination: &Destination) -> bool {
        if !self.config.accept_fake_destinations {
            return false;
        }
        match destination {
            Destination::Phone(number) => number.starts_with(&self.config.test_phone_prefix),
            Destination::Email(address) => address
                .rsplit_once('@')
                .map_or(false, |(_, domain)| domain == self.config.test_email_domain),
        }
    }

    fn generate_code(&self) -> String {
        (0..self.config.code_length)
            .map(|_| char::from(b'0' + self.random.digit()))
            .collect()
    }

    async fn ensure_deliverable(&self, destination: &Destination) -> Result<()> {
        let check = match destination {
            Destination::Email(address) => self.delivery.validator.validate_email(address).await,
            Destination::Phone(number) => self.delivery.validator.validate_phone(number).await,
        };

        match check {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(kind = %self.kind, channel = %destination.channel(), "Destination rejected");
                Err(AuthError::InvalidDestination(format!(
                    "{} is not deliverable",
                    destination.channel().destination_label()
                ))
                .into())
            }
            Err(e) => {
                error!(error = %e, "Deliverability check failed");
                Err(AuthError::ExternalServiceFailure(e.to_string()).into())
            }
        }
    }

    async fn dispatch(&self, destination: &Destination, code: &str) -> Result<()> {
        let minutes = self.config.code_ttl_minutes;
        let sent = match destination {
            Destination::Email(address) => {
                self.delivery
                    .notifier
                    .send_email(
                        address,
                        "Your verification code",
                        &format!(
                            "Your verification code is {}. It expires in {} minutes.",
                            code, minutes
                        ),
                    )
                    .await
            }
            Destination::Phone(number) => {
                self.delivery
                    .notifier
                    .send_sms(
                        number,
                        &format!("Your verification code is {}. Expires in {} min.", code, minutes),
                    )
                    .await
            }
        };

        sent.map_err(|e| {
            error!(kind = %self.kind, error = %e, "Verification code delivery failed");
            AuthError::ExternalServiceFailure(e.to_string()).into()
        })
    }
}
