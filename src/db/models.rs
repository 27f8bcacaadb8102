use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TokenRejection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    PropertyManager,
    Worker,
    Admin,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::PropertyManager => "property_manager",
            PrincipalKind::Worker => "worker",
            PrincipalKind::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
        }
    }

    /// Name of the destination segment in rate-limit keys.
    pub fn destination_label(&self) -> &'static str {
        match self {
            Channel::Sms => "phone",
            Channel::Email => "address",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant `{}`", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! text_enum {
    ($ty:ty { $($text:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(PrincipalKind {
    "property_manager" => PrincipalKind::PropertyManager,
    "worker" => PrincipalKind::Worker,
    "admin" => PrincipalKind::Admin,
});
text_enum!(Channel { "sms" => Channel::Sms, "email" => Channel::Email });
text_enum!(Platform { "ios" => Platform::Ios, "android" => Platform::Android });

/// Account as seen by the credential check. Owned by the registration side;
/// this crate only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub kind: PrincipalKind,
    pub username: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(skip_serializing)]
    pub totp_secret: String,
    pub is_active: bool,
}

/// Where a token is pinned: the caller's IP for web clients, the device id
/// for mobile clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientBinding {
    Ip(String),
    Device(String),
}

impl ClientBinding {
    pub fn ip(&self) -> Option<&str> {
        match self {
            ClientBinding::Ip(ip) => Some(ip),
            ClientBinding::Device(_) => None,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            ClientBinding::Device(id) => Some(id),
            ClientBinding::Ip(_) => None,
        }
    }

    pub fn is_mobile(&self) -> bool {
        matches!(self, ClientBinding::Device(_))
    }

    /// Identifier used for anonymous verification proofs.
    pub fn identifier(&self) -> &str {
        match self {
            ClientBinding::Ip(value) | ClientBinding::Device(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
    pub ip: Option<String>,
    pub device_id: Option<String>,
}

impl RefreshToken {
    pub fn new(
        principal_id: Uuid,
        token_hash: String,
        binding: &ClientBinding,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal_id,
            token_hash,
            expires_at: now + ttl,
            created_at: now,
            revoked: false,
            ip: binding.ip().map(str::to_string),
            device_id: binding.device_id().map(str::to_string),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Checks a presented token against the request. Tokens stored without a
    /// binding skip the binding comparison.
    pub fn validate_for(
        &self,
        binding: &ClientBinding,
        now: DateTime<Utc>,
    ) -> Result<(), TokenRejection> {
        if self.revoked {
            return Err(TokenRejection::Revoked);
        }
        if self.is_expired(now) {
            return Err(TokenRejection::Expired);
        }
        if let Some(stored) = self.ip.as_deref() {
            if binding.ip() != Some(stored) {
                return Err(TokenRejection::IpMismatch);
            }
        }
        if let Some(stored) = self.device_id.as_deref() {
            if binding.device_id() != Some(stored) {
                return Err(TokenRejection::DeviceMismatch);
            }
        }
        Ok(())
    }
}

/// Result of an attempted refresh-token rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The presented token was removed; carries the replacement row.
    Rotated(RefreshToken),
    Rejected(TokenRejection),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct LoginAttempt {
    pub principal_id: Uuid,
    pub attempt_count: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl LoginAttempt {
    pub fn new(principal_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            principal_id,
            attempt_count: 0,
            locked_until: None,
            updated_at: now,
            created_at: now,
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until > now)
    }

    /// In-place failure bookkeeping. The SQL store runs the same rules in a
    /// single statement.
    pub fn register_failure(
        &mut self,
        now: DateTime<Utc>,
        lock_duration: chrono::Duration,
        window: chrono::Duration,
        max_attempts: i32,
    ) {
        if self.is_locked(now) {
            return;
        }

        if now - self.updated_at > window {
            self.attempt_count = 1;
        } else {
            self.attempt_count += 1;
        }

        self.locked_until = if self.attempt_count >= max_attempts {
            Some(now + lock_duration)
        } else {
            None
        };
        self.updated_at = now;
    }

    pub fn clear(&mut self, now: DateTime<Utc>) {
        self.attempt_count = 0;
        self.locked_until = None;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCode {
    pub id: Uuid,
    pub kind: PrincipalKind,
    pub channel: Channel,
    pub principal_id: Option<Uuid>,
    pub destination: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub attempts: i32,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub verified_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl VerificationCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn verified_within(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        self.verified && matches!(self.verified_at, Some(at) if now - at <= grace)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationChallenge {
    pub id: Uuid,
    pub challenge: Vec<u8>,
    pub platform: Platform,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AttestationChallenge {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RateLimitCounter {
    pub key: String,
    pub attempt_count: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct BlacklistedToken {
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(ip: Option<&str>, device: Option<&str>, now: DateTime<Utc>) -> RefreshToken {
        RefreshToken {
            id: Uuid::new_v4(),
            principal_id: Uuid::new_v4(),
            token_hash: "hash".into(),
            expires_at: now + Duration::days(1),
            created_at: now,
            revoked: false,
            ip: ip.map(str::to_string),
            device_id: device.map(str::to_string),
        }
    }

    #[test]
    fn text_enums_round_trip_through_str() {
        assert_eq!("worker".parse::<PrincipalKind>(), Ok(PrincipalKind::Worker));
        assert_eq!(Channel::Email.to_string(), "email");
        assert!("windows".parse::<Platform>().is_err());
    }

    #[test]
    fn refresh_token_binding_rules() {
        let now = Utc::now();
        let web = token(Some("1.1.1.1"), None, now);
        assert!(web.validate_for(&ClientBinding::Ip("1.1.1.1".into()), now).is_ok());
        assert_eq!(
            web.validate_for(&ClientBinding::Ip("2.2.2.2".into()), now),
            Err(TokenRejection::IpMismatch)
        );

        let mobile = token(None, Some("D1"), now);
        assert_eq!(
            mobile.validate_for(&ClientBinding::Device("D2".into()), now),
            Err(TokenRejection::DeviceMismatch)
        );

        let legacy = token(None, None, now);
        assert!(legacy.validate_for(&ClientBinding::Device("any".into()), now).is_ok());
    }

    #[test]
    fn refresh_token_expiry_and_revocation() {
        let now = Utc::now();
        let mut t = token(None, None, now);
        assert_eq!(
            t.validate_for(&ClientBinding::Ip("x".into()), now + Duration::days(2)),
            Err(TokenRejection::Expired)
        );
        t.revoked = true;
        assert_eq!(
            t.validate_for(&ClientBinding::Ip("x".into()), now),
            Err(TokenRejection::Revoked)
        );
    }

    #[test]
    fn failure_bookkeeping_locks_on_threshold() {
        let now = Utc::now();
        let mut attempt = LoginAttempt::new(Uuid::new_v4(), now);
        for _ in 0..2 {
            attempt.register_failure(now, Duration::minutes(15), Duration::minutes(15), 3);
            assert!(!attempt.is_locked(now));
        }
        attempt.register_failure(now, Duration::minutes(15), Duration::minutes(15), 3);
        assert_eq!(attempt.attempt_count, 3);
        assert_eq!(attempt.locked_until, Some(now + Duration::minutes(15)));
    }

    #[test]
    fn verified_within_grace() {
        let now = Utc::now();
        let code = VerificationCode {
            id: Uuid::new_v4(),
            kind: PrincipalKind::Worker,
            channel: Channel::Sms,
            principal_id: None,
            destination: "+15551234567".into(),
            code: "123456".into(),
            expires_at: now,
            attempts: 0,
            verified: true,
            verified_at: Some(now),
            verified_by: Some("1.1.1.1".into()),
            created_at: now,
        };
        assert!(code.verified_within(now + Duration::minutes(15), Duration::minutes(15)));
        assert!(!code.verified_within(now + Duration::minutes(16), Duration::minutes(15)));
    }
}
