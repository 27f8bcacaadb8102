use argon2::{Argon2, PasswordHash, PasswordVerifier};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::error;
use uuid::Uuid;

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP_SECS: u64 = 30;

/// What a client submits to log in. Admins send a password as well as the
/// TOTP code; mobile workers attach an attestation proof.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginCredentials {
    pub identifier: String,
    #[serde(default)]
    pub password: Option<String>,
    pub totp_code: String,
    #[serde(default)]
    pub attestation: Option<AttestationProof>,
}

/// Platform attestation evidence produced over a previously issued challenge.
#[derive(Debug, Clone, Deserialize)]
pub struct AttestationProof {
    pub challenge_id: Uuid,
    pub evidence: String,
}

pub trait TotpVerifier: Send + Sync {
    /// Whether `code` is valid for `secret` at `at`, one step either side.
    fn validate(&self, secret: &str, code: &str, at: DateTime<Utc>) -> bool;
}

/// RFC 6238 verifier: SHA-1, six digits, 30 second steps, base32 secrets.
#[derive(Debug, Default, Clone, Copy)]
pub struct RfcTotpVerifier;

impl TotpVerifier for RfcTotpVerifier {
    fn validate(&self, secret: &str, code: &str, at: DateTime<Utc>) -> bool {
        let secret_bytes = match Secret::Encoded(secret.to_string()).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = ?e, "Stored TOTP secret is not valid base32");
                return false;
            }
        };

        let totp = match TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP_SECS,
            secret_bytes,
        ) {
            Ok(totp) => totp,
            Err(e) => {
                error!(error = ?e, "Stored TOTP secret rejected");
                return false;
            }
        };

        let time = match u64::try_from(at.timestamp()) {
            Ok(time) => time,
            Err(_) => return false,
        };
        totp.check(code.trim(), time)
    }
}

/// Verifies a password against a PHC-format Argon2 hash.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let parsed = match PasswordHash::new(stored_hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(error = %e, "Stored password hash is unreadable");
            return false;
        }
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_totp_accepts_current_and_adjacent_step() {
        let now = Utc::now();
        let verifier = RfcTotpVerifier;

        assert!(verifier.validate(TOTP_SECRET, &current_code(now), now));
        assert!(verifier.validate(TOTP_SECRET, &current_code(now - Duration::seconds(30)), now));
        assert!(!verifier.validate(TOTP_SECRET, &current_code(now - Duration::minutes(5)), now));
    }

    #[test]
    fn test_totp_rejects_bad_secret() {
        assert!(!RfcTotpVerifier.validate("not base32!", "123456", Utc::now()));
    }

    #[test]
    fn test_password_verification() {
        let hash = hash_password("correct horse");
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("battery staple", &hash));
        assert!(!verify_password("correct horse", "garbage"));
    }
}
