//! Authentication core
//!
//! Credential checks, brute-force lockout, access/refresh token lifecycle,
//! verification codes and mobile attestation challenges.

mod attestation;
mod credentials;
mod rate_limit;
mod service;
mod sessions;
mod throttle;
mod tokens;
mod transport;
mod verification;

pub use attestation::{encode_challenge, AttestationVerifier, ChallengeManager, IssuedChallenge};
pub use credentials::{
    verify_password, AttestationProof, LoginCredentials, RfcTotpVerifier, TotpVerifier,
};
pub use rate_limit::{RateLimitTier, RateLimiter};
pub use service::{AuthContext, AuthService, AuthStores, LoginSuccess};
pub use sessions::{SessionManager, TokenPair, TokenTtls};
pub use throttle::LoginThrottle;
pub use tokens::{hash_token, AccessToken, Claims, TokenIssuer, TokenVerifier};
pub use transport::{bearer_token, peer_ip, TokenDelivery, DEVICE_ID_HEADER};
pub use verification::{Delivery, Destination, VerificationService};
