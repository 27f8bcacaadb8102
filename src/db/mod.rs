//! Storage capabilities for the auth core.
//!
//! One trait per record family. The atomicity each method promises is the
//! contract; [`postgres::PgStore`] meets it with row locks and single
//! statements, [`memory::MemoryStore`] with a mutex per table.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::Result;

pub use memory::{MemoryCredentialStore, MemoryStore};
pub use models::{
    AttestationChallenge, BlacklistedToken, Channel, ClientBinding, LoginAttempt, Platform,
    Principal, PrincipalKind, RateLimitCounter, RefreshToken, RotationOutcome, VerificationCode,
};
pub use postgres::PgStore;

#[async_trait]
pub trait LoginAttemptStore: Send + Sync {
    /// Fetch the record, inserting a zeroed one when absent.
    async fn get_or_create(&self, principal_id: Uuid, now: DateTime<Utc>) -> Result<LoginAttempt>;

    /// Apply one failed attempt atomically:
    /// locked rows are left untouched, a gap longer than `window` restarts
    /// the count at 1, otherwise the count grows and reaching `max_attempts`
    /// sets `locked_until = now + lock_duration`.
    async fn increment(
        &self,
        principal_id: Uuid,
        lock_duration: Duration,
        window: Duration,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<LoginAttempt>;

    async fn reset(&self, principal_id: Uuid, now: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Delete every token of the principal and store `token`, in one
    /// transaction. Returns how many tokens were removed.
    async fn replace_for_principal(&self, token: &RefreshToken) -> Result<u64>;

    /// Lock the row matching `presented_hash`, validate it against `binding`,
    /// delete it and insert a successor carrying `next_hash`. Of two
    /// concurrent callers presenting the same hash exactly one is `Rotated`.
    async fn rotate(
        &self,
        presented_hash: &str,
        binding: &ClientBinding,
        next_hash: &str,
        next_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>>;

    async fn delete_by_hash(&self, token_hash: &str) -> Result<bool>;

    async fn delete_for_principal(&self, principal_id: Uuid) -> Result<u64>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomic fixed-window upsert. A missing or expired key restarts at 1
    /// expiring at `now + window`; otherwise the count grows. Returns whether
    /// the post-increment count is within `limit`.
    async fn increment_and_check(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait VerificationCodeStore: Send + Sync {
    /// Remove any code for the same (kind, channel, destination) and store
    /// `code`. Concurrent callers may both succeed; the newest row wins.
    async fn replace(&self, code: &VerificationCode) -> Result<()>;

    async fn latest(
        &self,
        kind: PrincipalKind,
        channel: Channel,
        destination: &str,
    ) -> Result<Option<VerificationCode>>;

    /// Count one submission against an unverified row, atomically, only
    /// while `attempts < max_attempts`. Returns the new count, or `None` when
    /// the cap is reached or the row is gone.
    async fn claim_attempt(&self, id: Uuid, max_attempts: i32) -> Result<Option<i32>>;

    /// Flip `verified` on an unverified row. False when another caller got
    /// there first or the row is gone.
    async fn mark_verified(
        &self,
        id: Uuid,
        verified_at: DateTime<Utc>,
        verified_by: &str,
    ) -> Result<bool>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Drop unverified codes past expiry and verified codes older than
    /// `verified_before`.
    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        verified_before: DateTime<Utc>,
    ) -> Result<u64>;
}

#[async_trait]
pub trait AttestationChallengeStore: Send + Sync {
    async fn insert(&self, challenge: &AttestationChallenge) -> Result<()>;

    /// Read and delete in one step. Expired rows are removed too but come
    /// back as `None`.
    async fn take(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<AttestationChallenge>>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait TokenBlacklistStore: Send + Sync {
    async fn insert(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()>;

    async fn contains(&self, jti: &str, now: DateTime<Utc>) -> Result<bool>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Read side of the account tables, owned by registration.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look a principal up by username, email or phone.
    async fn find_by_identifier(
        &self,
        kind: PrincipalKind,
        identifier: &str,
    ) -> Result<Option<Principal>>;

    async fn exists_for_destination(
        &self,
        kind: PrincipalKind,
        channel: Channel,
        destination: &str,
    ) -> Result<bool>;
}
