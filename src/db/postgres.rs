use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    AttestationChallenge, AttestationChallengeStore, Channel, ClientBinding, CredentialStore,
    LoginAttempt, LoginAttemptStore, Principal, PrincipalKind, RateLimitStore, RefreshToken,
    RefreshTokenStore, RotationOutcome, TokenBlacklistStore, VerificationCode,
    VerificationCodeStore,
};
use crate::error::{AppError, DatabaseError, TokenRejection};
use crate::Result;

const LOGIN_ATTEMPT_COLUMNS: &str =
    "principal_id, attempt_count, locked_until, updated_at, created_at";
const REFRESH_TOKEN_COLUMNS: &str =
    "id, principal_id, token_hash, expires_at, created_at, revoked, ip, device_id";
const VERIFICATION_COLUMNS: &str = "id, kind, channel, principal_id, destination, code, expires_at, \
     attempts, verified, verified_at, verified_by, created_at";

/// Postgres-backed implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: std::time::Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| AppError::DatabaseError(DatabaseError::ConnectionError(e.to_string())))?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        self.pool.as_ref()
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.pool.as_ref().begin().await?)
    }

    async fn insert_refresh_token(
        token: &RefreshToken,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, principal_id, token_hash, expires_at, created_at, revoked, ip, device_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(token.id)
        .bind(token.principal_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(token.created_at)
        .bind(token.revoked)
        .bind(&token.ip)
        .bind(&token.device_id)
        .execute(&mut **transaction)
        .await?;

        Ok(())
    }
}

fn parse_text<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|e| {
        AppError::DatabaseError(DatabaseError::CorruptRecord(format!("{}: {}", column, e)))
    })
}

fn verification_from_row(row: &PgRow) -> Result<VerificationCode> {
    Ok(VerificationCode {
        id: row.try_get("id")?,
        kind: parse_text(row, "kind")?,
        channel: parse_text(row, "channel")?,
        principal_id: row.try_get("principal_id")?,
        destination: row.try_get("destination")?,
        code: row.try_get("code")?,
        expires_at: row.try_get("expires_at")?,
        attempts: row.try_get("attempts")?,
        verified: row.try_get("verified")?,
        verified_at: row.try_get("verified_at")?,
        verified_by: row.try_get("verified_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn challenge_from_row(row: &PgRow) -> Result<AttestationChallenge> {
    Ok(AttestationChallenge {
        id: row.try_get("id")?,
        challenge: row.try_get("challenge")?,
        platform: parse_text(row, "platform")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn principal_from_row(row: &PgRow) -> Result<Principal> {
    Ok(Principal {
        id: row.try_get("id")?,
        kind: parse_text(row, "kind")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        password_hash: row.try_get("password_hash")?,
        totp_secret: row.try_get("totp_secret")?,
        is_active: row.try_get("is_active")?,
    })
}

#[async_trait]
impl LoginAttemptStore for PgStore {
    async fn get_or_create(&self, principal_id: Uuid, now: DateTime<Utc>) -> Result<LoginAttempt> {
        let attempt = sqlx::query_as::<_, LoginAttempt>(&format!(
            r#"
            INSERT INTO login_attempts (principal_id, attempt_count, locked_until, updated_at, created_at)
            VALUES ($1, 0, NULL, $2, $2)
            ON CONFLICT (principal_id) DO UPDATE SET principal_id = EXCLUDED.principal_id
            RETURNING {}
            "#,
            LOGIN_ATTEMPT_COLUMNS
        ))
        .bind(principal_id)
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(attempt)
    }

    async fn increment(
        &self,
        principal_id: Uuid,
        lock_duration: Duration,
        window: Duration,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<LoginAttempt> {
        // The upsert holds the row lock, so concurrent failures serialize here.
        let attempt = sqlx::query_as::<_, LoginAttempt>(&format!(
            r#"
            INSERT INTO login_attempts (principal_id, attempt_count, locked_until, updated_at, created_at)
            VALUES ($1, 1, CASE WHEN 1 >= $5 THEN $3 ELSE NULL END, $2, $2)
            ON CONFLICT (principal_id) DO UPDATE SET
                attempt_count = CASE
                    WHEN login_attempts.locked_until > $2 THEN login_attempts.attempt_count
                    WHEN login_attempts.updated_at < $4 THEN 1
                    ELSE login_attempts.attempt_count + 1
                END,
                locked_until = CASE
                    WHEN login_attempts.locked_until > $2 THEN login_attempts.locked_until
                    WHEN login_attempts.updated_at < $4 THEN CASE WHEN 1 >= $5 THEN $3 ELSE NULL END
                    WHEN login_attempts.attempt_count + 1 >= $5 THEN $3
                    ELSE NULL
                END,
                updated_at = CASE
                    WHEN login_attempts.locked_until > $2 THEN login_attempts.updated_at
                    ELSE $2
                END
            RETURNING {}
            "#,
            LOGIN_ATTEMPT_COLUMNS
        ))
        .bind(principal_id)
        .bind(now)
        .bind(now + lock_duration)
        .bind(now - window)
        .bind(max_attempts)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(attempt)
    }

    async fn reset(&self, principal_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO login_attempts (principal_id, attempt_count, locked_until, updated_at, created_at)
            VALUES ($1, 0, NULL, $2, $2)
            ON CONFLICT (principal_id) DO UPDATE SET
                attempt_count = 0,
                locked_until = NULL,
                updated_at = $2
            "#,
        )
        .bind(principal_id)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for PgStore {
    async fn replace_for_principal(&self, token: &RefreshToken) -> Result<u64> {
        let mut transaction = self.begin_transaction().await?;

        let removed = sqlx::query("DELETE FROM refresh_tokens WHERE principal_id = $1")
            .bind(token.principal_id)
            .execute(&mut *transaction)
            .await?
            .rows_affected();
        Self::insert_refresh_token(token, &mut transaction).await?;

        transaction.commit().await?;
        Ok(removed)
    }

    async fn rotate(
        &self,
        presented_hash: &str,
        binding: &ClientBinding,
        next_hash: &str,
        next_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome> {
        let mut transaction = self.begin_transaction().await?;

        let current = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {} FROM refresh_tokens WHERE token_hash = $1 FOR UPDATE",
            REFRESH_TOKEN_COLUMNS
        ))
        .bind(presented_hash)
        .fetch_optional(&mut *transaction)
        .await?;

        let current = match current {
            Some(token) => token,
            None => {
                transaction.rollback().await?;
                return Ok(RotationOutcome::Rejected(TokenRejection::Unknown));
            }
        };

        if let Err(rejection) = current.validate_for(binding, now) {
            transaction.rollback().await?;
            return Ok(RotationOutcome::Rejected(rejection));
        }

        sqlx::query("DELETE FROM refresh_tokens WHERE id = $1")
            .bind(current.id)
            .execute(&mut *transaction)
            .await?;

        let next = RefreshToken::new(
            current.principal_id,
            next_hash.to_string(),
            binding,
            now,
            next_ttl,
        );
        Self::insert_refresh_token(&next, &mut transaction).await?;

        transaction.commit().await?;
        Ok(RotationOutcome::Rotated(next))
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        let token = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {} FROM refresh_tokens WHERE token_hash = $1",
            REFRESH_TOKEN_COLUMNS
        ))
        .bind(token_hash)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(token)
    }

    async fn delete_by_hash(&self, token_hash: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_for_principal(&self, principal_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE principal_id = $1")
            .bind(principal_id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RateLimitStore for PgStore {
    async fn increment_and_check(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO rate_limit_counters (key, attempt_count, expires_at)
            VALUES ($1, 1, $2)
            ON CONFLICT (key) DO UPDATE SET
                attempt_count = CASE
                    WHEN rate_limit_counters.expires_at <= $3 THEN 1
                    ELSE rate_limit_counters.attempt_count + 1
                END,
                expires_at = CASE
                    WHEN rate_limit_counters.expires_at <= $3 THEN $2
                    ELSE rate_limit_counters.expires_at
                END
            RETURNING attempt_count
            "#,
        )
        .bind(key)
        .bind(now + window)
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(count <= limit)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_counters WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl VerificationCodeStore for PgStore {
    async fn replace(&self, code: &VerificationCode) -> Result<()> {
        let mut transaction = self.begin_transaction().await?;

        sqlx::query(
            "DELETE FROM verification_codes WHERE kind = $1 AND channel = $2 AND destination = $3",
        )
        .bind(code.kind.as_str())
        .bind(code.channel.as_str())
        .bind(&code.destination)
        .execute(&mut *transaction)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO verification_codes
                (id, kind, channel, principal_id, destination, code, expires_at, attempts, verified, verified_at, verified_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(code.id)
        .bind(code.kind.as_str())
        .bind(code.channel.as_str())
        .bind(code.principal_id)
        .bind(&code.destination)
        .bind(&code.code)
        .bind(code.expires_at)
        .bind(code.attempts)
        .bind(code.verified)
        .bind(code.verified_at)
        .bind(&code.verified_by)
        .bind(code.created_at)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;
        Ok(())
    }

    async fn latest(
        &self,
        kind: PrincipalKind,
        channel: Channel,
        destination: &str,
    ) -> Result<Option<VerificationCode>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM verification_codes
            WHERE kind = $1 AND channel = $2 AND destination = $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            VERIFICATION_COLUMNS
        ))
        .bind(kind.as_str())
        .bind(channel.as_str())
        .bind(destination)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.as_ref().map(verification_from_row).transpose()
    }

    async fn claim_attempt(&self, id: Uuid, max_attempts: i32) -> Result<Option<i32>> {
        let attempts = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE verification_codes SET attempts = attempts + 1
            WHERE id = $1 AND verified = FALSE AND attempts < $2
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(max_attempts)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(attempts)
    }

    async fn mark_verified(
        &self,
        id: Uuid,
        verified_at: DateTime<Utc>,
        verified_by: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE verification_codes
            SET verified = TRUE, verified_at = $2, verified_by = $3
            WHERE id = $1 AND verified = FALSE
            "#,
        )
        .bind(id)
        .bind(verified_at)
        .bind(verified_by)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM verification_codes WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        verified_before: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM verification_codes
            WHERE (verified = FALSE AND expires_at < $1)
               OR (verified = TRUE AND (verified_at IS NULL OR verified_at < $2))
            "#,
        )
        .bind(now)
        .bind(verified_before)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AttestationChallengeStore for PgStore {
    async fn insert(&self, challenge: &AttestationChallenge) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO attestation_challenges (id, challenge, platform, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(challenge.id)
        .bind(&challenge.challenge)
        .bind(challenge.platform.as_str())
        .bind(challenge.expires_at)
        .bind(challenge.created_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn take(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<AttestationChallenge>> {
        let row = sqlx::query(
            r#"
            DELETE FROM attestation_challenges WHERE id = $1
            RETURNING id, challenge, platform, expires_at, created_at
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        let challenge = row.as_ref().map(challenge_from_row).transpose()?;
        Ok(challenge.filter(|c| !c.is_expired(now)))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM attestation_challenges WHERE expires_at < $1")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TokenBlacklistStore for PgStore {
    async fn insert(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO blacklisted_tokens (jti, expires_at) VALUES ($1, $2)
            ON CONFLICT (jti) DO UPDATE SET expires_at = GREATEST(blacklisted_tokens.expires_at, EXCLUDED.expires_at)
            "#,
        )
        .bind(jti)
        .bind(expires_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn contains(&self, jti: &str, now: DateTime<Utc>) -> Result<bool> {
        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM blacklisted_tokens WHERE jti = $1 AND expires_at > $2")
                .bind(jti)
                .bind(now)
                .fetch_optional(self.pool.as_ref())
                .await?;

        Ok(found.is_some())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM blacklisted_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_by_identifier(
        &self,
        kind: PrincipalKind,
        identifier: &str,
    ) -> Result<Option<Principal>> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, username, email, phone, password_hash, totp_secret, is_active
            FROM principals
            WHERE kind = $1
              AND (lower(username) = lower($2) OR lower(email) = lower($2) OR phone = $2)
            LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .bind(identifier.trim())
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.as_ref().map(principal_from_row).transpose()
    }

    async fn exists_for_destination(
        &self,
        kind: PrincipalKind,
        channel: Channel,
        destination: &str,
    ) -> Result<bool> {
        let sql = match channel {
            Channel::Email => "SELECT EXISTS(SELECT 1 FROM principals WHERE kind = $1 AND lower(email) = lower($2))",
            Channel::Sms => "SELECT EXISTS(SELECT 1 FROM principals WHERE kind = $1 AND phone = $2)",
        };
        let exists: bool = sqlx::query_scalar(sql)
            .bind(kind.as_str())
            .bind(destination)
            .fetch_one(self.pool.as_ref())
            .await?;

        Ok(exists)
    }
}
