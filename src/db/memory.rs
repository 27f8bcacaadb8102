//! In-memory storage implementations

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AttestationChallenge, AttestationChallengeStore, Channel, ClientBinding, CredentialStore,
    LoginAttempt, LoginAttemptStore, Principal, PrincipalKind, RateLimitCounter, RateLimitStore,
    RefreshToken, RefreshTokenStore, RotationOutcome, TokenBlacklistStore, VerificationCode,
    VerificationCodeStore,
};
use crate::error::TokenRejection;
use crate::Result;

/// Every auth table held in process memory. Each table sits behind its own
/// mutex, so each trait method is atomic with respect to that table.
#[derive(Default)]
pub struct MemoryStore {
    login_attempts: Mutex<HashMap<Uuid, LoginAttempt>>,
    refresh_tokens: Mutex<HashMap<String, RefreshToken>>,
    counters: Mutex<HashMap<String, RateLimitCounter>>,
    codes: Mutex<Vec<VerificationCode>>,
    challenges: Mutex<HashMap<Uuid, AttestationChallenge>>,
    blacklist: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn refresh_token_count(&self, principal_id: Uuid) -> usize {
        self.refresh_tokens
            .lock()
            .await
            .values()
            .filter(|t| t.principal_id == principal_id)
            .count()
    }

    pub async fn counter(&self, key: &str) -> Option<RateLimitCounter> {
        self.counters.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl LoginAttemptStore for MemoryStore {
    async fn get_or_create(&self, principal_id: Uuid, now: DateTime<Utc>) -> Result<LoginAttempt> {
        let mut attempts = self.login_attempts.lock().await;
        Ok(attempts
            .entry(principal_id)
            .or_insert_with(|| LoginAttempt::new(principal_id, now))
            .clone())
    }

    async fn increment(
        &self,
        principal_id: Uuid,
        lock_duration: Duration,
        window: Duration,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<LoginAttempt> {
        let mut attempts = self.login_attempts.lock().await;
        let record = attempts
            .entry(principal_id)
            .or_insert_with(|| LoginAttempt::new(principal_id, now));
        record.register_failure(now, lock_duration, window, max_attempts);
        Ok(record.clone())
    }

    async fn reset(&self, principal_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut attempts = self.login_attempts.lock().await;
        attempts
            .entry(principal_id)
            .or_insert_with(|| LoginAttempt::new(principal_id, now))
            .clear(now);
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn replace_for_principal(&self, token: &RefreshToken) -> Result<u64> {
        let mut tokens = self.refresh_tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.principal_id != token.principal_id);
        let removed = (before - tokens.len()) as u64;
        tokens.insert(token.token_hash.clone(), token.clone());
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
        let mut tokens = self.refresh_tokens.lock().await;
        let current = match tokens.get(presented_hash) {
            Some(token) => token,
            None => return Ok(RotationOutcome::Rejected(TokenRejection::Unknown)),
        };
        if let Err(rejection) = current.validate_for(binding, now) {
            return Ok(RotationOutcome::Rejected(rejection));
        }

        let principal_id = current.principal_id;
        tokens.remove(presented_hash);
        let next = RefreshToken::new(principal_id, next_hash.to_string(), binding, now, next_ttl);
        tokens.insert(next.token_hash.clone(), next.clone());
        Ok(RotationOutcome::Rotated(next))
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        Ok(self.refresh_tokens.lock().await.get(token_hash).cloned())
    }

    async fn delete_by_hash(&self, token_hash: &str) -> Result<bool> {
        Ok(self.refresh_tokens.lock().await.remove(token_hash).is_some())
    }

    async fn delete_for_principal(&self, principal_id: Uuid) -> Result<u64> {
        let mut tokens = self.refresh_tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.principal_id != principal_id);
        Ok((before - tokens.len()) as u64)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tokens = self.refresh_tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, t| !t.is_expired(now));
        Ok((before - tokens.len()) as u64)
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn increment_and_check(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut counters = self.counters.lock().await;
        let counter = counters
            .entry(key.to_string())
            .or_insert_with(|| RateLimitCounter {
                key: key.to_string(),
                attempt_count: 0,
                expires_at: now + window,
            });

        if counter.expires_at <= now {
            counter.attempt_count = 0;
            counter.expires_at = now + window;
        }
        counter.attempt_count += 1;

        Ok(counter.attempt_count <= limit)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|_, c| c.expires_at > now);
        Ok((before - counters.len()) as u64)
    }
}

#[async_trait]
impl VerificationCodeStore for MemoryStore {
    async fn replace(&self, code: &VerificationCode) -> Result<()> {
        let mut codes = self.codes.lock().await;
        codes.retain(|c| {
            !(c.kind == code.kind && c.channel == code.channel && c.destination == code.destination)
        });
        codes.push(code.clone());
        Ok(())
    }

    async fn latest(
        &self,
        kind: PrincipalKind,
        channel: Channel,
        destination: &str,
    ) -> Result<Option<VerificationCode>> {
        let codes = self.codes.lock().await;
        Ok(codes
            .iter()
            .filter(|c| c.kind == kind && c.channel == channel && c.destination == destination)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn claim_attempt(&self, id: Uuid, max_attempts: i32) -> Result<Option<i32>> {
        let mut codes = self.codes.lock().await;
        Ok(codes
            .iter_mut()
            .find(|c| c.id == id && !c.verified && c.attempts < max_attempts)
            .map(|code| {
                code.attempts += 1;
                code.attempts
            }))
    }

    async fn mark_verified(
        &self,
        id: Uuid,
        verified_at: DateTime<Utc>,
        verified_by: &str,
    ) -> Result<bool> {
        let mut codes = self.codes.lock().await;
        match codes.iter_mut().find(|c| c.id == id && !c.verified) {
            Some(code) => {
                code.verified = true;
                code.verified_at = Some(verified_at);
                code.verified_by = Some(verified_by.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut codes = self.codes.lock().await;
        let before = codes.len();
        codes.retain(|c| c.id != id);
        Ok(codes.len() < before)
    }

    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        verified_before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut codes = self.codes.lock().await;
        let before = codes.len();
        codes.retain(|c| {
            if c.verified {
                matches!(c.verified_at, Some(at) if at >= verified_before)
            } else {
                !c.is_expired(now)
            }
        });
        Ok((before - codes.len()) as u64)
    }
}

#[async_trait]
impl AttestationChallengeStore for MemoryStore {
    async fn insert(&self, challenge: &AttestationChallenge) -> Result<()> {
        self.challenges
            .lock()
            .await
            .insert(challenge.id, challenge.clone());
        Ok(())
    }

    async fn take(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<AttestationChallenge>> {
        let taken = self.challenges.lock().await.remove(&id);
        Ok(taken.filter(|c| !c.is_expired(now)))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut challenges = self.challenges.lock().await;
        let before = challenges.len();
        challenges.retain(|_, c| !c.is_expired(now));
        Ok((before - challenges.len()) as u64)
    }
}

#[async_trait]
impl TokenBlacklistStore for MemoryStore {
    async fn insert(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.blacklist
            .lock()
            .await
            .insert(jti.to_string(), expires_at);
        Ok(())
    }

    async fn contains(&self, jti: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(matches!(self.blacklist.lock().await.get(jti), Some(exp) if *exp > now))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut blacklist = self.blacklist.lock().await;
        let before = blacklist.len();
        blacklist.retain(|_, exp| *exp > now);
        Ok((before - blacklist.len()) as u64)
    }
}

/// In-memory principal directory for development and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    principals: Mutex<HashMap<Uuid, Principal>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, principal: Principal) {
        self.principals.lock().await.insert(principal.id, principal);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_identifier(
        &self,
        kind: PrincipalKind,
        identifier: &str,
    ) -> Result<Option<Principal>> {
        let needle = identifier.trim().to_lowercase();
        let principals = self.principals.lock().await;
        Ok(principals
            .values()
            .find(|p| {
                p.kind == kind
                    && [&p.username, &p.email, &p.phone]
                        .iter()
                        .any(|field| field.as_deref().map_or(false, |v| v.to_lowercase() == needle))
            })
            .cloned())
    }

    async fn exists_for_destination(
        &self,
        kind: PrincipalKind,
        channel: Channel,
        destination: &str,
    ) -> Result<bool> {
        let principals = self.principals.lock().await;
        Ok(principals.values().any(|p| {
            p.kind == kind
                && match channel {
                    Channel::Email => p
                        .email
                        .as_deref()
                        .map_or(false, |email| email.eq_ignore_ascii_case(destination)),
                    Channel::Sms => p.phone.as_deref() == Some(destination),
                }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Platform;
    use std::sync::Arc;

    #[tokio::test]
    async fn counter_restarts_after_window() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let window = Duration::hours(1);

        assert!(store.increment_and_check("sms:global", 2, window, now).await.unwrap());
        assert!(store.increment_and_check("sms:global", 2, window, now).await.unwrap());
        assert!(!store.increment_and_check("sms:global", 2, window, now).await.unwrap());
        assert_eq!(store.counter("sms:global").await.unwrap().attempt_count, 3);

        let later = now + window;
        assert!(store.increment_and_check("sms:global", 2, window, later).await.unwrap());
        assert_eq!(store.counter("sms:global").await.unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn concurrent_increments_are_all_counted() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .increment_and_check("email:global", 10, Duration::hours(1), now)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
        assert_eq!(store.counter("email:global").await.unwrap().attempt_count, 50);
    }

    #[tokio::test]
    async fn challenge_take_is_single_use() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let challenge = AttestationChallenge {
            id: Uuid::new_v4(),
            challenge: vec![7; 32],
            platform: Platform::Ios,
            expires_at: now + Duration::minutes(5),
            created_at: now,
        };
        AttestationChallengeStore::insert(&store, &challenge).await.unwrap();

        assert_eq!(store.take(challenge.id, now).await.unwrap(), Some(challenge.clone()));
        assert_eq!(store.take(challenge.id, now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn verification_cleanup_keeps_live_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let base = VerificationCode {
            id: Uuid::new_v4(),
            kind: PrincipalKind::PropertyManager,
            channel: Channel::Email,
            principal_id: None,
            destination: "a@example.com".into(),
            code: "111111".into(),
            expires_at: now - Duration::minutes(1),
            attempts: 0,
            verified: false,
            verified_at: None,
            verified_by: None,
            created_at: now - Duration::minutes(11),
        };
        let live = VerificationCode {
            id: Uuid::new_v4(),
            destination: "b@example.com".into(),
            expires_at: now + Duration::minutes(5),
            ..base.clone()
        };
        let recently_verified = VerificationCode {
            id: Uuid::new_v4(),
            destination: "c@example.com".into(),
            verified: true,
            verified_at: Some(now - Duration::minutes(2)),
            ..base.clone()
        };
        for code in [&base, &live, &recently_verified] {
            store.replace(code).await.unwrap();
        }

        let removed = VerificationCodeStore::delete_expired(&store, now, now - Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .latest(PrincipalKind::PropertyManager, Channel::Email, "c@example.com")
            .await
            .unwrap()
            .is_some());
    }
}
