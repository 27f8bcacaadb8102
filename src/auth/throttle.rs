use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::LockoutConfig;
use crate::db::{LoginAttempt, LoginAttemptStore};
use crate::Result;

/// Per-principal failed-login counter with windowed lockout.
#[derive(Clone)]
pub struct LoginThrottle {
    store: Arc<dyn LoginAttemptStore>,
    clock: Arc<dyn Clock>,
}

impl LoginThrottle {
    pub fn new(store: Arc<dyn LoginAttemptStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn get_or_create(&self, principal_id: Uuid) -> Result<LoginAttempt> {
        self.store.get_or_create(principal_id, self.clock.now()).await
    }

    /// Returns whether the principal is locked and, if so, until when.
    pub async fn is_locked(&self, principal_id: Uuid) -> Result<(bool, Option<DateTime<Utc>>)> {
        let now = self.clock.now();
        let attempt = self.store.get_or_create(principal_id, now).await?;

        if attempt.is_locked(now) {
            Ok((true, attempt.locked_until))
        } else {
            Ok((false, None))
        }
    }

    pub async fn record_failure(
        &self,
        principal_id: Uuid,
        policy: &LockoutConfig,
    ) -> Result<LoginAttempt> {
        let now = self.clock.now();
        let attempt = self
            .store
            .increment(
                principal_id,
                policy.lock_duration(),
                policy.window(),
                policy.max_attempts,
                now,
            )
            .await?;

        if lock_engaged(&attempt, now) {
            warn!(
                principal_id = %principal_id,
                attempts = attempt.attempt_count,
                locked_until = ?attempt.locked_until,
                "Account locked after repeated login failures"
            );
        }

        Ok(attempt)
    }

    pub async fn reset(&self, principal_id: Uuid) -> Result<()> {
        self.store.reset(principal_id, self.clock.now()).await
    }
}

/// Callers only record a failure after seeing the principal unlocked, so a
/// lock in effect right after the increment was set by it. Stores may round
/// `locked_until`, so no exact comparison.
fn lock_engaged(attempt: &LoginAttempt, now: DateTime<Utc>) -> bool {
    attempt.is_locked(now)
}
