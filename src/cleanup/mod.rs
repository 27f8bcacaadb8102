//! Periodic removal of expired auth records
//!
//! Every deletion targets rows that are already ignored by the live checks,
//! so the job can run at any time alongside traffic.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::auth::{AuthContext, ChallengeManager, RateLimiter, SessionManager};
use crate::clock::Clock;
use crate::db::{TokenBlacklistStore, VerificationCodeStore};
use crate::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub refresh_tokens: u64,
    pub verification_codes: u64,
    pub rate_limit_counters: u64,
    pub attestation_challenges: u64,
    pub blacklisted_tokens: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.refresh_tokens
            + self.verification_codes
            + self.rate_limit_counters
            + self.attestation_challenges
            + self.blacklisted_tokens
    }
}

pub struct CleanupJob {
    sessions: SessionManager,
    rate_limiter: RateLimiter,
    challenges: ChallengeManager,
    codes: Arc<dyn VerificationCodeStore>,
    blacklist: Arc<dyn TokenBlacklistStore>,
    verified_grace: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl CleanupJob {
    pub fn new(ctx: &AuthContext) -> Self {
        Self {
            sessions: ctx.sessions(),
            rate_limiter: ctx.rate_limiter(),
            challenges: ctx.challenges(),
            codes: ctx.stores.verification_codes.clone(),
            blacklist: ctx.stores.blacklist.clone(),
            verified_grace: ctx.settings.verification.grace_window(),
            clock: ctx.clock.clone(),
        }
    }

    pub async fn run_once(&self) -> Result<CleanupReport> {
        let now = self.clock.now();

        let (refresh_tokens, verification_codes, rate_limit_counters, attestation_challenges, blacklisted_tokens) =
            futures::try_join!(
                self.sessions.cleanup(),
                self.codes.delete_expired(now, now - self.verified_grace),
                self.rate_limiter.cleanup(),
                self.challenges.cleanup(),
                self.blacklist.delete_expired(now),
            )?;

        let report = CleanupReport {
            refresh_tokens,
            verification_codes,
            rate_limit_counters,
            attestation_challenges,
            blacklisted_tokens,
        };

        info!(
            refresh_tokens = report.refresh_tokens,
            verification_codes = report.verification_codes,
            rate_limit_counters = report.rate_limit_counters,
            attestation_challenges = report.attestation_challenges,
            blacklisted_tokens = report.blacklisted_tokens,
            "Expired auth records removed"
        );
        Ok(report)
    }

    /// Runs immediately, then once per `every`. A failed pass is logged and
    /// retried on the next tick.
    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "Cleanup pass failed");
                }
            }
        })
    }
}
