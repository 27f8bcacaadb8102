use std::sync::Arc;
use tracing::warn;

use crate::clock::Clock;
use crate::config::{ChannelLimits, RateLimitConfig};
use crate::db::{Channel, RateLimitStore};
use crate::error::AuthError;
use crate::Result;

/// Which of the three verification-send limits tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitTier {
    Global,
    Source,
    Destination,
}

impl RateLimitTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitTier::Global => "global",
            RateLimitTier::Source => "source",
            RateLimitTier::Destination => "destination",
        }
    }
}

/// Gate for outbound verification messages: global, per-source and
/// per-destination fixed-window caps, checked in that order.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub async fn check_sms_rate_limits(&self, source: &str, phone: &str) -> Result<()> {
        self.check_rate_limits(Channel::Sms, source, phone).await
    }

    pub async fn check_email_rate_limits(&self, source: &str, address: &str) -> Result<()> {
        self.check_rate_limits(Channel::Email, source, address).await
    }

    pub async fn check_rate_limits(
        &self,
        channel: Channel,
        source: &str,
        destination: &str,
    ) -> Result<()> {
        let limits = self.limits_for(channel);
        let prefix = channel.as_str();

        let tiers = [
            (RateLimitTier::Global, format!("{}:global", prefix), limits.global),
            (
                RateLimitTier::Source,
                format!("{}:ip:{}", prefix, source),
                limits.per_source,
            ),
            (
                RateLimitTier::Destination,
                format!("{}:{}:{}", prefix, channel.destination_label(), destination),
                limits.per_destination,
            ),
        ];

        for (tier, key, limit) in tiers {
            if !self.increment_and_check(&key, limit).await? {
                warn!(
                    channel = prefix,
                    tier = tier.as_str(),
                    key = %key,
                    "Verification send rate limit exceeded"
                );
                return Err(AuthError::RateLimitExceeded { tier }.into());
            }
        }

        Ok(())
    }

    /// Counts the request even when it ends up rejected.
    pub async fn increment_and_check(&self, key: &str, limit: i64) -> Result<bool> {
        self.store
            .increment_and_check(key, limit, self.config.window(), self.clock.now())
            .await
    }

    pub async fn cleanup(&self) -> Result<u64> {
        self.store.delete_expired(self.clock.now()).await
    }

    fn limits_for(&self, channel: Channel) -> ChannelLimits {
        match channel {
            Channel::Sms => self.config.sms,
            Channel::Email => self.config.email,
        }
    }
}
