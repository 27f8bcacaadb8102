//! Outbound collaborators of the verification flow: message delivery and
//! destination deliverability checks.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::VerificationConfig;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;

    async fn send_sms(&self, to: &str, body: &str) -> anyhow::Result<()>;
}

/// Development notifier. Records that a message went out without the
/// message body, which carries the code.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        info!(to, subject, body_len = body.len(), "Email dispatched");
        Ok(())
    }

    async fn send_sms(&self, to: &str, body: &str) -> anyhow::Result<()> {
        info!(to, body_len = body.len(), "SMS dispatched");
        Ok(())
    }
}

/// `Ok(false)` means the destination is unusable; `Err` means the check
/// itself could not be carried out.
#[async_trait]
pub trait DeliverabilityValidator: Send + Sync {
    async fn validate_email(&self, address: &str) -> anyhow::Result<bool>;

    async fn validate_phone(&self, number: &str) -> anyhow::Result<bool>;
}

/// Syntax-only checks: a single `@` with a dotted domain, and E.164 numbers.
#[derive(Debug, Clone)]
pub struct FormatValidator {
    email: Regex,
    phone: Regex,
}

impl FormatValidator {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            email: Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")?,
            phone: Regex::new(r"^\+[1-9][0-9]{6,14}$")?,
        })
    }

    pub fn is_email(&self, address: &str) -> bool {
        address.len() <= 254 && self.email.is_match(address)
    }

    pub fn is_phone(&self, number: &str) -> bool {
        self.phone.is_match(number)
    }
}

#[async_trait]
impl DeliverabilityValidator for FormatValidator {
    async fn validate_email(&self, address: &str) -> anyhow::Result<bool> {
        Ok(self.is_email(address))
    }

    async fn validate_phone(&self, number: &str) -> anyhow::Result<bool> {
        Ok(self.is_phone(number))
    }
}

#[derive(Debug, Deserialize)]
struct DeliverabilityResponse {
    deliverable: bool,
}

/// Format check followed by a lookup against a third-party deliverability
/// API (`GET {base}/v1/email?address=` and `GET {base}/v1/phone?number=`).
/// A path prefix on `base` is kept.
#[derive(Debug, Clone)]
pub struct HttpDeliverabilityValidator {
    client: reqwest::Client,
    base_url: url::Url,
    api_key: Option<String>,
    format: FormatValidator,
}

impl HttpDeliverabilityValidator {
    pub fn new(base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build deliverability client")?;

        let mut base_url = url::Url::parse(base_url).context("invalid deliverability api url")?;
        // Lookups join relative paths, so keep any prefix as a directory.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            api_key,
            format: FormatValidator::new()?,
        })
    }

    async fn lookup(&self, path: &str, param: &str, value: &str) -> anyhow::Result<bool> {
        let url = self.base_url.join(path)?;
        let mut request = self.client.get(url).query(&[(param, value)]);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request.send().await.context("deliverability request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "deliverability api returned status {}",
                response.status()
            ));
        }

        let body: DeliverabilityResponse = response
            .json()
            .await
            .context("invalid deliverability response")?;
        debug!(path, deliverable = body.deliverable, "Deliverability lookup");
        Ok(body.deliverable)
    }
}

#[async_trait]
impl DeliverabilityValidator for HttpDeliverabilityValidator {
    async fn validate_email(&self, address: &str) -> anyhow::Result<bool> {
        if !self.format.is_email(address) {
            return Ok(false);
        }
        self.lookup("v1/email", "address", address).await
    }

    async fn validate_phone(&self, number: &str) -> anyhow::Result<bool> {
        if !self.format.is_phone(number) {
            return Ok(false);
        }
        self.lookup("v1/phone", "number", number).await
    }
}

/// Turns either check into an always-true no-op when its flag is off.
pub struct FlaggedValidator {
    inner: Arc<dyn DeliverabilityValidator>,
    check_email: bool,
    check_phone: bool,
}

impl FlaggedValidator {
    pub fn new(inner: Arc<dyn DeliverabilityValidator>, check_email: bool, check_phone: bool) -> Self {
        Self {
            inner,
            check_email,
            check_phone,
        }
    }

    /// Format-only unless an API endpoint is configured.
    pub fn from_config(config: &VerificationConfig) -> anyhow::Result<Self> {
        let inner: Arc<dyn DeliverabilityValidator> = match &config.deliverability_api_url {
            Some(url) => Arc::new(HttpDeliverabilityValidator::new(
                url,
                config.deliverability_api_key.clone(),
            )?),
            None => Arc::new(FormatValidator::new()?),
        };

        Ok(Self::new(
            inner,
            config.check_email_deliverability,
            config.check_phone_deliverability,
        ))
    }
}

#[async_trait]
impl DeliverabilityValidator for FlaggedValidator {
    async fn validate_email(&self, address: &str) -> anyhow::Result<bool> {
        if !self.check_email {
            return Ok(true);
        }
        self.inner.validate_email(address).await
    }

    async fn validate_phone(&self, number: &str) -> anyhow::Result<bool> {
        if !self.check_phone {
            return Ok(true);
        }
        self.inner.validate_phone(number).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_rules() {
        let format = FormatValidator::new().unwrap();
        assert!(format.is_email("a.b@example.com"));
        assert!(!format.is_email("a@b"));
        assert!(!format.is_email("two@@example.com"));
        assert!(format.is_phone("+15551234567"));
        assert!(!format.is_phone("5551234567"));
        assert!(!format.is_phone("+0123456789"));
    }

    #[tokio::test]
    async fn test_disabled_checks_always_pass() {
        let inner = Arc::new(FormatValidator::new().unwrap());
        let validator = FlaggedValidator::new(inner, false, true);

        assert!(validator.validate_email("not an email").await.unwrap());
        assert!(!validator.validate_phone("not a phone").await.unwrap());
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        LogNotifier
            .send_sms("+15551234567", "Your code is 123456")
            .await
            .unwrap();
    }
}
