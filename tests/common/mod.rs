#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketplace_auth::auth::{AttestationVerifier, AuthContext, AuthStores, Delivery};
use marketplace_auth::clock::{ManualClock, OsRandom};
use marketplace_auth::db::{
    AttestationChallenge, MemoryCredentialStore, MemoryStore, Principal, PrincipalKind,
};
use marketplace_auth::notify::{DeliverabilityValidator, FlaggedValidator, Notifier};
use marketplace_auth::Settings;
use mockall::mock;
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

pub const TOTP_SECRET: &str = "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP";

mock! {
    pub Notifier {}

    #[async_trait]
    impl Notifier for Notifier {
        async fn send_email(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
        async fn send_sms(&self, to: &str, body: &str) -> anyhow::Result<()>;
    }
}

mock! {
    pub Attestation {}

    #[async_trait]
    impl AttestationVerifier for Attestation {
        async fn verify(
            &self,
            challenge: &AttestationChallenge,
            encoded_challenge: &str,
            evidence: &str,
        ) -> anyhow::Result<Option<String>>;
    }
}

pub struct TestApp {
    pub ctx: AuthContext,
    pub store: Arc<MemoryStore>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub clock: Arc<ManualClock>,
}

pub fn settings() -> Settings {
    Settings::new_for_test().expect("Failed to load test config")
}

pub fn test_app(settings: Settings, notifier: Arc<dyn Notifier>) -> TestApp {
    let validator = FlaggedValidator::from_config(&settings.verification).unwrap();
    test_app_with(settings, notifier, Arc::new(validator))
}

pub fn test_app_with(
    settings: Settings,
    notifier: Arc<dyn Notifier>,
    validator: Arc<dyn DeliverabilityValidator>,
) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let credentials = Arc::new(MemoryCredentialStore::new());
    let clock = Arc::new(ManualClock::default());

    let ctx = AuthContext::new(
        Arc::new(settings),
        AuthStores::shared(store.clone(), credentials.clone()),
        Delivery {
            validator,
            notifier,
        },
        clock.clone(),
        Arc::new(OsRandom),
    )
    .expect("Failed to build auth context");

    TestApp {
        ctx,
        store,
        credentials,
        clock,
    }
}

/// Notifier that accepts every message.
pub fn accepting_notifier() -> MockNotifier {
    let mut notifier = MockNotifier::new();
    notifier.expect_send_sms().returning(|_, _| Ok(()));
    notifier.expect_send_email().returning(|_, _, _| Ok(()));
    notifier
}

fn totp() -> TOTP {
    let secret = Secret::Encoded(TOTP_SECRET.to_string()).to_bytes().unwrap();
    TOTP::new(Algorithm::SHA1, 6, 1, 30, secret).unwrap()
}

pub fn totp_code(at: DateTime<Utc>) -> String {
    totp().generate(at.timestamp() as u64)
}

/// A six digit code that is not valid in the current or adjacent steps.
pub fn wrong_totp_code(at: DateTime<Utc>) -> String {
    let totp = totp();
    let valid: Vec<String> = [-30i64, 0, 30]
        .iter()
        .map(|offset| totp.generate((at.timestamp() + offset) as u64))
        .collect();
    (0..)
        .map(|n| format!("{:06}", n))
        .find(|candidate| !valid.contains(candidate))
        .unwrap()
}

pub fn hash_password(password: &str) -> String {
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::Argon2;

    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

pub async fn add_worker(app: &TestApp, phone: &str) -> Principal {
    let principal = Principal {
        id: Uuid::new_v4(),
        kind: PrincipalKind::Worker,
        username: None,
        email: None,
        phone: Some(phone.to_string()),
        password_hash: None,
        totp_secret: TOTP_SECRET.to_string(),
        is_active: true,
    };
    app.credentials.insert(principal.clone()).await;
    principal
}

pub async fn add_property_manager(app: &TestApp, email: &str) -> Principal {
    let principal = Principal {
        id: Uuid::new_v4(),
        kind: PrincipalKind::PropertyManager,
        username: None,
        email: Some(email.to_string()),
        phone: None,
        password_hash: None,
        totp_secret: TOTP_SECRET.to_string(),
        is_active: true,
    };
    app.credentials.insert(principal.clone()).await;
    principal
}

pub async fn add_admin(app: &TestApp, username: &str, password: &str) -> Principal {
    let principal = Principal {
        id: Uuid::new_v4(),
        kind: PrincipalKind::Admin,
        username: Some(username.to_string()),
        email: None,
        phone: None,
        password_hash: Some(hash_password(password)),
        totp_secret: TOTP_SECRET.to_string(),
        is_active: true,
    };
    app.credentials.insert(principal.clone()).await;
    principal
}
