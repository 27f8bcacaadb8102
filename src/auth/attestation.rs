use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::clock::{Clock, SecureRandom};
use crate::db::{AttestationChallenge, AttestationChallengeStore, Platform};
use crate::Result;

const CHALLENGE_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct IssuedChallenge {
    pub challenge_id: Uuid,
    pub challenge: String,
    pub expires_at: DateTime<Utc>,
}

/// Android attestation signs over a digest of the nonce, iOS over the nonce
/// itself.
pub fn encode_challenge(platform: Platform, raw: &[u8]) -> String {
    match platform {
        Platform::Android => URL_SAFE_NO_PAD.encode(Sha256::digest(raw)),
        Platform::Ios => URL_SAFE_NO_PAD.encode(raw),
    }
}

/// Checks platform attestation evidence (App Attest, Play Integrity) against
/// a consumed challenge. Returns the device fingerprint to embed in the access
/// token, or `None` when the evidence does not hold up.
#[async_trait]
pub trait AttestationVerifier: Send + Sync {
    async fn verify(
        &self,
        challenge: &AttestationChallenge,
        encoded_challenge: &str,
        evidence: &str,
    ) -> anyhow::Result<Option<String>>;
}

/// Single-use, short-lived challenges for mobile attestation.
#[derive(Clone)]
pub struct ChallengeManager {
    store: Arc<dyn AttestationChallengeStore>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn SecureRandom>,
    ttl: Duration,
}

impl ChallengeManager {
    pub fn new(
        store: Arc<dyn AttestationChallengeStore>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn SecureRandom>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            random,
            ttl,
        }
    }

    pub async fn issue_challenge(&self, platform: Platform) -> Result<IssuedChallenge> {
        let mut raw = vec![0u8; CHALLENGE_BYTES];
        self.random.fill_bytes(&mut raw);

        let now = self.clock.now();
        let challenge = AttestationChallenge {
            id: Uuid::new_v4(),
            challenge: raw,
            platform,
            expires_at: now + self.ttl,
            created_at: now,
        };
        self.store.insert(&challenge).await?;

        debug!(challenge_id = %challenge.id, platform = %platform, "Attestation challenge issued");
        Ok(IssuedChallenge {
            challenge_id: challenge.id,
            challenge: encode_challenge(platform, &challenge.challenge),
            expires_at: challenge.expires_at,
        })
    }

    /// Missing, expired and already-used challenges all come back as `None`.
    pub async fn consume(&self, challenge_id: Uuid) -> Result<Option<AttestationChallenge>> {
        self.store.take(challenge_id, self.clock.now()).await
    }

    pub async fn cleanup(&self) -> Result<u64> {
        self.store.delete_expired(self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, OsRandom};
    use crate::db::MemoryStore;

    fn manager() -> (ChallengeManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let manager = ChallengeManager::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            Arc::new(OsRandom),
            Duration::minutes(5),
        );
        (manager, clock)
    }

    #[tokio::test]
    async fn test_challenge_is_single_use() {
        let (manager, _) = manager();
        let issued = manager.issue_challenge(Platform::Ios).await.unwrap();

        let consumed = manager.consume(issued.challenge_id).await.unwrap().unwrap();
        assert_eq!(consumed.challenge.len(), 32);
        assert_eq!(encode_challenge(Platform::Ios, &consumed.challenge), issued.challenge);

        assert!(manager.consume(issued.challenge_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_challenge_is_not_found() {
        let (manager, clock) = manager();
        let issued = manager.issue_challenge(Platform::Android).await.unwrap();

        clock.advance(Duration::minutes(6));
        assert!(manager.consume(issued.challenge_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_challenge_is_not_found() {
        let (manager, _) = manager();
        assert!(manager.consume(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn test_platform_encodings() {
        let raw = [7u8; 32];
        let ios = encode_challenge(Platform::Ios, &raw);
        let android = encode_challenge(Platform::Android, &raw);

        assert_eq!(URL_SAFE_NO_PAD.decode(&ios).unwrap(), raw.to_vec());
        assert_eq!(
            URL_SAFE_NO_PAD.decode(&android).unwrap(),
            Sha256::digest(raw).to_vec()
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let (manager, clock) = manager();
        manager.issue_challenge(Platform::Ios).await.unwrap();
        clock.advance(Duration::minutes(6));
        let fresh = manager.issue_challenge(Platform::Ios).await.unwrap();

        assert_eq!(manager.cleanup().await.unwrap(), 1);
        assert!(manager.consume(fresh.challenge_id).await.unwrap().is_some());
    }
}
