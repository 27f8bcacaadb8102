//! Injected time and randomness sources.
//!
//! Every component reads the current time through [`Clock`] and draws
//! security-sensitive bytes through [`SecureRandom`] so tests can pin both.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub trait SecureRandom: Send + Sync {
    fn fill_bytes(&self, dest: &mut [u8]);

    /// Uniform decimal digit. Bytes >= 250 are rejected so every digit has
    /// the same probability.
    fn digit(&self) -> u8 {
        let mut byte = [0u8; 1];
        loop {
            self.fill_bytes(&mut byte);
            if byte[0] < 250 {
                return byte[0] % 10;
            }
        }
    }
}

/// Operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl SecureRandom for OsRandom {
    fn fill_bytes(&self, dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sequence(Mutex<Vec<u8>>);

    impl SecureRandom for Sequence {
        fn fill_bytes(&self, dest: &mut [u8]) {
            let mut bytes = self.0.lock().unwrap();
            for slot in dest.iter_mut() {
                *slot = bytes.remove(0);
            }
        }
    }

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn digit_rejects_biased_bytes() {
        let rng = Sequence(Mutex::new(vec![255, 250, 17]));
        assert_eq!(rng.digit(), 7);
    }

    #[test]
    fn os_random_fills_buffer() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        OsRandom.fill_bytes(&mut a);
        OsRandom.fill_bytes(&mut b);
        assert_ne!(a, b);
    }
}
