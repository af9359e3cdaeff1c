//! One-time code issuance and verification.
//!
//! Codes are 6 digits, valid for five minutes and single use. Records are
//! keyed by normalised email and a new issue overwrites the previous record.
//! Expiry is lazy: nothing runs in the background, a stale record is simply
//! refused (and dropped) the next time it is looked up.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

pub const OTP_DIGITS: usize = 6;
pub const DEFAULT_OTP_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpRecord {
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl OtpRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OtpRejection {
    #[error("no code has been issued for this user")]
    NotFound,
    #[error("code has expired")]
    Expired,
    #[error("code has already been used")]
    Consumed,
    #[error("invalid code")]
    Mismatch,
}

#[derive(Debug)]
pub struct OtpManager {
    records: HashMap<String, OtpRecord>,
    ttl: Duration,
}

impl Default for OtpManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OtpManager {
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_OTP_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh code for `email`, replacing any outstanding one.
    pub fn issue(&mut self, email: &str) -> OtpRecord {
        self.issue_at(email, Utc::now())
    }

    pub fn issue_at(&mut self, email: &str, now: DateTime<Utc>) -> OtpRecord {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
        self.store(email, code, now)
    }

    fn store(&mut self, email: &str, code: String, now: DateTime<Utc>) -> OtpRecord {
        let record = OtpRecord {
            code,
            expires_at: now + self.ttl,
            consumed: false,
        };
        self.records.insert(normalize_email(email), record.clone());
        tracing::debug!(email, expires_at = %record.expires_at, "otp issued");
        record
    }

    pub fn verify(&mut self, email: &str, code: &str) -> Result<(), OtpRejection> {
        self.verify_at(email, code, Utc::now())
    }

    /// Verify and consume. Expired or consumed records never verify, even
    /// when the digits match.
    pub fn verify_at(
        &mut self,
        email: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OtpRejection> {
        let key = normalize_email(email);
        let record = self.records.get_mut(&key).ok_or(OtpRejection::NotFound)?;

        if record.consumed {
            return Err(OtpRejection::Consumed);
        }
        if record.is_expired_at(now) {
            self.records.remove(&key);
            return Err(OtpRejection::Expired);
        }
        if record.code != code.trim() {
            return Err(OtpRejection::Mismatch);
        }
        record.consumed = true;
        Ok(())
    }

    /// Drop expired and consumed records. Returns how many were removed.
    pub fn purge_stale(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| !r.consumed && !r.is_expired_at(now));
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_issued_code_shape() {
        let mut m = OtpManager::new();
        let r = m.issue_at("user@example.com", t0());
        assert_eq!(r.code.len(), OTP_DIGITS);
        assert!(r.code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(r.expires_at, t0() + Duration::minutes(5));
        assert!(!r.consumed);
    }

    #[test]
    fn test_verify_within_ttl() {
        let mut m = OtpManager::new();
        m.store("user@example.com", "482913".into(), t0());
        assert_eq!(
            m.verify_at("user@example.com", "482913", t0() + Duration::seconds(299)),
            Ok(())
        );
    }

    #[test]
    fn test_verify_after_ttl_fails() {
        let mut m = OtpManager::new();
        m.store("user@example.com", "482913".into(), t0());
        assert_eq!(
            m.verify_at("user@example.com", "482913", t0() + Duration::seconds(301)),
            Err(OtpRejection::Expired)
        );
        // Lazily removed.
        assert!(m.is_empty());
    }

    #[test]
    fn test_exact_expiry_instant_still_valid() {
        let mut m = OtpManager::new();
        m.store("user@example.com", "482913".into(), t0());
        assert!(m
            .verify_at("user@example.com", "482913", t0() + Duration::seconds(300))
            .is_ok());
    }

    #[test]
    fn test_single_use() {
        let mut m = OtpManager::new();
        m.store("user@example.com", "482913".into(), t0());
        assert!(m.verify_at("user@example.com", "482913", t0()).is_ok());
        assert_eq!(
            m.verify_at("user@example.com", "482913", t0()),
            Err(OtpRejection::Consumed)
        );
    }

    #[test]
    fn test_mismatch_does_not_consume() {
        let mut m = OtpManager::new();
        m.store("user@example.com", "482913".into(), t0());
        assert_eq!(
            m.verify_at("user@example.com", "000000", t0()),
            Err(OtpRejection::Mismatch)
        );
        assert!(m.verify_at("user@example.com", "482913", t0()).is_ok());
    }

    #[test]
    fn test_unknown_email() {
        let mut m = OtpManager::new();
        assert_eq!(
            m.verify_at("nobody@example.com", "123456", t0()),
            Err(OtpRejection::NotFound)
        );
    }

    #[test]
    fn test_reissue_overwrites_previous_code() {
        let mut m = OtpManager::new();
        m.store("user@example.com", "111111".into(), t0());
        m.store("user@example.com", "222222".into(), t0());
        assert_eq!(
            m.verify_at("user@example.com", "111111", t0()),
            Err(OtpRejection::Mismatch)
        );
        assert!(m.verify_at("user@example.com", "222222", t0()).is_ok());
    }

    #[test]
    fn test_email_key_is_normalised() {
        let mut m = OtpManager::new();
        m.store(" User@Example.com", "482913".into(), t0());
        assert!(m.verify_at("user@example.com", "482913", t0()).is_ok());
    }

    #[test]
    fn test_purge_stale() {
        let mut m = OtpManager::new();
        m.store("a@example.com", "111111".into(), t0());
        m.store("b@example.com", "222222".into(), t0() + Duration::minutes(10));
        m.store("c@example.com", "333333".into(), t0() + Duration::minutes(10));
        m.verify_at("c@example.com", "333333", t0() + Duration::minutes(10))
            .unwrap();
        assert_eq!(m.purge_stale(t0() + Duration::minutes(11)), 2);
        assert_eq!(m.len(), 1);
    }
}
