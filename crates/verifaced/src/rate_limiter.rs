use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Failures within WINDOW that trigger a lockout.
const MAX_FAILURES: u32 = 5;
/// Window over which failures are counted.
const WINDOW: Duration = Duration::from_secs(60);
/// Lockout duration after MAX_FAILURES.
const LOCKOUT: Duration = Duration::from_secs(300);

struct Attempts {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl Attempts {
    fn fresh(now: Instant) -> Self {
        Self {
            failures: 0,
            window_start: now,
            locked_until: None,
        }
    }
}

/// Per-email limiter for login, one-time code and face login attempts.
///
/// Only rejected credentials count as failures. Infrastructure errors (mail
/// relay down, oracle unreachable) never lock anyone out.
#[derive(Default)]
pub struct RateLimiter {
    records: HashMap<String, Attempts>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Err(retry_after)` while the email is locked out.
    pub fn check(&mut self, email: &str) -> Result<(), Duration> {
        self.check_at(email, Instant::now())
    }

    pub fn check_at(&mut self, email: &str, now: Instant) -> Result<(), Duration> {
        let Some(record) = self.records.get_mut(email) else {
            return Ok(());
        };

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                return Err(locked_until.duration_since(now));
            }
            *record = Attempts::fresh(now);
        } else if now.duration_since(record.window_start) >= WINDOW {
            record.failures = 0;
            record.window_start = now;
        }
        Ok(())
    }

    pub fn record_failure(&mut self, email: &str) {
        self.record_failure_at(email, Instant::now());
    }

    pub fn record_failure_at(&mut self, email: &str, now: Instant) {
        let record = self
            .records
            .entry(email.to_string())
            .or_insert_with(|| Attempts::fresh(now));

        if now.duration_since(record.window_start) >= WINDOW {
            record.failures = 0;
            record.window_start = now;
        }

        record.failures += 1;
        if record.failures >= MAX_FAILURES {
            record.locked_until = Some(now + LOCKOUT);
            tracing::warn!(
                email,
                failures = record.failures,
                lockout_secs = LOCKOUT.as_secs(),
                "rate limit triggered, locking email"
            );
        } else {
            tracing::debug!(email, failures = record.failures, max = MAX_FAILURES, "attempt failed");
        }
    }

    pub fn record_success(&mut self, email: &str) {
        self.records.remove(email);
    }
}
