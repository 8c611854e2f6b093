//! Login attempt throttling.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Failed attempts allowed before lockout.
const MAX_ATTEMPTS: u32 = 5;

/// How long a locked-out key stays blocked.
const LOCKOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Default)]
struct Attempts {
    count: u32,
    locked_until: Option<Instant>,
}

/// Tracks failed logins per (username, client IP) pair.
#[derive(Debug)]
pub struct LoginRateLimiter {
    max_attempts: u32,
    lockout: Duration,
    records: Mutex<HashMap<String, Attempts>>,
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new(MAX_ATTEMPTS, LOCKOUT)
    }
}

impl LoginRateLimiter {
    pub fn new(max_attempts: u32, lockout: Duration) -> Self {
        Self {
            max_attempts,
            lockout,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn key(username: &str, client_ip: &str) -> String {
        format!("{}|{}", username, client_ip)
    }

    /// Whether this pair is currently locked out.
    pub fn is_blocked(&self, username: &str, client_ip: &str) -> bool {
        let mut records = self.records.lock().expect("rate limiter lock poisoned");
        let Some(record) = records.get_mut(&Self::key(username, client_ip)) else {
            return false;
        };
        match record.locked_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // lockout elapsed, start fresh
                records.remove(&Self::key(username, client_ip));
                false
            }
            None => false,
        }
    }

    /// Seconds until the lockout ends, zero when not locked.
    pub fn lockout_remaining_secs(&self, username: &str, client_ip: &str) -> u64 {
        let records = self.records.lock().expect("rate limiter lock poisoned");
        records
            .get(&Self::key(username, client_ip))
            .and_then(|r| r.locked_until)
            .map(|until| until.saturating_duration_since(Instant::now()).as_secs())
            .unwrap_or(0)
    }

    /// Record a failed attempt; returns remaining attempts before lockout.
    pub fn record_failure(&self, username: &str, client_ip: &str) -> u32 {
        let mut records = self.records.lock().expect("rate limiter lock poisoned");
        let record = records.entry(Self::key(username, client_ip)).or_default();
        record.count += 1;
        if record.count >= self.max_attempts {
            record.locked_until = Some(Instant::now() + self.lockout);
            0
        } else {
            self.max_attempts - record.count
        }
    }

    /// Forget the failure history after a successful login.
    pub fn clear_on_success(&self, username: &str, client_ip: &str) {
        self.records
            .lock()
            .expect("rate limiter lock poisoned")
            .remove(&Self::key(username, client_ip));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_after_max_failures() {
        let limiter = LoginRateLimiter::new(3, Duration::from_secs(60));

        assert!(!limiter.is_blocked("alice", "10.0.0.1"));
        assert_eq!(limiter.record_failure("alice", "10.0.0.1"), 2);
        assert_eq!(limiter.record_failure("alice", "10.0.0.1"), 1);
        assert!(!limiter.is_blocked("alice", "10.0.0.1"));
        assert_eq!(limiter.record_failure("alice", "10.0.0.1"), 0);
        assert!(limiter.is_blocked("alice", "10.0.0.1"));
        assert!(limiter.lockout_remaining_secs("alice", "10.0.0.1") > 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = LoginRateLimiter::new(2, Duration::from_secs(60));
        limiter.record_failure("alice", "10.0.0.1");
        limiter.record_failure("alice", "10.0.0.1");
        assert!(limiter.is_blocked("alice", "10.0.0.1"));
        assert!(!limiter.is_blocked("alice", "10.0.0.2"));
        assert!(!limiter.is_blocked("bob", "10.0.0.1"));
    }

    #[test]
    fn test_clear_on_success() {
        let limiter = LoginRateLimiter::new(2, Duration::from_secs(60));
        limiter.record_failure("alice", "10.0.0.1");
        limiter.clear_on_success("alice", "10.0.0.1");
        assert_eq!(limiter.record_failure("alice", "10.0.0.1"), 1);
    }

    #[test]
    fn test_lockout_expires() {
        let limiter = LoginRateLimiter::new(1, Duration::from_millis(0));
        limiter.record_failure("alice", "10.0.0.1");
        // zero-length lockout has already elapsed
        assert!(!limiter.is_blocked("alice", "10.0.0.1"));
    }
}
