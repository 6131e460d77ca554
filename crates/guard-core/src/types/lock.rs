//! Instrument lock types produced by the circuit breaker.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the veto predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allowed,
    /// Both the invalidation phrase and the outflow condition matched.
    Vetoed { phrase: String },
}

impl Verdict {
    pub fn is_vetoed(&self) -> bool {
        matches!(self, Verdict::Vetoed { .. })
    }
}

/// A blacklist entry: new entries for `code` are forbidden until it expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub code: String,
    pub locked_at: DateTime<Utc>,
    pub reason: String,
    /// Lock length in seconds.
    pub duration_secs: i64,
}

impl LockRecord {
    pub fn new(code: impl Into<String>, locked_at: DateTime<Utc>, reason: String, duration: Duration) -> Self {
        Self {
            code: code.into(),
            locked_at,
            reason,
            duration_secs: duration.num_seconds(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.locked_at + self.duration()
    }

    /// A lock is expired once `now - locked_at >= duration`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.locked_at >= self.duration()
    }

    /// Time left before expiry, zero when already expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let left = self.expires_at() - now;
        if left < Duration::zero() {
            Duration::zero()
        } else {
            left
        }
    }
}

/// Result of a tradeability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockStatus {
    Unlocked,
    Locked {
        reason: String,
        locked_at: DateTime<Utc>,
        remaining_secs: i64,
    },
}

impl LockStatus {
    pub fn from_record(record: &LockRecord, now: DateTime<Utc>) -> Self {
        LockStatus::Locked {
            reason: record.reason.clone(),
            locked_at: record.locked_at,
            remaining_secs: record.remaining(now).num_seconds(),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, LockStatus::Locked { .. })
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self {
            LockStatus::Locked { remaining_secs, .. } => Some(Duration::seconds(*remaining_secs)),
            LockStatus::Unlocked => None,
        }
    }
}
