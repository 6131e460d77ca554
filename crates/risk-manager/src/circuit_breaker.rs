//! Circuit breaker that blacklists instruments whose thesis has been invalidated.
//!
//! The veto is one-way: once a fact text matches an invalidation phrase while
//! capital is flowing out faster than the configured threshold, the instrument
//! is locked for a fixed duration and no new entries are permitted.

use chrono::{DateTime, Duration, Utc};
use guard_core::types::{LockRecord, LockStatus, Verdict};
use guard_core::{Error, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Longest accepted lock (one year).
pub const MAX_LOCK_DURATION_HOURS: i64 = 24 * 366;

/// Configuration for the circuit breaker veto rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Phrases that mark a fact as invalidating the trade thesis.
    pub veto_phrases: Vec<String>,
    /// Capital flow strictly below this value counts as outflow (must be negative).
    pub outflow_threshold: Decimal,
    /// How long a lock lasts (in hours).
    pub lock_duration_hours: i64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            veto_phrases: [
                "clarification",
                "no related business",
                "not involved",
                "has not formed",
                "澄清",
                "不涉及",
                "尚未形成",
                "未形成相关业务",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            outflow_threshold: Decimal::new(-10, 1), // -1.0
            lock_duration_hours: 24,
        }
    }
}

impl CircuitBreakerConfig {
    /// Lock duration, or `Error::Config` when out of range.
    pub fn lock_duration(&self) -> Result<Duration> {
        if self.lock_duration_hours <= 0 || self.lock_duration_hours > MAX_LOCK_DURATION_HOURS {
            return Err(Error::config(format!(
                "circuit_breaker.lock_duration_hours must be in 1..={}, got {}",
                MAX_LOCK_DURATION_HOURS, self.lock_duration_hours
            )));
        }
        Duration::try_hours(self.lock_duration_hours).ok_or_else(|| {
            Error::config(format!(
                "circuit_breaker.lock_duration_hours {} is out of range",
                self.lock_duration_hours
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.veto_phrases.is_empty() {
            return Err(Error::config("circuit_breaker.veto_phrases must not be empty"));
        }
        if self.veto_phrases.iter().any(|p| p.trim().is_empty()) {
            return Err(Error::config("circuit_breaker.veto_phrases contains an empty phrase"));
        }
        if self.outflow_threshold >= Decimal::ZERO {
            return Err(Error::config(format!(
                "circuit_breaker.outflow_threshold must be negative, got {}",
                self.outflow_threshold
            )));
        }
        self.lock_duration()?;
        Ok(())
    }
}

/// Per-instrument veto engine with a time-locked blacklist.
pub struct CircuitBreakerEngine {
    config: CircuitBreakerConfig,
    /// Lower-cased, trimmed phrases used for matching.
    phrases: Vec<String>,
    lock_duration: Duration,
    locks: Mutex<HashMap<String, LockRecord>>,
}

impl CircuitBreakerEngine {
    /// Create a new engine, validating the configuration.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        let lock_duration = config.lock_duration()?;
        let phrases = config
            .veto_phrases
            .iter()
            .map(|p| p.trim().to_lowercase())
            .collect();
        Ok(Self {
            config,
            phrases,
            lock_duration,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Pure veto predicate.
    ///
    /// Vetoed only when the text contains an invalidation phrase AND the
    /// capital flow is strictly below the outflow threshold.
    pub fn evaluate(&self, fact_text: &str, capital_flow: Decimal) -> Verdict {
        if capital_flow >= self.config.outflow_threshold {
            return Verdict::Allowed;
        }
        let text = fact_text.trim();
        if text.is_empty() {
            return Verdict::Allowed;
        }
        let text = text.to_lowercase();
        match self.phrases.iter().position(|p| text.contains(p.as_str())) {
            Some(idx) => Verdict::Vetoed {
                phrase: self.config.veto_phrases[idx].clone(),
            },
            None => Verdict::Allowed,
        }
    }

    /// Return the existing lock, or evaluate the predicate and lock on veto.
    ///
    /// Re-triggering while locked does not extend the lock.
    pub fn check_and_lock(
        &self,
        code: &str,
        fact_text: &str,
        capital_flow: Decimal,
        now: DateTime<Utc>,
    ) -> Result<LockStatus> {
        if code.trim().is_empty() {
            return Err(Error::invalid_input("code", "instrument code is empty"));
        }

        let mut locks = self.locks.lock();

        if let Some(record) = locks.get(code) {
            if !record.is_expired(now) {
                return Ok(LockStatus::from_record(record, now));
            }
            debug!(code = %code, locked_at = %record.locked_at, "Lock expired, re-evaluating");
            locks.remove(code);
        }

        match self.evaluate(fact_text, capital_flow) {
            Verdict::Allowed => Ok(LockStatus::Unlocked),
            Verdict::Vetoed { phrase } => {
                let reason = format!(
                    "thesis invalidated by \"{}\" with capital flow {} below {}",
                    phrase, capital_flow, self.config.outflow_threshold
                );
                let record = LockRecord::new(code, now, reason, self.lock_duration);
                warn!(
                    code = %code,
                    reason = %record.reason,
                    expires_at = %record.expires_at(),
                    "Circuit breaker TRIPPED - new entries blocked"
                );
                let status = LockStatus::from_record(&record, now);
                locks.insert(code.to_string(), record);
                Ok(status)
            }
        }
    }

    /// Whether the instrument is currently locked. Expired locks are dropped.
    pub fn is_locked(&self, code: &str, now: DateTime<Utc>) -> bool {
        self.lock_status(code, now).is_locked()
    }

    /// Current lock status without evaluating the predicate.
    pub fn lock_status(&self, code: &str, now: DateTime<Utc>) -> LockStatus {
        let mut locks = self.locks.lock();
        match locks.get(code) {
            None => return LockStatus::Unlocked,
            Some(record) if !record.is_expired(now) => return LockStatus::from_record(record, now),
            Some(_) => {}
        }
        debug!(code = %code, "Lock expired");
        locks.remove(code);
        LockStatus::Unlocked
    }

    /// Manually remove the lock for an instrument. Returns whether one existed.
    pub fn unlock(&self, code: &str) -> bool {
        let removed = self.locks.lock().remove(code).is_some();
        if removed {
            info!(code = %code, "Instrument manually unlocked");
        }
        removed
    }

    /// Manually remove every lock. Returns how many were removed.
    pub fn unlock_all(&self) -> usize {
        let removed = {
            let mut locks = self.locks.lock();
            let count = locks.len();
            locks.clear();
            count
        };
        info!(removed = removed, "All instruments manually unlocked");
        removed
    }

    /// All live locks, oldest first. Expired locks are pruned.
    pub fn locked_instruments(&self, now: DateTime<Utc>) -> Vec<LockRecord> {
        let mut locks = self.locks.lock();
        locks.retain(|_, record| !record.is_expired(now));
        let mut live: Vec<LockRecord> = locks.values().cloned().collect();
        drop(locks);
        live.sort_by(|a, b| a.locked_at.cmp(&b.locked_at).then_with(|| a.code.cmp(&b.code)));
        live
    }
}
