//! Time-windowed, capacity-bounded alert deduplication.
//!
//! Keyed on `(instrument, kind)`. An entry suppresses re-emission until its
//! cool-down window has elapsed; when the cache is full the least recently
//! touched entry is evicted. Every operation runs under a single mutex.

use chrono::{DateTime, Duration, Utc};
use guard_core::types::{Alert, AlertKind};
use guard_core::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Longest accepted cool-down window (one week).
pub const MAX_WINDOW_MINUTES: i64 = 7 * 24 * 60;

/// Deduplicator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Cool-down window (in minutes).
    pub window_minutes: i64,
    /// Maximum number of cached entries.
    pub capacity: usize,
    /// Run a full expiry sweep every this many operations.
    pub sweep_interval: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_minutes: 30,
            capacity: 100,
            sweep_interval: 64,
        }
    }
}

impl DedupConfig {
    /// Cool-down window, or `Error::Config` when out of range.
    pub fn window(&self) -> Result<Duration> {
        if self.window_minutes <= 0 || self.window_minutes > MAX_WINDOW_MINUTES {
            return Err(Error::config(format!(
                "dedup.window_minutes must be in 1..={}, got {}",
                MAX_WINDOW_MINUTES, self.window_minutes
            )));
        }
        Duration::try_minutes(self.window_minutes).ok_or_else(|| {
            Error::config(format!("dedup.window_minutes {} is out of range", self.window_minutes))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.window()?;
        if self.capacity == 0 {
            return Err(Error::config("dedup.capacity must be at least 1"));
        }
        if self.sweep_interval == 0 {
            return Err(Error::config("dedup.sweep_interval must be at least 1"));
        }
        Ok(())
    }
}

/// Counters for operator tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    /// Entries currently cached (may include not yet swept stale entries).
    pub cached: usize,
    pub recorded: u64,
    pub suppressed: u64,
    pub evicted: u64,
    pub expired: u64,
}

type AlertKey = (String, AlertKind);

struct Entry {
    alert: Alert,
    /// Recency stamp; key into `DedupState::recency`.
    touch: u64,
}

#[derive(Default)]
struct DedupState {
    entries: HashMap<AlertKey, Entry>,
    /// Recency stamp -> key, oldest first.
    recency: BTreeMap<u64, AlertKey>,
    clock: u64,
    ops: u64,
    stats: DedupStats,
}

impl DedupState {
    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: &AlertKey) {
        let stamp = self.next_stamp();
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.touch);
            entry.touch = stamp;
            self.recency.insert(stamp, key.clone());
        }
    }

    fn remove(&mut self, key: &AlertKey) -> Option<Alert> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.touch);
        Some(entry.alert)
    }

    /// Live entry for `key`; a stale entry is dropped on the way.
    fn live(&mut self, key: &AlertKey, now: DateTime<Utc>, window: Duration) -> bool {
        let expired = match self.entries.get(key) {
            None => return false,
            Some(entry) => now - entry.alert.emitted_at >= window,
        };
        if expired {
            self.remove(key);
            self.stats.expired += 1;
            debug!(instrument = %key.0, kind = %key.1, "Alert cool-down elapsed");
            return false;
        }
        true
    }

    fn evict_lru(&mut self) {
        let oldest = self.recency.iter().next().map(|(stamp, key)| (*stamp, key.clone()));
        if let Some((stamp, key)) = oldest {
            self.recency.remove(&stamp);
            self.entries.remove(&key);
            self.stats.evicted += 1;
            debug!(instrument = %key.0, kind = %key.1, "Evicted least recently used alert");
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        let stale: Vec<AlertKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.alert.emitted_at >= window)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.remove(key);
        }
        self.stats.expired += stale.len() as u64;
        stale.len()
    }

    fn tick(&mut self, now: DateTime<Utc>, window: Duration, interval: u64) {
        self.ops += 1;
        if self.ops % interval == 0 {
            let removed = self.sweep(now, window);
            if removed > 0 {
                debug!(removed = removed, "Periodic alert sweep");
            }
        }
    }

    fn record(&mut self, alert: Alert, capacity: usize, window: Duration) -> Alert {
        let key = (alert.instrument.clone(), alert.kind);
        let mut alert = alert;

        if let Some(previous) = self.remove(&key) {
            alert.first_seen = previous.first_seen;
        } else if self.entries.len() >= capacity {
            // Expired entries go first; only a cache full of live entries loses one.
            self.sweep(alert.emitted_at, window);
            if self.entries.len() >= capacity {
                self.evict_lru();
            }
        }

        let stamp = self.next_stamp();
        self.recency.insert(stamp, key.clone());
        self.entries.insert(
            key,
            Entry {
                alert: alert.clone(),
                touch: stamp,
            },
        );
        self.stats.recorded += 1;
        alert
    }
}

/// Alert deduplicator shared by all scan loops.
pub struct AlertDeduplicator {
    config: DedupConfig,
    window: Duration,
    state: Mutex<DedupState>,
}

impl AlertDeduplicator {
    pub fn new(config: DedupConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            window: config.window()?,
            config,
            state: Mutex::new(DedupState::default()),
        })
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// True iff a live entry exists for the exact pair. A hit refreshes LRU
    /// recency but not the cool-down timestamp.
    pub fn is_duplicate(&self, instrument: &str, kind: AlertKind, now: DateTime<Utc>) -> bool {
        let key = (instrument.to_string(), kind);
        let mut state = self.state.lock();
        state.tick(now, self.window, self.config.sweep_interval);
        let live = state.live(&key, now, self.window);
        if live {
            state.touch(&key);
        }
        live
    }

    /// Insert or replace the entry for the pair and restart its cool-down.
    pub fn record(
        &self,
        instrument: &str,
        kind: AlertKind,
        now: DateTime<Utc>,
        confidence: f64,
        payload: serde_json::Value,
    ) -> Alert {
        let alert = Alert::new(instrument, kind, now, confidence, payload);
        let mut state = self.state.lock();
        state.tick(now, self.window, self.config.sweep_interval);
        let key = (instrument.to_string(), kind);
        // Drop a stale entry first so its first_seen is not carried over.
        state.live(&key, now, self.window);
        state.record(alert, self.config.capacity, self.window)
    }

    /// Atomic check-and-record. Returns the recorded alert, or `None` when the
    /// pair is still cooling down.
    pub fn admit(
        &self,
        instrument: &str,
        kind: AlertKind,
        now: DateTime<Utc>,
        confidence: f64,
        payload: serde_json::Value,
    ) -> Option<Alert> {
        let key = (instrument.to_string(), kind);
        let mut state = self.state.lock();
        state.tick(now, self.window, self.config.sweep_interval);

        if state.live(&key, now, self.window) {
            state.touch(&key);
            state.stats.suppressed += 1;
            debug!(instrument = %instrument, kind = %kind, "Suppressed duplicate alert");
            return None;
        }

        let alert = Alert::new(instrument, kind, now, confidence, payload);
        Some(state.record(alert, self.config.capacity, self.window))
    }

    /// Live entries emitted within `within` of `now`, newest first.
    pub fn recent(&self, within: Duration, now: DateTime<Utc>) -> Vec<Alert> {
        let cutoff = now - within;
        let mut state = self.state.lock();
        state.sweep(now, self.window);
        let mut alerts: Vec<Alert> = state
            .entries
            .values()
            .filter(|entry| entry.alert.emitted_at > cutoff)
            .map(|entry| entry.alert.clone())
            .collect();
        drop(state);
        alerts.sort_by(|a, b| b.emitted_at.cmp(&a.emitted_at));
        alerts
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.state.lock().sweep(now, self.window)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.recency.clear();
    }

    pub fn stats(&self) -> DedupStats {
        let state = self.state.lock();
        DedupStats {
            cached: state.entries.len(),
            ..state.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dedup(capacity: usize) -> AlertDeduplicator {
        AlertDeduplicator::new(DedupConfig {
            capacity,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_cool_down_boundary() {
        let dedup = dedup(100);
        let t0 = Utc::now();
        dedup.record("600000", AlertKind::StopLossHit, t0, 0.9, json!({}));

        let epsilon = Duration::milliseconds(1);
        assert!(dedup.is_duplicate("600000", AlertKind::StopLossHit, t0 + Duration::minutes(30) - epsilon));
        assert!(!dedup.is_duplicate("600000", AlertKind::StopLossHit, t0 + Duration::minutes(30) + epsilon));
    }

    #[test]
    fn test_pairs_are_independent() {
        let dedup = dedup(100);
        let t0 = Utc::now();
        dedup.record("600000", AlertKind::StopLossHit, t0, 0.9, json!({}));

        assert!(!dedup.is_duplicate("600000", AlertKind::BreakEscape, t0));
        assert!(!dedup.is_duplicate("600001", AlertKind::StopLossHit, t0));
    }

    #[test]
    fn test_record_resets_timestamp() {
        let dedup = dedup(100);
        let t0 = Utc::now();
        dedup.record("600000", AlertKind::StopLossHit, t0, 0.9, json!({}));
        let t1 = t0 + Duration::minutes(20);
        let alert = dedup.record("600000", AlertKind::StopLossHit, t1, 0.8, json!({"n": 2}));

        assert_eq!(alert.first_seen, t0);
        assert_eq!(alert.emitted_at, t1);
        // Window now runs from t1
        assert!(dedup.is_duplicate("600000", AlertKind::StopLossHit, t0 + Duration::minutes(45)));
        assert!(!dedup.is_duplicate("600000", AlertKind::StopLossHit, t1 + Duration::minutes(30)));
    }

    #[test]
    fn test_lru_evicts_least_recently_touched() {
        let dedup = dedup(3);
        let t0 = Utc::now();
        dedup.record("A", AlertKind::StopLossHit, t0, 0.9, json!({}));
        dedup.record("B", AlertKind::StopLossHit, t0, 0.9, json!({}));
        dedup.record("C", AlertKind::StopLossHit, t0, 0.9, json!({}));
        dedup.record("D", AlertKind::StopLossHit, t0, 0.9, json!({}));

        assert_eq!(dedup.len(), 3);
        assert!(!dedup.is_duplicate("A", AlertKind::StopLossHit, t0));
        assert!(dedup.is_duplicate("B", AlertKind::StopLossHit, t0));
        assert!(dedup.is_duplicate("C", AlertKind::StopLossHit, t0));
        assert!(dedup.is_duplicate("D", AlertKind::StopLossHit, t0));
        assert_eq!(dedup.stats().evicted, 1);
    }

    #[test]
    fn test_lookup_refreshes_recency() {
        let dedup = dedup(3);
        let t0 = Utc::now();
        dedup.record("A", AlertKind::StopLossHit, t0, 0.9, json!({}));
        dedup.record("B", AlertKind::StopLossHit, t0, 0.9, json!({}));
        dedup.record("C", AlertKind::StopLossHit, t0, 0.9, json!({}));

        // Touch A so B becomes the oldest.
        assert!(dedup.is_duplicate("A", AlertKind::StopLossHit, t0));
        dedup.record("D", AlertKind::StopLossHit, t0, 0.9, json!({}));

        assert!(dedup.is_duplicate("A", AlertKind::StopLossHit, t0));
        assert!(!dedup.is_duplicate("B", AlertKind::StopLossHit, t0));
    }

    #[test]
    fn test_full_cache_drops_expired_before_evicting_live() {
        let dedup = dedup(2);
        let t0 = Utc::now();
        dedup.record("X", AlertKind::StopLossHit, t0, 0.9, json!({}));
        dedup.record("Y", AlertKind::StopLossHit, t0 + Duration::minutes(5), 0.9, json!({}));
        // X is touched last, so Y is the least recently used entry.
        assert!(dedup.is_duplicate("X", AlertKind::StopLossHit, t0 + Duration::minutes(29)));

        // X has expired by now while Y is still cooling down.
        let t1 = t0 + Duration::minutes(31);
        dedup.record("Z", AlertKind::StopLossHit, t1, 0.9, json!({}));

        assert!(dedup.is_duplicate("Y", AlertKind::StopLossHit, t1));
        assert!(dedup.is_duplicate("Z", AlertKind::StopLossHit, t1));
        assert!(!dedup.is_duplicate("X", AlertKind::StopLossHit, t1));
        let stats = dedup.stats();
        assert_eq!(stats.evicted, 0);
        assert_eq!(stats.expired, 1);
    }

    #[test]
    fn test_replacing_does_not_evict() {
        let dedup = dedup(2);
        let t0 = Utc::now();
        dedup.record("A", AlertKind::StopLossHit, t0, 0.9, json!({}));
        dedup.record("B", AlertKind::StopLossHit, t0, 0.9, json!({}));
        dedup.record("A", AlertKind::StopLossHit, t0 + Duration::minutes(1), 0.9, json!({}));

        assert_eq!(dedup.len(), 2);
        assert_eq!(dedup.stats().evicted, 0);
    }

    #[test]
    fn test_admit_suppresses_within_window() {
        let dedup = dedup(100);
        let t0 = Utc::now();

        assert!(dedup.admit("600000", AlertKind::CircuitBreakTripped, t0, 1.0, json!({})).is_some());
        assert!(dedup
            .admit("600000", AlertKind::CircuitBreakTripped, t0 + Duration::minutes(10), 1.0, json!({}))
            .is_none());

        // Suppression does not restart the window.
        let alert = dedup
            .admit("600000", AlertKind::CircuitBreakTripped, t0 + Duration::minutes(30), 1.0, json!({}))
            .unwrap();
        assert_eq!(alert.first_seen, t0 + Duration::minutes(30));

        let stats = dedup.stats();
        assert_eq!(stats.recorded, 2);
        assert_eq!(stats.suppressed, 1);
        assert_eq!(stats.expired, 1);
    }

    #[test]
    fn test_recent_filters_by_cutoff() {
        let dedup = dedup(100);
        let t0 = Utc::now();
        dedup.record("A", AlertKind::StopLossHit, t0, 0.9, json!({}));
        dedup.record("B", AlertKind::BreakEscape, t0 + Duration::minutes(10), 0.95, json!({}));
        dedup.record("C", AlertKind::CostProtectHit, t0 + Duration::minutes(20), 0.85, json!({}));

        let now = t0 + Duration::minutes(25);
        let recent = dedup.recent(Duration::minutes(10), now);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].instrument, "C");

        let recent = dedup.recent(Duration::minutes(60), now);
        let order: Vec<_> = recent.iter().map(|a| a.instrument.as_str()).collect();
        assert_eq!(order, vec!["C", "B", "A"]);

        // A has left its cool-down window by t0 + 35m.
        let recent = dedup.recent(Duration::minutes(60), t0 + Duration::minutes(35));
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn test_sweep_and_clear() {
        let dedup = dedup(100);
        let t0 = Utc::now();
        dedup.record("A", AlertKind::StopLossHit, t0, 0.9, json!({}));
        dedup.record("B", AlertKind::StopLossHit, t0 + Duration::minutes(20), 0.9, json!({}));

        assert_eq!(dedup.sweep(t0 + Duration::minutes(31)), 1);
        assert_eq!(dedup.len(), 1);

        dedup.clear();
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_periodic_sweep_runs() {
        let dedup = AlertDeduplicator::new(DedupConfig {
            sweep_interval: 4,
            ..Default::default()
        })
        .unwrap();
        let t0 = Utc::now();
        dedup.record("A", AlertKind::StopLossHit, t0, 0.9, json!({}));
        dedup.record("B", AlertKind::StopLossHit, t0, 0.9, json!({}));

        let later = t0 + Duration::hours(1);
        dedup.is_duplicate("Z", AlertKind::StopLossHit, later);
        // Fourth operation triggers the sweep.
        dedup.is_duplicate("Z", AlertKind::StopLossHit, later);
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(AlertDeduplicator::new(DedupConfig {
            capacity: 0,
            ..Default::default()
        })
        .is_err());
        assert!(AlertDeduplicator::new(DedupConfig {
            window_minutes: 0,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_oversized_window_rejected_at_construction() {
        for minutes in [MAX_WINDOW_MINUTES + 1, i64::MAX / 2, i64::MAX] {
            let config = DedupConfig {
                window_minutes: minutes,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(Error::Config { .. })));
            assert!(matches!(AlertDeduplicator::new(config), Err(Error::Config { .. })));
        }

        let dedup = AlertDeduplicator::new(DedupConfig {
            window_minutes: MAX_WINDOW_MINUTES,
            ..Default::default()
        })
        .unwrap();
        let t0 = Utc::now();
        dedup.record("600000", AlertKind::StopLossHit, t0, 0.9, json!({}));
        assert!(dedup.is_duplicate("600000", AlertKind::StopLossHit, t0 + Duration::days(6)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admit_emits_once() {
        use std::sync::Arc;

        let dedup = Arc::new(dedup(100));
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let dedup = dedup.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .admit("600000", AlertKind::DrawdownLockHit, now, 0.9, json!({}))
                    .is_some()
            }));
        }

        let mut emitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 1);
        assert_eq!(dedup.stats().suppressed, 31);
    }
}
