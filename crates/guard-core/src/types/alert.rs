//! Alert records emitted by the coordinator and deduplicated per instrument.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DefenseTier;

/// Kind of derived alert. Deduplication is keyed on `(instrument, kind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Instrument was blacklisted by the circuit breaker.
    CircuitBreakTripped,
    /// Price fell through the initial hard stop.
    StopLossHit,
    /// Price fell through the cost-protect stop.
    CostProtectHit,
    /// Price fell through the peak-trailing stop.
    DrawdownLockHit,
    /// Price broke down from a limit-up.
    BreakEscape,
}

impl AlertKind {
    /// Alert kind raised when an exit fires on the given tier.
    pub fn for_tier(tier: DefenseTier) -> Self {
        match tier {
            DefenseTier::None => AlertKind::StopLossHit,
            DefenseTier::CostProtect => AlertKind::CostProtectHit,
            DefenseTier::DrawdownLock => AlertKind::DrawdownLockHit,
            DefenseTier::BreakEscape => AlertKind::BreakEscape,
        }
    }

    /// Default confidence attached to alerts of this kind.
    pub fn default_confidence(&self) -> f64 {
        match self {
            AlertKind::CircuitBreakTripped => 1.0,
            AlertKind::BreakEscape => 0.95,
            AlertKind::StopLossHit | AlertKind::DrawdownLockHit => 0.9,
            AlertKind::CostProtectHit => 0.85,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::CircuitBreakTripped => "circuit_break_tripped",
            AlertKind::StopLossHit => "stop_loss_hit",
            AlertKind::CostProtectHit => "cost_protect_hit",
            AlertKind::DrawdownLockHit => "drawdown_lock_hit",
            AlertKind::BreakEscape => "break_escape",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An emitted alert, already deduplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub instrument: String,
    pub kind: AlertKind,
    /// First emission of this pair while it stayed live in the cache.
    pub first_seen: DateTime<Utc>,
    /// Latest emission; the cool-down window runs from here.
    pub emitted_at: DateTime<Utc>,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    pub payload: serde_json::Value,
}

impl Alert {
    pub fn new(
        instrument: impl Into<String>,
        kind: AlertKind,
        now: DateTime<Utc>,
        confidence: f64,
        payload: serde_json::Value,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            instrument: instrument.into(),
            kind,
            first_seen: now,
            emitted_at: now,
            confidence,
            payload,
        }
    }

    /// One-line summary for notification layers.
    pub fn summary(&self) -> String {
        format!(
            "{} | {} | confidence {:.2}",
            self.instrument, self.kind, self.confidence
        )
    }
}
