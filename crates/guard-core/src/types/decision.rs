//! Incoming risk events and the decisions returned for them.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Alert, DefenseTier, PositionSnapshot};

/// One update for an instrument: price/position data, fact data, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub code: String,
    pub current_price: Decimal,
    /// Present when the instrument is an open position.
    #[serde(default)]
    pub cost_price: Option<Decimal>,
    #[serde(default)]
    pub peak_price: Option<Decimal>,
    #[serde(default)]
    pub ever_limit_up: bool,
    #[serde(default)]
    pub limit_up_price: Option<Decimal>,
    /// Qualitative fact text (news, announcements).
    #[serde(default)]
    pub fact_text: Option<String>,
    /// Net capital flow; negative means outflow.
    #[serde(default)]
    pub capital_flow: Option<Decimal>,
    /// Feed timestamp, used instead of wall-clock time when replaying.
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl RiskEvent {
    /// A bare price update for an instrument with no open position.
    pub fn price(code: impl Into<String>, current_price: Decimal) -> Self {
        Self {
            code: code.into(),
            current_price,
            cost_price: None,
            peak_price: None,
            ever_limit_up: false,
            limit_up_price: None,
            fact_text: None,
            capital_flow: None,
            observed_at: None,
        }
    }

    /// Event for an open position.
    pub fn position(snapshot: &PositionSnapshot) -> Self {
        Self {
            code: snapshot.code.clone(),
            current_price: snapshot.current_price,
            cost_price: Some(snapshot.cost_price),
            peak_price: Some(snapshot.peak_price),
            ever_limit_up: snapshot.ever_limit_up,
            limit_up_price: snapshot.limit_up_price,
            fact_text: None,
            capital_flow: None,
            observed_at: None,
        }
    }

    /// Attach fact text and capital flow.
    pub fn with_fact(mut self, fact_text: impl Into<String>, capital_flow: Decimal) -> Self {
        self.fact_text = Some(fact_text.into());
        self.capital_flow = Some(capital_flow);
        self
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }

    pub fn has_fact(&self) -> bool {
        self.fact_text.is_some() || self.capital_flow.is_some()
    }

    pub fn is_open_position(&self) -> bool {
        self.cost_price.is_some()
    }

    /// Position snapshot for this event, if it describes an open position.
    ///
    /// A missing peak falls back to the current price.
    pub fn snapshot(&self) -> Option<PositionSnapshot> {
        let cost_price = self.cost_price?;
        Some(PositionSnapshot {
            code: self.code.clone(),
            cost_price,
            current_price: self.current_price,
            peak_price: self.peak_price.unwrap_or(self.current_price),
            ever_limit_up: self.ever_limit_up,
            limit_up_price: self.limit_up_price,
        })
    }
}

/// Final action for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// New entries are permitted.
    AllowEntry,
    /// Do nothing: keep the position, or do not enter.
    Hold,
    /// Exit the open position now.
    ForceSell,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::AllowEntry => "allow_entry",
            Action::Hold => "hold",
            Action::ForceSell => "force_sell",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision returned to the execution/notification layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub code: String,
    pub action: Action,
    /// Always populated, including for degraded decisions.
    pub reason: String,
    pub tier: Option<DefenseTier>,
    pub stop_price: Option<Decimal>,
    /// Hours left on the instrument lock, two decimal places.
    pub lock_remaining_hours: Option<Decimal>,
    /// Alert to dispatch; `None` when nothing fired or it was a duplicate.
    pub alert: Option<Alert>,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(code: impl Into<String>, action: Action, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            code: code.into(),
            action,
            reason: reason.into(),
            tier: None,
            stop_price: None,
            lock_remaining_hours: None,
            alert: None,
            decided_at: now,
        }
    }

    /// Safe fallback used when an event cannot be evaluated.
    pub fn degraded(code: impl Into<String>, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(code, Action::Hold, reason, now)
    }

    pub fn with_defense(mut self, tier: DefenseTier, stop_price: Decimal) -> Self {
        self.tier = Some(tier);
        self.stop_price = Some(stop_price);
        self
    }

    pub fn with_lock_remaining(mut self, remaining: Duration) -> Self {
        self.lock_remaining_hours = Some(hours(remaining));
        self
    }

    pub fn with_alert(mut self, alert: Option<Alert>) -> Self {
        self.alert = alert;
        self
    }

    pub fn allows_entry(&self) -> bool {
        self.action == Action::AllowEntry
    }
}

/// Duration in hours, rounded to two decimal places.
pub fn hours(duration: Duration) -> Decimal {
    (Decimal::from(duration.num_seconds()) / Decimal::from(3600)).round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_snapshot_defaults_peak_to_current() {
        let mut event = RiskEvent::price("600519", dec!(101));
        assert!(event.snapshot().is_none());

        event.cost_price = Some(dec!(100));
        let snapshot = event.snapshot().unwrap();
        assert_eq!(snapshot.peak_price, dec!(101));
    }

    #[test]
    fn test_event_deserializes_sparse_json() {
        let event: RiskEvent =
            serde_json::from_str(r#"{"code":"000001","current_price":"12.5","capital_flow":-2.5,"fact_text":"x"}"#)
                .unwrap();
        assert_eq!(event.current_price, dec!(12.5));
        assert_eq!(event.capital_flow, Some(dec!(-2.5)));
        assert!(event.has_fact());
        assert!(!event.is_open_position());
    }

    #[test]
    fn test_hours_rounding() {
        assert_eq!(hours(Duration::minutes(90)), dec!(1.5));
        assert_eq!(hours(Duration::seconds(100)), dec!(0.03));
    }

    #[test]
    fn test_degraded_decision_is_hold() {
        let decision = Decision::degraded("000001", "bad input", Utc::now());
        assert_eq!(decision.action, Action::Hold);
        assert!(!decision.allows_entry());
    }
}
