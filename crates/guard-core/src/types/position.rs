//! Position snapshots and the defense/exit results derived from them.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Convert a feed-supplied `f64` into a `Decimal`.
///
/// NaN and infinities are rejected instead of being coerced to zero.
pub fn decimal_from_f64(field: &str, value: f64) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(Error::invalid_input(field, format!("{} is not a finite number", value)));
    }
    Decimal::from_f64(value)
        .ok_or_else(|| Error::invalid_input(field, format!("{} is out of decimal range", value)))
}

/// Require a strictly positive price.
pub fn ensure_positive(field: &str, value: Decimal) -> Result<()> {
    if value <= Decimal::ZERO {
        return Err(Error::invalid_input(field, format!("must be positive, got {}", value)));
    }
    Ok(())
}

/// Caller-supplied view of an open position.
///
/// The guard keeps no position ledger; the caller tracks `peak_price` and
/// hands a fresh snapshot in on every evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Instrument code.
    pub code: String,
    /// Average cost of the position.
    pub cost_price: Decimal,
    /// Latest traded price.
    pub current_price: Decimal,
    /// Highest price observed since the position was opened.
    pub peak_price: Decimal,
    /// Whether the instrument touched its limit-up price during the session.
    #[serde(default)]
    pub ever_limit_up: bool,
    /// Limit-up price for the session, when known.
    #[serde(default)]
    pub limit_up_price: Option<Decimal>,
}

impl PositionSnapshot {
    /// Create a snapshot without limit-up information.
    pub fn new(
        code: impl Into<String>,
        cost_price: Decimal,
        current_price: Decimal,
        peak_price: Decimal,
    ) -> Self {
        Self {
            code: code.into(),
            cost_price,
            current_price,
            peak_price,
            ever_limit_up: false,
            limit_up_price: None,
        }
    }

    /// Attach a limit-up event to the snapshot.
    pub fn with_limit_up(mut self, limit_up_price: Decimal) -> Self {
        self.ever_limit_up = true;
        self.limit_up_price = Some(limit_up_price);
        self
    }

    /// Build a snapshot from raw `f64` feed values, rejecting non-finite numbers.
    pub fn from_f64(
        code: impl Into<String>,
        cost_price: f64,
        current_price: f64,
        peak_price: f64,
        ever_limit_up: bool,
        limit_up_price: Option<f64>,
    ) -> Result<Self> {
        let snapshot = Self {
            code: code.into(),
            cost_price: decimal_from_f64("cost_price", cost_price)?,
            current_price: decimal_from_f64("current_price", current_price)?,
            peak_price: decimal_from_f64("peak_price", peak_price)?,
            ever_limit_up,
            limit_up_price: limit_up_price
                .map(|p| decimal_from_f64("limit_up_price", p))
                .transpose()?,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Check that every price is strictly positive and the code is non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(Error::invalid_input("code", "instrument code is empty"));
        }
        ensure_positive("cost_price", self.cost_price)?;
        ensure_positive("current_price", self.current_price)?;
        ensure_positive("peak_price", self.peak_price)?;
        if let Some(limit_up) = self.limit_up_price {
            ensure_positive("limit_up_price", limit_up)?;
        }
        Ok(())
    }

    /// Current profit ratio relative to cost, `None` on overflow.
    pub fn current_profit(&self) -> Option<Decimal> {
        profit_over(self.current_price, self.cost_price)
    }

    /// Peak profit ratio relative to cost, `None` on overflow.
    pub fn peak_profit(&self) -> Option<Decimal> {
        profit_over(self.peak_price, self.cost_price)
    }
}

fn profit_over(price: Decimal, cost: Decimal) -> Option<Decimal> {
    price.checked_sub(cost)?.checked_div(cost)
}

/// Trailing-stop defense tier, in activation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefenseTier {
    /// Initial hard stop below cost.
    None,
    /// Stop lifted just above cost once the position is in profit.
    CostProtect,
    /// Stop trails the peak once peak profit is large enough.
    DrawdownLock,
    /// Price broke down from a limit-up; exit immediately.
    BreakEscape,
}

impl DefenseTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefenseTier::None => "none",
            DefenseTier::CostProtect => "cost_protect",
            DefenseTier::DrawdownLock => "drawdown_lock",
            DefenseTier::BreakEscape => "break_escape",
        }
    }
}

impl std::fmt::Display for DefenseTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the tiered stop computation. Recomputed on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenseResult {
    /// Active stop price.
    pub stop_price: Decimal,
    /// Tier that produced the stop price.
    pub tier: DefenseTier,
    /// Human-readable explanation.
    pub reason: String,
    /// Exit at market now, regardless of the stop comparison.
    pub forced_exit: bool,
    /// `(current - cost) / cost`.
    pub current_profit: Decimal,
    /// `(peak - cost) / cost`.
    pub peak_profit: Decimal,
}

/// What to do with an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitAction {
    Hold,
    ForceSell,
}

/// Exit check result for one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub code: String,
    pub action: ExitAction,
    /// `current_price <= stop_price`.
    pub triggered: bool,
    pub current_price: Decimal,
    pub defense: DefenseResult,
}

impl ExitSignal {
    pub fn should_exit(&self) -> bool {
        self.action == ExitAction::ForceSell
    }
}
