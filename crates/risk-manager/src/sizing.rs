//! Risk-based position sizing with an optional half-Kelly reduction.

use guard_core::types::ensure_positive;
use guard_core::{Error, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::exit_controller::{overflow, PositionExitController};

/// Sizing limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Fraction of the account that may be lost if the stop is hit.
    pub max_loss_ratio: Decimal,
    /// Fraction of the account that may be committed to one position.
    pub max_exposure_ratio: Decimal,
    /// Share counts are rounded down to a multiple of this.
    pub lot_size: u64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            max_loss_ratio: Decimal::new(2, 2),      // 2%
            max_exposure_ratio: Decimal::new(80, 2), // 80%
            lot_size: 1,
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("sizing.max_loss_ratio", self.max_loss_ratio),
            ("sizing.max_exposure_ratio", self.max_exposure_ratio),
        ] {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(Error::config(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.lot_size == 0 {
            return Err(Error::config("sizing.lot_size must be at least 1"));
        }
        Ok(())
    }
}

impl PositionExitController {
    /// Shares such that hitting `stop_price` loses at most `max_loss_ratio`
    /// of the account, capped by the exposure limit and rounded to lots.
    ///
    /// Fails when `stop_price >= price`.
    pub fn size_by_risk(&self, price: Decimal, stop_price: Decimal, account_value: Decimal) -> Result<u64> {
        ensure_positive("price", price)?;
        if stop_price < Decimal::ZERO {
            return Err(Error::invalid_input("stop_price", format!("must not be negative, got {}", stop_price)));
        }
        if account_value < Decimal::ZERO {
            return Err(Error::invalid_input(
                "account_value",
                format!("must not be negative, got {}", account_value),
            ));
        }
        if stop_price >= price {
            return Err(Error::invalid_input(
                "stop_price",
                format!("stop {} must be below price {}", stop_price, price),
            ));
        }

        let risk_budget = account_value * self.sizing.max_loss_ratio;
        let risk_shares = risk_budget
            .checked_div(price - stop_price)
            .ok_or_else(|| overflow("stop_price", format!("{} / ({} - {})", risk_budget, price, stop_price)))?
            .floor();
        let exposure_shares = shares_affordable(account_value * self.sizing.max_exposure_ratio, price)?;
        let shares = self.round_to_lot(to_shares(risk_shares.min(exposure_shares))?);

        debug!(
            price = %price,
            stop_price = %stop_price,
            risk_shares = %risk_shares,
            exposure_shares = %exposure_shares,
            shares = shares,
            "Sized position by risk"
        );
        Ok(shares)
    }

    /// Risk-based size further reduced by half-Kelly. Never larger than
    /// `size_by_risk` for the same inputs.
    pub fn size_with_kelly(
        &self,
        price: Decimal,
        stop_price: Decimal,
        account_value: Decimal,
        win_rate: Decimal,
        payoff_ratio: Decimal,
    ) -> Result<u64> {
        let risk_shares = self.size_by_risk(price, stop_price, account_value)?;
        let fraction = kelly_fraction(win_rate, payoff_ratio)?;
        let kelly_shares = self.round_to_lot(to_shares(shares_affordable(account_value * fraction, price)?)?);
        Ok(risk_shares.min(kelly_shares))
    }

    fn round_to_lot(&self, shares: u64) -> u64 {
        shares - shares % self.sizing.lot_size
    }
}

/// Half-Kelly fraction `((b*p - q) / b) / 2`, clamped to `[0, 1]`.
pub fn kelly_fraction(win_rate: Decimal, payoff_ratio: Decimal) -> Result<Decimal> {
    if win_rate < Decimal::ZERO || win_rate > Decimal::ONE {
        return Err(Error::invalid_input("win_rate", format!("must be in [0, 1], got {}", win_rate)));
    }
    ensure_positive("payoff_ratio", payoff_ratio)?;

    let lose_rate = Decimal::ONE - win_rate;
    let full = (payoff_ratio * win_rate - lose_rate) / payoff_ratio;
    let half = full / Decimal::TWO;
    Ok(half.max(Decimal::ZERO).min(Decimal::ONE))
}

/// Whole shares `budget` buys at `price`.
fn shares_affordable(budget: Decimal, price: Decimal) -> Result<Decimal> {
    budget
        .checked_div(price)
        .map(|shares| shares.floor())
        .ok_or_else(|| overflow("price", format!("{} / {}", budget, price)))
}

fn to_shares(value: Decimal) -> Result<u64> {
    value
        .to_u64()
        .ok_or_else(|| Error::invalid_input("shares", format!("{} does not fit a share count", value)))
}
