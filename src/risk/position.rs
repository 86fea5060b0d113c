//! Position snapshot as delivered by the venue

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};

/// Largest size, price or margin accepted from the venue
///
/// Keeps every product of two such values well inside `Decimal`'s range.
pub const MAX_MAGNITUDE: Decimal = dec!(1000000000000);

/// Reject `value` outside `[0, MAX_MAGNITUDE]`
pub(crate) fn check_magnitude(symbol: &str, field: &str, value: Decimal) -> Result<()> {
    if value < Decimal::ZERO {
        return Err(FeedError::InvalidPosition(format!(
            "{}: negative {} {}",
            symbol, field, value
        )));
    }
    if value > MAX_MAGNITUDE {
        return Err(FeedError::InvalidPosition(format!(
            "{}: {} {} exceeds {}",
            symbol, field, value, MAX_MAGNITUDE
        )));
    }
    Ok(())
}

/// Direction of a futures position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for long, -1 for short
    pub fn direction(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

/// How collateral is attributed to the position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    #[default]
    Cross,
    Isolated,
}

/// Point-in-time view of one open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute contract quantity
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub leverage: u32,
    #[serde(default)]
    pub margin_mode: MarginMode,
    /// Margin locked for an isolated position
    #[serde(default)]
    pub isolated_margin: Option<Decimal>,
    /// Venue-provided maintenance margin rate for the position's tier
    #[serde(default)]
    pub maint_margin_rate: Option<Decimal>,
    /// Update time (milliseconds)
    #[serde(default)]
    pub update_time: u64,
}

impl PositionSnapshot {
    /// Reject snapshots the calculator cannot reason about
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(FeedError::InvalidPosition("empty symbol".to_string()));
        }
        check_magnitude(&self.symbol, "size", self.size)?;
        if self.leverage == 0 {
            return Err(FeedError::InvalidPosition(format!(
                "{}: leverage must be at least 1",
                self.symbol
            )));
        }
        check_magnitude(&self.symbol, "entry price", self.entry_price)?;
        check_magnitude(&self.symbol, "mark price", self.mark_price)?;
        if let Some(margin) = self.isolated_margin {
            check_magnitude(&self.symbol, "isolated margin", margin)?;
        }
        if let Some(rate) = self.maint_margin_rate {
            if rate < Decimal::ZERO || rate >= Decimal::ONE {
                return Err(FeedError::InvalidPosition(format!(
                    "{}: maintenance margin rate {} out of range",
                    self.symbol, rate
                )));
            }
        }
        Ok(())
    }

    /// Upper-case the symbol so it matches `markPrice:` channel routing
    pub fn normalize(&mut self) {
        self.symbol = self.symbol.trim().to_uppercase();
    }

    /// A zero-size snapshot means the position was closed
    pub fn is_closed(&self) -> bool {
        self.size.is_zero()
    }

    pub fn is_isolated(&self) -> bool {
        self.margin_mode == MarginMode::Isolated
    }
}
