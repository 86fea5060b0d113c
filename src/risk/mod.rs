//! Risk module
//!
//! Derives margin ratio, liquidation price and return figures from position
//! snapshots.

pub mod calculator;
mod metrics;
pub(crate) mod position;

pub use metrics::{Collateral, CrossAccount, RiskMetrics};
pub use position::{MarginMode, PositionSide, PositionSnapshot, MAX_MAGNITUDE};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Coarse classification of a margin ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Warning,
    Danger,
    Liquidation,
}

/// Calculator inputs that do not come from the venue
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskParams {
    /// Used when a snapshot carries no maintenance margin rate
    pub maint_margin_rate: Decimal,
    /// Margin ratio at which a position turns `Warning`
    pub warning_ratio: Decimal,
    /// Margin ratio at which a position turns `Danger`
    pub danger_ratio: Decimal,
}

impl RiskParams {
    /// Map a margin ratio to a risk level; no ratio means no margin left
    pub fn classify(&self, margin_ratio: Option<Decimal>) -> RiskLevel {
        match margin_ratio {
            None => RiskLevel::Liquidation,
            Some(ratio) if ratio >= Decimal::ONE => RiskLevel::Liquidation,
            Some(ratio) if ratio >= self.danger_ratio => RiskLevel::Danger,
            Some(ratio) if ratio >= self.warning_ratio => RiskLevel::Warning,
            Some(_) => RiskLevel::Safe,
        }
    }
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            maint_margin_rate: dec!(0.004),
            warning_ratio: dec!(0.5),
            danger_ratio: dec!(0.8),
        }
    }
}
