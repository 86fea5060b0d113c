//! Position tracker module
//!
//! Keeps the latest position and account state from the feed and turns it
//! into risk reports.

mod book;

pub use book::PositionBook;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::risk::{PositionSnapshot, RiskLevel, RiskMetrics};

/// Risk report for one position, as published to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub symbol: String,
    pub position: PositionSnapshot,
    pub metrics: RiskMetrics,
}

/// Account-wide view over the cross margin pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRisk {
    pub wallet_balance: Decimal,
    pub available_balance: Option<Decimal>,
    /// Unrealized PnL over every position, cross and isolated
    pub total_unrealized_pnl: Decimal,
    pub total_notional: Decimal,
    pub cross_maintenance_margin: Decimal,
    /// Wallet balance plus cross unrealized PnL
    pub cross_margin_balance: Decimal,
    pub margin_ratio: Option<Decimal>,
    pub risk_level: RiskLevel,
    pub open_positions: usize,
}
