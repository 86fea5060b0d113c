//! Risk metrics bundle for a single position

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::calculator;
use super::position::PositionSnapshot;
use super::{RiskLevel, RiskParams};

/// Share of a cross account attributable to everything except one position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossAccount {
    pub wallet_balance: Decimal,
    /// Maintenance margin of the other cross positions
    pub other_maintenance: Decimal,
    /// Unrealized PnL of the other cross positions
    pub other_unrealized_pnl: Decimal,
}

/// Collateral backing a position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collateral {
    /// Dedicated margin: `isolated_margin`, or initial margin when absent
    Isolated,
    /// Shared wallet balance
    Cross(CrossAccount),
}

/// Derived risk figures for one position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub notional: Decimal,
    pub entry_notional: Decimal,
    pub unrealized_pnl: Decimal,
    pub initial_margin: Option<Decimal>,
    pub maintenance_margin: Decimal,
    pub maint_margin_rate: Decimal,
    /// Collateral plus PnL the maintenance requirement is measured against
    pub margin_balance: Decimal,
    pub margin_ratio: Option<Decimal>,
    pub liquidation_price: Option<Decimal>,
    pub liquidation_distance_pct: Option<Decimal>,
    pub roe_pct: Option<Decimal>,
    pub roi_pct: Option<Decimal>,
    pub effective_leverage: Option<Decimal>,
    pub risk_level: RiskLevel,
}

impl RiskMetrics {
    /// Compute every metric for `position` backed by `collateral`
    pub fn compute(position: &PositionSnapshot, collateral: Collateral, params: &RiskParams) -> Self {
        let mmr = position.maint_margin_rate.unwrap_or(params.maint_margin_rate);

        let notional = calculator::mark_notional(position);
        let unrealized_pnl = calculator::unrealized_pnl(position);
        let initial_margin = calculator::initial_margin(position);
        let maintenance_margin = calculator::maintenance_margin(position, mmr);

        // Ratio inputs differ by mode: a cross position reports the account ratio
        let (backing, margin_balance, ratio_maintenance) = match collateral {
            Collateral::Isolated => {
                let backing = position
                    .isolated_margin
                    .or(initial_margin)
                    .unwrap_or(Decimal::ZERO);
                (backing, backing.saturating_add(unrealized_pnl), maintenance_margin)
            }
            Collateral::Cross(account) => {
                let wallet_and_peers = account.wallet_balance.saturating_add(account.other_unrealized_pnl);
                (
                    wallet_and_peers.saturating_sub(account.other_maintenance),
                    wallet_and_peers.saturating_add(unrealized_pnl),
                    maintenance_margin.saturating_add(account.other_maintenance),
                )
            }
        };

        let margin_ratio = calculator::margin_ratio(ratio_maintenance, margin_balance);
        let liquidation_price = calculator::liquidation_price(position, backing, mmr);

        Self {
            notional,
            entry_notional: calculator::entry_notional(position),
            unrealized_pnl,
            initial_margin,
            maintenance_margin,
            maint_margin_rate: mmr,
            margin_balance,
            margin_ratio,
            liquidation_distance_pct: liquidation_price
                .and_then(|liq| calculator::liquidation_distance_pct(position.mark_price, liq)),
            liquidation_price,
            roe_pct: calculator::roe_pct(position),
            roi_pct: calculator::roi_pct(position),
            effective_leverage: calculator::effective_leverage(notional, margin_balance),
            risk_level: params.classify(margin_ratio),
        }
    }

    /// True once maintenance margin is no longer covered
    pub fn is_liquidatable(&self) -> bool {
        self.risk_level == RiskLevel::Liquidation
    }
}
