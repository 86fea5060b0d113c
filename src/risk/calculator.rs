//! Pure risk arithmetic over position snapshots
//!
//! Every function here is side-effect free and never panics. Products
//! saturate at the `Decimal` bounds; quantities that are undefined for the
//! given inputs (zero size, non-positive margin balance, a long that can never
//! be liquidated, a quotient out of range) come back as `None`.

use rust_decimal::Decimal;

use super::position::{PositionSide, PositionSnapshot};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Position value at `price`
pub fn notional(size: Decimal, price: Decimal) -> Decimal {
    size.saturating_mul(price)
}

/// Value of the position at its entry price
pub fn entry_notional(position: &PositionSnapshot) -> Decimal {
    notional(position.size, position.entry_price)
}

/// Value of the position at the current mark price
pub fn mark_notional(position: &PositionSnapshot) -> Decimal {
    notional(position.size, position.mark_price)
}

/// Unrealized PnL at the current mark price
pub fn unrealized_pnl(position: &PositionSnapshot) -> Decimal {
    unrealized_pnl_at(position, position.mark_price)
}

/// Unrealized PnL if the mark moved to `price`
pub fn unrealized_pnl_at(position: &PositionSnapshot, price: Decimal) -> Decimal {
    price
        .saturating_sub(position.entry_price)
        .saturating_mul(position.size)
        .saturating_mul(position.side.direction())
}

/// Margin required to open the position at its leverage
pub fn initial_margin(position: &PositionSnapshot) -> Option<Decimal> {
    if position.leverage == 0 {
        return None;
    }
    entry_notional(position).checked_div(Decimal::from(position.leverage))
}

/// Maintenance margin at the current mark price
pub fn maintenance_margin(position: &PositionSnapshot, maint_margin_rate: Decimal) -> Decimal {
    mark_notional(position).saturating_mul(maint_margin_rate)
}

/// Maintenance margin over margin balance; 1.0 or more means liquidation
pub fn margin_ratio(maintenance: Decimal, margin_balance: Decimal) -> Option<Decimal> {
    if margin_balance <= Decimal::ZERO {
        return None;
    }
    maintenance.checked_div(margin_balance)
}

/// Mark price at which `collateral + pnl(P) == maintenance(P)`
///
/// `collateral` is the margin backing the position excluding its own PnL.
pub fn liquidation_price(
    position: &PositionSnapshot,
    collateral: Decimal,
    maint_margin_rate: Decimal,
) -> Option<Decimal> {
    if position.size.is_zero() {
        return None;
    }

    let size = position.size;
    let cost = size.saturating_mul(position.entry_price);

    let price = match position.side {
        PositionSide::Long => {
            let denominator = size.saturating_mul(Decimal::ONE - maint_margin_rate);
            if denominator <= Decimal::ZERO {
                return None;
            }
            cost.saturating_sub(collateral).checked_div(denominator)?
        }
        PositionSide::Short => {
            let denominator = size.saturating_mul(Decimal::ONE + maint_margin_rate);
            cost.saturating_add(collateral).checked_div(denominator)?
        }
    };

    if price <= Decimal::ZERO {
        None
    } else {
        Some(price)
    }
}

/// Return on equity (initial margin), in percent
pub fn roe_pct(position: &PositionSnapshot) -> Option<Decimal> {
    let margin = initial_margin(position)?;
    percent_of(unrealized_pnl(position), margin)
}

/// Unleveraged return on the entry notional, in percent
pub fn roi_pct(position: &PositionSnapshot) -> Option<Decimal> {
    percent_of(unrealized_pnl(position), entry_notional(position))
}

/// Mark notional over margin balance
pub fn effective_leverage(notional: Decimal, margin_balance: Decimal) -> Option<Decimal> {
    if margin_balance <= Decimal::ZERO {
        return None;
    }
    notional.checked_div(margin_balance)
}

/// How far the mark has to travel to reach liquidation, in percent of mark
pub fn liquidation_distance_pct(mark_price: Decimal, liquidation_price: Decimal) -> Option<Decimal> {
    if mark_price <= Decimal::ZERO {
        return None;
    }
    percent_of(mark_price.saturating_sub(liquidation_price).abs(), mark_price)
}

fn percent_of(value: Decimal, base: Decimal) -> Option<Decimal> {
    if base.is_zero() {
        return None;
    }
    value.checked_div(base)?.checked_mul(HUNDRED)
}
