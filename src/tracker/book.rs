//! Position book
//!
//! Latest snapshot per symbol plus the account balance the cross positions
//! share.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use super::{AccountRisk, RiskReport};
use crate::parser::{AccountUpdate, FeedMessage};
use crate::risk::{calculator, Collateral, CrossAccount, PositionSnapshot, RiskMetrics, RiskParams};

#[derive(Debug, Default)]
pub struct PositionBook {
    positions: BTreeMap<String, PositionSnapshot>,
    account: Option<AccountUpdate>,
    params: RiskParams,
}

impl PositionBook {
    pub fn new(params: RiskParams) -> Self {
        Self {
            positions: BTreeMap::new(),
            account: None,
            params,
        }
    }

    /// Apply a feed message
    ///
    /// Returns the symbols whose risk may have changed, sorted. A returned
    /// symbol without a report was closed.
    pub fn apply(&mut self, message: &FeedMessage) -> Vec<String> {
        let mut changed = match message {
            FeedMessage::Positions { snapshot, positions } => {
                let mut changed: Vec<String> = if *snapshot {
                    let previous = self.positions.keys().cloned().collect();
                    self.positions.clear();
                    previous
                } else {
                    Vec::new()
                };

                for position in positions {
                    if position.is_closed() {
                        if self.positions.remove(&position.symbol).is_some() {
                            changed.push(position.symbol.clone());
                        }
                    } else {
                        self.positions.insert(position.symbol.clone(), position.clone());
                        changed.push(position.symbol.clone());
                    }
                }
                self.with_cross_peers(changed)
            }
            FeedMessage::MarkPrice(update) => match self.positions.get_mut(&update.symbol) {
                Some(position) => {
                    position.mark_price = update.mark_price;
                    if update.ts > 0 {
                        position.update_time = update.ts;
                    }
                    self.with_cross_peers(vec![update.symbol.clone()])
                }
                None => Vec::new(),
            },
            FeedMessage::Account(account) => {
                self.account = Some(account.clone());
                self.cross_symbols()
            }
            _ => Vec::new(),
        };

        changed.sort();
        changed.dedup();
        changed
    }

    pub fn get(&self, symbol: &str) -> Option<&PositionSnapshot> {
        self.positions.get(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn account(&self) -> Option<&AccountUpdate> {
        self.account.as_ref()
    }

    /// Risk report for one tracked position
    pub fn report(&self, symbol: &str) -> Option<RiskReport> {
        let position = self.positions.get(symbol)?;
        let collateral = self.collateral_for(position);
        Some(RiskReport {
            symbol: position.symbol.clone(),
            position: position.clone(),
            metrics: RiskMetrics::compute(position, collateral, &self.params),
        })
    }

    /// Reports for every tracked position, ordered by symbol
    pub fn reports(&self) -> Vec<RiskReport> {
        self.positions
            .keys()
            .filter_map(|symbol| self.report(symbol))
            .collect()
    }

    /// Account-wide figures; `None` until an account update arrived
    pub fn account_summary(&self) -> Option<AccountRisk> {
        let account = self.account.as_ref()?;

        let mut total_unrealized_pnl = Decimal::ZERO;
        let mut total_notional = Decimal::ZERO;
        let mut cross_unrealized_pnl = Decimal::ZERO;
        let mut cross_maintenance_margin = Decimal::ZERO;

        for position in self.positions.values() {
            let pnl = calculator::unrealized_pnl(position);
            total_unrealized_pnl = total_unrealized_pnl.saturating_add(pnl);
            total_notional = total_notional.saturating_add(calculator::mark_notional(position));
            if !position.is_isolated() {
                cross_unrealized_pnl = cross_unrealized_pnl.saturating_add(pnl);
                cross_maintenance_margin = cross_maintenance_margin.saturating_add(self.maintenance(position));
            }
        }

        let cross_margin_balance = account.wallet_balance.saturating_add(cross_unrealized_pnl);
        let margin_ratio = calculator::margin_ratio(cross_maintenance_margin, cross_margin_balance);

        Some(AccountRisk {
            wallet_balance: account.wallet_balance,
            available_balance: account.available_balance,
            total_unrealized_pnl,
            total_notional,
            cross_maintenance_margin,
            cross_margin_balance,
            margin_ratio,
            risk_level: self.params.classify(margin_ratio),
            open_positions: self.positions.len(),
        })
    }

    fn maintenance(&self, position: &PositionSnapshot) -> Decimal {
        let rate = position.maint_margin_rate.unwrap_or(self.params.maint_margin_rate);
        calculator::maintenance_margin(position, rate)
    }

    /// Isolated positions stand alone; cross positions share the wallet
    fn collateral_for(&self, position: &PositionSnapshot) -> Collateral {
        if position.is_isolated() {
            return Collateral::Isolated;
        }
        // Without a balance the best estimate is the position's own margin
        let Some(account) = &self.account else {
            return Collateral::Isolated;
        };

        let mut other_maintenance = Decimal::ZERO;
        let mut other_unrealized_pnl = Decimal::ZERO;
        for other in self.positions.values() {
            if other.symbol == position.symbol || other.is_isolated() {
                continue;
            }
            other_maintenance = other_maintenance.saturating_add(self.maintenance(other));
            other_unrealized_pnl = other_unrealized_pnl.saturating_add(calculator::unrealized_pnl(other));
        }

        Collateral::Cross(CrossAccount {
            wallet_balance: account.wallet_balance,
            other_maintenance,
            other_unrealized_pnl,
        })
    }

    fn cross_symbols(&self) -> Vec<String> {
        self.positions
            .values()
            .filter(|p| !p.is_isolated())
            .map(|p| p.symbol.clone())
            .collect()
    }

    /// A change to one cross position moves every other cross position
    fn with_cross_peers(&self, mut changed: Vec<String>) -> Vec<String> {
        let touches_cross = changed.iter().any(|symbol| {
            self.positions
                .get(symbol)
                .map(|p| !p.is_isolated())
                .unwrap_or(true)
        });
        if touches_cross && self.account.is_some() {
            changed.extend(self.cross_symbols());
        }
        changed
    }
}
