//! Position Management Module
//!
//! Per-symbol positions derived from exchange truth plus locally known fills.
//!
//! - `Position` - signed quantity, weighted entry price, leverage
//! - `PositionReconciler` - merges exchange snapshots into local state and owns leverage changes

mod reconciler;

pub use crate::exchange::{AssetBalance, BalanceSnapshot, PositionSide};
pub use reconciler::{
    PositionReconciler, ReconcileReport, ReconciliationAction, ReconciliationConfig,
    ReconciliationResult, MAX_LEVERAGE, MIN_LEVERAGE,
};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::PositionSnapshot;
use crate::types::OrderSide;

/// Leverage assumed for a symbol the exchange has not reported yet.
pub const DEFAULT_LEVERAGE: u32 = 20;

/// Which symbols a reconciliation pass covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileScope {
    Symbol(String),
    All,
}

/// Per-symbol aggregate position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Positive long, negative short, zero flat
    pub signed_quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub position_side: PositionSide,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            signed_quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            mark_price: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            leverage: DEFAULT_LEVERAGE,
            position_side: PositionSide::Both,
            updated_at: Utc::now(),
        }
    }

    pub fn from_snapshot(snapshot: &PositionSnapshot) -> Self {
        Self {
            symbol: snapshot.symbol.clone(),
            signed_quantity: snapshot.position_amt,
            entry_price: snapshot.entry_price,
            mark_price: snapshot.mark_price,
            unrealized_pnl: snapshot.unrealized_pnl,
            leverage: snapshot.leverage,
            position_side: snapshot.position_side,
            updated_at: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.signed_quantity.is_zero()
    }

    /// Direction of the position, `None` when flat.
    pub fn side(&self) -> Option<OrderSide> {
        if self.signed_quantity > Decimal::ZERO {
            Some(OrderSide::Buy)
        } else if self.signed_quantity < Decimal::ZERO {
            Some(OrderSide::Sell)
        } else {
            None
        }
    }

    pub fn notional(&self) -> Decimal {
        self.signed_quantity.abs() * self.mark_price
    }

    /// Fold one fill into quantity and weighted entry price.
    pub fn apply_fill(&mut self, side: OrderSide, quantity: Decimal, price: Decimal) {
        let old = self.signed_quantity;
        let delta = side.sign() * quantity;
        let new = old + delta;

        let same_direction = (old > Decimal::ZERO && delta > Decimal::ZERO)
            || (old < Decimal::ZERO && delta < Decimal::ZERO);

        if old.is_zero() || same_direction {
            self.entry_price = (old.abs() * self.entry_price + quantity * price) / new.abs();
        } else if new.is_zero() {
            self.entry_price = Decimal::ZERO;
        } else if (new > Decimal::ZERO) != (old > Decimal::ZERO) {
            // flipped through flat: the remainder opened at the fill price
            self.entry_price = price;
        }

        self.signed_quantity = new;
        if !self.mark_price.is_zero() {
            self.unrealized_pnl = (self.mark_price - self.entry_price) * new;
        }
        self.updated_at = Utc::now();
    }
}
