//! Position reconciliation with the exchange.
//!
//! Exchange truth always wins: a reconciliation pass overwrites the local
//! record of every covered symbol and reports the drift it found.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{BalanceSnapshot, Position, ReconcileScope};
use crate::error::EngineError;
use crate::exchange::{PositionSide, PositionSnapshot};
use crate::metrics;
use crate::resilience::RateGovernor;
use crate::types::OrderSide;

pub const MIN_LEVERAGE: u32 = 1;
pub const MAX_LEVERAGE: u32 = 125;

/// Outcome of reconciling one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationResult {
    pub symbol: String,
    /// Position according to local tracking
    pub local_quantity: Decimal,
    /// Position according to the exchange
    pub exchange_quantity: Decimal,
    /// Absolute difference between the two
    pub drift: Decimal,
    pub action: ReconciliationAction,
}

/// What a pass did to the local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationAction {
    /// Local quantity matched
    NoChange,
    /// Local quantity overwritten with the exchange's
    Corrected,
    /// Exchange holds a position the engine never tracked
    AdoptedUntracked,
    /// Exchange is flat where the engine believed a position existed
    ClosedExternally,
}

impl std::fmt::Display for ReconciliationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoChange => write!(f, "NoChange"),
            Self::Corrected => write!(f, "Corrected"),
            Self::AdoptedUntracked => write!(f, "AdoptedUntracked"),
            Self::ClosedExternally => write!(f, "ClosedExternally"),
        }
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub results: Vec<ReconciliationResult>,
    pub balance: BalanceSnapshot,
}

impl ReconcileReport {
    pub fn drifted(&self) -> impl Iterator<Item = &ReconciliationResult> {
        self.results
            .iter()
            .filter(|r| r.action != ReconciliationAction::NoChange)
    }
}

/// Configuration for position reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Interval between periodic drift checks (0 disables them)
    #[serde(default)]
    pub interval_secs: u64,
    /// Reconcile after every command that can change positions
    #[serde(default = "default_after_command")]
    pub reconcile_after_command: bool,
}

fn default_after_command() -> bool {
    true
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0,
            reconcile_after_command: default_after_command(),
        }
    }
}

impl ReconciliationConfig {
    pub fn periodic_interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

/// Owns every local [`Position`] and the last known balance.
///
/// Positions live behind per-symbol mutexes; gateway I/O always completes
/// before a symbol's lock is taken.
pub struct PositionReconciler {
    governor: Arc<RateGovernor>,
    config: ReconciliationConfig,
    positions: DashMap<String, Arc<Mutex<Position>>>,
    balance: RwLock<Option<BalanceSnapshot>>,
}

impl PositionReconciler {
    pub fn new(governor: Arc<RateGovernor>, config: ReconciliationConfig) -> Self {
        Self {
            governor,
            config,
            positions: DashMap::new(),
            balance: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    fn handle(&self, symbol: &str) -> Arc<Mutex<Position>> {
        self.positions
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Position::flat(symbol))))
            .value()
            .clone()
    }

    /// Snapshot of one symbol's position.
    pub async fn position(&self, symbol: &str) -> Option<Position> {
        let handle = self.positions.get(symbol).map(|h| h.value().clone())?;
        let position = handle.lock().await;
        Some(position.clone())
    }

    /// Non-flat positions, sorted by symbol.
    pub async fn positions(&self) -> Vec<Position> {
        let handles: Vec<Arc<Mutex<Position>>> =
            self.positions.iter().map(|e| e.value().clone()).collect();

        let mut open = Vec::new();
        for handle in handles {
            let position = handle.lock().await;
            if !position.is_flat() {
                open.push(position.clone());
            }
        }
        open.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        open
    }

    /// Last balance fetched by a reconciliation pass or `refresh_balance`.
    pub async fn balance(&self) -> Option<BalanceSnapshot> {
        self.balance.read().await.clone()
    }

    pub async fn refresh_balance(&self) -> Result<BalanceSnapshot, EngineError> {
        let balance = self.governor.get_balance().await?;
        *self.balance.write().await = Some(balance.clone());
        Ok(balance)
    }

    /// Fold a locally observed fill in between reconciliation passes.
    pub async fn apply_fill(&self, symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) {
        let handle = self.handle(symbol);
        let mut position = handle.lock().await;
        position.apply_fill(side, quantity, price);
        debug!(
            symbol = symbol,
            side = %side,
            quantity = %quantity,
            price = %price,
            new_position = %position.signed_quantity,
            "Local position updated from fill"
        );
    }

    /// Pull positions and balance from the exchange and overwrite local records.
    pub async fn reconcile(&self, scope: ReconcileScope) -> Result<ReconcileReport, EngineError> {
        let filter = match &scope {
            ReconcileScope::Symbol(symbol) => Some(symbol.as_str()),
            ReconcileScope::All => None,
        };
        let snapshots = self.governor.get_positions(filter).await?;
        let balance = self.governor.get_balance().await?;

        // hedge-mode accounts report one snapshot per side; fold them into the net position
        let mut remote: HashMap<String, PositionSnapshot> = HashMap::new();
        for snapshot in snapshots {
            match remote.get_mut(&snapshot.symbol) {
                Some(merged) => merge_leg(merged, &snapshot),
                None => {
                    remote.insert(snapshot.symbol.clone(), snapshot);
                }
            }
        }

        let covered: BTreeSet<String> = match &scope {
            ReconcileScope::Symbol(symbol) => std::iter::once(symbol.clone()).collect(),
            ReconcileScope::All => self
                .positions
                .iter()
                .map(|e| e.key().clone())
                .chain(remote.keys().cloned())
                .collect(),
        };

        let mut results = Vec::with_capacity(covered.len());
        for symbol in covered {
            results.push(self.overwrite(&symbol, remote.get(&symbol)).await);
        }

        *self.balance.write().await = Some(balance.clone());

        Ok(ReconcileReport { results, balance })
    }

    async fn overwrite(&self, symbol: &str, remote: Option<&PositionSnapshot>) -> ReconciliationResult {
        let handle = self.handle(symbol);
        let mut position = handle.lock().await;

        let local_quantity = position.signed_quantity;
        let exchange_quantity = remote.map(|s| s.position_amt).unwrap_or_default();
        let drift = (exchange_quantity - local_quantity).abs();

        let action = if drift.is_zero() {
            ReconciliationAction::NoChange
        } else if local_quantity.is_zero() {
            ReconciliationAction::AdoptedUntracked
        } else if exchange_quantity.is_zero() {
            ReconciliationAction::ClosedExternally
        } else {
            ReconciliationAction::Corrected
        };

        *position = match remote {
            Some(snapshot) => Position::from_snapshot(snapshot),
            None => {
                let mut flat = Position::flat(symbol);
                flat.leverage = position.leverage;
                flat
            }
        };

        metrics::set_position_drift(symbol, drift.to_f64().unwrap_or_default());
        if action == ReconciliationAction::NoChange {
            debug!(symbol = symbol, position = %exchange_quantity, "Position in sync");
        } else {
            warn!(
                symbol = symbol,
                local = %local_quantity,
                exchange = %exchange_quantity,
                drift = %drift,
                action = %action,
                "Position drift detected, exchange state accepted"
            );
        }

        ReconciliationResult {
            symbol: symbol.to_string(),
            local_quantity,
            exchange_quantity,
            drift,
            action,
        }
    }

    /// Change leverage for a symbol. The local value only changes once the
    /// exchange confirmed.
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<Position, EngineError> {
        if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&leverage) {
            return Err(EngineError::invalid(format!(
                "leverage {} outside {}..={}",
                leverage, MIN_LEVERAGE, MAX_LEVERAGE
            )));
        }

        let ack = self.governor.set_leverage(symbol, leverage).await?;

        let handle = self.handle(symbol);
        let mut position = handle.lock().await;
        position.leverage = ack.leverage;
        position.updated_at = chrono::Utc::now();
        info!(
            symbol = symbol,
            leverage = ack.leverage,
            max_notional = ?ack.max_notional,
            "Leverage updated"
        );
        Ok(position.clone())
    }

    /// Spawn a drift check over all symbols every `interval`.
    ///
    /// Returns a `JoinHandle` that can be used to abort the task.
    pub fn start_periodic(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                match self.reconcile(ReconcileScope::All).await {
                    Ok(report) => {
                        let drifted = report.drifted().count();
                        if drifted > 0 {
                            info!(
                                total = report.results.len(),
                                drifted,
                                "Periodic reconciliation completed"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Periodic reconciliation failed"),
                }
            }
        })
    }
}

/// Net two position legs of one symbol. The entry price is weighted by the
/// absolute size of each leg and unrealized PnL is summed.
fn merge_leg(merged: &mut PositionSnapshot, leg: &PositionSnapshot) {
    if leg.position_amt.is_zero() {
        return;
    }
    if merged.position_amt.is_zero() {
        let net_pnl = merged.unrealized_pnl + leg.unrealized_pnl;
        *merged = leg.clone();
        merged.unrealized_pnl = net_pnl;
        return;
    }

    let merged_size = merged.position_amt.abs();
    let leg_size = leg.position_amt.abs();
    merged.entry_price =
        (merged.entry_price * merged_size + leg.entry_price * leg_size) / (merged_size + leg_size);
    merged.unrealized_pnl += leg.unrealized_pnl;
    merged.position_amt += leg.position_amt;
    merged.leverage = merged.leverage.max(leg.leverage);
    if merged.position_side != leg.position_side {
        merged.position_side = PositionSide::Both;
    }
}
