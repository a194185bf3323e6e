//! Command Facade
//!
//! The single entry point for the operator layer. Every operation takes
//! primitive values and returns `Result<_, EngineError>`; nothing panics or
//! leaks shared mutable state across the boundary.
//!
//! Commands that can change positions trigger an inline reconciliation of the
//! affected symbol when `reconcile_after_command` is set.

mod queue;

pub use queue::{
    command_channel, run_command_loop, Command, CommandHandle, CommandOutput, CommandReceiver,
    CommandResult,
};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exchange::{BalanceSnapshot, ExchangeGateway, ExecutionEvent, SymbolInfo};
use crate::orders::{
    ClientToken, ExchangeOrderId, OcoIntent, OcoPlacement, Order, OrderCoordinator, OrderIntent,
    OrderLedger, ScanReport, Transition,
};
use crate::positions::{Position, PositionReconciler, ReconcileScope, MAX_LEVERAGE, MIN_LEVERAGE};
use crate::resilience::RateGovernor;
use crate::types::OrderSide;

/// Answer to [`CommandFacade::validate_connection`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionReport {
    pub server_time: DateTime<Utc>,
    /// Server clock minus local clock
    pub clock_skew_ms: i64,
    pub balance: BalanceSnapshot,
}

fn normalize_symbol(symbol: &str) -> Result<String, EngineError> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(EngineError::invalid("symbol must not be empty"));
    }
    Ok(symbol)
}

fn exchange_id(raw: &str) -> Result<ExchangeOrderId, EngineError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(EngineError::invalid("exchange order id must not be empty"));
    }
    Ok(ExchangeOrderId::new(raw))
}

/// Facade over governor, coordinator and reconciler.
pub struct CommandFacade {
    governor: Arc<RateGovernor>,
    coordinator: OrderCoordinator,
    positions: Arc<PositionReconciler>,
}

impl CommandFacade {
    /// Wire the engine around an injected gateway handle.
    pub fn new(gateway: Arc<dyn ExchangeGateway>, config: &EngineConfig) -> Self {
        let governor = Arc::new(RateGovernor::new(gateway, &config.governor, config.retry.clone()));
        let positions = Arc::new(PositionReconciler::new(
            governor.clone(),
            config.reconciliation.clone(),
        ));
        let coordinator = OrderCoordinator::new(
            governor.clone(),
            Arc::new(OrderLedger::new()),
            positions.clone(),
        );
        Self {
            governor,
            coordinator,
            positions,
        }
    }

    pub fn ledger(&self) -> &Arc<OrderLedger> {
        self.coordinator.ledger()
    }

    pub fn positions(&self) -> &Arc<PositionReconciler> {
        &self.positions
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    /// Start the periodic drift check if an interval is configured.
    pub fn start_background_reconciliation(&self) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.positions.config().periodic_interval()?;
        info!(interval_secs = interval.as_secs(), "Starting periodic reconciliation");
        Some(self.positions.clone().start_periodic(interval))
    }

    /// Full pass over every symbol; run once at startup.
    pub async fn startup_reconcile(&self) -> Result<usize, EngineError> {
        let report = self.positions.reconcile(ReconcileScope::All).await?;
        let drifted = report.drifted().count();
        info!(
            symbols = report.results.len(),
            drifted,
            "Startup reconciliation completed"
        );
        Ok(drifted)
    }

    async fn after_command(&self, symbol: &str) {
        if !self.positions.config().reconcile_after_command {
            return;
        }
        if let Err(e) = self
            .positions
            .reconcile(ReconcileScope::Symbol(symbol.to_string()))
            .await
        {
            warn!(symbol = symbol, error = %e, "Post-command reconciliation failed");
        }
    }

    // --- Queries ---

    pub async fn get_balance(&self) -> Result<BalanceSnapshot, EngineError> {
        self.positions.refresh_balance().await
    }

    pub async fn get_price(&self, symbol: &str) -> Result<Decimal, EngineError> {
        let symbol = normalize_symbol(symbol)?;
        self.governor.get_price(&symbol).await
    }

    /// Tick size, lot size and notional floor the exchange applies to `symbol`.
    pub async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, EngineError> {
        let symbol = normalize_symbol(symbol)?;
        let info = self.governor.symbol_info(&symbol).await?;
        info!(
            symbol = %info.symbol,
            status = %info.status,
            tick_size = %info.tick_size,
            step_size = %info.step_size,
            "Symbol info retrieved"
        );
        Ok(info)
    }

    /// Non-flat positions after a fresh reconciliation.
    pub async fn list_positions(&self) -> Result<Vec<Position>, EngineError> {
        self.positions.reconcile(ReconcileScope::All).await?;
        Ok(self.positions.positions().await)
    }

    pub async fn status(&self, symbol: &str, exchange_order_id: &str) -> Result<Order, EngineError> {
        let symbol = normalize_symbol(symbol)?;
        let id = exchange_id(exchange_order_id)?;
        let order = self.coordinator.status(&symbol, &id).await?;
        self.after_command(&symbol).await;
        Ok(order)
    }

    /// Check that the exchange answers and credentials are accepted.
    pub async fn validate_connection(&self) -> Result<ConnectionReport, EngineError> {
        let server_time = self.governor.server_time().await?;
        let balance = self.positions.refresh_balance().await?;
        let clock_skew_ms = (server_time - Utc::now()).num_milliseconds();
        info!(
            server_time = %server_time,
            clock_skew_ms,
            available = %balance.available_balance,
            "Exchange connection validated"
        );
        Ok(ConnectionReport {
            server_time,
            clock_skew_ms,
            balance,
        })
    }

    // --- Order commands ---

    pub async fn place_market(&self, symbol: &str, side: OrderSide, quantity: Decimal) -> Result<Order, EngineError> {
        self.place(OrderIntent::market(symbol, side, quantity)).await
    }

    pub async fn place_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Order, EngineError> {
        self.place(OrderIntent::limit(symbol, side, quantity, price)).await
    }

    pub async fn place_stop_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        stop_price: Decimal,
    ) -> Result<Order, EngineError> {
        self.place(OrderIntent::stop_limit(symbol, side, quantity, price, stop_price))
            .await
    }

    /// Submit an intent with reduce-only / time-in-force set by the caller.
    pub async fn place(&self, mut intent: OrderIntent) -> Result<Order, EngineError> {
        intent.symbol = normalize_symbol(&intent.symbol)?;
        let symbol = intent.symbol.clone();
        let result = self.coordinator.submit_single(intent).await;
        self.after_placement(&symbol, &result).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn place_oco(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        stop_price: Decimal,
        stop_limit_price: Decimal,
    ) -> Result<OcoPlacement, EngineError> {
        self.place_oco_intent(OcoIntent {
            symbol: symbol.to_string(),
            side,
            quantity,
            take_profit_price: price,
            stop_price,
            stop_limit_price,
            reduce_only: false,
        })
        .await
    }

    /// Place an OCO pair from a full intent, e.g. with both legs reduce-only.
    pub async fn place_oco_intent(&self, mut intent: OcoIntent) -> Result<OcoPlacement, EngineError> {
        intent.symbol = normalize_symbol(&intent.symbol)?;
        let symbol = intent.symbol.clone();
        let result = self.coordinator.submit_oco(intent).await;
        self.after_placement(&symbol, &result).await;
        result
    }

    async fn after_placement<T>(&self, symbol: &str, result: &Result<T, EngineError>) {
        match result {
            // local validation never touched the exchange
            Err(EngineError::InvalidOrderParameters(_)) => {}
            _ => self.after_command(symbol).await,
        }
    }

    /// Cancel an order (all open legs for a group leg).
    pub async fn cancel(&self, symbol: &str, exchange_order_id: &str) -> Result<Vec<Order>, EngineError> {
        let symbol = normalize_symbol(symbol)?;
        let id = exchange_id(exchange_order_id)?;
        let orders = self.coordinator.cancel(&symbol, &id).await?;
        self.after_command(&symbol).await;
        Ok(orders)
    }

    /// Resolve an unknown-outcome submit identified by its client token.
    pub async fn resubmit(&self, client_token: &str) -> Result<Order, EngineError> {
        let token = ClientToken::new(client_token.trim());
        if token.is_empty() {
            return Err(EngineError::invalid("client token must not be empty"));
        }
        let order = self.coordinator.resubmit(&token).await?;
        self.after_command(&order.symbol).await;
        Ok(order)
    }

    /// Adopt exchange open orders the ledger does not know.
    pub async fn sync_open_orders(&self, symbol: &str) -> Result<ScanReport, EngineError> {
        let symbol = normalize_symbol(symbol)?;
        self.coordinator.scan_open_orders(&symbol).await
    }

    /// `value` is taken signed so negative operator input is refused, not wrapped.
    pub async fn set_leverage(&self, symbol: &str, value: i64) -> Result<Position, EngineError> {
        let symbol = normalize_symbol(symbol)?;
        let leverage = u32::try_from(value)
            .ok()
            .filter(|v| (MIN_LEVERAGE..=MAX_LEVERAGE).contains(v))
            .ok_or_else(|| {
                EngineError::invalid(format!(
                    "leverage {} outside {}..={}",
                    value, MIN_LEVERAGE, MAX_LEVERAGE
                ))
            })?;
        self.positions.set_leverage(&symbol, leverage).await
    }

    // --- Halt handling ---

    pub async fn halt_reason(&self) -> Option<String> {
        self.governor.halt_reason().await
    }

    pub async fn clear_halt(&self) {
        self.governor.clear_halt().await;
    }

    // --- Gateway notifications ---

    pub async fn apply_event(&self, event: ExecutionEvent) -> Result<Vec<Transition>, EngineError> {
        self.coordinator.handle_event(event).await
    }

    /// Consume the gateway's event stream until it closes.
    pub async fn run_event_pump(&self, mut events: mpsc::UnboundedReceiver<ExecutionEvent>) {
        info!("Execution event pump started");
        while let Some(event) = events.recv().await {
            let sequence = event.sequence;
            match self.apply_event(event).await {
                Ok(transitions) => {
                    debug!(sequence, transitions = transitions.len(), "Execution event applied");
                }
                Err(e) => warn!(sequence, error = %e, "Execution event not applied"),
            }
        }
        info!("Execution event stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::exchange::paper::PaperOp;
    use crate::exchange::{ExchangeError, PaperExchange};
    use crate::orders::OrderState;
    use crate::resilience::RetryPolicy;
    use rust_decimal_macros::dec;

    fn facade() -> (CommandFacade, Arc<PaperExchange>) {
        let (paper, _events) = PaperExchange::new(dec!(10000));
        paper.set_price("BTCUSDT", dec!(50000));
        paper.set_price("ETHUSDT", dec!(3000));
        let paper = Arc::new(paper);
        let mut config = EngineConfig::default();
        config.retry = RetryPolicy::immediate(3);
        config.governor.requests_per_second = 1000;
        config.governor.burst = 1000;
        (CommandFacade::new(paper.clone(), &config), paper)
    }

    #[tokio::test]
    async fn test_out_of_range_leverage_never_calls_gateway() {
        let (facade, paper) = facade();
        for value in [-5, 0, 126, 200] {
            let err = facade.set_leverage("BTCUSDT", value).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidOrderParameters);
        }
        assert_eq!(paper.call_count(PaperOp::Leverage), 0);

        let position = facade.set_leverage("btcusdt", 50).await.unwrap();
        assert_eq!(position.leverage, 50);
        assert_eq!(paper.leverage_of("BTCUSDT"), 50);
    }

    #[tokio::test]
    async fn test_market_order_reconciles_position() {
        let (facade, _paper) = facade();
        let order = facade
            .place_market("BTCUSDT", OrderSide::Buy, dec!(0.002))
            .await
            .unwrap();
        assert_eq!(order.state, OrderState::Filled);

        let positions = facade.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTCUSDT");
        assert_eq!(positions[0].signed_quantity, dec!(0.002));
    }

    #[tokio::test]
    async fn test_balance_and_connection() {
        let (facade, _paper) = facade();
        let balance = facade.get_balance().await.unwrap();
        assert_eq!(balance.total_wallet_balance, dec!(10000));

        let report = facade.validate_connection().await.unwrap();
        assert!(report.clock_skew_ms.abs() < 5_000);
    }

    #[tokio::test]
    async fn test_fatal_failure_halts_trading_until_cleared() {
        let (facade, paper) = facade();
        paper.fail_next(PaperOp::Submit, ExchangeError::Unauthorized("invalid API key".into()));

        let err = facade
            .place_market("BTCUSDT", OrderSide::Buy, dec!(0.001))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(facade.halt_reason().await.is_some());

        // reads still work, trading calls are refused without reaching the gateway
        assert_eq!(facade.get_price("BTCUSDT").await.unwrap(), dec!(50000));
        let submits = paper.call_count(PaperOp::Submit);
        let err = facade
            .place_market("BTCUSDT", OrderSide::Buy, dec!(0.001))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(paper.call_count(PaperOp::Submit), submits);

        facade.clear_halt().await;
        facade
            .place_market("BTCUSDT", OrderSide::Buy, dec!(0.001))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_primitive_input_validation() {
        let (facade, _paper) = facade();
        assert_eq!(
            facade.get_price("  ").await.unwrap_err().kind(),
            ErrorKind::InvalidOrderParameters
        );
        assert_eq!(
            facade.cancel("BTCUSDT", "").await.unwrap_err().kind(),
            ErrorKind::InvalidOrderParameters
        );
        assert_eq!(
            facade.resubmit(" ").await.unwrap_err().kind(),
            ErrorKind::InvalidOrderParameters
        );
        assert_eq!(
            facade.status("BTCUSDT", "999").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
