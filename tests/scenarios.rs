use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::mock;
use mockall::predicate::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use perpdesk::config::EngineConfig;
use perpdesk::error::ErrorKind;
use perpdesk::exchange::paper::PaperOp;
use perpdesk::exchange::{
    BalanceSnapshot, CancelResponse, ExchangeError, ExchangeGateway, ExecutionEvent, LeverageResponse,
    OrderSnapshot, PaperExchange, PositionSnapshot, SubmitRequest, SubmitResponse, SymbolInfo,
};
use perpdesk::facade::CommandFacade;
use perpdesk::orders::{ExchangeOrderId, OrderRef, OrderState};
use perpdesk::resilience::RetryPolicy;
use perpdesk::types::OrderSide;

// --- Mocks ---

// Sync mock methods behind an async_trait adapter, so expectations can be
// written as plain closures.

mock! {
    pub Gateway {
        fn submit_order_mock(&self, request: &SubmitRequest) -> Result<SubmitResponse, ExchangeError>;
        fn cancel_order_mock(&self, symbol: &str, exchange_id: &ExchangeOrderId) -> Result<CancelResponse, ExchangeError>;
        fn query_order_mock(&self, symbol: &str, order: &OrderRef) -> Result<OrderSnapshot, ExchangeError>;
        fn open_orders_mock(&self, symbol: &str) -> Result<Vec<OrderSnapshot>, ExchangeError>;
        fn get_positions_mock(&self, symbol: Option<String>) -> Result<Vec<PositionSnapshot>, ExchangeError>;
        fn get_balance_mock(&self) -> Result<BalanceSnapshot, ExchangeError>;
        fn set_leverage_mock(&self, symbol: &str, leverage: u32) -> Result<LeverageResponse, ExchangeError>;
        fn get_price_mock(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
        fn symbol_info_mock(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError>;
        fn server_time_mock(&self) -> Result<DateTime<Utc>, ExchangeError>;
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn submit_order(&self, request: &SubmitRequest) -> Result<SubmitResponse, ExchangeError> {
        self.submit_order_mock(request)
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        exchange_id: &ExchangeOrderId,
    ) -> Result<CancelResponse, ExchangeError> {
        self.cancel_order_mock(symbol, exchange_id)
    }

    async fn query_order(&self, symbol: &str, order: &OrderRef) -> Result<OrderSnapshot, ExchangeError> {
        self.query_order_mock(symbol, order)
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderSnapshot>, ExchangeError> {
        self.open_orders_mock(symbol)
    }

    async fn get_positions(&self, symbol: Option<String>) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        self.get_positions_mock(symbol)
    }

    async fn get_balance(&self) -> Result<BalanceSnapshot, ExchangeError> {
        self.get_balance_mock()
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<LeverageResponse, ExchangeError> {
        self.set_leverage_mock(symbol, leverage)
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.get_price_mock(symbol)
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        self.symbol_info_mock(symbol)
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        self.server_time_mock()
    }
}

// --- Helpers ---

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry = RetryPolicy::immediate(4);
    config.governor.requests_per_second = 1000;
    config.governor.burst = 1000;
    config
}

fn accepted(request: &SubmitRequest, exchange_id: &str) -> OrderSnapshot {
    OrderSnapshot {
        exchange_id: ExchangeOrderId::new(exchange_id),
        client_token: Some(request.client_token.clone()),
        symbol: request.symbol.clone(),
        side: request.side,
        order_type: request.order_type,
        quantity: request.quantity,
        price: request.price,
        stop_price: request.stop_price,
        state: OrderState::Submitted,
        filled_qty: Decimal::ZERO,
        avg_price: None,
        reduce_only: request.reduce_only,
        updated_at: Utc::now(),
    }
}

fn paper_facade(wallet: Decimal) -> (CommandFacade, Arc<PaperExchange>, mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (paper, events) = PaperExchange::new(wallet);
    paper.set_price("BTCUSDT", dec!(50000));
    let paper = Arc::new(paper);
    (CommandFacade::new(paper.clone(), &test_config()), paper, events)
}

async fn drain_events(facade: &CommandFacade, events: &mut mpsc::UnboundedReceiver<ExecutionEvent>) {
    while let Ok(event) = events.try_recv() {
        // fills already absorbed from submit responses come back as duplicates
        let _ = facade.apply_event(event).await;
    }
}

// --- Scenarios ---

#[tokio::test]
async fn test_oco_take_profit_fill_cancels_stop_leg() {
    let (facade, paper, mut events) = paper_facade(dec!(10000));

    facade
        .place_market("BTCUSDT", OrderSide::Buy, dec!(0.01))
        .await
        .unwrap();
    drain_events(&facade, &mut events).await;

    let placement = facade
        .place_oco("BTCUSDT", OrderSide::Sell, dec!(0.01), dec!(52000), dec!(48000), dec!(47500))
        .await
        .unwrap();

    let group = facade.ledger().group(&placement.group_id).unwrap();
    assert!(group.cancel_on_fill);
    assert_eq!(group.legs.len(), 2);
    assert_eq!(placement.take_profit.state, OrderState::Submitted);
    assert_eq!(placement.stop_loss.state, OrderState::Submitted);
    assert_eq!(placement.take_profit.linked_group_id, Some(placement.group_id.clone()));
    assert_eq!(placement.stop_loss.linked_group_id, Some(placement.group_id.clone()));

    paper.set_price("BTCUSDT", dec!(52000));
    drain_events(&facade, &mut events).await;

    let take_profit = facade.ledger().get(&placement.take_profit.client_token).await.unwrap();
    let stop_loss = facade.ledger().get(&placement.stop_loss.client_token).await.unwrap();
    assert_eq!(take_profit.state, OrderState::Filled);
    assert_eq!(stop_loss.state, OrderState::Canceled);
    assert_eq!(paper.call_count(PaperOp::Cancel), 1);

    // the exchange agrees: flat, nothing resting
    assert_eq!(paper.position_amount("BTCUSDT"), Decimal::ZERO);
    assert!(facade.list_positions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_timeout_then_already_exists_records_one_order() {
    let mut gateway = MockGateway::new();

    let submits = Arc::new(AtomicUsize::new(0));
    let seen = submits.clone();
    gateway
        .expect_submit_order_mock()
        .times(2)
        .returning(move |request| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ExchangeError::Timeout)
            } else {
                Ok(SubmitResponse::AlreadyExists(accepted(request, "8886001")))
            }
        });
    // the first attempt is not yet visible when queried
    gateway
        .expect_query_order_mock()
        .with(eq("BTCUSDT"), always())
        .times(1)
        .returning(|_, _| Err(ExchangeError::NotFound("Order does not exist.".into())));
    gateway
        .expect_get_positions_mock()
        .returning(|_| Ok(Vec::new()));
    gateway
        .expect_get_balance_mock()
        .returning(|| Ok(BalanceSnapshot::default()));

    let facade = CommandFacade::new(Arc::new(gateway), &test_config());
    let order = facade
        .place_market("BTCUSDT", OrderSide::Buy, dec!(0.001))
        .await
        .unwrap();

    assert_eq!(order.state, OrderState::Submitted);
    assert_eq!(order.exchange_id, Some(ExchangeOrderId::new("8886001")));
    assert!(!order.outcome_unknown);
    assert_eq!(facade.ledger().len(), 1);
    assert_eq!(submits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_out_of_range_leverage_rejected_locally() {
    let mut gateway = MockGateway::new();
    gateway.expect_set_leverage_mock().times(0);

    let facade = CommandFacade::new(Arc::new(gateway), &test_config());
    for value in [200, 126, 0, -1] {
        let err = facade.set_leverage("BTCUSDT", value).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOrderParameters);
    }
}

#[tokio::test]
async fn test_cancel_after_partial_fill_keeps_filled_quantity() {
    let (facade, paper, mut events) = paper_facade(dec!(10000));

    let order = facade
        .place_limit("BTCUSDT", OrderSide::Buy, dec!(0.01), dec!(49000))
        .await
        .unwrap();
    assert_eq!(order.state, OrderState::Submitted);
    let id = order.exchange_id.clone().unwrap();

    paper.fill_order(&id, dec!(0.004)).unwrap();
    drain_events(&facade, &mut events).await;

    let canceled = facade.cancel("BTCUSDT", id.as_str()).await.unwrap();
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled[0].state, OrderState::Canceled);
    assert_eq!(canceled[0].fill.filled_qty, dec!(0.004));

    let position = facade.positions().position("BTCUSDT").await.unwrap();
    assert_eq!(position.signed_quantity, dec!(0.004));
}

#[tokio::test]
async fn test_restart_adopts_resting_orders() {
    let (first, paper, _events) = paper_facade(dec!(10000));
    let resting = first
        .place_limit("BTCUSDT", OrderSide::Sell, dec!(0.002), dec!(55000))
        .await
        .unwrap();
    drop(first);

    // a fresh engine over the same venue knows nothing until it scans
    let second = CommandFacade::new(paper.clone(), &test_config());
    assert!(second.ledger().is_empty());

    let report = second.sync_open_orders("btcusdt").await.unwrap();
    assert_eq!(report.adopted, vec![resting.client_token.clone()]);

    let adopted = second.ledger().get(&resting.client_token).await.unwrap();
    assert_eq!(adopted.state, OrderState::Submitted);
    assert_eq!(adopted.exchange_id, resting.exchange_id);
}

#[tokio::test]
async fn test_status_picks_up_external_cancel() {
    let (facade, paper, _events) = paper_facade(dec!(10000));
    let order = facade
        .place_limit("BTCUSDT", OrderSide::Buy, dec!(0.003), dec!(45000))
        .await
        .unwrap();
    let id = order.exchange_id.clone().unwrap();

    // the stream event is never delivered; only a status query reveals it
    assert!(paper.cancel_externally(&id));
    let refreshed = facade.status("BTCUSDT", id.as_str()).await.unwrap();
    assert_eq!(refreshed.state, OrderState::Canceled);
    assert_eq!(refreshed.client_token, order.client_token);
}

#[tokio::test]
async fn test_symbol_info_reports_exchange_rules() {
    let mut gateway = MockGateway::new();
    gateway
        .expect_symbol_info_mock()
        .with(eq("ETHUSDT"))
        .times(1)
        .returning(|symbol| {
            Ok(SymbolInfo {
                symbol: symbol.to_string(),
                status: "TRADING".into(),
                tick_size: dec!(0.01),
                min_price: dec!(39.86),
                step_size: dec!(0.001),
                min_qty: dec!(0.001),
                max_qty: dec!(10000),
                min_notional: dec!(20),
            })
        });

    let facade = CommandFacade::new(Arc::new(gateway), &test_config());
    let info = facade.symbol_info(" ethusdt ").await.unwrap();
    assert!(info.is_trading());
    assert_eq!(info.tick_size, dec!(0.01));
    assert_eq!(info.min_notional, dec!(20));
}

#[tokio::test]
async fn test_order_off_tick_grid_rejected_by_exchange() {
    let (facade, paper, _events) = paper_facade(dec!(10000));
    let mut rules = facade.symbol_info("BTCUSDT").await.unwrap();
    rules.tick_size = dec!(0.1);
    paper.set_symbol_info(rules);

    let err = facade
        .place_limit("BTCUSDT", OrderSide::Buy, dec!(0.01), dec!(49000.05))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);
    assert_eq!(
        err,
        perpdesk::error::EngineError::Rejected {
            reason: "Filter failure: PRICE_FILTER".into(),
            code: Some(-1013),
        }
    );

    // nothing rests on either side
    assert!(facade.ledger().list_open_by_symbol("BTCUSDT").await.is_empty());
    assert_eq!(paper.order_count(), 0);
}
