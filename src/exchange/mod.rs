//! Exchange Gateway boundary
//!
//! The engine performs no I/O of its own: every request goes through an
//! [`ExchangeGateway`] implementation injected at construction. Transport
//! concerns (TLS, request signing, websocket framing) live behind the trait.
//!
//! Responses are mapped to tagged unions per call kind, each with an
//! explicit `Unrecognized` variant for payloads the transport could not
//! classify.

pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orders::{ClientToken, ExchangeOrderId, OrderEventKind, OrderRef, OrderState};
use crate::types::{OrderSide, OrderType, TimeInForce};

pub use paper::PaperExchange;

/// Errors reported by a gateway implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Rate limited by exchange (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Rejected (code {code:?}): {reason}")]
    Rejected { code: Option<i64>, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Unrecognized error payload: {0}")]
    Unrecognized(String),
}

/// How the governor treats a gateway failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Exchange-side throttling; retry after backoff, nothing was applied
    RateLimited,
    /// Instability; retry with backoff, the request may have been applied
    Transient,
    /// Business rejection; never retried
    Rejected,
    /// Unknown order / symbol
    NotFound,
    /// Credentials or permissions; never retried, halts trading
    Fatal,
}

impl ExchangeError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Network(_) | Self::Timeout | Self::Server { .. } | Self::Unrecognized(_) => {
                FailureClass::Transient
            }
            Self::RateLimited { .. } => FailureClass::RateLimited,
            Self::Rejected { .. } => FailureClass::Rejected,
            Self::NotFound(_) => FailureClass::NotFound,
            Self::Unauthorized(_) => FailureClass::Fatal,
        }
    }
}

/// Submit request. The client token is mandatory: it is what makes retries
/// idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    pub client_token: ClientToken,
}

/// Exchange view of a single order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub exchange_id: ExchangeOrderId,
    pub client_token: Option<ClientToken>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub state: OrderState,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub reduce_only: bool,
    pub updated_at: DateTime<Utc>,
}

impl OrderSnapshot {
    /// State-machine events that bring a freshly recorded order to this snapshot.
    pub fn to_events(&self) -> Vec<OrderEventKind> {
        let mut events = Vec::with_capacity(3);

        if self.state == OrderState::Rejected {
            events.push(OrderEventKind::Rejected {
                reason: "rejected by exchange".to_string(),
            });
            return events;
        }

        events.push(OrderEventKind::Ack {
            exchange_id: self.exchange_id.clone(),
        });

        if self.filled_qty > Decimal::ZERO {
            events.push(OrderEventKind::Fill {
                cumulative_qty: self.filled_qty,
                avg_price: self.avg_price.or(self.price).unwrap_or_default(),
            });
        }

        match self.state {
            OrderState::Canceled => events.push(OrderEventKind::CancelAck),
            OrderState::Expired => events.push(OrderEventKind::Expired),
            _ => {}
        }

        events
    }
}

/// Response to a submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubmitResponse {
    Accepted(OrderSnapshot),
    /// An order with this client token already exists; this is its state
    AlreadyExists(OrderSnapshot),
    Unrecognized { raw: String },
}

/// Response to a cancel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CancelResponse {
    Canceled,
    /// Order already filled, cancelled or expired on the exchange
    AlreadyFinal,
    Unrecognized { raw: String },
}

/// Response to a leverage change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LeverageResponse {
    Updated {
        leverage: u32,
        max_notional: Option<Decimal>,
    },
    Unrecognized { raw: String },
}

/// Hedge-mode side of a position (`Both` in one-way mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    #[default]
    Both,
    Long,
    Short,
}

/// Exchange view of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    /// Positive long, negative short
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub position_side: PositionSide,
}

/// Per-asset margin balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub wallet_balance: Decimal,
    pub unrealized_profit: Decimal,
    pub margin_balance: Decimal,
    pub maint_margin: Decimal,
    pub initial_margin: Decimal,
    pub position_initial_margin: Decimal,
    pub open_order_initial_margin: Decimal,
}

/// Futures account balance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub total_wallet_balance: Decimal,
    pub total_unrealized_profit: Decimal,
    pub total_margin_balance: Decimal,
    pub total_position_initial_margin: Decimal,
    pub total_open_order_initial_margin: Decimal,
    pub available_balance: Decimal,
    pub max_withdraw_amount: Decimal,
    /// Assets with a non-zero wallet balance
    pub assets: Vec<AssetBalance>,
}

/// Trading rules of one symbol, as published by the exchange.
///
/// The exchange enforces these on submit; the engine only reports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// `TRADING` while the contract accepts orders
    pub status: String,
    /// PRICE_FILTER
    pub tick_size: Decimal,
    pub min_price: Decimal,
    /// LOT_SIZE
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    /// MIN_NOTIONAL, in quote asset
    pub min_notional: Decimal,
}

/// Filter a request breaks, named as the exchange names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterViolation {
    PriceFilter,
    LotSize,
    MinNotional,
}

impl std::fmt::Display for FilterViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PriceFilter => write!(f, "PRICE_FILTER"),
            Self::LotSize => write!(f, "LOT_SIZE"),
            Self::MinNotional => write!(f, "MIN_NOTIONAL"),
        }
    }
}

fn on_grid(value: Decimal, step: Decimal) -> bool {
    step.is_zero() || (value % step).is_zero()
}

impl SymbolInfo {
    pub fn is_trading(&self) -> bool {
        self.status.eq_ignore_ascii_case("TRADING")
    }

    /// First filter `quantity` at `price` breaks. `price` is the limit price,
    /// or the last trade for market orders; `check_price` is false for the latter.
    pub fn check(&self, quantity: Decimal, price: Decimal, check_price: bool) -> Option<FilterViolation> {
        if check_price && (price < self.min_price || !on_grid(price, self.tick_size)) {
            return Some(FilterViolation::PriceFilter);
        }
        if quantity < self.min_qty || quantity > self.max_qty || !on_grid(quantity, self.step_size) {
            return Some(FilterViolation::LotSize);
        }
        if quantity * price < self.min_notional {
            return Some(FilterViolation::MinNotional);
        }
        None
    }
}

/// Asynchronous order notification from the gateway's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Monotonic per-stream marker
    pub sequence: u64,
    pub symbol: String,
    pub client_token: Option<ClientToken>,
    pub exchange_id: Option<ExchangeOrderId>,
    pub kind: OrderEventKind,
}

impl ExecutionEvent {
    /// Preferred lookup key: the client token if present.
    pub fn order_ref(&self) -> Option<OrderRef> {
        self.client_token
            .clone()
            .map(OrderRef::Client)
            .or_else(|| self.exchange_id.clone().map(OrderRef::Exchange))
    }
}

/// Capability the engine requires from an exchange connection.
///
/// Implementations are shared by all components and must be stateless per
/// call (session state lives in the implementation, not in callers).
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Submit an order. Must be idempotent keyed by `request.client_token`.
    async fn submit_order(&self, request: &SubmitRequest) -> Result<SubmitResponse, ExchangeError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        exchange_id: &ExchangeOrderId,
    ) -> Result<CancelResponse, ExchangeError>;

    async fn query_order(&self, symbol: &str, order: &OrderRef)
        -> Result<OrderSnapshot, ExchangeError>;

    /// Orders still resting on the book for `symbol`.
    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderSnapshot>, ExchangeError>;

    /// Positions for one symbol, or all symbols when `None`.
    async fn get_positions(
        &self,
        symbol: Option<String>,
    ) -> Result<Vec<PositionSnapshot>, ExchangeError>;

    async fn get_balance(&self) -> Result<BalanceSnapshot, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32)
        -> Result<LeverageResponse, ExchangeError>;

    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Trading rules (tick size, lot size, minimum notional) of `symbol`.
    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError>;

    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError>;
}
