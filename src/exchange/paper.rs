//! Paper trading venue.
//!
//! `PaperExchange` simulates a USDT-margined futures exchange in memory:
//! orders, positions, leverage and a margin account. Market orders fill at
//! the last price, resting limit and stop-limit orders are matched whenever
//! [`PaperExchange::set_price`] moves the market. Asynchronous changes
//! (fills of resting orders, external cancels, expiries) are published on
//! the execution-event channel returned by [`PaperExchange::new`].
//!
//! Submits are held to per-symbol trading rules ([`SymbolInfo`]) the way the
//! exchange holds them: tick size, lot size and minimum notional.
//!
//! Failures can be injected per operation to exercise retry paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    AssetBalance, BalanceSnapshot, CancelResponse, ExchangeError, ExchangeGateway,
    ExecutionEvent, FilterViolation, LeverageResponse, OrderSnapshot, PositionSide,
    PositionSnapshot, SubmitRequest, SubmitResponse, SymbolInfo,
};
use crate::orders::{ClientToken, ExchangeOrderId, OrderEventKind, OrderRef, OrderState};
use crate::types::{OrderSide, OrderType};

const QUOTE_ASSET: &str = "USDT";
const FIRST_ORDER_ID: u64 = 4_000_000_001;
pub const PAPER_DEFAULT_LEVERAGE: u32 = 20;

/// Gateway operations that accept injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Submit,
    Cancel,
    Query,
    OpenOrders,
    Positions,
    Balance,
    Leverage,
    Price,
    SymbolInfo,
    ServerTime,
}

/// An injected failure for the next call of an operation.
#[derive(Debug, Clone)]
pub enum Injection {
    /// Fail without touching venue state
    Fail(ExchangeError),
    /// Apply the request, then report the error (lost response)
    ApplyThenFail(ExchangeError),
}

#[derive(Debug, Clone)]
struct PaperOrder {
    snapshot: OrderSnapshot,
    /// Stop-limit orders rest untriggered until the stop price trades
    triggered: bool,
}

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    amount: Decimal,
    entry_price: Decimal,
}

impl PaperPosition {
    /// Apply a fill; returns realized PnL.
    fn apply(&mut self, side: OrderSide, quantity: Decimal, price: Decimal) -> Decimal {
        let old = self.amount;
        let delta = side.sign() * quantity;
        let new = old + delta;
        let mut realized = Decimal::ZERO;

        let same_direction =
            (old > Decimal::ZERO && delta > Decimal::ZERO) || (old < Decimal::ZERO && delta < Decimal::ZERO);

        if old.is_zero() || same_direction {
            self.entry_price = (old.abs() * self.entry_price + quantity * price) / new.abs();
        } else {
            let closed = quantity.min(old.abs());
            let direction = if old > Decimal::ZERO { Decimal::ONE } else { Decimal::NEGATIVE_ONE };
            realized = (price - self.entry_price) * closed * direction;
            if new.is_zero() {
                self.entry_price = Decimal::ZERO;
            } else if (new > Decimal::ZERO) != (old > Decimal::ZERO) {
                self.entry_price = price;
            }
        }

        self.amount = new;
        realized
    }
}

struct Venue {
    prices: HashMap<String, Decimal>,
    orders: BTreeMap<u64, PaperOrder>,
    by_token: HashMap<ClientToken, u64>,
    positions: HashMap<String, PaperPosition>,
    leverage: HashMap<String, u32>,
    rules: HashMap<String, SymbolInfo>,
    wallet_balance: Decimal,
    next_order_id: u64,
}

impl Venue {
    /// Rules set through [`PaperExchange::set_symbol_info`], else the paper defaults.
    fn rules_of(&self, symbol: &str) -> SymbolInfo {
        self.rules
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| SymbolInfo {
                symbol: symbol.to_string(),
                status: "TRADING".to_string(),
                tick_size: Decimal::new(1, 2),
                min_price: Decimal::new(1, 2),
                step_size: Decimal::new(1, 3),
                min_qty: Decimal::new(1, 3),
                max_qty: Decimal::from(1000),
                min_notional: Decimal::from(5),
            })
    }

    fn leverage_of(&self, symbol: &str) -> u32 {
        self.leverage
            .get(symbol)
            .copied()
            .unwrap_or(PAPER_DEFAULT_LEVERAGE)
    }

    fn key_of(&self, id: &ExchangeOrderId) -> Option<u64> {
        id.as_str()
            .parse()
            .ok()
            .filter(|k| self.orders.contains_key(k))
    }

    fn lookup(&self, order: &OrderRef) -> Option<u64> {
        match order {
            OrderRef::Exchange(id) => self.key_of(id),
            OrderRef::Client(token) => self.by_token.get(token).copied(),
        }
    }

    fn unrealized(&self) -> Decimal {
        self.positions
            .iter()
            .map(|(symbol, p)| {
                let mark = self.prices.get(symbol).copied().unwrap_or(p.entry_price);
                (mark - p.entry_price) * p.amount
            })
            .sum()
    }

    fn position_margin(&self) -> Decimal {
        self.positions
            .iter()
            .map(|(symbol, p)| {
                let mark = self.prices.get(symbol).copied().unwrap_or(p.entry_price);
                p.amount.abs() * mark / Decimal::from(self.leverage_of(symbol))
            })
            .sum()
    }

    fn open_order_margin(&self) -> Decimal {
        self.orders
            .values()
            .filter(|o| o.snapshot.state.is_open() && !o.snapshot.reduce_only)
            .map(|o| {
                let s = &o.snapshot;
                let price = s.price.or_else(|| self.prices.get(&s.symbol).copied()).unwrap_or_default();
                (s.quantity - s.filled_qty) * price / Decimal::from(self.leverage_of(&s.symbol))
            })
            .sum()
    }

    fn available_balance(&self) -> Decimal {
        let available = self.wallet_balance + self.unrealized()
            - self.position_margin()
            - self.open_order_margin();
        available.max(Decimal::ZERO)
    }

    /// Raise the order's cumulative fill to `cumulative` at `price`.
    fn fill(&mut self, key: u64, cumulative: Decimal, price: Decimal) -> Option<OrderSnapshot> {
        let order = self.orders.get_mut(&key)?;
        let snapshot = &mut order.snapshot;
        let cumulative = cumulative.min(snapshot.quantity);
        if cumulative <= snapshot.filled_qty || snapshot.state.is_terminal() {
            return None;
        }

        let delta = cumulative - snapshot.filled_qty;
        let old_notional = snapshot.filled_qty * snapshot.avg_price.unwrap_or_default();
        snapshot.avg_price = Some((old_notional + delta * price) / cumulative);
        snapshot.filled_qty = cumulative;
        snapshot.state = if cumulative == snapshot.quantity {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        snapshot.updated_at = Utc::now();

        let filled = snapshot.clone();
        let realized = self
            .positions
            .entry(filled.symbol.clone())
            .or_default()
            .apply(filled.side, delta, price);
        self.wallet_balance += realized;

        debug!(
            exchange_id = %filled.exchange_id,
            symbol = %filled.symbol,
            filled = %filled.filled_qty,
            price = %price,
            realized_pnl = %realized,
            "Paper fill"
        );
        Some(filled)
    }
}

fn rejected(code: i64, reason: impl Into<String>) -> ExchangeError {
    ExchangeError::Rejected {
        code: Some(code),
        reason: reason.into(),
    }
}

fn max_notional_for(leverage: u32) -> Decimal {
    let bracket: u64 = match leverage {
        0..=10 => 10_000_000,
        11..=20 => 5_000_000,
        21..=50 => 1_000_000,
        51..=100 => 250_000,
        _ => 50_000,
    };
    Decimal::from(bracket)
}

/// In-memory futures venue implementing [`ExchangeGateway`].
pub struct PaperExchange {
    venue: Mutex<Venue>,
    events: mpsc::UnboundedSender<ExecutionEvent>,
    sequence: AtomicU64,
    injections: Mutex<HashMap<PaperOp, VecDeque<Injection>>>,
    calls: Mutex<HashMap<PaperOp, usize>>,
}

impl PaperExchange {
    /// Create a venue holding `wallet_balance` USDT, plus its event stream.
    pub fn new(wallet_balance: Decimal) -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let exchange = Self {
            venue: Mutex::new(Venue {
                prices: HashMap::new(),
                orders: BTreeMap::new(),
                by_token: HashMap::new(),
                positions: HashMap::new(),
                leverage: HashMap::new(),
                rules: HashMap::new(),
                wallet_balance,
                next_order_id: FIRST_ORDER_ID,
            }),
            events: tx,
            sequence: AtomicU64::new(0),
            injections: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        };
        (exchange, rx)
    }

    fn venue(&self) -> MutexGuard<'_, Venue> {
        self.venue.lock().unwrap_or_else(|p| p.into_inner())
    }

    // --- Test and simulation hooks ---

    pub fn inject(&self, op: PaperOp, injection: Injection) {
        self.injections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(op)
            .or_default()
            .push_back(injection);
    }

    pub fn fail_next(&self, op: PaperOp, error: ExchangeError) {
        self.inject(op, Injection::Fail(error));
    }

    /// Number of gateway calls received for `op`.
    pub fn call_count(&self, op: PaperOp) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Orders on the venue carrying `token`.
    pub fn orders_with_token(&self, token: &ClientToken) -> usize {
        self.venue()
            .orders
            .values()
            .filter(|o| o.snapshot.client_token.as_ref() == Some(token))
            .count()
    }

    pub fn order_count(&self) -> usize {
        self.venue().orders.len()
    }

    pub fn position_amount(&self, symbol: &str) -> Decimal {
        self.venue()
            .positions
            .get(symbol)
            .map(|p| p.amount)
            .unwrap_or_default()
    }

    pub fn leverage_of(&self, symbol: &str) -> u32 {
        self.venue().leverage_of(symbol)
    }

    /// Replace the trading rules of a symbol.
    pub fn set_symbol_info(&self, info: SymbolInfo) {
        self.venue().rules.insert(info.symbol.clone(), info);
    }

    fn begin(&self, op: PaperOp) -> Option<Injection> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(op)
            .or_insert(0) += 1;
        self.injections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
    }

    fn emit(&self, snapshot: &OrderSnapshot, kind: OrderEventKind) {
        let event = ExecutionEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            symbol: snapshot.symbol.clone(),
            client_token: snapshot.client_token.clone(),
            exchange_id: Some(snapshot.exchange_id.clone()),
            kind,
        };
        if self.events.send(event).is_err() {
            debug!("Paper event receiver dropped");
        }
    }

    fn emit_fill(&self, snapshot: &OrderSnapshot) {
        self.emit(
            snapshot,
            OrderEventKind::Fill {
                cumulative_qty: snapshot.filled_qty,
                avg_price: snapshot.avg_price.unwrap_or_default(),
            },
        );
    }

    /// Move the market and match resting orders against the new price.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let mut venue = self.venue();
        venue.prices.insert(symbol.to_string(), price);

        let resting: Vec<u64> = venue
            .orders
            .iter()
            .filter(|(_, o)| o.snapshot.symbol == symbol && o.snapshot.state.is_open())
            .map(|(k, _)| *k)
            .collect();

        for key in resting {
            let Some(order) = venue.orders.get_mut(&key) else {
                continue;
            };
            let side = order.snapshot.side;
            let limit = order.snapshot.price.unwrap_or(price);
            let quantity = order.snapshot.quantity;
            let mut fill_price = limit;

            if order.snapshot.order_type == OrderType::StopLimit && !order.triggered {
                let stop = order.snapshot.stop_price.unwrap_or_default();
                let hit = match side {
                    OrderSide::Buy => price >= stop,
                    OrderSide::Sell => price <= stop,
                };
                if !hit {
                    continue;
                }
                order.triggered = true;
                // takes liquidity on arrival
                fill_price = price;
                debug!(exchange_id = %order.snapshot.exchange_id, stop = %stop, "Paper stop triggered");
            }

            let marketable = match side {
                OrderSide::Buy => price <= limit,
                OrderSide::Sell => price >= limit,
            };
            if marketable {
                if let Some(filled) = venue.fill(key, quantity, fill_price) {
                    self.emit_fill(&filled);
                }
            }
        }
    }

    /// Fill a resting order up to `cumulative` at its limit price.
    pub fn fill_order(&self, exchange_id: &ExchangeOrderId, cumulative: Decimal) -> Option<OrderSnapshot> {
        let mut venue = self.venue();
        let key = venue.key_of(exchange_id)?;
        let order = venue.orders.get(&key)?;
        let price = order
            .snapshot
            .price
            .or_else(|| venue.prices.get(&order.snapshot.symbol).copied())
            .unwrap_or_default();
        let filled = venue.fill(key, cumulative, price)?;
        self.emit_fill(&filled);
        Some(filled)
    }

    /// Expire a resting order as its time in force would.
    pub fn expire_order(&self, exchange_id: &ExchangeOrderId) -> bool {
        self.finish_externally(exchange_id, OrderState::Expired, OrderEventKind::Expired)
    }

    /// Cancel an order from outside the engine (another session, liquidation).
    pub fn cancel_externally(&self, exchange_id: &ExchangeOrderId) -> bool {
        self.finish_externally(exchange_id, OrderState::Canceled, OrderEventKind::CancelAck)
    }

    fn finish_externally(&self, exchange_id: &ExchangeOrderId, state: OrderState, kind: OrderEventKind) -> bool {
        let mut venue = self.venue();
        let Some(key) = venue.key_of(exchange_id) else {
            return false;
        };
        let Some(order) = venue.orders.get_mut(&key) else {
            return false;
        };
        if order.snapshot.state.is_terminal() {
            return false;
        }
        order.snapshot.state = state;
        order.snapshot.updated_at = Utc::now();
        let snapshot = order.snapshot.clone();
        self.emit(&snapshot, kind);
        true
    }

    fn validate(venue: &Venue, request: &SubmitRequest) -> Result<Decimal, ExchangeError> {
        let market = *venue
            .prices
            .get(&request.symbol)
            .ok_or_else(|| rejected(-1121, "Invalid symbol."))?;

        if request.quantity <= Decimal::ZERO {
            return Err(rejected(-4003, "Quantity less than or equal to zero."));
        }
        if request.order_type.requires_price() && request.price.map_or(true, |p| p <= Decimal::ZERO) {
            return Err(rejected(-1102, "Mandatory parameter 'price' was not sent, was empty/null, or malformed."));
        }

        let rules = venue.rules_of(&request.symbol);
        if !rules.is_trading() {
            return Err(rejected(-4140, "Invalid symbol status for opening position."));
        }
        let reference = request.price.unwrap_or(market);
        match rules.check(request.quantity, reference, request.price.is_some()) {
            None => {}
            // closing orders are exempt from the notional floor
            Some(FilterViolation::MinNotional) if request.reduce_only => {}
            Some(FilterViolation::MinNotional) => {
                return Err(rejected(
                    -4164,
                    format!("Order's notional must be no smaller than {}", rules.min_notional),
                ));
            }
            Some(violation) => return Err(rejected(-1013, format!("Filter failure: {}", violation))),
        }
        if let Some(stop) = request.stop_price {
            if rules.check(request.quantity, stop, true) == Some(FilterViolation::PriceFilter) {
                return Err(rejected(-1013, "Filter failure: PRICE_FILTER"));
            }
        }
        if request.order_type.requires_stop_price() {
            let stop = request
                .stop_price
                .filter(|s| *s > Decimal::ZERO)
                .ok_or_else(|| rejected(-1102, "Mandatory parameter 'stopPrice' was not sent, was empty/null, or malformed."))?;
            let immediate = match request.side {
                OrderSide::Buy => market >= stop,
                OrderSide::Sell => market <= stop,
            };
            if immediate {
                return Err(rejected(-2021, "Order would immediately trigger."));
            }
        }

        let position = venue
            .positions
            .get(&request.symbol)
            .map(|p| p.amount)
            .unwrap_or_default();
        if request.reduce_only {
            let reduces = match request.side {
                OrderSide::Buy => position < Decimal::ZERO && request.quantity <= position.abs(),
                OrderSide::Sell => position > Decimal::ZERO && request.quantity <= position.abs(),
            };
            if !reduces {
                return Err(rejected(-2022, "ReduceOnly Order is rejected."));
            }
        } else {
            let required = request.quantity * reference / Decimal::from(venue.leverage_of(&request.symbol));
            if required > venue.available_balance() {
                return Err(rejected(-2019, "Margin is insufficient."));
            }
        }

        Ok(market)
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn submit_order(&self, request: &SubmitRequest) -> Result<SubmitResponse, ExchangeError> {
        let injection = self.begin(PaperOp::Submit);
        if let Some(Injection::Fail(e)) = &injection {
            return Err(e.clone());
        }

        let mut venue = self.venue();
        if let Some(key) = venue.by_token.get(&request.client_token).copied() {
            if let Some(existing) = venue.orders.get(&key) {
                debug!(client_token = %request.client_token, "Paper submit repeated, returning existing order");
                return Ok(SubmitResponse::AlreadyExists(existing.snapshot.clone()));
            }
        }

        let market = Self::validate(&venue, request)?;

        let key = venue.next_order_id;
        venue.next_order_id += 1;
        let snapshot = OrderSnapshot {
            exchange_id: ExchangeOrderId::from(key),
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
        };
        venue.orders.insert(
            key,
            PaperOrder {
                snapshot,
                triggered: false,
            },
        );
        venue.by_token.insert(request.client_token.clone(), key);

        let marketable = match (request.order_type, request.price) {
            (OrderType::Market, _) => true,
            (OrderType::Limit, Some(limit)) => match request.side {
                OrderSide::Buy => market <= limit,
                OrderSide::Sell => market >= limit,
            },
            _ => false,
        };
        if marketable {
            venue.fill(key, request.quantity, market);
        }

        let snapshot = venue
            .orders
            .get(&key)
            .map(|o| o.snapshot.clone())
            .ok_or_else(|| ExchangeError::Unrecognized("order vanished".into()))?;
        info!(
            client_token = %request.client_token,
            exchange_id = %snapshot.exchange_id,
            state = %snapshot.state,
            "Paper order accepted"
        );

        match injection {
            Some(Injection::ApplyThenFail(e)) => Err(e),
            _ => Ok(SubmitResponse::Accepted(snapshot)),
        }
    }

    async fn cancel_order(&self, _symbol: &str, exchange_id: &ExchangeOrderId) -> Result<CancelResponse, ExchangeError> {
        let injection = self.begin(PaperOp::Cancel);
        if let Some(Injection::Fail(e)) = &injection {
            return Err(e.clone());
        }

        let mut venue = self.venue();
        let key = venue
            .key_of(exchange_id)
            .ok_or_else(|| ExchangeError::NotFound("Unknown order sent.".into()))?;
        let Some(order) = venue.orders.get_mut(&key) else {
            return Err(ExchangeError::NotFound("Unknown order sent.".into()));
        };

        let response = if order.snapshot.state.is_terminal() {
            CancelResponse::AlreadyFinal
        } else {
            order.snapshot.state = OrderState::Canceled;
            order.snapshot.updated_at = Utc::now();
            CancelResponse::Canceled
        };

        match injection {
            Some(Injection::ApplyThenFail(e)) => Err(e),
            _ => Ok(response),
        }
    }

    async fn query_order(&self, _symbol: &str, order: &OrderRef) -> Result<OrderSnapshot, ExchangeError> {
        if let Some(Injection::Fail(e) | Injection::ApplyThenFail(e)) = self.begin(PaperOp::Query) {
            return Err(e);
        }
        let venue = self.venue();
        venue
            .lookup(order)
            .and_then(|k| venue.orders.get(&k))
            .map(|o| o.snapshot.clone())
            .ok_or_else(|| ExchangeError::NotFound("Order does not exist.".into()))
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderSnapshot>, ExchangeError> {
        if let Some(Injection::Fail(e) | Injection::ApplyThenFail(e)) = self.begin(PaperOp::OpenOrders) {
            return Err(e);
        }
        Ok(self
            .venue()
            .orders
            .values()
            .filter(|o| o.snapshot.symbol == symbol && o.snapshot.state.is_open())
            .map(|o| o.snapshot.clone())
            .collect())
    }

    async fn get_positions(&self, symbol: Option<String>) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        if let Some(Injection::Fail(e) | Injection::ApplyThenFail(e)) = self.begin(PaperOp::Positions) {
            return Err(e);
        }
        let venue = self.venue();
        let mut symbols: Vec<&String> = match &symbol {
            Some(s) => venue.prices.keys().filter(|k| *k == s).collect(),
            None => venue.prices.keys().collect(),
        };
        symbols.sort();

        Ok(symbols
            .into_iter()
            .map(|s| {
                let position = venue.positions.get(s).cloned().unwrap_or_default();
                let mark = venue.prices.get(s).copied().unwrap_or_default();
                PositionSnapshot {
                    symbol: s.clone(),
                    position_amt: position.amount,
                    entry_price: position.entry_price,
                    mark_price: mark,
                    unrealized_pnl: (mark - position.entry_price) * position.amount,
                    leverage: venue.leverage_of(s),
                    position_side: PositionSide::Both,
                }
            })
            .collect())
    }

    async fn get_balance(&self) -> Result<BalanceSnapshot, ExchangeError> {
        if let Some(Injection::Fail(e) | Injection::ApplyThenFail(e)) = self.begin(PaperOp::Balance) {
            return Err(e);
        }
        let venue = self.venue();
        let unrealized = venue.unrealized();
        let position_margin = venue.position_margin();
        let open_order_margin = venue.open_order_margin();
        let available = venue.available_balance();

        let usdt = AssetBalance {
            asset: QUOTE_ASSET.to_string(),
            wallet_balance: venue.wallet_balance,
            unrealized_profit: unrealized,
            margin_balance: venue.wallet_balance + unrealized,
            maint_margin: position_margin / Decimal::from(2),
            initial_margin: position_margin + open_order_margin,
            position_initial_margin: position_margin,
            open_order_initial_margin: open_order_margin,
        };

        Ok(BalanceSnapshot {
            total_wallet_balance: venue.wallet_balance,
            total_unrealized_profit: unrealized,
            total_margin_balance: venue.wallet_balance + unrealized,
            total_position_initial_margin: position_margin,
            total_open_order_initial_margin: open_order_margin,
            available_balance: available,
            max_withdraw_amount: available,
            assets: if venue.wallet_balance.is_zero() { vec![] } else { vec![usdt] },
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<LeverageResponse, ExchangeError> {
        let injection = self.begin(PaperOp::Leverage);
        if let Some(Injection::Fail(e)) = &injection {
            return Err(e.clone());
        }
        if !(1..=125).contains(&leverage) {
            return Err(rejected(-4028, format!("Leverage {} is not valid", leverage)));
        }

        let mut venue = self.venue();
        if !venue.prices.contains_key(symbol) {
            return Err(rejected(-1121, "Invalid symbol."));
        }
        venue.leverage.insert(symbol.to_string(), leverage);

        match injection {
            Some(Injection::ApplyThenFail(e)) => Err(e),
            _ => Ok(LeverageResponse::Updated {
                leverage,
                max_notional: Some(max_notional_for(leverage)),
            }),
        }
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        if let Some(Injection::Fail(e) | Injection::ApplyThenFail(e)) = self.begin(PaperOp::Price) {
            return Err(e);
        }
        self.venue()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| rejected(-1121, "Invalid symbol."))
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        if let Some(Injection::Fail(e) | Injection::ApplyThenFail(e)) = self.begin(PaperOp::SymbolInfo) {
            return Err(e);
        }
        let venue = self.venue();
        if !venue.prices.contains_key(symbol) && !venue.rules.contains_key(symbol) {
            return Err(rejected(-1121, "Invalid symbol."));
        }
        Ok(venue.rules_of(symbol))
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        if let Some(Injection::Fail(e) | Injection::ApplyThenFail(e)) = self.begin(PaperOp::ServerTime) {
            return Err(e);
        }
        Ok(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn venue() -> (PaperExchange, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (paper, rx) = PaperExchange::new(dec!(10000));
        paper.set_price("BTCUSDT", dec!(50000));
        (paper, rx)
    }

    fn request(token: &str, side: OrderSide, order_type: OrderType, qty: Decimal) -> SubmitRequest {
        SubmitRequest {
            symbol: "BTCUSDT".into(),
            side,
            order_type,
            quantity: qty,
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: false,
            client_token: ClientToken::new(token),
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_and_moves_position() {
        let (paper, _rx) = venue();
        let response = paper
            .submit_order(&request("m1", OrderSide::Buy, OrderType::Market, dec!(0.01)))
            .await
            .unwrap();

        match response {
            SubmitResponse::Accepted(s) => {
                assert_eq!(s.state, OrderState::Filled);
                assert_eq!(s.avg_price, Some(dec!(50000)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(paper.position_amount("BTCUSDT"), dec!(0.01));
    }

    #[tokio::test]
    async fn test_repeated_token_returns_existing_order() {
        let (paper, _rx) = venue();
        let req = request("dup", OrderSide::Buy, OrderType::Market, dec!(0.01));
        paper.submit_order(&req).await.unwrap();
        let again = paper.submit_order(&req).await.unwrap();

        assert!(matches!(again, SubmitResponse::AlreadyExists(_)));
        assert_eq!(paper.orders_with_token(&ClientToken::new("dup")), 1);
        assert_eq!(paper.position_amount("BTCUSDT"), dec!(0.01));
    }

    #[tokio::test]
    async fn test_resting_limit_fills_on_price_move_and_emits_event() {
        let (paper, mut rx) = venue();
        let mut req = request("l1", OrderSide::Sell, OrderType::Limit, dec!(0.01));
        req.price = Some(dec!(52000));
        let id = match paper.submit_order(&req).await.unwrap() {
            SubmitResponse::Accepted(s) => {
                assert_eq!(s.state, OrderState::Submitted);
                s.exchange_id
            }
            other => panic!("unexpected {:?}", other),
        };

        paper.set_price("BTCUSDT", dec!(51000));
        assert!(rx.try_recv().is_err());

        paper.set_price("BTCUSDT", dec!(52000));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.exchange_id, Some(id));
        assert_eq!(event.sequence, 1);
        assert_eq!(
            event.kind,
            OrderEventKind::Fill {
                cumulative_qty: dec!(0.01),
                avg_price: dec!(52000)
            }
        );
    }

    #[tokio::test]
    async fn test_stop_limit_triggers_below_stop() {
        let (paper, mut rx) = venue();
        let mut req = request("s1", OrderSide::Sell, OrderType::StopLimit, dec!(0.01));
        req.price = Some(dec!(47500));
        req.stop_price = Some(dec!(48000));
        paper.submit_order(&req).await.unwrap();

        paper.set_price("BTCUSDT", dec!(48500));
        assert!(rx.try_recv().is_err());

        paper.set_price("BTCUSDT", dec!(47900));
        let event = rx.try_recv().unwrap();
        assert!(matches!(event.kind, OrderEventKind::Fill { avg_price, .. } if avg_price == dec!(47900)));
    }

    #[tokio::test]
    async fn test_stop_that_would_trigger_immediately_is_rejected() {
        let (paper, _rx) = venue();
        let mut req = request("s2", OrderSide::Sell, OrderType::StopLimit, dec!(0.01));
        req.price = Some(dec!(50500));
        req.stop_price = Some(dec!(51000));
        let err = paper.submit_order(&req).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: Some(-2021), .. }));
    }

    #[tokio::test]
    async fn test_cancel_final_order_reports_already_final() {
        let (paper, _rx) = venue();
        let id = match paper
            .submit_order(&request("c1", OrderSide::Buy, OrderType::Market, dec!(0.01)))
            .await
            .unwrap()
        {
            SubmitResponse::Accepted(s) => s.exchange_id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            paper.cancel_order("BTCUSDT", &id).await.unwrap(),
            CancelResponse::AlreadyFinal
        );
        assert!(matches!(
            paper.cancel_order("BTCUSDT", &ExchangeOrderId::new("1")).await,
            Err(ExchangeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_margin_and_reduce_only_checks() {
        let (paper, _rx) = venue();
        // 10 BTC at 50000 / 20x = 25000 USDT margin > 10000
        let err = paper
            .submit_order(&request("big", OrderSide::Buy, OrderType::Market, dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: Some(-2019), .. }));

        let mut reduce = request("ro", OrderSide::Sell, OrderType::Market, dec!(0.01));
        reduce.reduce_only = true;
        let err = paper.submit_order(&reduce).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: Some(-2022), .. }));
    }

    #[tokio::test]
    async fn test_symbol_filters_enforced_on_submit() {
        let (paper, _rx) = venue();
        paper.set_symbol_info(SymbolInfo {
            symbol: "BTCUSDT".into(),
            status: "TRADING".into(),
            tick_size: dec!(0.1),
            min_price: dec!(556.8),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            max_qty: dec!(1000),
            min_notional: dec!(100),
        });
        assert_eq!(paper.symbol_info("BTCUSDT").await.unwrap().tick_size, dec!(0.1));
        assert!(paper.symbol_info("DOGEUSDT").await.is_err());

        let err = paper
            .submit_order(&request("lot", OrderSide::Buy, OrderType::Market, dec!(0.0025)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExchangeError::Rejected {
                code: Some(-1013),
                reason: "Filter failure: LOT_SIZE".into()
            }
        );

        let mut tick = request("tick", OrderSide::Buy, OrderType::Limit, dec!(0.01));
        tick.price = Some(dec!(49000.05));
        let err = paper.submit_order(&tick).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: Some(-1013), ref reason } if reason.contains("PRICE_FILTER")));

        let err = paper
            .submit_order(&request("small", OrderSide::Buy, OrderType::Market, dec!(0.001)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: Some(-4164), .. }));
        assert_eq!(paper.order_count(), 0);

        // reduce-only orders may close below the notional floor
        paper
            .submit_order(&request("open", OrderSide::Buy, OrderType::Market, dec!(0.003)))
            .await
            .unwrap();
        let mut close = request("close", OrderSide::Sell, OrderType::Market, dec!(0.001));
        close.reduce_only = true;
        assert!(paper.submit_order(&close).await.is_ok());
        assert_eq!(paper.position_amount("BTCUSDT"), dec!(0.002));
    }

    #[tokio::test]
    async fn test_apply_then_fail_injection_keeps_order() {
        let (paper, _rx) = venue();
        paper.inject(PaperOp::Submit, Injection::ApplyThenFail(ExchangeError::Timeout));
        let req = request("lost", OrderSide::Buy, OrderType::Market, dec!(0.001));

        assert_eq!(paper.submit_order(&req).await.unwrap_err(), ExchangeError::Timeout);
        assert_eq!(paper.orders_with_token(&ClientToken::new("lost")), 1);
        assert_eq!(paper.call_count(PaperOp::Submit), 1);
    }

    #[tokio::test]
    async fn test_balance_reflects_realized_pnl() {
        let (paper, _rx) = venue();
        paper
            .submit_order(&request("o", OrderSide::Buy, OrderType::Market, dec!(0.1)))
            .await
            .unwrap();
        paper.set_price("BTCUSDT", dec!(51000));
        paper
            .submit_order(&request("c", OrderSide::Sell, OrderType::Market, dec!(0.1)))
            .await
            .unwrap();

        let balance = paper.get_balance().await.unwrap();
        assert_eq!(balance.total_wallet_balance, dec!(10100));
        assert_eq!(balance.total_position_initial_margin, Decimal::ZERO);
        assert_eq!(balance.assets.len(), 1);
    }

    #[tokio::test]
    async fn test_leverage_bounds_and_brackets() {
        let (paper, _rx) = venue();
        assert!(paper.set_leverage("BTCUSDT", 0).await.is_err());
        match paper.set_leverage("BTCUSDT", 50).await.unwrap() {
            LeverageResponse::Updated { leverage, max_notional } => {
                assert_eq!(leverage, 50);
                assert_eq!(max_notional, Some(dec!(1000000)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(paper.leverage_of("BTCUSDT"), 50);
    }
}
