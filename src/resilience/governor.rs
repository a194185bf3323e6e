//! Rate & Retry Governor
//!
//! Every gateway call made by the engine passes through [`RateGovernor`],
//! which enforces the request budget (token bucket with a bounded wait),
//! retries transient failures with backoff, fails fast while the circuit
//! breaker is open and halts trading after a fatal failure.
//!
//! Submits get extra care. Once a submit may have reached the exchange, the
//! next attempt first queries the order by client token, so a retry never
//! produces a second exchange-side order even if the gateway's own
//! idempotency is weaker than advertised.

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::{clock::DefaultClock, state::InMemoryState, Quota, RateLimiter};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{CircuitBreaker, RetryPolicy};
use crate::error::EngineError;
use crate::exchange::{
    BalanceSnapshot, CancelResponse, ExchangeError, ExchangeGateway, FailureClass,
    LeverageResponse, OrderSnapshot, PositionSnapshot, SubmitRequest, SubmitResponse, SymbolInfo,
};
use crate::logging::LogThrottle;
use crate::metrics;
use crate::orders::{ClientToken, ExchangeOrderId, OrderRef};

type DirectLimiter = RateLimiter<governor::state::direct::NotKeyed, InMemoryState, DefaultClock>;

/// Request budget and failure handling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Sustained request budget
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Requests that may be issued back to back before throttling
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Longest a call waits for budget before failing with `RateLimited`
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Per-call deadline; an expired call is a transient failure
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

fn default_requests_per_second() -> u32 {
    10
}
fn default_burst() -> u32 {
    10
}
fn default_max_wait_ms() -> u64 {
    5_000
}
fn default_call_timeout_ms() -> u64 {
    10_000
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    30
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            max_wait_ms: default_max_wait_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

/// Successful submit.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitAck {
    pub snapshot: OrderSnapshot,
    /// The order already existed on the exchange (earlier attempt or process)
    pub recovered: bool,
}

/// Successful cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    Canceled,
    /// Filled, cancelled or expired before the cancel arrived
    AlreadyFinal,
}

/// Successful leverage change.
#[derive(Debug, Clone, PartialEq)]
pub struct LeverageAck {
    pub leverage: u32,
    pub max_notional: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    /// Queries; allowed while trading is halted
    Read,
    /// Calls that change exchange state
    Trading,
}

enum Step {
    Retry { wait: Option<Duration>, sent: bool },
    Stop(EngineError),
}

enum TokenLookup {
    Found(OrderSnapshot),
    Absent,
    Failed(ExchangeError),
}

/// Shared throttle/retry layer in front of the exchange gateway.
pub struct RateGovernor {
    gateway: Arc<dyn ExchangeGateway>,
    limiter: Arc<DirectLimiter>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    max_wait: Duration,
    call_timeout: Duration,
    halted: RwLock<Option<String>>,
    retry_log: Mutex<LogThrottle>,
}

impl RateGovernor {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        config: &GovernorConfig,
        retry: RetryPolicy,
    ) -> Self {
        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(rate);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)));

        Self {
            gateway,
            limiter,
            retry,
            breaker: CircuitBreaker::new(
                config.breaker_failure_threshold,
                Duration::from_secs(config.breaker_cooldown_secs),
            ),
            max_wait: Duration::from_millis(config.max_wait_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            halted: RwLock::new(None),
            retry_log: Mutex::new(LogThrottle::new(Duration::from_secs(5))),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Reason trading is halted, if a fatal failure was seen.
    pub async fn halt_reason(&self) -> Option<String> {
        self.halted.read().await.clone()
    }

    /// Resume trading calls after credentials were fixed.
    pub async fn clear_halt(&self) {
        let mut halted = self.halted.write().await;
        if let Some(reason) = halted.take() {
            info!(previous_reason = %reason, "Trading halt cleared");
        }
    }

    async fn halt(&self, reason: &str) {
        error!(reason = %reason, "Fatal gateway failure, halting trading calls");
        *self.halted.write().await = Some(reason.to_string());
    }

    // --- Trading calls ---

    /// Submit an order, retrying transient failures without ever creating a
    /// duplicate for the same client token.
    pub async fn submit_order(&self, request: &SubmitRequest) -> Result<SubmitAck, EngineError> {
        const OP: &str = "submit_order";
        let token = &request.client_token;
        if token.is_empty() {
            return Err(EngineError::invalid("submit requires a client token"));
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut possibly_sent = false;
        let mut last_error: Option<ExchangeError> = None;

        for attempt in 1..=max_attempts {
            self.admit(OP, CallKind::Trading)
                .await
                .map_err(|e| Self::after_possible_send(OP, e, possibly_sent, token))?;

            let outcome = if possibly_sent {
                match self
                    .lookup_by_token(&request.symbol, token)
                    .await
                    .map_err(|e| Self::after_possible_send(OP, e, true, token))?
                {
                    TokenLookup::Found(snapshot) => {
                        info!(
                            client_token = %token,
                            exchange_id = %snapshot.exchange_id,
                            attempt,
                            "Earlier submit attempt reached the exchange"
                        );
                        metrics::record_gateway_call(OP, "recovered");
                        return Ok(SubmitAck {
                            snapshot,
                            recovered: true,
                        });
                    }
                    TokenLookup::Failed(e) => Err(e),
                    TokenLookup::Absent => {
                        debug!(client_token = %token, attempt, "No exchange order for token, resubmitting");
                        self.send_submit(request)
                            .await
                            .map_err(|e| Self::after_possible_send(OP, e, true, token))?
                    }
                }
            } else {
                self.send_submit(request).await?
            };

            let err = match outcome {
                Ok(ack) => return Ok(ack),
                Err(e) => e,
            };

            match self.classify(OP, &err).await {
                Step::Stop(e) => return Err(e),
                Step::Retry { wait, sent } => {
                    possibly_sent |= sent;
                    if attempt < max_attempts {
                        self.backoff(OP, attempt, wait, &err).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(self
            .exhausted(OP, CallKind::Trading, last_error, possibly_sent)
            .with_client_token(token))
    }

    /// One budgeted submit call. The outer `Err` is a budget failure (nothing
    /// sent); the inner result is the gateway's answer.
    async fn send_submit(
        &self,
        request: &SubmitRequest,
    ) -> Result<Result<SubmitAck, ExchangeError>, EngineError> {
        const OP: &str = "submit_order";
        self.acquire(OP).await?;

        let result = match self.timed(self.gateway.submit_order(request)).await {
            Ok(SubmitResponse::Accepted(snapshot)) => Ok(SubmitAck {
                snapshot,
                recovered: false,
            }),
            Ok(SubmitResponse::AlreadyExists(snapshot)) => {
                info!(
                    client_token = %request.client_token,
                    exchange_id = %snapshot.exchange_id,
                    "Exchange already holds an order for this client token"
                );
                Ok(SubmitAck {
                    snapshot,
                    recovered: true,
                })
            }
            Ok(SubmitResponse::Unrecognized { raw }) => {
                warn!(client_token = %request.client_token, raw = %raw, "Unrecognized submit response");
                Err(ExchangeError::Unrecognized(raw))
            }
            Err(e) => Err(e),
        };

        if result.is_ok() {
            self.breaker.record_success();
            metrics::record_gateway_call(OP, "ok");
        }
        Ok(result)
    }

    async fn lookup_by_token(&self, symbol: &str, token: &ClientToken) -> Result<TokenLookup, EngineError> {
        const OP: &str = "query_order";
        self.acquire(OP).await?;

        let order = OrderRef::Client(token.clone());
        match self.timed(self.gateway.query_order(symbol, &order)).await {
            Ok(snapshot) => {
                self.breaker.record_success();
                Ok(TokenLookup::Found(snapshot))
            }
            Err(ExchangeError::NotFound(_)) => {
                self.breaker.record_success();
                Ok(TokenLookup::Absent)
            }
            Err(e) => Ok(TokenLookup::Failed(e)),
        }
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        exchange_id: &ExchangeOrderId,
    ) -> Result<CancelAck, EngineError> {
        let gateway = &self.gateway;
        self.execute("cancel_order", CallKind::Trading, move || async move {
            gateway
                .cancel_order(symbol, exchange_id)
                .await
                .and_then(|response| match response {
                    CancelResponse::Canceled => Ok(CancelAck::Canceled),
                    CancelResponse::AlreadyFinal => Ok(CancelAck::AlreadyFinal),
                    CancelResponse::Unrecognized { raw } => Err(ExchangeError::Unrecognized(raw)),
                })
        })
        .await
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<LeverageAck, EngineError> {
        let gateway = &self.gateway;
        self.execute("set_leverage", CallKind::Trading, move || async move {
            gateway
                .set_leverage(symbol, leverage)
                .await
                .and_then(|response| match response {
                    LeverageResponse::Updated {
                        leverage,
                        max_notional,
                    } => Ok(LeverageAck {
                        leverage,
                        max_notional,
                    }),
                    LeverageResponse::Unrecognized { raw } => {
                        Err(ExchangeError::Unrecognized(raw))
                    }
                })
        })
        .await
    }

    // --- Read calls ---

    pub async fn query_order(&self, symbol: &str, order: &OrderRef) -> Result<OrderSnapshot, EngineError> {
        self.execute("query_order", CallKind::Read, move || {
            self.gateway.query_order(symbol, order)
        })
        .await
    }

    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderSnapshot>, EngineError> {
        self.execute("open_orders", CallKind::Read, move || self.gateway.open_orders(symbol))
            .await
    }

    pub async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionSnapshot>, EngineError> {
        let symbol = symbol.map(str::to_string);
        self.execute("get_positions", CallKind::Read, move || {
            self.gateway.get_positions(symbol.clone())
        })
        .await
    }

    pub async fn get_balance(&self) -> Result<BalanceSnapshot, EngineError> {
        self.execute("get_balance", CallKind::Read, move || self.gateway.get_balance())
            .await
    }

    pub async fn get_price(&self, symbol: &str) -> Result<Decimal, EngineError> {
        self.execute("get_price", CallKind::Read, move || self.gateway.get_price(symbol))
            .await
    }

    pub async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, EngineError> {
        self.execute("symbol_info", CallKind::Read, move || self.gateway.symbol_info(symbol))
            .await
    }

    pub async fn server_time(&self) -> Result<DateTime<Utc>, EngineError> {
        self.execute("server_time", CallKind::Read, move || self.gateway.server_time())
            .await
    }

    // --- Shared machinery ---

    /// Retry loop for calls that are safe to repeat as-is.
    async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        kind: CallKind,
        mut call: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ExchangeError>> + Send,
        T: Send,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut possibly_sent = false;
        let mut last_error: Option<ExchangeError> = None;

        for attempt in 1..=max_attempts {
            let ready = match self.admit(operation, kind).await {
                Ok(()) => self.acquire(operation).await,
                Err(e) => Err(e),
            };
            if let Err(e) = ready {
                return Err(if kind == CallKind::Trading && possibly_sent {
                    Self::unknown_outcome(operation, e.to_string())
                } else {
                    e
                });
            }

            let err = match self.timed(call()).await {
                Ok(value) => {
                    self.breaker.record_success();
                    metrics::record_gateway_call(operation, "ok");
                    return Ok(value);
                }
                Err(e) => e,
            };

            match self.classify(operation, &err).await {
                Step::Stop(e) => return Err(e),
                Step::Retry { wait, sent } => {
                    possibly_sent |= sent;
                    if attempt < max_attempts {
                        self.backoff(operation, attempt, wait, &err).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(self.exhausted(operation, kind, last_error, possibly_sent))
    }

    /// Halt and breaker checks that precede every attempt.
    async fn admit(&self, operation: &'static str, kind: CallKind) -> Result<(), EngineError> {
        if kind == CallKind::Trading {
            if let Some(reason) = self.halted.read().await.as_ref() {
                metrics::record_gateway_call(operation, "halted");
                return Err(EngineError::Fatal(format!("trading halted: {}", reason)));
            }
        }

        if !self.breaker.allow_request() {
            metrics::record_gateway_call(operation, "circuit_open");
            return Err(EngineError::Transient {
                operation: operation.to_string(),
                message: "circuit breaker open".to_string(),
                unknown_outcome: false,
                client_token: None,
            });
        }
        Ok(())
    }

    /// Wait for request budget, at most `max_wait`.
    async fn acquire(&self, operation: &'static str) -> Result<(), EngineError> {
        match tokio::time::timeout(self.max_wait, self.limiter.until_ready()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                metrics::record_budget_exhausted(operation);
                warn!(
                    operation,
                    max_wait_ms = self.max_wait.as_millis() as u64,
                    "Request budget exhausted"
                );
                Err(EngineError::RateLimited {
                    operation: operation.to_string(),
                })
            }
        }
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, ExchangeError>>,
    ) -> Result<T, ExchangeError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout),
        }
    }

    async fn classify(&self, operation: &'static str, err: &ExchangeError) -> Step {
        match err.class() {
            FailureClass::RateLimited => {
                metrics::record_gateway_call(operation, "rate_limited");
                let wait = match err {
                    ExchangeError::RateLimited { retry_after_ms } => {
                        retry_after_ms.map(Duration::from_millis)
                    }
                    _ => None,
                };
                Step::Retry { wait, sent: false }
            }
            FailureClass::Transient => {
                metrics::record_gateway_call(operation, "transient");
                self.breaker.record_failure();
                Step::Retry {
                    wait: None,
                    sent: true,
                }
            }
            FailureClass::Rejected => {
                metrics::record_gateway_call(operation, "rejected");
                self.breaker.record_success();
                let (reason, code) = match err {
                    ExchangeError::Rejected { code, reason } => (reason.clone(), *code),
                    other => (other.to_string(), None),
                };
                warn!(operation, reason = %reason, code = ?code, "Exchange rejected request");
                Step::Stop(EngineError::Rejected { reason, code })
            }
            FailureClass::NotFound => {
                metrics::record_gateway_call(operation, "not_found");
                self.breaker.record_success();
                let what = match err {
                    ExchangeError::NotFound(what) => what.clone(),
                    other => other.to_string(),
                };
                Step::Stop(EngineError::NotFound(what))
            }
            FailureClass::Fatal => {
                metrics::record_gateway_call(operation, "fatal");
                let reason = err.to_string();
                self.halt(&reason).await;
                Step::Stop(EngineError::Fatal(reason))
            }
        }
    }

    async fn backoff(
        &self,
        operation: &'static str,
        attempt: u32,
        hint: Option<Duration>,
        err: &ExchangeError,
    ) {
        let delay = self.retry.delay_after(attempt).max(hint.unwrap_or_default());
        metrics::record_retry(operation);

        let suppressed = {
            let mut throttle = self.retry_log.lock().unwrap_or_else(|p| p.into_inner());
            throttle.should_log().then(|| throttle.take_suppressed())
        };
        if let Some(suppressed) = suppressed {
            warn!(
                operation,
                attempt,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                suppressed,
                error = %err,
                "Gateway call failed, retrying"
            );
        }

        tokio::time::sleep(delay).await;
    }

    fn exhausted(
        &self,
        operation: &'static str,
        kind: CallKind,
        last_error: Option<ExchangeError>,
        possibly_sent: bool,
    ) -> EngineError {
        let message = last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "retries exhausted".to_string());

        let throttled = matches!(
            last_error.as_ref().map(ExchangeError::class),
            Some(FailureClass::RateLimited)
        );
        if throttled && !possibly_sent {
            error!(operation, "Exchange kept throttling, giving up");
            return EngineError::RateLimited {
                operation: operation.to_string(),
            };
        }

        let unknown_outcome = possibly_sent && kind == CallKind::Trading;
        error!(
            operation,
            unknown_outcome,
            error = %message,
            "Gateway call failed after {} attempts", self.retry.max_attempts.max(1)
        );
        EngineError::Transient {
            operation: operation.to_string(),
            message,
            unknown_outcome,
            client_token: None,
        }
    }

    fn unknown_outcome(operation: &str, message: String) -> EngineError {
        EngineError::Transient {
            operation: operation.to_string(),
            message,
            unknown_outcome: true,
            client_token: None,
        }
    }

    /// A failure after an attempt that may have reached the exchange leaves
    /// the submit's outcome unknown, whatever stopped the retries.
    fn after_possible_send(
        operation: &str,
        err: EngineError,
        possibly_sent: bool,
        token: &ClientToken,
    ) -> EngineError {
        let err = if possibly_sent && !err.is_unknown_outcome() {
            Self::unknown_outcome(operation, err.to_string())
        } else {
            err
        };
        err.with_client_token(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::orders::OrderState;
    use crate::types::{OrderSide, OrderType};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Gateway answering submits and queries from scripted queues.
    #[derive(Default)]
    struct ScriptedGateway {
        submits: Mutex<VecDeque<Result<SubmitResponse, ExchangeError>>>,
        queries: Mutex<VecDeque<Result<OrderSnapshot, ExchangeError>>>,
        submit_calls: AtomicUsize,
        query_calls: AtomicUsize,
        price_calls: AtomicUsize,
    }

    impl ScriptedGateway {
        fn with_submits(submits: Vec<Result<SubmitResponse, ExchangeError>>) -> Self {
            Self {
                submits: Mutex::new(submits.into()),
                ..Default::default()
            }
        }

        fn queue_queries(self, queries: Vec<Result<OrderSnapshot, ExchangeError>>) -> Self {
            *self.queries.lock().unwrap() = queries.into();
            self
        }
    }

    #[async_trait]
    impl ExchangeGateway for ScriptedGateway {
        async fn submit_order(&self, _request: &SubmitRequest) -> Result<SubmitResponse, ExchangeError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            self.submits
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ExchangeError::Network("script exhausted".into())))
        }

        async fn cancel_order(
            &self,
            _symbol: &str,
            _exchange_id: &ExchangeOrderId,
        ) -> Result<CancelResponse, ExchangeError> {
            Ok(CancelResponse::AlreadyFinal)
        }

        async fn query_order(&self, _symbol: &str, order: &OrderRef) -> Result<OrderSnapshot, ExchangeError> {
            self.query_calls.fetch_add(1, Ordering::SeqCst);
            self.queries
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ExchangeError::NotFound(order.to_string())))
        }

        async fn open_orders(&self, _symbol: &str) -> Result<Vec<OrderSnapshot>, ExchangeError> {
            Ok(vec![])
        }

        async fn get_positions(&self, _symbol: Option<String>) -> Result<Vec<PositionSnapshot>, ExchangeError> {
            Ok(vec![])
        }

        async fn get_balance(&self) -> Result<BalanceSnapshot, ExchangeError> {
            Ok(BalanceSnapshot::default())
        }

        async fn set_leverage(&self, _symbol: &str, leverage: u32) -> Result<LeverageResponse, ExchangeError> {
            Ok(LeverageResponse::Updated {
                leverage,
                max_notional: None,
            })
        }

        async fn get_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
            self.price_calls.fetch_add(1, Ordering::SeqCst);
            Ok(dec!(50000))
        }

        async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
            Err(ExchangeError::NotFound(symbol.to_string()))
        }

        async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
            Ok(Utc::now())
        }
    }

    fn request(token: &str) -> SubmitRequest {
        SubmitRequest {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: dec!(0.001),
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: false,
            client_token: ClientToken::new(token),
        }
    }

    fn snapshot(token: &str) -> OrderSnapshot {
        OrderSnapshot {
            exchange_id: ExchangeOrderId::new("1001"),
            client_token: Some(ClientToken::new(token)),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: dec!(0.001),
            price: None,
            stop_price: None,
            state: OrderState::Submitted,
            filled_qty: Decimal::ZERO,
            avg_price: None,
            reduce_only: false,
            updated_at: Utc::now(),
        }
    }

    fn governor(gateway: Arc<ScriptedGateway>, attempts: u32) -> RateGovernor {
        RateGovernor::new(
            gateway,
            &GovernorConfig {
                requests_per_second: 1_000,
                burst: 1_000,
                ..Default::default()
            },
            RetryPolicy::immediate(attempts),
        )
    }

    #[tokio::test]
    async fn test_submit_accepted_first_attempt() {
        let gw = Arc::new(ScriptedGateway::with_submits(vec![Ok(
            SubmitResponse::Accepted(snapshot("t1")),
        )]));
        let gov = governor(gw.clone(), 3);

        let ack = gov.submit_order(&request("t1")).await.unwrap();
        assert!(!ack.recovered);
        assert_eq!(gw.submit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gw.query_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_query_finds_order_without_resubmitting() {
        let gw = Arc::new(
            ScriptedGateway::with_submits(vec![Err(ExchangeError::Timeout)])
                .queue_queries(vec![Ok(snapshot("t2"))]),
        );
        let gov = governor(gw.clone(), 3);

        let ack = gov.submit_order(&request("t2")).await.unwrap();
        assert!(ack.recovered);
        assert_eq!(gw.submit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gw.query_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_then_already_exists_is_success() {
        let gw = Arc::new(ScriptedGateway::with_submits(vec![
            Err(ExchangeError::Timeout),
            Ok(SubmitResponse::AlreadyExists(snapshot("t3"))),
        ]));
        let gov = governor(gw.clone(), 3);

        let ack = gov.submit_order(&request("t3")).await.unwrap();
        assert!(ack.recovered);
        assert_eq!(ack.snapshot.exchange_id, ExchangeOrderId::new("1001"));
        assert_eq!(gw.submit_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let gw = Arc::new(ScriptedGateway::with_submits(vec![Err(
            ExchangeError::Rejected {
                code: Some(-2019),
                reason: "Margin is insufficient".into(),
            },
        )]));
        let gov = governor(gw.clone(), 4);

        let err = gov.submit_order(&request("t4")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(gw.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_transient_reports_unknown_outcome_with_token() {
        let gw = Arc::new(ScriptedGateway::with_submits(vec![
            Err(ExchangeError::Timeout),
            Err(ExchangeError::Server {
                status: 502,
                message: "bad gateway".into(),
            }),
            Err(ExchangeError::Network("reset".into())),
        ]));
        let gov = governor(gw.clone(), 3);

        let err = gov.submit_order(&request("t5")).await.unwrap_err();
        assert!(err.is_unknown_outcome());
        match err {
            EngineError::Transient { client_token, .. } => {
                assert_eq!(client_token, Some(ClientToken::new("t5")))
            }
            other => panic!("expected Transient, got {:?}", other),
        }
        // one token lookup before each retry
        assert_eq!(gw.query_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exchange_throttling_yields_rate_limited() {
        let throttled = || {
            Err(ExchangeError::RateLimited {
                retry_after_ms: Some(1),
            })
        };
        let gw = Arc::new(ScriptedGateway::with_submits(vec![throttled(), throttled()]));
        let gov = governor(gw.clone(), 2);

        let err = gov.submit_order(&request("t6")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(!err.is_unknown_outcome());
        assert_eq!(gw.query_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_halts_trading_but_not_reads() {
        let gw = Arc::new(ScriptedGateway::with_submits(vec![
            Err(ExchangeError::Unauthorized("invalid api key".into())),
            Ok(SubmitResponse::Accepted(snapshot("t8"))),
        ]));
        let gov = governor(gw.clone(), 3);

        let err = gov.submit_order(&request("t7")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(gov.halt_reason().await.is_some());

        let err = gov.submit_order(&request("t8")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(gw.submit_calls.load(Ordering::SeqCst), 1);

        assert_eq!(gov.get_price("BTCUSDT").await.unwrap(), dec!(50000));

        gov.clear_halt().await;
        assert!(gov.submit_order(&request("t8")).await.is_ok());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_rate_limited() {
        let gw = Arc::new(ScriptedGateway::default());
        let gov = RateGovernor::new(
            gw.clone(),
            &GovernorConfig {
                requests_per_second: 1,
                burst: 1,
                max_wait_ms: 10,
                ..Default::default()
            },
            RetryPolicy::immediate(1),
        );

        assert!(gov.get_price("BTCUSDT").await.is_ok());
        let err = gov.get_price("BTCUSDT").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(gw.price_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_calling_gateway() {
        let gw = Arc::new(
            ScriptedGateway::with_submits(vec![Err(ExchangeError::Network("down".into()))])
                .queue_queries(vec![Err(ExchangeError::Network("down".into()))]),
        );
        let gov = RateGovernor::new(
            gw.clone(),
            &GovernorConfig {
                requests_per_second: 1_000,
                burst: 1_000,
                breaker_failure_threshold: 2,
                breaker_cooldown_secs: 60,
                ..Default::default()
            },
            RetryPolicy::immediate(2),
        );

        let first = gov.submit_order(&request("t9")).await.unwrap_err();
        assert!(first.is_unknown_outcome());

        let second = gov.submit_order(&request("t10")).await.unwrap_err();
        assert_eq!(second.kind(), ErrorKind::Transient);
        assert!(!second.is_unknown_outcome());
        assert_eq!(gw.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_token_refused() {
        let gw = Arc::new(ScriptedGateway::default());
        let gov = governor(gw.clone(), 1);

        let err = gov.submit_order(&request("")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOrderParameters);
        assert_eq!(gw.submit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_already_final_passes_through() {
        let gw = Arc::new(ScriptedGateway::default());
        let gov = governor(gw, 1);

        let ack = gov
            .cancel_order("BTCUSDT", &ExchangeOrderId::new("1"))
            .await
            .unwrap();
        assert_eq!(ack, CancelAck::AlreadyFinal);
    }
}
