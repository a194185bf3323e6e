//! Composite Order Coordinator
//!
//! Turns operator intents into ledger orders, submits them through the
//! governor, and keeps the legs of composite groups consistent: once any leg
//! of a cancel-on-fill group fills, every other open leg is cancelled.
//!
//! A single MARKET/LIMIT/STOP_LIMIT order is the one-leg case of the same
//! path without linkage.

use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use super::ledger::{ApplyOutcome, LedgerError, OrderLedger, Transition};
use super::types::{
    ClientToken, ExchangeOrderId, GroupId, Order, OrderEvent, OrderEventKind, OrderGroup,
    OrderRef, OrderState,
};
use crate::error::EngineError;
use crate::exchange::{ExecutionEvent, OrderSnapshot, SubmitRequest};
use crate::metrics;
use crate::positions::PositionReconciler;
use crate::resilience::{CancelAck, RateGovernor};
use crate::types::{OrderSide, OrderType, TimeInForce};

/// A single-order intent.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    /// Generated at submission when not given
    pub client_token: Option<ClientToken>,
}

impl OrderIntent {
    fn new(symbol: impl Into<String>, side: OrderSide, order_type: OrderType, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: false,
            client_token: None,
        }
    }

    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self::new(symbol, side, OrderType::Market, quantity)
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        let mut intent = Self::new(symbol, side, OrderType::Limit, quantity);
        intent.price = Some(price);
        intent
    }

    pub fn stop_limit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        stop_price: Decimal,
    ) -> Self {
        let mut intent = Self::new(symbol, side, OrderType::StopLimit, quantity);
        intent.price = Some(price);
        intent.stop_price = Some(stop_price);
        intent
    }

    #[must_use]
    pub fn with_reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    #[must_use]
    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = Some(tif);
        self
    }

    #[must_use]
    pub fn with_client_token(mut self, token: ClientToken) -> Self {
        self.client_token = Some(token);
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::invalid("symbol must not be empty"));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(EngineError::invalid(format!(
                "quantity must be greater than zero, got {}",
                self.quantity
            )));
        }
        if self.order_type.requires_price() && !self.price.is_some_and(|p| p > Decimal::ZERO) {
            return Err(EngineError::invalid(format!(
                "{} order requires a positive price",
                self.order_type
            )));
        }
        if self.order_type.requires_stop_price() && !self.stop_price.is_some_and(|p| p > Decimal::ZERO) {
            return Err(EngineError::invalid(format!(
                "{} order requires a positive stop price",
                self.order_type
            )));
        }
        if self.client_token.as_ref().is_some_and(ClientToken::is_empty) {
            return Err(EngineError::invalid("client token must not be empty"));
        }
        Ok(())
    }

    fn into_order(self) -> Order {
        let token = self.client_token.unwrap_or_else(ClientToken::generate);
        let mut order = Order::new(token, self.symbol, self.side, self.order_type, self.quantity)
            .with_reduce_only(self.reduce_only);
        if let Some(price) = self.price {
            order = order.with_price(price);
        }
        if let Some(stop) = self.stop_price {
            order = order.with_stop_price(stop);
        }
        if self.order_type.requires_price() {
            order = order.with_time_in_force(self.time_in_force.unwrap_or_default());
        }
        order
    }
}

/// One-cancels-the-other intent: a LIMIT take-profit leg plus a STOP_LIMIT
/// stop-loss leg on the same side and quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct OcoIntent {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub take_profit_price: Decimal,
    pub stop_price: Decimal,
    pub stop_limit_price: Decimal,
    pub reduce_only: bool,
}

impl OcoIntent {
    fn validate_shape(&self) -> Result<(), EngineError> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::invalid("symbol must not be empty"));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(EngineError::invalid(format!(
                "quantity must be greater than zero, got {}",
                self.quantity
            )));
        }
        for (name, value) in [
            ("take-profit price", self.take_profit_price),
            ("stop price", self.stop_price),
            ("stop-limit price", self.stop_limit_price),
        ] {
            if value <= Decimal::ZERO {
                return Err(EngineError::invalid(format!("{} must be positive, got {}", name, value)));
            }
        }
        Ok(())
    }

    /// SELL: take-profit > market > stop. BUY: take-profit < market < stop.
    fn validate_against(&self, market: Decimal) -> Result<(), EngineError> {
        let ordered = match self.side {
            OrderSide::Sell => self.take_profit_price > market && market > self.stop_price,
            OrderSide::Buy => self.take_profit_price < market && market < self.stop_price,
        };
        if ordered {
            return Ok(());
        }
        let expected = match self.side {
            OrderSide::Sell => "take-profit > market > stop",
            OrderSide::Buy => "take-profit < market < stop",
        };
        Err(EngineError::invalid(format!(
            "{} OCO requires {} (take-profit {}, market {}, stop {})",
            self.side, expected, self.take_profit_price, market, self.stop_price
        )))
    }
}

/// Both legs of a placed OCO group.
#[derive(Debug, Clone)]
pub struct OcoPlacement {
    pub group_id: GroupId,
    pub take_profit: Order,
    pub stop_loss: Order,
}

/// Result of an open-order scan for one symbol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    /// Exchange orders the ledger had never seen
    pub adopted: Vec<ClientToken>,
    /// Known orders refreshed from exchange state
    pub refreshed: usize,
    /// Pending submits the exchange does not know (yet)
    pub unresolved: Vec<ClientToken>,
}

/// How a single leg cancel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegCancel {
    Canceled,
    /// The exchange had already finished the order (fill race)
    AlreadyFinal,
    /// The ledger already holds a terminal state
    AlreadyTerminal,
    /// No exchange id yet; cancelled once the ack arrives
    Deferred,
}

impl LegCancel {
    fn label(&self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::AlreadyFinal => "already_final",
            Self::AlreadyTerminal => "already_terminal",
            Self::Deferred => "deferred",
        }
    }
}

fn submit_request(order: &Order) -> SubmitRequest {
    SubmitRequest {
        symbol: order.symbol.clone(),
        side: order.side,
        order_type: order.order_type,
        quantity: order.quantity(),
        price: order.price,
        stop_price: order.stop_price,
        time_in_force: order.time_in_force,
        reduce_only: order.reduce_only,
        client_token: order.client_token.clone(),
    }
}

fn rejection_reason(err: &EngineError) -> String {
    match err {
        EngineError::Rejected { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

/// Submits intents and enforces composite-order linkage.
pub struct OrderCoordinator {
    governor: Arc<RateGovernor>,
    ledger: Arc<OrderLedger>,
    positions: Arc<PositionReconciler>,
}

impl OrderCoordinator {
    pub fn new(
        governor: Arc<RateGovernor>,
        ledger: Arc<OrderLedger>,
        positions: Arc<PositionReconciler>,
    ) -> Self {
        Self {
            governor,
            ledger,
            positions,
        }
    }

    pub fn ledger(&self) -> &Arc<OrderLedger> {
        &self.ledger
    }

    async fn order(&self, token: &ClientToken) -> Result<Order, EngineError> {
        self.ledger
            .get(token)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("client token {}", token)))
    }

    // --- Submission ---

    /// Validate, record and submit one order.
    pub async fn submit_single(&self, intent: OrderIntent) -> Result<Order, EngineError> {
        intent.validate()?;
        let order = intent.into_order();
        let token = order.client_token.clone();
        info!(
            client_token = %token,
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            quantity = %order.quantity(),
            "Submitting order"
        );
        self.ledger.record(order)?;
        self.submit_recorded(&token).await
    }

    /// Validate and place both legs of an OCO group.
    ///
    /// If a leg fails, already placed legs are cancelled (best effort), legs
    /// not yet sent are marked rejected, and the leg's error is returned.
    pub async fn submit_oco(&self, intent: OcoIntent) -> Result<OcoPlacement, EngineError> {
        intent.validate_shape()?;
        let market = self.governor.get_price(&intent.symbol).await?;
        intent.validate_against(market)?;

        let group_id = GroupId::generate();
        let take_profit = Order::new(
            ClientToken::generate(),
            intent.symbol.clone(),
            intent.side,
            OrderType::Limit,
            intent.quantity,
        )
        .with_price(intent.take_profit_price)
        .with_time_in_force(TimeInForce::Gtc)
        .with_reduce_only(intent.reduce_only)
        .in_group(group_id.clone());
        let stop_loss = Order::new(
            ClientToken::generate(),
            intent.symbol.clone(),
            intent.side,
            OrderType::StopLimit,
            intent.quantity,
        )
        .with_price(intent.stop_limit_price)
        .with_stop_price(intent.stop_price)
        .with_time_in_force(TimeInForce::Gtc)
        .with_reduce_only(intent.reduce_only)
        .in_group(group_id.clone());

        let legs = vec![take_profit.client_token.clone(), stop_loss.client_token.clone()];
        self.ledger.record(take_profit)?;
        self.ledger.record(stop_loss)?;
        self.ledger
            .register_group(OrderGroup::new(group_id.clone(), legs.clone(), true))?;

        info!(
            group_id = %group_id,
            symbol = %intent.symbol,
            side = %intent.side,
            quantity = %intent.quantity,
            take_profit = %intent.take_profit_price,
            stop = %intent.stop_price,
            stop_limit = %intent.stop_limit_price,
            market = %market,
            "Placing OCO group"
        );

        for (index, token) in legs.iter().enumerate() {
            if let Err(e) = self.submit_recorded(token).await {
                error!(group_id = %group_id, leg = index, error = %e, "OCO leg failed, unwinding group");
                self.unwind_group(&group_id, &legs[..index], token, &legs[index + 1..], &e)
                    .await;
                return Err(e);
            }
        }

        Ok(OcoPlacement {
            group_id,
            take_profit: self.order(&legs[0]).await?,
            stop_loss: self.order(&legs[1]).await?,
        })
    }

    async fn unwind_group(
        &self,
        group_id: &GroupId,
        placed: &[ClientToken],
        failed: &ClientToken,
        unsent: &[ClientToken],
        cause: &EngineError,
    ) {
        // a late ack of any leg is cancelled on arrival
        self.ledger.trigger_group(group_id, failed);

        for token in placed {
            match self.cancel_leg(token).await {
                Ok(outcome) => metrics::record_sibling_cancel(outcome.label()),
                Err(e) => {
                    metrics::record_sibling_cancel("failed");
                    error!(group_id = %group_id, client_token = %token, error = %e, "Failed to cancel placed OCO leg");
                }
            }
        }

        if cause.is_unknown_outcome() {
            self.settle_unknown_leg(failed).await;
        }

        for token in unsent {
            let event = OrderEvent::local(OrderEventKind::Rejected {
                reason: format!("not sent: sibling leg failed ({})", rejection_reason(cause)),
            });
            if let Err(e) = self.apply_local(&OrderRef::Client(token.clone()), event, false).await {
                warn!(client_token = %token, error = %e, "Could not mark unsent OCO leg");
            }
        }
    }

    /// A leg whose submit outcome is unknown may still exist on the exchange.
    async fn settle_unknown_leg(&self, token: &ClientToken) {
        let Ok(order) = self.order(token).await else {
            return;
        };
        match self
            .governor
            .query_order(&order.symbol, &OrderRef::Client(token.clone()))
            .await
        {
            Ok(snapshot) => {
                if let Err(e) = self.absorb_snapshot(token, &snapshot, true).await {
                    warn!(client_token = %token, error = %e, "Could not absorb queried OCO leg");
                }
                if let Err(e) = self.cancel_leg(token).await {
                    error!(client_token = %token, error = %e, "Failed to cancel queried OCO leg");
                }
            }
            Err(EngineError::NotFound(_)) => {
                debug!(client_token = %token, "Unknown-outcome OCO leg not on exchange");
            }
            Err(e) => {
                warn!(client_token = %token, error = %e, "Could not query unknown-outcome OCO leg");
            }
        }
    }

    /// Submit an order already recorded as PENDING_SUBMIT.
    async fn submit_recorded(&self, token: &ClientToken) -> Result<Order, EngineError> {
        let order = self.order(token).await?;
        let side = order.side.to_string();

        match self.governor.submit_order(&submit_request(&order)).await {
            Ok(ack) => {
                let outcome = if ack.recovered { "recovered" } else { "accepted" };
                metrics::record_order(&order.symbol, &side, outcome);
                let transitions = self.absorb_snapshot(token, &ack.snapshot, true).await?;
                self.enforce_linkage(&transitions).await;
                self.order(token).await
            }
            Err(e) if e.is_unknown_outcome() => {
                metrics::record_order(&order.symbol, &side, "unknown");
                self.ledger.mark_outcome_unknown(token).await?;
                Err(e.with_client_token(token))
            }
            Err(e) => {
                metrics::record_order(&order.symbol, &side, "rejected");
                let event = OrderEvent::local(OrderEventKind::Rejected {
                    reason: rejection_reason(&e),
                });
                self.apply_local(&OrderRef::Client(token.clone()), event, false)
                    .await?;
                Err(e)
            }
        }
    }

    /// Resolve an unknown-outcome submit: adopt the exchange's order if it
    /// exists, resubmit with the same token only if it does not.
    pub async fn resubmit(&self, token: &ClientToken) -> Result<Order, EngineError> {
        let order = self.order(token).await?;
        if order.state != OrderState::PendingSubmit {
            debug!(client_token = %token, state = %order.state, "Order no longer pending, nothing to resubmit");
            return Ok(order);
        }

        match self
            .governor
            .query_order(&order.symbol, &OrderRef::Client(token.clone()))
            .await
        {
            Ok(snapshot) => {
                info!(
                    client_token = %token,
                    exchange_id = %snapshot.exchange_id,
                    "Exchange already holds the order, adopting instead of resubmitting"
                );
                self.refresh(token, &snapshot).await?;
                self.order(token).await
            }
            Err(EngineError::NotFound(_)) => {
                info!(client_token = %token, "Order not on exchange, resubmitting with the same token");
                self.submit_recorded(token).await
            }
            Err(e) => Err(e),
        }
    }

    // --- Event handling ---

    /// Apply one event from the gateway's notification stream.
    pub async fn handle_event(&self, event: ExecutionEvent) -> Result<Vec<Transition>, EngineError> {
        let token = event
            .client_token
            .clone()
            .and_then(|t| self.ledger.resolve(&OrderRef::Client(t)))
            .or_else(|| {
                event
                    .exchange_id
                    .clone()
                    .and_then(|id| self.ledger.resolve(&OrderRef::Exchange(id)))
            })
            .ok_or_else(|| {
                let what = event
                    .order_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "event without order reference".to_string());
                EngineError::NotFound(what)
            })?;
        let order_ref = OrderRef::Client(token.clone());
        let mut transitions = Vec::new();

        let order = self.order(&token).await?;
        let needs_ack = order.state == OrderState::PendingSubmit
            && !matches!(
                event.kind,
                OrderEventKind::Ack { .. } | OrderEventKind::Rejected { .. }
            );
        if needs_ack {
            if let Some(exchange_id) = event.exchange_id.clone() {
                debug!(client_token = %token, "Event for pending order implies ack");
                let ack = OrderEvent::local(OrderEventKind::Ack { exchange_id });
                if let ApplyOutcome::Applied(t) = self.apply_local(&order_ref, ack, true).await? {
                    transitions.push(t);
                }
            }
        }

        let outcome = self
            .apply_local(&order_ref, OrderEvent::sequenced(event.sequence, event.kind), true)
            .await;
        if let Ok(ApplyOutcome::Applied(t)) = &outcome {
            transitions.push(t.clone());
        }

        // linkage follows the applied part even if the event itself was refused
        self.enforce_linkage(&transitions).await;
        outcome?;
        Ok(transitions)
    }

    /// Ledger update plus fill propagation into positions.
    async fn apply_local(
        &self,
        order_ref: &OrderRef,
        event: OrderEvent,
        propagate_fills: bool,
    ) -> Result<ApplyOutcome, LedgerError> {
        let outcome = self.ledger.apply_event(order_ref, event).await?;
        if let ApplyOutcome::Applied(t) = &outcome {
            if propagate_fills && t.fill_delta > Decimal::ZERO {
                if let Some(price) = t.fill_price {
                    self.positions
                        .apply_fill(&t.symbol, t.side, t.fill_delta, price)
                        .await;
                }
            }
        }
        Ok(outcome)
    }

    /// Bring a ledger order up to an exchange snapshot.
    async fn absorb_snapshot(
        &self,
        token: &ClientToken,
        snapshot: &OrderSnapshot,
        propagate_fills: bool,
    ) -> Result<Vec<Transition>, EngineError> {
        let order_ref = OrderRef::Client(token.clone());
        let mut transitions = Vec::new();

        for kind in snapshot.to_events() {
            match self
                .apply_local(&order_ref, OrderEvent::local(kind), propagate_fills)
                .await
            {
                Ok(ApplyOutcome::Applied(t)) => transitions.push(t),
                // a locally cancelled order may still owe the snapshot's partial fill
                Ok(ApplyOutcome::Duplicate | ApplyOutcome::Late { .. }) => {}
                Err(e @ LedgerError::InvalidTransition { .. }) => {
                    warn!(
                        client_token = %token,
                        exchange_state = %snapshot.state,
                        error = %e,
                        "Exchange snapshot does not follow local state machine"
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(transitions)
    }

    /// Absorb a snapshot for a known order and apply linkage rules.
    async fn refresh(&self, token: &ClientToken, snapshot: &OrderSnapshot) -> Result<(), EngineError> {
        let transitions = self.absorb_snapshot(token, snapshot, true).await?;
        self.enforce_linkage(&transitions).await;
        self.cancel_if_orphaned(token).await;
        Ok(())
    }

    /// Record an exchange order the ledger has never seen.
    async fn adopt_snapshot(&self, snapshot: &OrderSnapshot) -> Result<ClientToken, EngineError> {
        let token = snapshot
            .client_token
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| ClientToken::new(format!("ext-{}", snapshot.exchange_id)));

        let mut order = Order::new(
            token.clone(),
            snapshot.symbol.clone(),
            snapshot.side,
            snapshot.order_type,
            snapshot.quantity,
        )
        .with_reduce_only(snapshot.reduce_only);
        order.price = snapshot.price;
        order.stop_price = snapshot.stop_price;

        match self.ledger.record(order) {
            Ok(()) => {}
            // adopted concurrently by another command
            Err(LedgerError::DuplicateToken(_)) => return Ok(token),
            Err(e) => return Err(e.into()),
        }

        // fills of adopted orders are already part of exchange positions
        self.absorb_snapshot(&token, snapshot, false).await?;
        warn!(
            client_token = %token,
            exchange_id = %snapshot.exchange_id,
            symbol = %snapshot.symbol,
            state = %snapshot.state,
            "Adopted order unknown to the ledger"
        );
        Ok(token)
    }

    // --- Linkage ---

    async fn enforce_linkage(&self, transitions: &[Transition]) {
        for t in transitions {
            let Some(group_id) = &t.group_id else {
                continue;
            };

            if t.became_filled() {
                let Some(group) = self.ledger.trigger_group(group_id, &t.client_token) else {
                    continue;
                };
                if group.cancel_on_fill {
                    info!(group_id = %group_id, filled_leg = %t.client_token, "OCO leg filled, cancelling siblings");
                    self.cancel_siblings(&group, &t.client_token).await;
                }
            } else if t.previous == OrderState::PendingSubmit && t.current.is_open() {
                // a deferred sibling cancel completes on ack
                self.cancel_if_orphaned(&t.client_token).await;
            }
        }
    }

    async fn cancel_siblings(&self, group: &OrderGroup, trigger: &ClientToken) {
        for sibling in group.siblings_of(trigger) {
            match self.cancel_leg(sibling).await {
                Ok(outcome) => {
                    metrics::record_sibling_cancel(outcome.label());
                    debug!(group_id = %group.group_id, client_token = %sibling, outcome = outcome.label(), "Sibling cancel done");
                }
                Err(e) => {
                    metrics::record_sibling_cancel("failed");
                    error!(
                        group_id = %group.group_id,
                        client_token = %sibling,
                        error = %e,
                        "Failed to cancel OCO sibling"
                    );
                }
            }
        }
    }

    /// Cancel a leg still open in a group that was already triggered.
    async fn cancel_if_orphaned(&self, token: &ClientToken) {
        let Some(order) = self.ledger.get(token).await else {
            return;
        };
        if order.is_terminal() {
            return;
        }
        let Some(group) = order
            .linked_group_id
            .as_ref()
            .and_then(|gid| self.ledger.group(gid))
        else {
            return;
        };
        if !group.cancel_on_fill || group.triggered_by.is_none() {
            return;
        }

        match self.cancel_leg(token).await {
            Ok(outcome) => metrics::record_sibling_cancel(outcome.label()),
            Err(e) => {
                metrics::record_sibling_cancel("failed");
                error!(client_token = %token, error = %e, "Failed to cancel orphaned OCO leg");
            }
        }
    }

    /// Cancel one order; a cancel that loses the race against a fill is success.
    async fn cancel_leg(&self, token: &ClientToken) -> Result<LegCancel, EngineError> {
        let order = self.order(token).await?;
        if order.is_terminal() {
            return Ok(LegCancel::AlreadyTerminal);
        }
        let Some(exchange_id) = order.exchange_id.clone() else {
            debug!(client_token = %token, "Cancel deferred until the exchange acks the order");
            return Ok(LegCancel::Deferred);
        };

        match self.governor.cancel_order(&order.symbol, &exchange_id).await? {
            CancelAck::Canceled => {
                self.apply_local(
                    &OrderRef::Client(token.clone()),
                    OrderEvent::local(OrderEventKind::CancelAck),
                    true,
                )
                .await?;
                Ok(LegCancel::Canceled)
            }
            CancelAck::AlreadyFinal => {
                warn!(
                    client_token = %token,
                    exchange_id = %exchange_id,
                    "Cancel raced with exchange-side completion"
                );
                let snapshot = self
                    .governor
                    .query_order(&order.symbol, &OrderRef::Exchange(exchange_id))
                    .await?;
                self.absorb_snapshot(token, &snapshot, true).await?;
                Ok(LegCancel::AlreadyFinal)
            }
        }
    }

    // --- Operator commands ---

    /// Cancel an order by exchange id. Cancelling any leg of a group cancels
    /// every open leg of that group.
    pub async fn cancel(&self, symbol: &str, exchange_id: &ExchangeOrderId) -> Result<Vec<Order>, EngineError> {
        let token = match self.ledger.resolve(&OrderRef::Exchange(exchange_id.clone())) {
            Some(token) => token,
            None => {
                let snapshot = self
                    .governor
                    .query_order(symbol, &OrderRef::Exchange(exchange_id.clone()))
                    .await?;
                self.adopt_snapshot(&snapshot).await?
            }
        };

        let order = self.order(&token).await?;
        if order.symbol != symbol {
            return Err(EngineError::invalid(format!(
                "order {} belongs to {}, not {}",
                exchange_id, order.symbol, symbol
            )));
        }

        let legs = match &order.linked_group_id {
            Some(group_id) => {
                self.ledger.trigger_group(group_id, &token);
                self.ledger
                    .group(group_id)
                    .map(|g| g.legs)
                    .unwrap_or_else(|| vec![token.clone()])
            }
            None => vec![token.clone()],
        };

        info!(symbol = symbol, exchange_id = %exchange_id, legs = legs.len(), "Cancelling order");
        for leg in &legs {
            if leg == &token {
                self.cancel_leg(leg).await?;
            } else if let Err(e) = self.cancel_leg(leg).await {
                error!(client_token = %leg, error = %e, "Failed to cancel group leg");
            }
        }

        let mut orders = Vec::with_capacity(legs.len());
        for leg in &legs {
            orders.push(self.order(leg).await?);
        }
        Ok(orders)
    }

    /// Query one order on the exchange and fold the answer into the ledger.
    pub async fn status(&self, symbol: &str, exchange_id: &ExchangeOrderId) -> Result<Order, EngineError> {
        let snapshot = self
            .governor
            .query_order(symbol, &OrderRef::Exchange(exchange_id.clone()))
            .await?;

        let known = self
            .ledger
            .resolve(&OrderRef::Exchange(exchange_id.clone()))
            .or_else(|| {
                snapshot
                    .client_token
                    .clone()
                    .and_then(|t| self.ledger.resolve(&OrderRef::Client(t)))
            });
        let token = match known {
            Some(token) => {
                self.refresh(&token, &snapshot).await?;
                token
            }
            None => self.adopt_snapshot(&snapshot).await?,
        };
        self.order(&token).await
    }

    /// Reconcile the ledger with the exchange's open orders for a symbol.
    pub async fn scan_open_orders(&self, symbol: &str) -> Result<ScanReport, EngineError> {
        let remote = self.governor.open_orders(symbol).await?;
        let mut report = ScanReport::default();
        let mut seen: HashSet<ClientToken> = HashSet::new();

        for snapshot in &remote {
            let known = self
                .ledger
                .resolve(&OrderRef::Exchange(snapshot.exchange_id.clone()))
                .or_else(|| {
                    snapshot
                        .client_token
                        .clone()
                        .and_then(|t| self.ledger.resolve(&OrderRef::Client(t)))
                });
            match known {
                Some(token) => {
                    self.refresh(&token, snapshot).await?;
                    report.refreshed += 1;
                    seen.insert(token);
                }
                None => {
                    let token = self.adopt_snapshot(snapshot).await?;
                    seen.insert(token.clone());
                    report.adopted.push(token);
                }
            }
        }

        // open locally but missing from the exchange's book
        for order in self.ledger.list_open_by_symbol(symbol).await {
            if seen.contains(&order.client_token) {
                continue;
            }
            let order_ref = match &order.exchange_id {
                Some(id) => OrderRef::Exchange(id.clone()),
                None => OrderRef::Client(order.client_token.clone()),
            };
            match self.governor.query_order(symbol, &order_ref).await {
                Ok(snapshot) => {
                    self.refresh(&order.client_token, &snapshot).await?;
                    report.refreshed += 1;
                }
                Err(EngineError::NotFound(_)) if order.state == OrderState::PendingSubmit => {
                    report.unresolved.push(order.client_token.clone());
                }
                Err(e) => {
                    warn!(client_token = %order.client_token, error = %e, "Could not refresh open order");
                }
            }
        }

        info!(
            symbol = symbol,
            exchange_open = remote.len(),
            adopted = report.adopted.len(),
            refreshed = report.refreshed,
            unresolved = report.unresolved.len(),
            "Open order scan completed"
        );
        Ok(report)
    }
}
