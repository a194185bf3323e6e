//! Order ledger with a per-order state machine.
//!
//! The ledger owns every [`Order`] and [`OrderGroup`] for the lifetime of
//! the process. Each order sits behind its own async mutex inside a
//! `DashMap`, so events for unrelated orders never contend on a shared lock.
//!
//! # Idempotency
//!
//! Reapplying an event that was already applied is a no-op:
//! - events carrying a gateway sequence at or below the order's last applied
//!   sequence are dropped
//! - fills are cumulative, so a fill that does not advance the filled
//!   quantity changes nothing
//! - events for terminal orders are logged and ignored, except a cumulative
//!   fill reaching a cancelled or expired order out of order: the exchange
//!   reported it before the terminal event, so its quantity still counts

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{
    ClientToken, ExchangeOrderId, GroupId, Order, OrderEvent, OrderEventKind, OrderGroup,
    OrderRef, OrderState,
};
use crate::error::EngineError;
use crate::metrics;
use crate::types::OrderSide;

/// Ledger invariant violations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Unknown order: {0}")]
    UnknownOrder(String),

    #[error("Client token already recorded: {0}")]
    DuplicateToken(ClientToken),

    #[error("Invalid transition for order {token}: {event} in state {state}")]
    InvalidTransition {
        token: ClientToken,
        state: OrderState,
        event: &'static str,
    },

    #[error("Overfill on order {token}: cumulative {cumulative} exceeds quantity {quantity}")]
    Overfill {
        token: ClientToken,
        cumulative: Decimal,
        quantity: Decimal,
    },
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownOrder(what) => EngineError::NotFound(what),
            LedgerError::DuplicateToken(token) => {
                EngineError::invalid(format!("client token {} already in use", token))
            }
            // the event is refused; trading is not halted over it
            other => EngineError::Rejected {
                reason: format!("ledger refused event: {}", other),
                code: None,
            },
        }
    }
}

/// A state change produced by [`OrderLedger::apply_event`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub client_token: ClientToken,
    pub symbol: String,
    pub side: OrderSide,
    pub previous: OrderState,
    pub current: OrderState,
    /// Quantity newly filled by this event
    pub fill_delta: Decimal,
    /// Average price of `fill_delta`
    pub fill_price: Option<Decimal>,
    pub group_id: Option<GroupId>,
}

impl Transition {
    pub fn became_filled(&self) -> bool {
        self.current == OrderState::Filled && self.previous != OrderState::Filled
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(Transition),
    /// Already applied (stale sequence, repeated ack, non-advancing fill)
    Duplicate,
    /// Order is terminal; the event was dropped
    Late { state: OrderState },
}

impl ApplyOutcome {
    pub fn transition(&self) -> Option<&Transition> {
        match self {
            ApplyOutcome::Applied(t) => Some(t),
            _ => None,
        }
    }
}

/// Thread-safe store of orders and composite groups.
#[derive(Default)]
pub struct OrderLedger {
    orders: DashMap<ClientToken, Arc<Mutex<Order>>>,
    by_exchange_id: DashMap<ExchangeOrderId, ClientToken>,
    groups: DashMap<GroupId, OrderGroup>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of orders recorded.
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Record a new order. Fails if the client token is already known.
    pub fn record(&self, order: Order) -> Result<(), LedgerError> {
        let token = order.client_token.clone();
        let exchange_id = order.exchange_id.clone();
        let (symbol, state) = (order.symbol.clone(), order.state);

        match self.orders.entry(token.clone()) {
            Entry::Occupied(_) => return Err(LedgerError::DuplicateToken(token)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(order)));
            }
        }
        if let Some(id) = exchange_id {
            self.by_exchange_id.insert(id, token.clone());
        }

        debug!(client_token = %token, symbol = %symbol, state = %state, "Order recorded in ledger");
        Ok(())
    }

    /// Register a composite group. Every leg must already be recorded.
    pub fn register_group(&self, group: OrderGroup) -> Result<(), LedgerError> {
        if let Some(missing) = group.legs.iter().find(|t| !self.orders.contains_key(*t)) {
            return Err(LedgerError::UnknownOrder(missing.to_string()));
        }
        debug!(group_id = %group.group_id, legs = group.legs.len(), "Order group registered");
        self.groups.insert(group.group_id.clone(), group);
        Ok(())
    }

    pub fn group(&self, group_id: &GroupId) -> Option<OrderGroup> {
        self.groups.get(group_id).map(|g| g.value().clone())
    }

    /// Mark `trigger` as the leg whose fill fires the group's cancel-on-fill.
    ///
    /// Returns the group only for the first trigger; later calls return `None`.
    pub fn trigger_group(&self, group_id: &GroupId, trigger: &ClientToken) -> Option<OrderGroup> {
        let mut group = self.groups.get_mut(group_id)?;
        if group.triggered_by.is_some() {
            return None;
        }
        group.triggered_by = Some(trigger.clone());
        Some(group.value().clone())
    }

    /// Client token for an order reference, if the order is known.
    pub fn resolve(&self, order: &OrderRef) -> Option<ClientToken> {
        match order {
            OrderRef::Client(token) => self.orders.contains_key(token).then(|| token.clone()),
            OrderRef::Exchange(id) => self.by_exchange_id.get(id).map(|t| t.value().clone()),
        }
    }

    fn handle(&self, order: &OrderRef) -> Option<Arc<Mutex<Order>>> {
        let token = self.resolve(order)?;
        self.orders.get(&token).map(|h| h.value().clone())
    }

    /// Snapshot of one order.
    pub async fn get(&self, token: &ClientToken) -> Option<Order> {
        let handle = self.orders.get(token).map(|h| h.value().clone())?;
        let order = handle.lock().await;
        Some(order.clone())
    }

    pub async fn get_by_ref(&self, order: &OrderRef) -> Option<Order> {
        let handle = self.handle(order)?;
        let order = handle.lock().await;
        Some(order.clone())
    }

    pub async fn get_by_exchange_id(&self, exchange_id: &ExchangeOrderId) -> Option<Order> {
        self.get_by_ref(&OrderRef::Exchange(exchange_id.clone())).await
    }

    /// Non-terminal orders for a symbol, oldest first.
    pub async fn list_open_by_symbol(&self, symbol: &str) -> Vec<Order> {
        // Clone the handles first: no map guard is held across an await.
        let handles: Vec<Arc<Mutex<Order>>> =
            self.orders.iter().map(|e| e.value().clone()).collect();

        let mut open = Vec::new();
        for handle in handles {
            let order = handle.lock().await;
            if order.symbol == symbol && order.state.is_open() {
                open.push(order.clone());
            }
        }
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        open
    }

    /// Flag a pending submit whose outcome is unknown.
    pub async fn mark_outcome_unknown(&self, token: &ClientToken) -> Result<(), LedgerError> {
        let handle = self
            .handle(&OrderRef::Client(token.clone()))
            .ok_or_else(|| LedgerError::UnknownOrder(token.to_string()))?;
        let mut order = handle.lock().await;
        if order.state == OrderState::PendingSubmit {
            order.outcome_unknown = true;
            order.updated_at = Utc::now();
            warn!(client_token = %token, symbol = %order.symbol, "Submit outcome unknown, order left pending");
        }
        Ok(())
    }

    /// Apply one state-machine event to the referenced order.
    pub async fn apply_event(
        &self,
        order_ref: &OrderRef,
        event: OrderEvent,
    ) -> Result<ApplyOutcome, LedgerError> {
        let handle = self
            .handle(order_ref)
            .ok_or_else(|| LedgerError::UnknownOrder(order_ref.to_string()))?;

        let mut order = handle.lock().await;
        let label = event.kind.label();
        let outcome = apply_to_order(&mut order, event)?;

        match &outcome {
            ApplyOutcome::Applied(transition) => {
                if let Some(id) = &order.exchange_id {
                    self.by_exchange_id
                        .entry(id.clone())
                        .or_insert_with(|| order.client_token.clone());
                }
                info!(
                    client_token = %order.client_token,
                    symbol = %order.symbol,
                    old_state = %transition.previous,
                    new_state = %transition.current,
                    filled = %order.fill.filled_qty,
                    quantity = %order.fill.quantity,
                    "Order state updated"
                );
            }
            ApplyOutcome::Duplicate => {
                debug!(client_token = %order.client_token, event = label, "Duplicate event ignored");
            }
            ApplyOutcome::Late { state } => {
                metrics::record_late_event(label);
                warn!(
                    client_token = %order.client_token,
                    state = %state,
                    event = label,
                    "Late event for terminal order ignored"
                );
            }
        }
        Ok(outcome)
    }
}

/// The state machine itself: mutate `order` for `event` or refuse it.
fn apply_to_order(order: &mut Order, event: OrderEvent) -> Result<ApplyOutcome, LedgerError> {
    if order.state.is_terminal() {
        return Ok(reordered_fill(order, &event).unwrap_or(ApplyOutcome::Late { state: order.state }));
    }
    if let (Some(seq), Some(last)) = (event.sequence, order.last_sequence) {
        if seq <= last {
            return Ok(ApplyOutcome::Duplicate);
        }
    }

    let previous = order.state;
    let invalid = |event: &'static str| LedgerError::InvalidTransition {
        token: order.client_token.clone(),
        state: previous,
        event,
    };
    let mut fill_delta = Decimal::ZERO;
    let mut fill_price = None;

    match event.kind {
        OrderEventKind::Ack { exchange_id } => match previous {
            OrderState::PendingSubmit => {
                order.exchange_id = Some(exchange_id);
                order.state = OrderState::Submitted;
                order.outcome_unknown = false;
            }
            _ if order.exchange_id.as_ref() == Some(&exchange_id) => {
                return Ok(ApplyOutcome::Duplicate)
            }
            _ => return Err(invalid("ack")),
        },
        OrderEventKind::Fill {
            cumulative_qty,
            avg_price,
        } => {
            if previous == OrderState::PendingSubmit {
                return Err(invalid("fill"));
            }
            if cumulative_qty > order.fill.quantity {
                return Err(LedgerError::Overfill {
                    token: order.client_token.clone(),
                    cumulative: cumulative_qty,
                    quantity: order.fill.quantity,
                });
            }
            if cumulative_qty <= order.fill.filled_qty {
                return Ok(ApplyOutcome::Duplicate);
            }

            let old_qty = order.fill.filled_qty;
            let old_notional = old_qty * order.fill.avg_fill_price.unwrap_or_default();
            fill_delta = cumulative_qty - old_qty;
            fill_price = Some((cumulative_qty * avg_price - old_notional) / fill_delta);

            order.fill.filled_qty = cumulative_qty;
            order.fill.avg_fill_price = Some(avg_price);
            order.state = if order.fill.is_complete() {
                OrderState::Filled
            } else {
                OrderState::PartiallyFilled
            };
        }
        OrderEventKind::CancelAck => match previous {
            OrderState::Submitted | OrderState::PartiallyFilled => {
                order.state = OrderState::Canceled;
            }
            _ => return Err(invalid("cancel_ack")),
        },
        OrderEventKind::Rejected { reason } => match previous {
            OrderState::PendingSubmit => {
                order.state = OrderState::Rejected;
                order.outcome_unknown = false;
                order.reject_reason = Some(reason);
            }
            _ => return Err(invalid("rejected")),
        },
        OrderEventKind::Expired => match previous {
            OrderState::Submitted => order.state = OrderState::Expired,
            _ => return Err(invalid("expired")),
        },
    }

    if let Some(seq) = event.sequence {
        order.last_sequence = Some(order.last_sequence.map_or(seq, |last| last.max(seq)));
    }
    order.updated_at = Utc::now();

    Ok(ApplyOutcome::Applied(Transition {
        client_token: order.client_token.clone(),
        symbol: order.symbol.clone(),
        side: order.side,
        previous,
        current: order.state,
        fill_delta,
        fill_price,
        group_id: order.linked_group_id.clone(),
    }))
}

/// A fill the exchange reported before the cancel or expiry that made the
/// order terminal. The state stays terminal; only the quantity advances.
///
/// A fill sequenced after the terminal event, or one that would complete the
/// order, contradicts the terminal state and is left to the late-event path.
fn reordered_fill(order: &mut Order, event: &OrderEvent) -> Option<ApplyOutcome> {
    if !matches!(order.state, OrderState::Canceled | OrderState::Expired) {
        return None;
    }
    let OrderEventKind::Fill {
        cumulative_qty,
        avg_price,
    } = &event.kind
    else {
        return None;
    };
    if let (Some(seq), Some(last)) = (event.sequence, order.last_sequence) {
        if seq > last {
            return None;
        }
    }
    let (cumulative_qty, avg_price) = (*cumulative_qty, *avg_price);
    if cumulative_qty <= order.fill.filled_qty || cumulative_qty >= order.fill.quantity {
        return None;
    }

    let old_qty = order.fill.filled_qty;
    let old_notional = old_qty * order.fill.avg_fill_price.unwrap_or_default();
    let fill_delta = cumulative_qty - old_qty;
    order.fill.filled_qty = cumulative_qty;
    order.fill.avg_fill_price = Some(avg_price);
    order.updated_at = Utc::now();

    Some(ApplyOutcome::Applied(Transition {
        client_token: order.client_token.clone(),
        symbol: order.symbol.clone(),
        side: order.side,
        previous: order.state,
        current: order.state,
        fill_delta,
        fill_price: Some((cumulative_qty * avg_price - old_notional) / fill_delta),
        group_id: order.linked_group_id.clone(),
    }))
}
