//! Core types for order management.
//!
//! Provides type-safe order identifiers, the order state machine vocabulary
//! and the composite-order group record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{OrderSide, OrderType, TimeInForce};

/// Maximum client token length accepted by USDT-M futures venues.
const MAX_TOKEN_LEN: usize = 36;

/// Client-assigned idempotency token.
///
/// Assigned locally before submission and sent with every attempt of the
/// same logical order, so a retried request that already succeeded on the
/// exchange is recognized instead of duplicated.
///
/// # Example
///
/// ```
/// use perpdesk::orders::ClientToken;
///
/// let token = ClientToken::new("pd-abc-123");
/// assert_eq!(token.as_str(), "pd-abc-123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientToken(String);

impl ClientToken {
    /// Wrap an existing token (e.g. one echoed back by the exchange).
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        let s: String = token.into();
        if s.is_empty() {
            tracing::warn!("Creating ClientToken with empty string - the governor will refuse it");
        }
        Self(s)
    }

    /// Generate a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        let mut s = format!("pd-{}", uuid::Uuid::new_v4().simple());
        s.truncate(MAX_TOKEN_LEN);
        Self(s)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ClientToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Exchange-assigned order identifier, absent while an order is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeOrderId(String);

impl ExchangeOrderId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExchangeOrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExchangeOrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for ExchangeOrderId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Identifier shared by every leg of a composite order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(String);

impl GroupId {
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("grp-{}", uuid::Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Either key under which an order can be addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderRef {
    Client(ClientToken),
    Exchange(ExchangeOrderId),
}

impl std::fmt::Display for OrderRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderRef::Client(t) => write!(f, "client:{}", t),
            OrderRef::Exchange(id) => write!(f, "exchange:{}", id),
        }
    }
}

impl From<ClientToken> for OrderRef {
    fn from(t: ClientToken) -> Self {
        OrderRef::Client(t)
    }
}

impl From<ExchangeOrderId> for OrderRef {
    fn from(id: ExchangeOrderId) -> Self {
        OrderRef::Exchange(id)
    }
}

/// Order lifecycle states.
///
/// ```text
/// PENDING_SUBMIT --(ack)--> SUBMITTED --(partial fill)--> PARTIALLY_FILLED
/// SUBMITTED --(full fill)--> FILLED
/// PARTIALLY_FILLED --(full fill)--> FILLED
/// SUBMITTED|PARTIALLY_FILLED --(cancel ack)--> CANCELED
/// PENDING_SUBMIT --(submit error: Rejected)--> REJECTED
/// SUBMITTED --(exchange expiry)--> EXPIRED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Recorded locally, not yet acknowledged by the exchange
    PendingSubmit,
    /// Accepted by the exchange, awaiting fills
    Submitted,
    /// Some quantity executed
    PartiallyFilled,
    /// All quantity executed
    Filled,
    /// Cancelled (by operator, sibling fill or exchange)
    Canceled,
    /// Rejected before reaching the book
    Rejected,
    /// Time-in-force exceeded
    Expired,
}

impl OrderState {
    /// Returns true if no further transitions are accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }

    /// Returns true if the order may still rest on (or reach) the book.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PendingSubmit => write!(f, "PENDING_SUBMIT"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Fill progress of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillStatus {
    /// Originally requested quantity
    pub quantity: Decimal,
    /// Cumulative quantity filled so far
    pub filled_qty: Decimal,
    /// Volume-weighted average fill price (None if no fills yet)
    pub avg_fill_price: Option<Decimal>,
}

impl FillStatus {
    pub fn new(quantity: Decimal) -> Self {
        Self {
            quantity,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
        }
    }

    pub fn unfilled_qty(&self) -> Decimal {
        self.quantity - self.filled_qty
    }

    pub fn is_complete(&self) -> bool {
        self.filled_qty >= self.quantity
    }

    pub fn has_fills(&self) -> bool {
        self.filled_qty > Decimal::ZERO
    }
}

/// One exchange-facing order as recorded by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_token: ClientToken,
    pub exchange_id: Option<ExchangeOrderId>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Limit price (LIMIT, STOP_LIMIT)
    pub price: Option<Decimal>,
    /// Trigger price (STOP_LIMIT)
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    pub state: OrderState,
    pub fill: FillStatus,
    /// Non-null for composite-order legs
    pub linked_group_id: Option<GroupId>,
    /// Set when a submit timed out and the exchange may or may not hold the order
    pub outcome_unknown: bool,
    pub reject_reason: Option<String>,
    /// Highest gateway sequence marker applied so far
    pub last_sequence: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a new order in `PendingSubmit` state.
    #[must_use]
    pub fn new(
        client_token: ClientToken,
        symbol: impl Into<String>,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            client_token,
            exchange_id: None,
            symbol: symbol.into(),
            side,
            order_type,
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: false,
            state: OrderState::PendingSubmit,
            fill: FillStatus::new(quantity),
            linked_group_id: None,
            outcome_unknown: false,
            reject_reason: None,
            last_sequence: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    #[must_use]
    pub fn with_stop_price(mut self, stop_price: Decimal) -> Self {
        self.stop_price = Some(stop_price);
        self
    }

    #[must_use]
    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = Some(tif);
        self
    }

    #[must_use]
    pub fn with_reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    #[must_use]
    pub fn in_group(mut self, group_id: GroupId) -> Self {
        self.linked_group_id = Some(group_id);
        self
    }

    pub fn quantity(&self) -> Decimal {
        self.fill.quantity
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether this order is one leg of a composite group.
    pub fn is_composite_leg(&self) -> bool {
        self.linked_group_id.is_some()
    }
}

/// A composite intent (e.g. OCO) linking several legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderGroup {
    pub group_id: GroupId,
    /// Leg tokens in submission order
    pub legs: Vec<ClientToken>,
    /// True for OCO: a fill on one leg cancels all others
    pub cancel_on_fill: bool,
    /// Leg whose fill triggered sibling cancellation, once it happened
    pub triggered_by: Option<ClientToken>,
}

impl OrderGroup {
    pub fn new(group_id: GroupId, legs: Vec<ClientToken>, cancel_on_fill: bool) -> Self {
        Self {
            group_id,
            legs,
            cancel_on_fill,
            triggered_by: None,
        }
    }

    /// Every leg other than `token`.
    pub fn siblings_of<'a>(&'a self, token: &'a ClientToken) -> impl Iterator<Item = &'a ClientToken> {
        self.legs.iter().filter(move |t| *t != token)
    }
}

/// Input to the order state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderEventKind {
    /// Exchange accepted the order and assigned an id
    Ack { exchange_id: ExchangeOrderId },
    /// Cumulative fill progress
    Fill {
        cumulative_qty: Decimal,
        avg_price: Decimal,
    },
    CancelAck,
    Rejected { reason: String },
    Expired,
}

impl OrderEventKind {
    /// Short name used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ack { .. } => "ack",
            Self::Fill { .. } => "fill",
            Self::CancelAck => "cancel_ack",
            Self::Rejected { .. } => "rejected",
            Self::Expired => "expired",
        }
    }
}

/// State-machine event with the gateway's ordering marker.
///
/// `sequence` is `None` for events the engine derives from synchronous
/// responses (submit acks, cancel responses, status snapshots).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub sequence: Option<u64>,
    pub kind: OrderEventKind,
}

impl OrderEvent {
    pub fn local(kind: OrderEventKind) -> Self {
        Self {
            sequence: None,
            kind,
        }
    }

    pub fn sequenced(sequence: u64, kind: OrderEventKind) -> Self {
        Self {
            sequence: Some(sequence),
            kind,
        }
    }
}
