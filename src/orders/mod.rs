//! Order Management Module
//!
//! Order lifecycle tracking and composite-order coordination.
//!
//! # Architecture
//!
//! - `OrderLedger` - per-order state machine, keyed by client token
//! - `OrderCoordinator` - intent validation, submission and OCO linkage
//! - Core types - `ClientToken`, `OrderState`, `FillStatus`, `Order`, `OrderGroup`
//!
//! # Example
//!
//! ```ignore
//! use perpdesk::orders::{OrderCoordinator, OrderIntent};
//! use perpdesk::types::OrderSide;
//!
//! let order = coordinator
//!     .submit_single(OrderIntent::market("BTCUSDT", OrderSide::Buy, dec!(0.001)))
//!     .await?;
//! ```

mod coordinator;
mod ledger;
mod types;

pub use coordinator::{LegCancel, OcoIntent, OcoPlacement, OrderCoordinator, OrderIntent, ScanReport};
pub use ledger::{ApplyOutcome, LedgerError, OrderLedger, Transition};
pub use types::{
    ClientToken, ExchangeOrderId, FillStatus, GroupId, Order, OrderEvent, OrderEventKind,
    OrderGroup, OrderRef, OrderState,
};
