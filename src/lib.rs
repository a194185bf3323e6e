//! PerpDesk: order lifecycle and position state engine for leveraged
//! perpetual futures.
//!
//! - `resilience` - rate and retry governor in front of every gateway call
//! - `orders` - order ledger and composite-order coordination
//! - `positions` - position and leverage reconciliation
//! - `facade` - command entry point and queue
//! - `exchange` - gateway contract and the in-process paper exchange

pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod facade;
pub mod logging;
pub mod metrics;
pub mod orders;
pub mod positions;
pub mod resilience;
pub mod types;
