//! # Resilience Module
//!
//! Everything standing between the engine and an unreliable exchange.
//!
//! ## Components
//! - `RateGovernor`: request budget, retries, trading halt; the only path to the gateway.
//! - `RetryPolicy`: exponential backoff with jitter.
//! - `CircuitBreaker`: fails fast after consecutive transient failures.

pub mod backoff;
pub mod circuit_breaker;
pub mod governor;

pub use backoff::RetryPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use self::governor::{CancelAck, GovernorConfig, LeverageAck, RateGovernor, SubmitAck};
