//! Prometheus Metrics Module
//!
//! Pre-registered metrics for the order engine.

use lazy_static::lazy_static;
use prometheus::{
    opts, register_gauge_vec, register_int_counter_vec, Encoder, GaugeVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    // --- Order Metrics ---

    /// Orders submitted (by symbol, side, outcome)
    pub static ref ORDERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("perpdesk_orders_total", "Orders submitted to the exchange"),
        &["symbol", "side", "outcome"]
    ).expect("FATAL: Failed to register ORDERS_TOTAL metric - check for duplicate registration");

    /// Events dropped because the order was already terminal
    pub static ref LATE_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("perpdesk_late_events_total", "Events received for terminal orders"),
        &["event"]
    ).expect("FATAL: Failed to register LATE_EVENTS_TOTAL metric - check for duplicate registration");

    /// OCO sibling cancellations (by outcome)
    pub static ref SIBLING_CANCELS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("perpdesk_sibling_cancels_total", "Sibling leg cancellations issued by the coordinator"),
        &["outcome"]
    ).expect("FATAL: Failed to register SIBLING_CANCELS_TOTAL metric - check for duplicate registration");

    // --- Gateway Metrics ---

    /// Gateway calls (by operation, outcome)
    pub static ref GATEWAY_CALLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("perpdesk_gateway_calls_total", "Gateway calls issued by the governor"),
        &["operation", "outcome"]
    ).expect("FATAL: Failed to register GATEWAY_CALLS_TOTAL metric - check for duplicate registration");

    /// Retries after transient failures
    pub static ref GATEWAY_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("perpdesk_gateway_retries_total", "Gateway call retries"),
        &["operation"]
    ).expect("FATAL: Failed to register GATEWAY_RETRIES_TOTAL metric - check for duplicate registration");

    /// Budget waits that exceeded the bounded wait
    pub static ref BUDGET_EXHAUSTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("perpdesk_budget_exhausted_total", "Calls refused by the request budget"),
        &["operation"]
    ).expect("FATAL: Failed to register BUDGET_EXHAUSTED_TOTAL metric - check for duplicate registration");

    // --- Position Metrics ---

    /// Last observed absolute drift between local and exchange position
    pub static ref POSITION_DRIFT: GaugeVec = register_gauge_vec!(
        opts!("perpdesk_position_drift", "Absolute position drift found by reconciliation"),
        &["symbol"]
    ).expect("FATAL: Failed to register POSITION_DRIFT metric - check for duplicate registration");
}

/// Record a submit outcome
pub fn record_order(symbol: &str, side: &str, outcome: &str) {
    ORDERS_TOTAL
        .with_label_values(&[symbol, side, outcome])
        .inc();
}

pub fn record_late_event(event: &str) {
    LATE_EVENTS_TOTAL.with_label_values(&[event]).inc();
}

pub fn record_sibling_cancel(outcome: &str) {
    SIBLING_CANCELS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_gateway_call(operation: &str, outcome: &str) {
    GATEWAY_CALLS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_retry(operation: &str) {
    GATEWAY_RETRIES_TOTAL.with_label_values(&[operation]).inc();
}

pub fn record_budget_exhausted(operation: &str) {
    BUDGET_EXHAUSTED_TOTAL.with_label_values(&[operation]).inc();
}

pub fn set_position_drift(symbol: &str, drift: f64) {
    POSITION_DRIFT.with_label_values(&[symbol]).set(drift);
}

/// Render all registered metrics in the text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode Prometheus metrics: {}", e);
        return String::new();
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Prometheus metrics buffer is not valid UTF-8: {}", e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics() {
        record_order("TESTUSDT", "BUY", "accepted");

        let output = gather_metrics();
        assert!(
            output.contains("perpdesk_orders_total"),
            "Expected metrics output to contain 'perpdesk_orders_total', got: {}",
            &output[..output.len().min(200)]
        );
    }
}
