//! Prometheus metrics for the protocol layer
//!
//! - Outbound call counts and durations per method
//! - Inbound call outcomes on the server pipeline
//! - Heartbeat outcomes and session liveness
//! - Reverse-channel dispatch outcomes

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder, register_counter_vec, register_gauge,
    register_histogram_vec,
};

lazy_static! {
    /// Outbound calls by method and status code
    pub static ref CALLS_TOTAL: CounterVec = register_counter_vec!(
        "orchestra_rpc_calls_total",
        "Total number of outbound calls",
        &["method", "status"]  // status: http code or "error"
    )
    .expect("register orchestra_rpc_calls_total");

    /// Outbound call duration histogram
    pub static ref CALL_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "orchestra_rpc_call_duration_seconds",
        "Outbound call duration in seconds",
        &["method"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("register orchestra_rpc_call_duration_seconds");

    /// Inbound calls handled by the server pipeline
    pub static ref INBOUND_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "orchestra_rpc_inbound_calls_total",
        "Total number of inbound calls processed",
        &["method", "status"]
    )
    .expect("register orchestra_rpc_inbound_calls_total");

    /// Heartbeats by outcome
    pub static ref HEARTBEATS_TOTAL: CounterVec = register_counter_vec!(
        "orchestra_rpc_heartbeats_total",
        "Total number of heartbeat calls",
        &["result"]  // "success" or "failure"
    )
    .expect("register orchestra_rpc_heartbeats_total");

    /// Sessions currently connected
    pub static ref SESSIONS_CONNECTED: Gauge = register_gauge!(
        "orchestra_rpc_sessions_connected",
        "Number of session endpoints in the connected state"
    )
    .expect("register orchestra_rpc_sessions_connected");

    /// Reverse-channel dispatches by outcome
    pub static ref DISPATCHES_TOTAL: CounterVec = register_counter_vec!(
        "orchestra_rpc_dispatches_total",
        "Total number of reverse-channel calls dispatched",
        &["result"]  // "success", "error" or "unmatched"
    )
    .expect("register orchestra_rpc_dispatches_total");
}

/// Render every registered metric in the text exposition format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Helper to record an outbound call outcome
pub fn record_call(method: &str, status: Option<u16>) {
    let status = status.map_or_else(|| "error".to_string(), |s| s.to_string());
    CALLS_TOTAL.with_label_values(&[method, status.as_str()]).inc();
}

/// Helper to record an inbound call outcome
pub fn record_inbound(method: &str, status: u16) {
    INBOUND_CALLS_TOTAL
        .with_label_values(&[method, status.to_string().as_str()])
        .inc();
}

/// Helper to record a heartbeat outcome
pub fn record_heartbeat(success: bool) {
    let result = if success { "success" } else { "failure" };
    HEARTBEATS_TOTAL.with_label_values(&[result]).inc();
}

/// Helper to record a session entering or leaving the connected state
pub fn record_session_connected(connected: bool) {
    if connected {
        SESSIONS_CONNECTED.inc();
    } else {
        SESSIONS_CONNECTED.dec();
    }
}

/// Helper to record a reverse-channel dispatch
pub fn record_dispatch(result: &str) {
    DISPATCHES_TOTAL.with_label_values(&[result]).inc();
}

/// Timer for outbound call duration tracking
pub struct CallTimer {
    method: String,
    start: std::time::Instant,
}

impl CallTimer {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        CALL_DURATION_SECONDS
            .with_label_values(&[self.method.as_str()])
            .observe(duration);
    }
}
