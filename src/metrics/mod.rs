//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Refill attempts, phase transitions and outcomes
//! - Reconciliation corrections
//! - Chain connection health

use crate::error::{RefillError, RefillResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Refill metrics
    pub static ref REFILLS_STARTED: CounterVec = register_counter_vec!(
        "refill_monitor_refills_started_total",
        "Refill attempts started",
        &["asset"]
    ).unwrap();

    pub static ref PHASE_TRANSITIONS: CounterVec = register_counter_vec!(
        "refill_monitor_phase_transitions_total",
        "Phases entered per asset",
        &["asset", "phase"]
    ).unwrap();

    pub static ref REFILL_OUTCOMES: CounterVec = register_counter_vec!(
        "refill_monitor_outcomes_total",
        "Terminal refill outcomes",
        &["asset", "status"]
    ).unwrap();

    pub static ref REFILL_PROGRESS: GaugeVec = register_gauge_vec!(
        "refill_monitor_progress",
        "Current progress of the asset's refill attempt (0-100)",
        &["asset"]
    ).unwrap();

    pub static ref REFILL_DURATION: HistogramVec = register_histogram_vec!(
        "refill_monitor_refill_duration_seconds",
        "Time from trigger to terminal state",
        &["asset"],
        vec![30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1800.0]
    ).unwrap();

    pub static ref POLL_ERRORS: CounterVec = register_counter_vec!(
        "refill_monitor_poll_errors_total",
        "Transient errors while polling a phase",
        &["asset", "phase"]
    ).unwrap();

    // Reconciliation metrics
    pub static ref RECONCILE_ACTIONS: CounterVec = register_counter_vec!(
        "refill_monitor_reconcile_actions_total",
        "Reconciliation results",
        &["asset", "action"]
    ).unwrap();

    // Chain metrics
    pub static ref RPC_FAILURES: CounterVec = register_counter_vec!(
        "refill_monitor_rpc_failures_total",
        "RPC provider failovers",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "refill_monitor_chain_block_height",
        "Latest block height seen per chain",
        &["chain_id"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RefillResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RefillError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RefillError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn render() -> RefillResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| RefillError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| RefillError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_refill_started(asset: &str) {
    REFILLS_STARTED.with_label_values(&[asset]).inc();
}

pub fn record_phase(asset: &str, phase: &str) {
    PHASE_TRANSITIONS.with_label_values(&[asset, phase]).inc();
}

pub fn record_outcome(asset: &str, status: &str) {
    REFILL_OUTCOMES.with_label_values(&[asset, status]).inc();
}

pub fn record_progress(asset: &str, progress: u8) {
    REFILL_PROGRESS
        .with_label_values(&[asset])
        .set(progress as f64);
}

pub fn record_refill_duration(asset: &str, secs: f64) {
    REFILL_DURATION.with_label_values(&[asset]).observe(secs);
}

pub fn record_poll_error(asset: &str, phase: &str) {
    POLL_ERRORS.with_label_values(&[asset, phase]).inc();
}

pub fn record_reconcile(asset: &str, action: &str) {
    RECONCILE_ACTIONS.with_label_values(&[asset, action]).inc();
}

pub fn record_rpc_failure(chain_id: u64) {
    RPC_FAILURES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_block_height(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        record_refill_started("mon");
        record_reconcile("link", "synthesized");
        record_block_height(10143, 42);

        let text = render().unwrap();
        assert!(text.contains("refill_monitor_refills_started_total"));
        assert!(text.contains("refill_monitor_reconcile_actions_total"));
        assert!(text.contains("refill_monitor_chain_block_height{chain_id=\"10143\"} 42"));
    }
}
