//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction submission outcomes
//! - Nonce resyncs and lock contention
//! - Pool account balances
//! - Scheduled task runs

use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::{Address, U256};
use ethers::utils::format_units;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "sponsor_relayer_transactions_submitted_total",
        "Total transactions accepted by the node",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "sponsor_relayer_transactions_confirmed_total",
        "Total transactions confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "sponsor_relayer_transactions_failed_total",
        "Total transactions failed",
        &["chain_id"]
    ).unwrap();

    pub static ref NONCE_RESYNCS: CounterVec = register_counter_vec!(
        "sponsor_relayer_nonce_resyncs_total",
        "Total nonce resyncs after a conflict",
        &["chain_id"]
    ).unwrap();

    pub static ref GAS_ESTIMATION_FALLBACKS: CounterVec = register_counter_vec!(
        "sponsor_relayer_gas_estimation_fallbacks_total",
        "Total submissions that fell back to the default gas limit",
        &["chain_id"]
    ).unwrap();

    // Lock metrics
    pub static ref LOCK_WAIT: HistogramVec = register_histogram_vec!(
        "sponsor_relayer_lock_wait_seconds",
        "Time spent waiting for a reservation",
        &["namespace"],
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    ).unwrap();

    // Pool metrics
    pub static ref ACCOUNT_BALANCE: GaugeVec = register_gauge_vec!(
        "sponsor_relayer_account_balance_eth",
        "Pool account balance in ETH",
        &["address"]
    ).unwrap();

    pub static ref POOL_ACCOUNTS: GaugeVec = register_gauge_vec!(
        "sponsor_relayer_pool_accounts",
        "Pool accounts by funding status",
        &["status"]
    ).unwrap();

    // Task metrics
    pub static ref TASK_RUNS: CounterVec = register_counter_vec!(
        "sponsor_relayer_task_runs_total",
        "Total scheduled task runs by outcome",
        &["task", "outcome"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "sponsor_relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "sponsor_relayer_health_check_failure_total",
        "Total failed health checks",
        &[]
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

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_nonce_resync(chain_id: u64) {
    NONCE_RESYNCS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_gas_estimation_fallback(chain_id: u64) {
    GAS_ESTIMATION_FALLBACKS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_lock_wait(namespace: &str, wait_secs: f64) {
    LOCK_WAIT.with_label_values(&[namespace]).observe(wait_secs);
}

pub fn record_account_balance(address: &Address, balance: U256) {
    let eth = format_units(balance, "ether")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    ACCOUNT_BALANCE
        .with_label_values(&[&format!("{:?}", address)])
        .set(eth);
}

pub fn record_pool_size(total: usize, funded: usize) {
    POOL_ACCOUNTS
        .with_label_values(&["funded"])
        .set(funded as f64);
    POOL_ACCOUNTS
        .with_label_values(&["unfunded"])
        .set(total.saturating_sub(funded) as f64);
}

pub fn record_task_run(task: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    TASK_RUNS.with_label_values(&[task, outcome]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
