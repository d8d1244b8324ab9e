//! Operator HTTP API for health checks and pool status

use crate::chain::NetworkClient;
use crate::config::ApiConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::{NonceLockStore, ReservationRecord};
use crate::tx::NonceLock;
use crate::wallet::AccountPool;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use ethers::types::Address;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<AccountPool>,
    /// Lock over the `wallet` namespace
    pub nonce_lock: Arc<NonceLock>,
    pub store: Arc<dyn NonceLockStore>,
    pub client: Arc<dyn NetworkClient>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - lock store and chain node reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();
    let chain_ok = state.client.get_block_number().await.is_ok();

    let status = if store_ok && chain_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: store_ok && chain_ok,
            store: store_ok,
            chain: chain_ok,
        }),
    )
}

/// Pool accounts and their reservations
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    match status_snapshot(&state).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn status_snapshot(state: &AppState) -> RelayerResult<StatusResponse> {
    Ok(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        chain_id: state.client.chain_id(),
        primary_address: state.pool.primary_address(),
        addresses: state.pool.addresses(),
        funded_addresses: state.pool.funded_addresses().to_vec(),
        reservations: state.nonce_lock.reservations().await?,
    })
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chain: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    chain_id: u64,
    primary_address: Address,
    addresses: Vec<Address>,
    funded_addresses: Vec<Address>,
    reservations: Vec<ReservationRecord>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ReservationState;
    use crate::testing::harness;

    #[tokio::test]
    async fn test_status_lists_pool_and_reservations() {
        let h = harness(2, 1).await;
        let state = AppState {
            pool: h.pool.clone(),
            nonce_lock: h.lock.clone(),
            store: h.store.clone(),
            client: h.chain.clone(),
            started_at: Instant::now(),
        };

        let held = h.lock.lock(h.pool.funded_addresses()).await.unwrap();
        let status = status_snapshot(&state).await.unwrap();

        assert_eq!(status.addresses.len(), 2);
        assert_eq!(status.funded_addresses, vec![h.pool.primary_address()]);
        assert_eq!(status.reservations.len(), 2);
        let locked: Vec<_> = status
            .reservations
            .iter()
            .filter(|r| r.state == ReservationState::Locked)
            .collect();
        assert_eq!(locked.len(), 1);

        let json = serde_json::to_value(&status.reservations).unwrap();
        assert!(json.to_string().contains("\"locked\""));
        held.release().await.unwrap();
    }
}
