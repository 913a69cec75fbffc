//! HTTP request handlers.

use crate::chain::TxStatus;
use crate::error::RelayError;
use crate::health::Lifecycle;
use crate::metrics::METRICS;
use crate::middleware::RequestId;
use crate::response::{ExecuteResponse, HealthResponse, KeyPoolStats, TxStatusResponse};
use crate::state::AppState;
use axum::extract::{FromRequest, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use near_primitives::hash::CryptoHash;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

/// Upper bound on the RPC reachability check inside `/health`.
const RPC_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Readiness probe. 200 only while `Ready`; the balancer stops routing here
/// the moment a drain starts.
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus metrics in text exposition format.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pool = state.pool();
    let body = METRICS.render(pool.size(), pool.in_flight(), state.health.is_ready());
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
}

/// Liveness with pool and RPC status. Always 200 while the process is up.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pool = state.pool();

    let rpc_status = match tokio::time::timeout(RPC_CHECK_TIMEOUT, state.chain.probe()).await {
        Ok(Ok(status)) => status,
        Ok(Err(_)) => "unavailable",
        Err(_) => {
            warn!(timeout_ms = RPC_CHECK_TIMEOUT.as_millis() as u64, "RPC health check timed out");
            "unavailable"
        }
    };
    let status = if rpc_status == "unavailable" {
        "unavailable"
    } else if rpc_status == "degraded" || pool.is_closed() {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        lifecycle: state.health.lifecycle().as_str(),
        relayer_account: pool.relayer_account().to_string(),
        contract_id: state.relay.contract_id().to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        requests: state.request_count.load(Ordering::Relaxed),
        active_rpc: state.chain.active_endpoint(),
        failovers: state.chain.failover_count(),
        key_pool: KeyPoolStats {
            size: pool.size(),
            available: pool.available(),
            in_flight: pool.in_flight(),
            keys: pool.key_stats(),
        },
    })
}

/// Forward a signed request to the contract.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> Response {
    let start = std::time::Instant::now();
    METRICS.requests_total.fetch_add(1, Ordering::Relaxed);
    state.request_count.fetch_add(1, Ordering::Relaxed);

    // Set by the request-id middleware.
    let req_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();

    let span = info_span!("execute", req_id = %req_id);
    async move {
        let response = match relay_body(&state, request).await {
            Ok(outcome) => {
                METRICS.relayed_success.fetch_add(1, Ordering::Relaxed);
                (
                    StatusCode::OK,
                    Json(ExecuteResponse::ok(outcome.result, outcome.tx_hash)),
                )
                    .into_response()
            }
            Err(e) => {
                METRICS.record_error(&e);
                match &e {
                    RelayError::ChainRejected { .. } => {
                        info!(error = %e, tx_hash = ?e.tx_hash(), "Contract rejected request")
                    }
                    RelayError::MalformedRequest(_) | RelayError::PayloadTooLarge { .. } => {
                        warn!(error = %e, "Invalid request")
                    }
                    _ => error!(kind = e.kind(), error = %e, "Relay failed"),
                }
                e.into_response()
            }
        };
        METRICS.record_duration(start);
        response
    }
    .instrument(span)
    .await
}

async fn relay_body(
    state: &Arc<AppState>,
    request: axum::extract::Request,
) -> Result<crate::chain::ChainOutcome, RelayError> {
    if matches!(
        state.health.lifecycle(),
        Lifecycle::Draining | Lifecycle::Stopped
    ) {
        return Err(RelayError::Draining);
    }

    let declared_len = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let body: Value = match Json::<Value>::from_request(request, state).await {
        Ok(Json(v)) => v,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return Err(RelayError::PayloadTooLarge {
                size: declared_len.unwrap_or_else(|| state.config.body_limit()),
                max: state.config.max_action_bytes,
            });
        }
        Err(rejection) => return Err(RelayError::MalformedRequest(rejection.body_text())),
    };

    state.relay.relay(&body).await.outcome
}

/// Query TX status. `GET /tx/{tx_hash}`
pub async fn tx_status(
    State(state): State<Arc<AppState>>,
    Path(tx_hash_str): Path<String>,
) -> impl IntoResponse {
    let tx_hash: CryptoHash = match tx_hash_str.parse() {
        Ok(h) => h,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(TxStatusResponse::err("Invalid tx_hash format")),
            );
        }
    };

    let sender_id = state.pool().relayer_account();

    match state.chain.tx_status(tx_hash, sender_id).await {
        Ok(TxStatus::Succeeded { tx_hash, result }) => (
            StatusCode::OK,
            Json(TxStatusResponse::final_ok(tx_hash, result)),
        ),
        Ok(TxStatus::Failed { tx_hash, error }) => (
            StatusCode::OK,
            Json(TxStatusResponse::final_err(tx_hash, error)),
        ),
        Ok(TxStatus::Pending) => (
            StatusCode::OK,
            Json(TxStatusResponse::pending(tx_hash_str)),
        ),
        Err(e) => {
            error!(error = %e, "TX status RPC error");
            (
                StatusCode::BAD_GATEWAY,
                Json(TxStatusResponse::err("RPC temporarily unavailable")),
            )
        }
    }
}
