use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::http::response::error_response;
use crate::observability::events::{EventQuery, EventType, SecurityEvent, Severity};
use crate::observability::SecurityMetrics;
use crate::security::anomaly::BlockState;
use crate::security::{unix_millis, GuardHandle};
use crate::store::StoreError;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub store_backend: &'static str,
    pub failure_policy: &'static str,
    pub uptime_secs: u64,
}

#[derive(Serialize)]
pub struct BlockStatus {
    pub identity: String,
    pub blocking: bool,
    #[serde(flatten)]
    pub state: BlockState,
}

fn store_unavailable(e: StoreError) -> Response {
    tracing::warn!(error = %e, "Admin request failed on store");
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "dependency_unavailable",
        "Shared store unavailable",
    )
}

pub async fn get_status(State(guards): State<GuardHandle>) -> Json<SystemStatus> {
    let guard = guards.load_full();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        store_backend: guard.store().backend_name(),
        failure_policy: guard.config().store.failure_policy.as_str(),
        uptime_secs: guard.monitor().snapshot().uptime_secs,
    })
}

pub async fn get_security_metrics(State(guards): State<GuardHandle>) -> Json<SecurityMetrics> {
    Json(guards.load().monitor().snapshot())
}

pub async fn get_security_events(
    State(guards): State<GuardHandle>,
    Query(query): Query<EventQuery>,
) -> Response {
    let guard = guards.load_full();
    match guard.monitor().events(&query).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => store_unavailable(e),
    }
}

pub async fn get_block(State(guards): State<GuardHandle>, Path(identity): Path<String>) -> Response {
    let guard = guards.load_full();
    match guard.anomaly().block_state(&identity).await {
        Ok(Some(state)) => Json(BlockStatus {
            blocking: state.is_blocking(unix_millis()),
            identity,
            state,
        })
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found", "No block recorded"),
        Err(e) => store_unavailable(e),
    }
}

/// Lift a block. Violation history is kept, so the next block escalates.
pub async fn delete_block(State(guards): State<GuardHandle>, Path(identity): Path<String>) -> Response {
    let guard = guards.load_full();
    match guard.anomaly().unblock(&identity).await {
        Ok(unblocked) => {
            if unblocked {
                guard
                    .monitor()
                    .log_security_event(SecurityEvent::new(
                        EventType::Unblocked,
                        identity.as_str(),
                        Severity::Low,
                        json!({ "source": "admin" }),
                    ))
                    .await;
            }
            Json(json!({ "identity": identity, "unblocked": unblocked })).into_response()
        }
        Err(e) => store_unavailable(e),
    }
}
