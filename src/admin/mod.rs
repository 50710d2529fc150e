//! Admin API on a separate listener.
//!
//! Every route requires the configured bearer key.

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::security::GuardHandle;

pub fn setup_admin_router(guards: GuardHandle) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/security/metrics", get(get_security_metrics))
        .route("/admin/security/events", get(get_security_events))
        .route("/admin/security/blocks/{identity}", get(get_block).delete(delete_block))
        .layer(middleware::from_fn_with_state(guards.clone(), admin_auth_middleware))
        .with_state(guards)
}
