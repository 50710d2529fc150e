//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with the guard middleware and forwarding handler
//! - Wire up middleware (tracing, timeouts, body limits, request ID)
//! - Bound in-flight requests with a semaphore
//! - Forward admitted requests to the upstream application
//! - Swap in rebuilt guards when the configuration changes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::GuardConfig;
use crate::http::request::{RequestIdExt, RequestIdLayer, X_REQUEST_ID};
use crate::http::response::{bad_gateway, error_response, gateway_timeout, strip_hop_by_hop};
use crate::security::headers::X_NONCE;
use crate::security::identity::ClientIdentity;
use crate::security::{guard_middleware, Guard, GuardHandle};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub guards: GuardHandle,
    pub client: Client<HttpConnector, Body>,
    pub in_flight: Arc<Semaphore>,
}

/// HTTP server for the edge guard.
pub struct HttpServer {
    router: Router,
    guards: GuardHandle,
}

impl HttpServer {
    /// Create a server around an assembled guard.
    pub fn new(guard: Guard) -> Self {
        let config = guard.config().clone();
        let guards: GuardHandle = Arc::new(ArcSwap::from_pointee(guard));

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.timeouts.connect_secs)));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        let state = AppState {
            guards: guards.clone(),
            client,
            in_flight: Arc::new(Semaphore::new(config.listener.max_connections)),
        };

        let router = Self::build_router(&config, state);
        Self { router, guards }
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// Listener-level settings (timeouts, limits) are fixed here; a reload
    /// only replaces the guard.
    #[allow(deprecated)]
    fn build_router(config: &GuardConfig, state: AppState) -> Router {
        let overall = Duration::from_secs(config.timeouts.request_secs + config.timeouts.connect_secs);

        Router::new()
            .route("/", any(forward_handler))
            .route("/{*path}", any(forward_handler))
            .layer(middleware::from_fn_with_state(state.guards.clone(), guard_middleware))
            .layer(middleware::from_fn_with_state(state.clone(), in_flight_limit))
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(config.listener.max_body_bytes))
            .layer(TimeoutLayer::new(overall))
            .layer(TraceLayer::new_for_http())
            .layer(RequestIdLayer::propagate())
            .layer(RequestIdLayer::set())
    }

    /// Handle shared with the admin API.
    pub fn guards(&self) -> GuardHandle {
        self.guards.clone()
    }

    /// The complete router, for embedding or driving in tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server until `shutdown` fires, applying configuration updates
    /// as they arrive.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GuardConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let guards = self.guards.clone();
        tokio::spawn(async move {
            while let Some(config) = config_updates.recv().await {
                let current = guards.load_full();
                match current.rebuild(config) {
                    Ok(guard) => {
                        guards.store(Arc::new(guard));
                        tracing::info!("Configuration reloaded");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Rejected configuration update; keeping current guard");
                    }
                }
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received, draining connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Shed load once `max_connections` requests are in flight.
async fn in_flight_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match state.in_flight.clone().try_acquire_owned() {
        Ok(_permit) => next.run(request).await,
        Err(_) => {
            tracing::warn!("In-flight request limit reached");
            error_response(
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                "overloaded",
                "Server is at capacity",
            )
        }
    }
}

/// Forward an admitted request to the upstream application.
async fn forward_handler(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let guard = state.guards.load_full();
    let config = guard.config();
    let request_id = request.request_id().to_string();

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("{}{}", config.upstream.url.trim_end_matches('/'), path_and_query);
    let uri = match target.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "Invalid upstream URI");
            return bad_gateway();
        }
    };

    let client_ip = request.extensions().get::<ClientIdentity>().map(|id| id.ip);
    let (mut parts, body) = request.into_parts();

    let original_host = parts.headers.remove(header::HOST);
    strip_hop_by_hop(&mut parts.headers);
    if let Some(host) = original_host {
        parts.headers.insert("x-forwarded-host", host);
    }
    if let Some(ip) = client_ip {
        if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
            parts.headers.insert("x-forwarded-for", value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        parts.headers.insert(X_REQUEST_ID, value);
    }
    parts.uri = uri;

    tracing::debug!(
        request_id = %request_id,
        method = %parts.method,
        uri = %parts.uri,
        nonce = parts.headers.contains_key(X_NONCE),
        "Forwarding request"
    );

    let upstream = Request::from_parts(parts, body);
    let timeout = Duration::from_secs(config.timeouts.request_secs);
    match tokio::time::timeout(timeout, state.client.request(upstream)).await {
        Ok(Ok(response)) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            tracing::debug!(
                request_id = %request_id,
                status = parts.status.as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Upstream responded"
            );
            Response::from_parts(parts, Body::new(body)).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!(request_id = %request_id, error = %e, "Upstream error");
            bad_gateway()
        }
        Err(_) => {
            tracing::error!(request_id = %request_id, timeout_secs = timeout.as_secs(), "Upstream timed out");
            gateway_timeout()
        }
    }
}
