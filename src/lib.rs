//! Edge security proxy.
//!
//! Sits in front of a web application and decides, per request, whether it
//! may reach the upstream: client identity, distributed rate limiting, CSRF
//! double-submit with rotation, IP intelligence, behavioral anomaly detection
//! with progressive blocking, and CSP nonce plus hardening headers on every
//! response.

pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;
pub mod store;

pub use config::GuardConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use security::{Guard, GuardHandle};
