//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, in-flight limit)
//!     → security::guard_middleware (deny or admit)
//!     → server.rs forward_handler (pooled upstream client)
//!     → response.rs (strip hop-by-hop headers, map upstream errors)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{RequestId, RequestIdExt, RequestIdLayer, X_REQUEST_ID};
pub use server::HttpServer;
