//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to an external dependency (store, IP provider):
//!     → timeouts.rs (hard deadline per call)
//!     → circuit_breaker.rs (skip a dependency that keeps failing)
//!     → backoff.rs (spacing between startup connection attempts)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - A failing dependency degrades the pipeline, it never stalls it

pub mod backoff;
pub mod circuit_breaker;
pub mod timeouts;

pub use circuit_breaker::CircuitBreaker;
pub use timeouts::with_timeout;
