//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Security pipeline produces:
//!     → monitor.rs (events, per-class timings, offender tracking)
//!         → events.rs (append-only log in the shared store)
//!         → metrics.rs (Prometheus counters and histograms)
//!     → logging.rs (structured tracing output)
//!
//! Consumers:
//!     → Admin API (event feed, metrics snapshot)
//!     → Prometheus scrape
//!     → Log aggregation (stdout, JSON)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request IDs are set before TraceLayer and echoed on every response
//! - Metrics are cheap (atomic increments); events cost one store write

pub mod events;
pub mod logging;
pub mod metrics;
pub mod monitor;

pub use events::{EventType, SecurityEvent, Severity};
pub use monitor::{SecurityMetrics, SecurityMonitor};
