//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Logging/metrics → Store → Guard → Listeners
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! Configuration reload is driven by the file watcher, not by signals.

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
