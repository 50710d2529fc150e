//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + environment
//!     → loader.rs (parse & deserialize)
//!     → env.rs (EDGE_GUARD_*, RATE_LIMIT_* overrides)
//!     → validation.rs (semantic checks)
//!     → GuardConfig (validated, immutable)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → HttpServer rebuilds the guard over the same store
//!     → atomic swap via ArcSwap
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - The store backend is fixed at startup; reloads never reconnect

pub mod env;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::*;
