//! edge-guard
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ http::server ──▶ security::pipeline ──▶ forward ──▶ Upstream app
//!                  request id       identity               pooled
//!                  in-flight cap    block + rate limit     hyper client
//!                  body limit       app check, CSRF
//!                                   IP intel + anomaly
//!                                   CSP nonce + headers
//!                                        │
//!                              store (Redis or memory)
//!                              events, metrics, logs
//! ```
//!
//! Usage: `edge-guard [CONFIG_PATH]`. Without a path the defaults are used,
//! with `EDGE_GUARD_*` environment overrides applied.

use std::path::PathBuf;
use std::process::ExitCode;

use edge_guard::lifecycle::startup;

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EDGE_GUARD_CONFIG").ok())
        .map(PathBuf::from);

    match startup::run(config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("edge-guard: {e}");
            tracing::error!(error = %e, "Fatal startup error");
            ExitCode::FAILURE
        }
    }
}
