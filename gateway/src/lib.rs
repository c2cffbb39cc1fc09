//! GPU inference gateway.
//!
//! Admits at most `max_active` concurrent chat completions to an
//! OpenAI-compatible backend, queues or rejects the overflow, and relays
//! unary and streamed responses back to callers.

pub mod admission;
pub mod backend;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod routes;
pub mod state;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionError, QueueMode, SlotLease};
pub use backend::{BackendError, ByteStream, ChatBackend, HttpBackend, UpstreamResponse, UpstreamStream};
pub use config::Config;
pub use envelope::ChatRequest;
pub use error::Error;
pub use metrics::GatewayMetrics;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the full HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    routes::router()
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            logging::request_logger,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
