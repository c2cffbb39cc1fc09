//! OpenAI-compatible /v1/models passthrough.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::error::Error;
use crate::proxy::ProxyOutcome;
use crate::state::AppState;

/// Build the models router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/models", get(list_models))
}

/// GET /v1/models - relay the backend's model list as-is.
async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    match state.backend.list_models(state.config.models_timeout()).await {
        Ok(upstream) => ProxyOutcome::Complete(upstream).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list backend models");
            Error::upstream(e.to_string()).into_response()
        }
    }
}
