//! Chat completions endpoint (OpenAI-compatible), admission-controlled.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;

use crate::envelope::ChatRequest;
use crate::error::Error;
use crate::proxy::CHAT_ENDPOINT;
use crate::state::AppState;

/// Build the chat router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

/// POST /v1/chat/completions - admit, then forward unary or streamed.
async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = match ChatRequest::parse(&body, &state.config.model_name) {
        Ok(request) => request,
        Err(e) => return reject(&state, e),
    };

    let lease = match state.admission.acquire().await {
        Ok(lease) => lease,
        Err(e) => return reject(&state, Error::from(e)),
    };

    tracing::debug!(
        model = %request.model(),
        stream = request.is_streaming(),
        admission = ?lease.admission(),
        "Chat completion admitted"
    );

    state.pipeline.forward(lease, request).await.into_response()
}

/// Count a request that never reached the backend and build its error response.
fn reject(state: &AppState, error: Error) -> Response {
    state
        .metrics
        .record_request(CHAT_ENDPOINT, error.status().as_str());
    error.into_response()
}
