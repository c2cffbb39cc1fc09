use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::state::AppState;

/// Middleware that logs HTTP requests at INFO level, together with slot and
/// wait-queue occupancy once the response is ready.
///
/// For streamed responses the duration covers time to headers only, and the
/// stream still holds its slot when the line is written.
pub async fn request_logger(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        free_slots = state.admission.available_slots(),
        queued = state.admission.queue_depth(),
        "HTTP request"
    );

    response
}
