use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

/// Backend state as seen by the health probe.
#[derive(Debug, PartialEq, Eq)]
enum BackendHealth {
    Ok(Vec<String>),
    /// Reachable but answered with a non-200 status.
    Degraded(u16),
    /// Reachable but no models loaded yet.
    Starting,
    Down,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<Value>,
}

impl BackendHealth {
    fn into_response_parts(self) -> (StatusCode, Json<Value>) {
        match self {
            BackendHealth::Ok(models) => {
                (StatusCode::OK, Json(json!({ "status": "ok", "models": models })))
            }
            BackendHealth::Degraded(code) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "vllm": code })),
            ),
            BackendHealth::Starting => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "starting", "vllm": "no_models" })),
            ),
            BackendHealth::Down => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "down", "vllm": "unreachable" })),
            ),
        }
    }
}

async fn probe(state: &AppState) -> BackendHealth {
    let upstream = match state.backend.list_models(state.config.health_timeout()).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::debug!(error = %e, "Health probe could not reach backend");
            return BackendHealth::Down;
        }
    };

    if upstream.status != StatusCode::OK {
        return BackendHealth::Degraded(upstream.status.as_u16());
    }

    let Ok(list) = serde_json::from_slice::<ModelList>(&upstream.body) else {
        return BackendHealth::Down;
    };
    let models: Vec<String> = list
        .data
        .iter()
        .filter_map(|m| m.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect();

    if models.is_empty() {
        BackendHealth::Starting
    } else {
        BackendHealth::Ok(models)
    }
}

/// GET /health - probe the backend's model listing.
async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let health = probe(&state).await;
    let up = matches!(health, BackendHealth::Ok(_));
    state.metrics.backend_up.set(up as i64);
    health.into_response_parts()
}

/// GET /metrics - Prometheus text exposition.
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.metrics.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_shapes() {
        let (status, Json(body)) = BackendHealth::Ok(vec!["qwen".into()]).into_response_parts();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "models": ["qwen"]}));

        let (status, Json(body)) = BackendHealth::Degraded(500).into_response_parts();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["vllm"], 500);

        let (_, Json(body)) = BackendHealth::Starting.into_response_parts();
        assert_eq!(body["status"], "starting");

        let (_, Json(body)) = BackendHealth::Down.into_response_parts();
        assert_eq!(body, json!({"status": "down", "vllm": "unreachable"}));
    }
}
