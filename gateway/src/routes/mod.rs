//! HTTP routes exposed by the gateway.

pub mod chat;
pub mod health;
pub mod models;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(health::router())
        .nest("/v1", Router::new().merge(chat::router()).merge(models::router()))
}
