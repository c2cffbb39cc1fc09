//! Error types surfaced to gateway callers.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::admission::AdmissionError;

/// Longest upstream error text passed through to callers, in characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Errors that end a request before or instead of a relayed backend response.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid_json")]
    InvalidJson,

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("{0}")]
    Upstream(String),
}

impl Error {
    /// Wrap an upstream failure, truncating its text.
    pub fn upstream(message: impl AsRef<str>) -> Self {
        Error::Upstream(truncate_message(message.as_ref()))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidJson => StatusCode::BAD_REQUEST,
            Error::Admission(AdmissionError::Busy | AdmissionError::QueueFull) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Error::Admission(AdmissionError::QueueTimeout | AdmissionError::Closed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Error::Admission(e) => e.retry_after_secs(),
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.to_string()
            }
        }));

        let mut response = (self.status(), body).into_response();
        if let Some(secs) = self.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Cut `message` down to [`MAX_ERROR_MESSAGE_CHARS`] characters.
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_CHARS) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
