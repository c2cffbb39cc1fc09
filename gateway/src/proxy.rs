//! Forwarding of admitted chat completions to the backend.
//!
//! Every admitted call carries a [`Finalizer`] that records metrics and gives
//! the slot back. It runs exactly once: explicitly when the call ends, or from
//! `Drop` when the caller goes away first.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::json;

use crate::admission::{AdmissionController, SlotLease};
use crate::backend::{ByteStream, ChatBackend, UpstreamResponse};
use crate::envelope::ChatRequest;
use crate::error::{truncate_message, Error};
use crate::metrics::GatewayMetrics;

pub const CHAT_ENDPOINT: &str = "/v1/chat/completions";

/// Terminal frame appended after a synthesized error event.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Status recorded when a call ends without a backend status.
const TRANSPORT_FAILURE_STATUS: StatusCode = StatusCode::BAD_GATEWAY;

/// Upper bound on how much of a streamed error body is read.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Post-call bookkeeping for one admitted request.
pub struct Finalizer {
    metrics: Arc<GatewayMetrics>,
    admission: Arc<AdmissionController>,
    endpoint: &'static str,
    lease: Option<SlotLease>,
}

impl Finalizer {
    /// Take ownership of `lease` and mark the request active.
    pub fn admit(
        lease: SlotLease,
        metrics: Arc<GatewayMetrics>,
        admission: Arc<AdmissionController>,
        endpoint: &'static str,
    ) -> Self {
        metrics.active_requests.inc();
        admission.refresh_queue_depth();
        Self {
            metrics,
            admission,
            endpoint,
            lease: Some(lease),
        }
    }

    /// Record the outcome and release the slot. Later calls do nothing.
    pub fn finish(&mut self, status: StatusCode) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        let elapsed = lease.admitted_at().elapsed();
        self.metrics.observe_latency(self.endpoint, elapsed.as_secs_f64());
        self.metrics.record_request(self.endpoint, status.as_str());
        self.metrics.active_requests.dec();
        lease.release();
        self.admission.refresh_queue_depth();

        tracing::debug!(
            endpoint = self.endpoint,
            status = status.as_u16(),
            duration_ms = elapsed.as_millis() as u64,
            "Forwarded call finished"
        );
    }

    pub fn is_finished(&self) -> bool {
        self.lease.is_none()
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if !self.is_finished() {
            tracing::warn!(endpoint = self.endpoint, "Caller went away before the call finished");
            self.finish(TRANSPORT_FAILURE_STATUS);
        }
    }
}

/// Result of a forwarded call, ready to become the caller's response.
pub enum ProxyOutcome {
    /// Backend answered; relayed verbatim.
    Complete(UpstreamResponse),
    /// Backend could not be reached.
    Failed(Error),
    /// Event stream, relayed or synthesized.
    Stream(RelayStream),
}

impl IntoResponse for ProxyOutcome {
    fn into_response(self) -> Response {
        match self {
            ProxyOutcome::Complete(upstream) => {
                let content_type = upstream
                    .content_type
                    .as_deref()
                    .and_then(|v| HeaderValue::from_str(v).ok())
                    .unwrap_or_else(|| HeaderValue::from_static("application/json"));
                (
                    upstream.status,
                    [(header::CONTENT_TYPE, content_type)],
                    upstream.body,
                )
                    .into_response()
            }
            ProxyOutcome::Failed(err) => err.into_response(),
            ProxyOutcome::Stream(stream) => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(stream),
            )
                .into_response(),
        }
    }
}

/// Forwards admitted requests and guarantees their finalize.
#[derive(Clone)]
pub struct ProxyPipeline {
    backend: Arc<dyn ChatBackend>,
    metrics: Arc<GatewayMetrics>,
    admission: Arc<AdmissionController>,
}

impl ProxyPipeline {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        metrics: Arc<GatewayMetrics>,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            backend,
            metrics,
            admission,
        }
    }

    /// Forward `request` while holding `lease`.
    pub async fn forward(&self, lease: SlotLease, request: ChatRequest) -> ProxyOutcome {
        let finalizer = Finalizer::admit(
            lease,
            self.metrics.clone(),
            self.admission.clone(),
            CHAT_ENDPOINT,
        );

        if request.is_streaming() {
            self.forward_stream(finalizer, &request).await
        } else {
            self.forward_unary(finalizer, &request).await
        }
    }

    async fn forward_unary(&self, mut finalizer: Finalizer, request: &ChatRequest) -> ProxyOutcome {
        match self.backend.chat_completion(request).await {
            Ok(upstream) => {
                finalizer.finish(upstream.status);
                ProxyOutcome::Complete(upstream)
            }
            Err(e) => {
                tracing::warn!(error = %e, model = %request.model(), "Chat completion failed");
                finalizer.finish(TRANSPORT_FAILURE_STATUS);
                ProxyOutcome::Failed(Error::upstream(e.to_string()))
            }
        }
    }

    async fn forward_stream(&self, mut finalizer: Finalizer, request: &ChatRequest) -> ProxyOutcome {
        match self.backend.chat_completion_stream(request).await {
            Ok(upstream) if upstream.status.is_success() => {
                ProxyOutcome::Stream(RelayStream::relay(upstream.body, upstream.status, finalizer))
            }
            Ok(upstream) => {
                let message = read_error_body(upstream.body).await;
                tracing::warn!(
                    status = upstream.status.as_u16(),
                    model = %request.model(),
                    "Backend rejected streaming chat completion"
                );
                finalizer.finish(upstream.status);
                ProxyOutcome::Stream(RelayStream::error(&message, upstream.status))
            }
            Err(e) => {
                tracing::warn!(error = %e, model = %request.model(), "Streaming chat completion failed");
                finalizer.finish(TRANSPORT_FAILURE_STATUS);
                ProxyOutcome::Stream(RelayStream::error(&e.to_string(), TRANSPORT_FAILURE_STATUS))
            }
        }
    }
}

/// `data: {"error":{"message":..,"status":..}}` event.
pub fn error_frame(message: &str, status: StatusCode) -> Bytes {
    let payload = json!({
        "error": {
            "message": truncate_message(message),
            "status": status.as_u16(),
        }
    });
    Bytes::from(format!("data: {}\n\n", payload))
}

async fn read_error_body(mut body: ByteStream) -> String {
    let mut buf = Vec::new();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => {
                let room = MAX_ERROR_BODY_BYTES - buf.len();
                buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if buf.len() >= MAX_ERROR_BODY_BYTES {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Error body cut short");
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Event stream handed to the caller.
///
/// Relays backend chunks untouched. A mid-stream transport failure ends the
/// relay with an error event and `[DONE]`. Dropping the stream cancels the
/// backend call before the finalizer runs.
pub struct RelayStream {
    upstream: Option<ByteStream>,
    pending: VecDeque<Bytes>,
    status: StatusCode,
    finalizer: Option<Finalizer>,
}

impl RelayStream {
    fn relay(upstream: ByteStream, status: StatusCode, finalizer: Finalizer) -> Self {
        Self {
            upstream: Some(upstream),
            pending: VecDeque::new(),
            status,
            finalizer: Some(finalizer),
        }
    }

    /// A stream that only carries an error event and `[DONE]`.
    fn error(message: &str, status: StatusCode) -> Self {
        Self {
            upstream: None,
            pending: VecDeque::from([error_frame(message, status), Bytes::from_static(DONE_FRAME)]),
            status,
            finalizer: None,
        }
    }

    fn finish(&mut self, status: StatusCode) {
        self.upstream = None;
        if let Some(finalizer) = self.finalizer.as_mut() {
            finalizer.finish(status);
        }
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            let Some(upstream) = this.upstream.as_mut() else {
                return Poll::Ready(None);
            };

            match upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) if chunk.is_empty() => continue,
                Poll::Ready(Some(Ok(chunk))) => return Poll::Ready(Some(Ok(chunk))),
                Poll::Ready(Some(Err(e))) => {
                    tracing::warn!(error = %e, "Backend stream failed mid-response");
                    this.finish(TRANSPORT_FAILURE_STATUS);
                    this.pending.push_back(error_frame(&e.to_string(), TRANSPORT_FAILURE_STATUS));
                    this.pending.push_back(Bytes::from_static(DONE_FRAME));
                }
                Poll::Ready(None) => {
                    let status = this.status;
                    this.finish(status);
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionConfig, QueueMode};
    use crate::backend::BackendError;
    use futures_util::stream;
    use std::time::Duration;

    fn fixtures() -> (Arc<GatewayMetrics>, Arc<AdmissionController>) {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let admission = Arc::new(AdmissionController::new(
            AdmissionConfig {
                max_active: 1,
                queue_mode: QueueMode::Queue,
                queue_max: 1,
                queue_timeout: Duration::from_secs(1),
            },
            metrics.queue_depth.clone(),
        ));
        (metrics, admission)
    }

    fn status_count(metrics: &GatewayMetrics, status: &str) -> u64 {
        metrics
            .requests_total
            .with_label_values(&[CHAT_ENDPOINT, status])
            .get()
    }

    #[test]
    fn test_error_frame_format() {
        let frame = error_frame("boom", StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            &frame[..],
            &b"data: {\"error\":{\"message\":\"boom\",\"status\":500}}\n\n"[..]
        );
    }

    #[tokio::test]
    async fn test_finalizer_runs_once() {
        let (metrics, admission) = fixtures();
        let lease = admission.acquire().await.unwrap();
        let mut finalizer = Finalizer::admit(lease, metrics.clone(), admission.clone(), CHAT_ENDPOINT);
        assert_eq!(metrics.active_requests.get(), 1);
        assert_eq!(admission.available_slots(), 0);

        finalizer.finish(StatusCode::OK);
        finalizer.finish(StatusCode::OK);
        drop(finalizer);

        assert_eq!(metrics.active_requests.get(), 0);
        assert_eq!(admission.available_slots(), 1);
        assert_eq!(status_count(&metrics, "200"), 1);
        assert_eq!(status_count(&metrics, "502"), 0);
    }

    #[tokio::test]
    async fn test_dropped_finalizer_counts_error() {
        let (metrics, admission) = fixtures();
        let lease = admission.acquire().await.unwrap();
        drop(Finalizer::admit(lease, metrics.clone(), admission.clone(), CHAT_ENDPOINT));

        assert_eq!(metrics.active_requests.get(), 0);
        assert_eq!(admission.available_slots(), 1);
        assert_eq!(status_count(&metrics, "502"), 1);
    }

    #[tokio::test]
    async fn test_relay_passes_chunks_and_finalizes_at_end() {
        let (metrics, admission) = fixtures();
        let lease = admission.acquire().await.unwrap();
        let finalizer = Finalizer::admit(lease, metrics.clone(), admission.clone(), CHAT_ENDPOINT);

        let chunks: Vec<Result<Bytes, BackendError>> = vec![
            Ok(Bytes::from_static(b"data: {\"a\"")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b":1}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let relay = RelayStream::relay(stream::iter(chunks).boxed(), StatusCode::OK, finalizer);

        let out: Vec<Bytes> = relay.map(|c| c.unwrap()).collect().await;
        assert_eq!(out.len(), 3);
        assert_eq!(out.concat(), b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(status_count(&metrics, "200"), 1);
        assert_eq!(admission.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_relay_mid_stream_failure_appends_error_and_done() {
        let (metrics, admission) = fixtures();
        let lease = admission.acquire().await.unwrap();
        let finalizer = Finalizer::admit(lease, metrics.clone(), admission.clone(), CHAT_ENDPOINT);

        let chunks: Vec<Result<Bytes, BackendError>> = vec![
            Ok(Bytes::from_static(b"data: {\"a\":1}\n\n")),
            Err(BackendError::Transport("connection reset".to_string())),
            Ok(Bytes::from_static(b"never relayed")),
        ];
        let relay = RelayStream::relay(stream::iter(chunks).boxed(), StatusCode::OK, finalizer);

        let out: Vec<Bytes> = relay.map(|c| c.unwrap()).collect().await;
        assert_eq!(out.len(), 3);
        assert_eq!(&out[0][..], b"data: {\"a\":1}\n\n");
        assert_eq!(out[1], error_frame("connection reset", StatusCode::BAD_GATEWAY));
        assert_eq!(&out[2][..], DONE_FRAME);
        assert_eq!(status_count(&metrics, "502"), 1);
        assert_eq!(metrics.active_requests.get(), 0);
    }

    #[tokio::test]
    async fn test_dropping_relay_releases_slot() {
        let (metrics, admission) = fixtures();
        let lease = admission.acquire().await.unwrap();
        let finalizer = Finalizer::admit(lease, metrics.clone(), admission.clone(), CHAT_ENDPOINT);

        let upstream = stream::iter(vec![Ok(Bytes::from_static(b"data: {}\n\n"))])
            .chain(stream::pending::<Result<Bytes, BackendError>>())
            .boxed();
        let mut relay = RelayStream::relay(upstream, StatusCode::OK, finalizer);

        assert!(relay.next().await.is_some());
        assert_eq!(admission.available_slots(), 0);

        drop(relay);
        assert_eq!(admission.available_slots(), 1);
        assert_eq!(metrics.active_requests.get(), 0);
        assert_eq!(status_count(&metrics, "502"), 1);
    }

    #[tokio::test]
    async fn test_read_error_body_is_bounded() {
        let big = Bytes::from(vec![b'x'; MAX_ERROR_BODY_BYTES + 10]);
        let body = stream::iter(vec![Ok::<_, BackendError>(big)]).boxed();
        let text = read_error_body(body).await;
        assert_eq!(text.len(), MAX_ERROR_BODY_BYTES);
    }
}
