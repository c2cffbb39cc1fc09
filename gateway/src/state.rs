//! Shared application state.

use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::backend::ChatBackend;
use crate::config::Config;
use crate::metrics::{GatewayMetrics, MetricsError};
use crate::proxy::ProxyPipeline;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub metrics: Arc<GatewayMetrics>,
    /// The single admission controller guarding the backend.
    pub admission: Arc<AdmissionController>,
    pub backend: Arc<dyn ChatBackend>,
    pub pipeline: ProxyPipeline,
}

impl AppState {
    pub fn new(config: Config, backend: Arc<dyn ChatBackend>) -> Result<Self, MetricsError> {
        let metrics = Arc::new(GatewayMetrics::new()?);
        let admission = Arc::new(AdmissionController::new(
            config.admission(),
            metrics.queue_depth.clone(),
        ));
        let pipeline = ProxyPipeline::new(backend.clone(), metrics.clone(), admission.clone());

        Ok(Self {
            config,
            metrics,
            admission,
            backend,
            pipeline,
        })
    }
}
