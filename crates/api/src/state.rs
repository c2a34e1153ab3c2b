use chrono::{DateTime, Utc};
use compressd_core::pipeline::PipelineContext;
use compressd_core::Config;
use std::sync::Arc;

/// Shared state handed to every axum handler via `State`. The broker lives
/// inside `pipeline` since submitting a job and running its pipeline use the
/// same queue handle.
pub struct AppState {
    pub pipeline: Arc<PipelineContext>,
    pub config: Config,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, pipeline: Arc<PipelineContext>) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            config,
            started_at: Utc::now(),
        })
    }
}
