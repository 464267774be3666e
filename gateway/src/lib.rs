//! modelgate: an HTTP gateway that runs a linear pipeline of script,
//! transform, model, image, concat and json-expander stages.

pub mod codec;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod routes;
pub mod stage;
pub mod test_util;

pub use codec::Encoding;
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use lifecycle::{Lifecycle, StageState};
pub use metrics::Metrics;
pub use pipeline::Pipeline;

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use modelgate_backends::BackendRegistry;

/// Shared application state.
pub struct AppState {
    pub config: GatewayConfig,
    /// Owns the pipeline; gates requests on readiness.
    pub lifecycle: Arc<Lifecycle>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Build the pipeline, then initialize and warm every stage.
    pub async fn start(config: GatewayConfig, registry: &BackendRegistry) -> Result<Arc<Self>> {
        let metrics = Arc::new(Metrics::new(&config.metric_types));
        let pipeline = Pipeline::build(&config, registry, metrics.clone())?;
        let lifecycle = Arc::new(Lifecycle::new(pipeline, &config));
        lifecycle.start().await?;
        Ok(Arc::new(Self {
            config,
            lifecycle,
            metrics,
        }))
    }
}

/// The full HTTP application: routes plus logging, CORS and tracing layers.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::router(state)
        .layer(middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
