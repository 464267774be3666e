//! Pipeline stages.
//!
//! A stage maps one record to a new record. Stages never mutate their
//! input and return only the fields they produce.

pub mod concat;
pub mod image_loading;
pub mod json_expander;
pub mod model;
pub mod postprocess;
pub mod script;
pub mod transform;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use modelgate_backends::BackendRegistry;
use modelgate_common::{Record, Schema};

use crate::config::{GatewayConfig, StepConfig};
use crate::error::Result;
use crate::metrics::Metrics;

pub use concat::ConcatStage;
pub use image_loading::ImageLoadingStage;
pub use json_expander::JsonExpanderStage;
pub use model::ModelStage;
pub use script::ScriptStage;
pub use transform::TransformStage;

/// Per-request data handed to every stage.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    /// Point after which queued backend work is abandoned.
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// One unit of computation in a pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Step type as written in configuration.
    fn kind(&self) -> &'static str;

    fn schema_in(&self) -> &Schema;

    fn schema_out(&self) -> &Schema;

    /// False when concurrent `apply` calls are serialized inside the stage.
    fn is_thread_safe(&self) -> bool {
        true
    }

    /// Acquire resources (compile scripts, load backends).
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Exercise the stage once so lazy allocations happen before traffic.
    async fn warm(&self) -> Result<()> {
        Ok(())
    }

    async fn apply(&self, input: &Record, ctx: &RequestContext) -> Result<Record>;

    /// Release resources. Called once, in reverse pipeline order.
    async fn close(&self) {}
}

/// Shared collaborators stages are built with.
#[derive(Clone)]
pub struct StageDeps<'a> {
    pub config: &'a GatewayConfig,
    pub registry: &'a BackendRegistry,
    pub metrics: Arc<Metrics>,
}

/// Build the stage for one configured step.
pub fn build_stage(step: &StepConfig, deps: &StageDeps<'_>) -> Result<Arc<dyn Stage>> {
    Ok(match step {
        StepConfig::Script(c) => Arc::new(ScriptStage::new(c.clone())),
        StepConfig::Transform(c) => Arc::new(TransformStage::new(c.clone())),
        StepConfig::Model(c) => Arc::new(ModelStage::new(c.clone(), deps)?),
        StepConfig::Image(c) => Arc::new(ImageLoadingStage::new(c.clone())),
        StepConfig::Concat(c) => Arc::new(ConcatStage::new(c.clone())),
        StepConfig::JsonExpander(c) => Arc::new(JsonExpanderStage::new(c.clone())),
    })
}
