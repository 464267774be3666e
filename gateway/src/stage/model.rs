//! Model stage: runs a backend through its pool and post-processes the
//! output according to the prediction type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use modelgate_backends::{BackendError, BackendRegistry};
use modelgate_common::{FieldSpec, Record, Schema, Tensor, Value, ValueKind};

use crate::config::{ModelStepConfig, ParallelInferenceConfig, PredictionType};
use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use crate::pool::{BackendPool, PoolError};
use crate::stage::postprocess::{self, DetectionParams};
use crate::stage::{RequestContext, Stage, StageDeps};

pub struct ModelStage {
    config: ModelStepConfig,
    prediction_type: PredictionType,
    settings: ParallelInferenceConfig,
    registry: BackendRegistry,
    metrics: Arc<Metrics>,
    warm_timeout: Duration,
    schema_in: Schema,
    schema_out: Schema,
    pool: OnceCell<BackendPool>,
}

impl ModelStage {
    pub fn new(config: ModelStepConfig, deps: &StageDeps<'_>) -> Result<Self> {
        if !deps.registry.contains(&config.backend) {
            return Err(GatewayError::Config(format!(
                "step '{}': unknown backend '{}' (available: {})",
                config.name,
                config.backend,
                deps.registry.kinds().join(", ")
            )));
        }

        let prediction_type = config.prediction_type.unwrap_or(deps.config.prediction_type);
        let default_field = match prediction_type {
            PredictionType::Classification => Some(("predictions", ValueKind::List)),
            t if t.is_detection() => Some(("bboxes", ValueKind::BoundingBoxes)),
            _ => None,
        };
        let schema_out = match default_field {
            Some((name, kind)) => {
                let name = config.output_field.clone().unwrap_or_else(|| name.to_string());
                Schema::new(vec![FieldSpec::new(name, kind)])
            }
            None => Schema::new(config.outputs.clone()),
        };

        Ok(Self {
            prediction_type,
            settings: config
                .parallel_inference
                .clone()
                .unwrap_or_else(|| deps.config.parallel_inference.clone()),
            registry: deps.registry.clone(),
            metrics: deps.metrics.clone(),
            warm_timeout: Duration::from_millis(deps.config.request_timeout_ms),
            schema_in: Schema::new(config.inputs.clone()),
            schema_out,
            pool: OnceCell::new(),
            config,
        })
    }

    fn pool(&self) -> Result<&BackendPool> {
        self.pool
            .get()
            .ok_or_else(|| GatewayError::NotReady(format!("stage '{}' is not initialized", self.config.name)))
    }

    fn pool_error(&self, err: PoolError) -> GatewayError {
        let stage = &self.config.name;
        match err {
            PoolError::Overloaded => {
                GatewayError::Overloaded(format!("stage '{}': backend queue is full", stage))
            }
            PoolError::DeadlineExceeded => GatewayError::DeadlineExceeded(format!(
                "stage '{}': request deadline exceeded",
                stage
            )),
            PoolError::Closed => GatewayError::NotReady(format!("stage '{}' is shutting down", stage)),
            PoolError::Backend(detail) => GatewayError::Backend {
                stage: stage.clone(),
                backend: self.config.backend.clone(),
                detail,
            },
        }
    }

    fn load_error(&self, err: BackendError) -> GatewayError {
        GatewayError::BackendLoad {
            stage: self.config.name.clone(),
            backend: self.config.backend.clone(),
            detail: err.to_string(),
        }
    }

    /// The tensor post-processing reads: the first declared output when the
    /// backend produced it, otherwise the only tensor in the output.
    fn scores<'a>(&self, output: &'a Record) -> Result<&'a Tensor> {
        if let Some(tensor) = self
            .config
            .outputs
            .first()
            .and_then(|spec| output.get(&spec.name))
            .and_then(Value::as_tensor)
        {
            return Ok(tensor);
        }
        let mut tensors = output.iter().filter_map(|(_, v)| v.as_tensor());
        match (tensors.next(), tensors.next()) {
            (Some(t), None) => Ok(t),
            _ => Err(self.backend_output_error("expected exactly one output tensor")),
        }
    }

    fn backend_output_error(&self, detail: impl Into<String>) -> GatewayError {
        GatewayError::Backend {
            stage: self.config.name.clone(),
            backend: self.config.backend.clone(),
            detail: detail.into(),
        }
    }

    fn postprocess(&self, output: Record) -> Result<Record> {
        let field = |value: Value| -> Result<Record> {
            let name = self.schema_out.names().next().unwrap_or("predictions");
            Ok(Record::new().with(name, value)?)
        };

        match self.prediction_type {
            PredictionType::Classification => {
                let scores = self.scores(&output)?;
                let predictions = postprocess::classify(scores, &self.config.labels, self.config.top_k)
                    .map_err(|e| self.backend_output_error(e))?;
                field(predictions)
            }
            t if t.is_detection() => {
                let params = DetectionParams {
                    labels: &self.config.labels,
                    iou_threshold: self.config.iou_threshold,
                    score_threshold: self.config.score_threshold,
                    per_class: self.config.per_class_nms,
                };
                let boxes = postprocess::detect(t, self.scores(&output)?, &params)
                    .map_err(|e| self.backend_output_error(e))?;
                field(Value::BoundingBoxes(boxes))
            }
            _ => Ok(output.select(self.schema_out.names())),
        }
    }
}

#[async_trait]
impl Stage for ModelStage {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> &'static str {
        "model"
    }

    fn schema_in(&self) -> &Schema {
        &self.schema_in
    }

    fn schema_out(&self) -> &Schema {
        &self.schema_out
    }

    async fn init(&self) -> Result<()> {
        let pool = BackendPool::start(
            &self.config.name,
            &self.registry,
            &self.config.backend,
            self.config.model_path.as_deref(),
            &self.settings,
            self.metrics.clone(),
        )
        .await
        .map_err(|e| match e {
            BackendError::UnknownKind(kind) => {
                GatewayError::Config(format!("step '{}': unknown backend '{}'", self.config.name, kind))
            }
            other => self.load_error(other),
        })?;
        if self.pool.set(pool).is_err() {
            tracing::warn!(stage = %self.config.name, "Stage initialized twice; keeping the first pool");
        }
        Ok(())
    }

    async fn warm(&self) -> Result<()> {
        let input = self.schema_in.zero_record();
        let deadline = tokio::time::Instant::now() + self.warm_timeout;
        self.pool()?
            .submit(input, deadline)
            .await
            .map_err(|e| self.load_error(BackendError::InferenceFailed(format!("warm-up failed: {}", e))))?;
        tracing::debug!(stage = %self.config.name, "Stage warmed");
        Ok(())
    }

    async fn apply(&self, input: &Record, ctx: &RequestContext) -> Result<Record> {
        let pool = self.pool()?;
        let request = input.select(self.schema_in.names());
        let output = pool
            .submit(request, ctx.deadline)
            .await
            .map_err(|e| self.pool_error(e))?;
        self.postprocess(output)
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }
}
