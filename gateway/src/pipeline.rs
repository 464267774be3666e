//! Ordered composition of stages with a checked schema chain.

use std::sync::Arc;
use std::time::Instant;

use modelgate_backends::BackendRegistry;
use modelgate_common::{Record, Schema};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use crate::stage::{build_stage, RequestContext, Stage, StageDeps};

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    metrics: Arc<Metrics>,
    log_timings: bool,
    allow_suffix_execution: bool,
}

impl Pipeline {
    /// Build every configured step and check the schema chain.
    pub fn build(config: &GatewayConfig, registry: &BackendRegistry, metrics: Arc<Metrics>) -> Result<Self> {
        let deps = StageDeps {
            config,
            registry,
            metrics: metrics.clone(),
        };
        let stages = config
            .pipeline
            .steps
            .iter()
            .map(|step| build_stage(step, &deps))
            .collect::<Result<Vec<_>>>()?;

        let pipeline = Self::new(stages, metrics)?
            .with_log_timings(config.log_timings)
            .with_suffix_execution(config.pipeline.allow_suffix_execution);
        tracing::info!(
            steps = pipeline.stages.len(),
            "Pipeline built: {}",
            pipeline
                .stages
                .iter()
                .map(|s| format!("{}({})", s.name(), s.kind()))
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(pipeline)
    }

    /// Fails when the list is empty or an adjacent pair is incompatible.
    pub fn new(stages: Vec<Arc<dyn Stage>>, metrics: Arc<Metrics>) -> Result<Self> {
        if stages.is_empty() {
            return Err(GatewayError::Config("pipeline has no stages".into()));
        }
        for pair in stages.windows(2) {
            let (producer, consumer) = (&pair[0], &pair[1]);
            producer
                .schema_out()
                .is_subtype_of(consumer.schema_in())
                .map_err(|e| {
                    GatewayError::Config(format!(
                        "pipeline schema error between '{}' and '{}': {}",
                        producer.name(),
                        consumer.name(),
                        e
                    ))
                })?;
        }
        Ok(Self {
            stages,
            metrics,
            log_timings: false,
            allow_suffix_execution: true,
        })
    }

    pub fn with_log_timings(mut self, log_timings: bool) -> Self {
        self.log_timings = log_timings;
        self
    }

    pub fn with_suffix_execution(mut self, allowed: bool) -> Self {
        self.allow_suffix_execution = allowed;
        self
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Index of the first stage to run: 0, or the named step.
    pub fn start_index(&self, step: Option<&str>) -> Result<usize> {
        let Some(step) = step else { return Ok(0) };
        let index = self
            .stages
            .iter()
            .position(|s| s.name() == step)
            .ok_or_else(|| GatewayError::BadRequest(format!("unknown step '{}'", step)))?;
        if index > 0 && !self.allow_suffix_execution {
            return Err(GatewayError::BadRequest(format!(
                "starting at step '{}' is not allowed by this gateway",
                step
            )));
        }
        Ok(index)
    }

    /// Input schema when execution starts at `start`.
    pub fn schema_in(&self, start: usize) -> &Schema {
        self.stages
            .get(start)
            .unwrap_or(&self.stages[0])
            .schema_in()
    }

    /// Schema of the terminal stage.
    pub fn schema_out(&self) -> &Schema {
        // non-empty by construction
        self.stages[self.stages.len() - 1].schema_out()
    }

    pub async fn apply(&self, input: Record, ctx: &RequestContext) -> Result<Record> {
        self.apply_from(0, input, ctx).await
    }

    /// Run stages `start..` in order, validating every boundary.
    pub async fn apply_from(&self, start: usize, input: Record, ctx: &RequestContext) -> Result<Record> {
        let mut record = input;
        for stage in self.stages.iter().skip(start) {
            if ctx.remaining().is_zero() {
                return Err(GatewayError::DeadlineExceeded(format!(
                    "request deadline passed before stage '{}'",
                    stage.name()
                )));
            }
            stage.schema_in().validate(&record)?;

            let started = Instant::now();
            let output = stage.apply(&record, ctx).await?;
            let elapsed = started.elapsed();

            self.metrics.record_stage(stage.name(), elapsed);
            if self.log_timings {
                tracing::info!(
                    stage = %stage.name(),
                    request_id = %ctx.request_id,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "Stage finished"
                );
            } else {
                tracing::debug!(
                    stage = %stage.name(),
                    request_id = %ctx.request_id,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "Stage finished"
                );
            }

            stage.schema_out().validate(&output).map_err(|e| {
                GatewayError::Internal(format!("stage '{}' produced an invalid record: {}", stage.name(), e))
            })?;
            record = output;
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptStepConfig;
    use crate::stage::ScriptStage;
    use modelgate_common::{DType, Dim, FieldSpec, Tensor, Value, ValueKind};
    use std::time::Duration;

    fn script(name: &str, code: &str, input: FieldSpec, output: FieldSpec) -> Arc<dyn Stage> {
        Arc::new(ScriptStage::new(ScriptStepConfig {
            name: name.into(),
            language: Default::default(),
            code: Some(code.into()),
            code_path: None,
            inputs: vec![input],
            outputs: vec![output],
            reentrant: false,
            max_operations: None,
        }))
    }

    fn list(name: &str) -> FieldSpec {
        FieldSpec::new(name, ValueKind::List)
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Duration::from_secs(5))
    }

    async fn init(pipeline: &Pipeline) {
        for stage in pipeline.stages() {
            stage.init().await.unwrap();
        }
    }

    fn two_step() -> Pipeline {
        Pipeline::new(
            vec![
                script("add", "second = first + 2", list("first"), list("second")),
                script("double", "third = second * 2", list("second"), list("third")),
            ],
            Arc::new(Metrics::new(&[])),
        )
        .unwrap()
    }

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().map(|v| Value::Int64(*v)).collect()).unwrap()
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let pipeline = two_step();
        init(&pipeline).await;
        let input = Record::new().with("first", ints(&[1, 2, 3])).unwrap();
        let output = pipeline.apply(input, &ctx()).await.unwrap();
        assert_eq!(output.get("third"), Some(&ints(&[6, 8, 10])));
        assert!(!output.contains("second"));
    }

    #[tokio::test]
    async fn test_suffix_execution() {
        let pipeline = two_step();
        init(&pipeline).await;
        let start = pipeline.start_index(Some("double")).unwrap();
        assert_eq!(start, 1);
        assert_eq!(pipeline.schema_in(start).names().collect::<Vec<_>>(), vec!["second"]);

        let input = Record::new().with("second", ints(&[1])).unwrap();
        let output = pipeline.apply_from(start, input, &ctx()).await.unwrap();
        assert_eq!(output.get("third"), Some(&ints(&[2])));
    }

    #[test]
    fn test_suffix_execution_can_be_disabled() {
        let pipeline = two_step().with_suffix_execution(false);
        assert_eq!(pipeline.start_index(Some("add")).unwrap(), 0);
        assert_eq!(pipeline.start_index(Some("double")).unwrap_err().kind(), "BadRequest");
        assert_eq!(pipeline.start_index(Some("nope")).unwrap_err().kind(), "BadRequest");
    }

    #[test]
    fn test_incompatible_neighbours_rejected() {
        let err = Pipeline::new(
            vec![
                script("a", "b = a", list("a"), list("b")),
                script("c", "d = c", list("c"), list("d")),
            ],
            Arc::new(Metrics::new(&[])),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), "ConfigError");
        assert!(err.to_string().contains("field 'c' is not produced"));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        assert!(Pipeline::new(Vec::new(), Arc::new(Metrics::new(&[]))).is_err());
    }

    #[tokio::test]
    async fn test_input_validated_before_apply() {
        let spec = FieldSpec::tensor("first")
            .with_dtype(DType::F32)
            .with_shape(vec![Dim::Any, Dim::Fixed(4)]);
        let pipeline = Pipeline::new(
            vec![script("s", "out = first", spec, FieldSpec::tensor("out"))],
            Arc::new(Metrics::new(&[])),
        )
        .unwrap();
        init(&pipeline).await;

        let input = Record::new()
            .with("first", Tensor::from_i32(vec![2, 3], &[0; 6]).unwrap())
            .unwrap();
        let err = pipeline.apply(input, &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "SchemaMismatch");
        assert!(err.to_string().contains("first"));

        let missing = pipeline.apply(Record::new(), &ctx()).await.unwrap_err();
        assert_eq!(missing.kind(), "BadRequest");
    }

    #[tokio::test]
    async fn test_stage_timings_recorded() {
        let metrics = Arc::new(Metrics::new(&[]));
        let pipeline = Pipeline::new(
            vec![script("add", "second = first + 2", list("first"), list("second"))],
            metrics.clone(),
        )
        .unwrap();
        init(&pipeline).await;
        let input = Record::new().with("first", ints(&[1])).unwrap();
        pipeline.apply(input, &ctx()).await.unwrap();
        assert!(metrics
            .render()
            .contains("modelgate_stage_duration_seconds_count{stage=\"add\"} 1"));
    }
}
