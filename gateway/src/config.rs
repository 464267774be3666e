//! Gateway configuration.
//!
//! Option names follow snake_case; the camelCase spellings (`httpPort`,
//! `parallelInference.queueLimit`, ...) are accepted as aliases.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use config::{Config as ConfigLoader, Environment, File};
use serde::{Deserialize, Serialize};

use modelgate_common::{DType, FieldSpec, ValueKind};

use crate::codec::Encoding;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How the model stage post-processes backend output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionType {
    Classification,
    Yolo,
    Ssd,
    Rcnn,
    #[default]
    Raw,
    Regression,
}

impl PredictionType {
    pub fn is_detection(self) -> bool {
        matches!(self, PredictionType::Yolo | PredictionType::Ssd | PredictionType::Rcnn)
    }
}

/// Submission policy of a backend pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferenceMode {
    #[default]
    #[serde(alias = "sequential")]
    Sequential,
    #[serde(alias = "batched")]
    Batched,
    #[serde(alias = "inplace")]
    Inplace,
}

/// Metric families rendered on `/metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Requests,
    Latency,
    Queue,
    Batch,
    Stages,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelInferenceConfig {
    pub workers: usize,
    #[serde(alias = "queueLimit")]
    pub queue_limit: usize,
    #[serde(alias = "batchLimit")]
    pub batch_limit: usize,
    #[serde(alias = "inferenceMode")]
    pub inference_mode: InferenceMode,
    /// Upper bound on how long a worker waits to fill a batch.
    #[serde(alias = "batchWindowMs")]
    pub batch_window_ms: u64,
}

impl Default for ParallelInferenceConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_limit: 64,
            batch_limit: 1,
            inference_mode: InferenceMode::Sequential,
            batch_window_ms: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub steps: Vec<StepConfig>,
    /// Whether `POST /{out}/{in}/{stepName}` may start mid-pipeline.
    #[serde(alias = "allowSuffixExecution")]
    pub allow_suffix_execution: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            allow_suffix_execution: true,
        }
    }
}

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    #[serde(alias = "httpPort")]
    pub http_port: u16,
    #[serde(alias = "listenHost")]
    pub listen_host: String,
    /// When set, requests must use this request encoding.
    #[serde(alias = "inputDataFormat")]
    pub input_data_format: Option<Encoding>,
    /// When set, requests must ask for this response encoding.
    #[serde(alias = "outputDataFormat")]
    pub output_data_format: Option<Encoding>,
    /// Default post-processing for model steps that do not set their own.
    #[serde(alias = "predictionType")]
    pub prediction_type: PredictionType,
    /// Where large multipart parts are spooled while a request is decoded.
    #[serde(alias = "uploadsDirectory")]
    pub uploads_directory: Option<PathBuf>,
    #[serde(alias = "maxBodyBytes")]
    pub max_body_bytes: usize,
    #[serde(alias = "parallelInference")]
    pub parallel_inference: ParallelInferenceConfig,
    #[serde(alias = "logTimings")]
    pub log_timings: bool,
    /// Empty means every family.
    #[serde(alias = "metricTypes")]
    pub metric_types: Vec<MetricType>,
    /// Default and upper bound of the per-request deadline.
    #[serde(alias = "requestTimeoutMs")]
    pub request_timeout_ms: u64,
    #[serde(alias = "drainTimeoutMs")]
    pub drain_timeout_ms: u64,
    #[serde(alias = "warmOnStart")]
    pub warm_on_start: bool,
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: default_port(),
            listen_host: default_host(),
            input_data_format: None,
            output_data_format: None,
            prediction_type: PredictionType::Raw,
            uploads_directory: None,
            max_body_bytes: 64 * 1024 * 1024,
            parallel_inference: ParallelInferenceConfig::default(),
            log_timings: false,
            metric_types: Vec::new(),
            request_timeout_ms: 30_000,
            drain_timeout_ms: 10_000,
            warm_on_start: true,
            logging: LoggingConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

// ============================================================================
// Step configuration
// ============================================================================

/// One pipeline step, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepConfig {
    Script(ScriptStepConfig),
    Transform(TransformStepConfig),
    Model(ModelStepConfig),
    Image(ImageStepConfig),
    Concat(ConcatStepConfig),
    #[serde(alias = "jsonExpander")]
    JsonExpander(JsonExpanderStepConfig),
}

impl StepConfig {
    pub fn name(&self) -> &str {
        match self {
            StepConfig::Script(c) => &c.name,
            StepConfig::Transform(c) => &c.name,
            StepConfig::Model(c) => &c.name,
            StepConfig::Image(c) => &c.name,
            StepConfig::Concat(c) => &c.name,
            StepConfig::JsonExpander(c) => &c.name,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            StepConfig::Script(_) => "script",
            StepConfig::Transform(_) => "transform",
            StepConfig::Model(_) => "model",
            StepConfig::Image(_) => "image",
            StepConfig::Concat(_) => "concat",
            StepConfig::JsonExpander(_) => "json-expander",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    #[default]
    Rhai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptStepConfig {
    pub name: String,
    #[serde(default)]
    pub language: ScriptLanguage,
    /// Inline source. Exactly one of `code` and `code_path` is set.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, alias = "codePath")]
    pub code_path: Option<PathBuf>,
    pub inputs: Vec<FieldSpec>,
    pub outputs: Vec<FieldSpec>,
    /// Allow concurrent invocations of the same script.
    #[serde(default)]
    pub reentrant: bool,
    #[serde(default, alias = "maxOperations")]
    pub max_operations: Option<u64>,
}

/// Column types a transform can cast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
}

/// One column-level transform operation, discriminated by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum TransformOp {
    Rename {
        from: String,
        to: String,
    },
    Drop {
        columns: Vec<String>,
    },
    Cast {
        column: String,
        to: ColumnType,
    },
    Append {
        column: String,
        suffix: String,
    },
    Prefix {
        column: String,
        prefix: String,
    },
    CategoricalToInteger {
        column: String,
        categories: Vec<String>,
    },
    IntegerToCategorical {
        column: String,
        categories: Vec<String>,
    },
    MinMaxScale {
        column: String,
        min: f64,
        max: f64,
    },
    OneHot {
        column: String,
        categories: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStepConfig {
    pub name: String,
    #[serde(default = "default_table_field")]
    pub input: String,
    /// Defaults to the input field name.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub operations: Vec<TransformOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStepConfig {
    pub name: String,
    /// Backend kind resolved through the backend registry.
    pub backend: String,
    #[serde(default, alias = "modelPath")]
    pub model_path: Option<PathBuf>,
    pub inputs: Vec<FieldSpec>,
    pub outputs: Vec<FieldSpec>,
    /// Overrides the gateway-wide prediction type.
    #[serde(default, alias = "predictionType")]
    pub prediction_type: Option<PredictionType>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_top_k", alias = "topK")]
    pub top_k: usize,
    #[serde(default = "default_iou_threshold", alias = "iouThreshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_score_threshold", alias = "scoreThreshold")]
    pub score_threshold: f32,
    /// Suppress overlapping boxes only within the same class.
    #[serde(default = "default_true", alias = "perClassNms")]
    pub per_class_nms: bool,
    /// Name of the post-processed field (`predictions` / `bboxes` by default).
    #[serde(default, alias = "outputField")]
    pub output_field: Option<String>,
    /// Overrides the gateway-wide pool settings for this backend.
    #[serde(default, alias = "parallelInference")]
    pub parallel_inference: Option<ParallelInferenceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    #[serde(alias = "NCHW")]
    Nchw,
    #[serde(alias = "NHWC")]
    Nhwc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    #[default]
    Bilinear,
    Nearest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorOrder {
    #[default]
    Rgb,
    Bgr,
    Gray,
}

impl ColorOrder {
    pub fn channels(self) -> usize {
        match self {
            ColorOrder::Rgb | ColorOrder::Bgr => 3,
            ColorOrder::Gray => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageStepConfig {
    pub name: String,
    #[serde(default = "default_image_field")]
    pub input: String,
    /// `image` (decoded pixels) or `bytes` (encoded PNG/JPEG/BMP).
    #[serde(default = "default_image_kind", alias = "inputKind")]
    pub input_kind: ValueKind,
    #[serde(default = "default_image_tensor_field")]
    pub output: String,
    pub layout: TensorLayout,
    #[serde(default)]
    pub resize: Option<Size>,
    #[serde(default)]
    pub crop: Option<Size>,
    #[serde(default)]
    pub interpolation: Interpolation,
    #[serde(default)]
    pub color: ColorOrder,
    /// Multiplier applied to raw 0-255 values before mean/std.
    #[serde(default = "default_pixel_scale")]
    pub scale: f32,
    #[serde(default)]
    pub mean: Vec<f32>,
    #[serde(default)]
    pub std: Vec<f32>,
    /// Prepend a batch axis of extent 1.
    #[serde(default = "default_true", alias = "batchDim")]
    pub batch_dim: bool,
}

impl ImageStepConfig {
    /// Final `(width, height)`: the crop when set, otherwise the resize.
    pub fn output_size(&self) -> Option<Size> {
        self.crop.or(self.resize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcatStepConfig {
    pub name: String,
    pub inputs: Vec<String>,
    pub output: String,
    /// Negative values count from the last axis.
    #[serde(default)]
    pub axis: i64,
    #[serde(default)]
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonMapping {
    /// JSON pointer (`/a/b/0`) or dotted path (`a.b.0`).
    pub path: String,
    pub output: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub dtype: Option<DType>,
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonExpanderStepConfig {
    pub name: String,
    pub input: String,
    pub mappings: Vec<JsonMapping>,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_true() -> bool {
    true
}
fn default_top_k() -> usize {
    1
}
fn default_iou_threshold() -> f32 {
    0.45
}
fn default_score_threshold() -> f32 {
    0.5
}
fn default_table_field() -> String {
    "table".to_string()
}
fn default_image_field() -> String {
    "image".to_string()
}
fn default_image_kind() -> ValueKind {
    ValueKind::Image
}
fn default_image_tensor_field() -> String {
    "image_tensor".to_string()
}
fn default_pixel_scale() -> f32 {
    1.0 / 255.0
}

impl GatewayConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (MODELGATE__SECTION__KEY format)
    /// 2. The file at `path`, or `modelgate.{toml,json,yaml}` if present
    /// 3. Built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("modelgate").required(false),
        };
        let config: GatewayConfig = ConfigLoader::builder()
            .set_default("listen_host", default_host())?
            .set_default("http_port", default_port() as i64)?
            .add_source(file)
            .add_source(
                Environment::with_prefix("MODELGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the gateway cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.listen_host.trim().is_empty() {
            return invalid("listen_host must not be empty".into());
        }
        if self.max_body_bytes == 0 {
            return invalid("max_body_bytes must be at least 1".into());
        }
        if self.request_timeout_ms == 0 {
            return invalid("request_timeout_ms must be at least 1".into());
        }
        validate_parallel("parallel_inference", &self.parallel_inference)?;

        if self.pipeline.steps.is_empty() {
            return invalid("pipeline.steps must contain at least one step".into());
        }
        let mut names = HashSet::new();
        for step in &self.pipeline.steps {
            if step.name().trim().is_empty() {
                return invalid(format!("a {} step has an empty name", step.type_name()));
            }
            if !names.insert(step.name()) {
                return invalid(format!("duplicate step name '{}'", step.name()));
            }
            validate_step(step)?;
        }
        Ok(())
    }
}

fn validate_parallel(path: &str, parallel: &ParallelInferenceConfig) -> Result<(), ConfigError> {
    if parallel.workers == 0 {
        return Err(ConfigError::Invalid(format!("{}.workers must be at least 1", path)));
    }
    if parallel.queue_limit == 0 {
        return Err(ConfigError::Invalid(format!("{}.queue_limit must be at least 1", path)));
    }
    if parallel.batch_limit == 0 {
        return Err(ConfigError::Invalid(format!("{}.batch_limit must be at least 1", path)));
    }
    Ok(())
}

fn validate_fields(step: &str, what: &str, fields: &[FieldSpec]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for field in fields {
        if field.name.is_empty() {
            return Err(ConfigError::Invalid(format!("step '{}': empty {} name", step, what)));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "step '{}': duplicate {} '{}'",
                step, what, field.name
            )));
        }
    }
    Ok(())
}

fn validate_step(step: &StepConfig) -> Result<(), ConfigError> {
    let name = step.name();
    let invalid = |msg: &str| Err(ConfigError::Invalid(format!("step '{}': {}", name, msg)));

    match step {
        StepConfig::Script(c) => {
            if c.code.is_some() == c.code_path.is_some() {
                return invalid("exactly one of code and code_path must be set");
            }
            if c.outputs.is_empty() {
                return invalid("at least one output is required");
            }
            validate_fields(name, "input", &c.inputs)?;
            validate_fields(name, "output", &c.outputs)?;
        }
        StepConfig::Transform(c) => {
            if c.input.is_empty() {
                return invalid("input must not be empty");
            }
            for op in &c.operations {
                if let TransformOp::MinMaxScale { min, max, column } = op {
                    if max <= min {
                        return invalid(&format!("minMaxScale on '{}' needs max > min", column));
                    }
                }
            }
        }
        StepConfig::Model(c) => {
            if c.backend.trim().is_empty() {
                return invalid("backend must not be empty");
            }
            if c.inputs.is_empty() {
                return invalid("at least one input is required");
            }
            validate_fields(name, "input", &c.inputs)?;
            validate_fields(name, "output", &c.outputs)?;
            if c.top_k == 0 {
                return invalid("top_k must be at least 1");
            }
            if !(0.0..=1.0).contains(&c.iou_threshold) || !(0.0..=1.0).contains(&c.score_threshold) {
                return invalid("iou_threshold and score_threshold must lie in [0, 1]");
            }
            if let Some(parallel) = &c.parallel_inference {
                validate_parallel(&format!("step '{}' parallel_inference", name), parallel)?;
            }
        }
        StepConfig::Image(c) => {
            let size = match c.output_size() {
                Some(size) => size,
                None => return invalid("resize or crop must be set so the output shape is fixed"),
            };
            if size.width == 0 || size.height == 0 {
                return invalid("output size must be non-zero");
            }
            if let (Some(resize), Some(crop)) = (c.resize, c.crop) {
                if crop.width > resize.width || crop.height > resize.height {
                    return invalid("crop must fit inside resize");
                }
            }
            if c.resize.is_none() && c.crop.is_some() {
                // cropping an arbitrary input needs a known source size
                return invalid("crop requires resize");
            }
            let channels = c.color.channels();
            for (label, values) in [("mean", &c.mean), ("std", &c.std)] {
                if !values.is_empty() && values.len() != 1 && values.len() != channels {
                    return invalid(&format!("{} needs 1 or {} values", label, channels));
                }
            }
            if c.std.iter().any(|s| *s == 0.0) {
                return invalid("std must not contain zero");
            }
            if !matches!(c.input_kind, ValueKind::Image | ValueKind::Bytes) {
                return invalid("input_kind must be image or bytes");
            }
        }
        StepConfig::Concat(c) => {
            if c.inputs.len() < 2 {
                return invalid("concat needs at least two inputs");
            }
            if c.output.is_empty() {
                return invalid("output must not be empty");
            }
        }
        StepConfig::JsonExpander(c) => {
            if c.mappings.is_empty() {
                return invalid("at least one mapping is required");
            }
            let mut outputs = HashSet::new();
            for mapping in &c.mappings {
                if !outputs.insert(mapping.output.as_str()) {
                    return invalid(&format!("duplicate output '{}'", mapping.output));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn script_step() -> serde_json::Value {
        json!({
            "type": "script",
            "name": "add",
            "code": "second = first + 2",
            "inputs": [{"name": "first", "kind": "list"}],
            "outputs": [{"name": "second", "kind": "list"}]
        })
    }

    fn parse(value: serde_json::Value) -> GatewayConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_host, "0.0.0.0");
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.parallel_inference.workers, 1);
        assert_eq!(config.parallel_inference.queue_limit, 64);
        assert_eq!(config.parallel_inference.inference_mode, InferenceMode::Sequential);
    }

    #[test]
    fn test_camel_case_aliases() {
        let config = parse(json!({
            "httpPort": 9000,
            "inputDataFormat": "numpy",
            "parallelInference": {"workers": 2, "queueLimit": 8, "inferenceMode": "BATCHED"},
            "pipeline": {"steps": [script_step()]}
        }));
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.input_data_format, Some(Encoding::Numpy));
        assert_eq!(config.parallel_inference.queue_limit, 8);
        assert_eq!(config.parallel_inference.inference_mode, InferenceMode::Batched);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_step_discriminator() {
        let config = parse(json!({
            "pipeline": {"steps": [
                script_step(),
                {"type": "json-expander", "name": "expand", "input": "doc",
                 "mappings": [{"path": "a.b", "output": "b", "kind": "string"}]},
                {"type": "transform", "name": "t",
                 "operations": [{"op": "rename", "from": "x", "to": "y"},
                                {"op": "oneHot", "column": "c", "categories": ["a", "b"]}]}
            ]}
        }));
        let types: Vec<_> = config.pipeline.steps.iter().map(StepConfig::type_name).collect();
        assert_eq!(types, vec!["script", "json-expander", "transform"]);
    }

    #[test]
    fn test_rejects_empty_pipeline() {
        let err = GatewayConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("pipeline.steps"));
    }

    #[test]
    fn test_rejects_duplicate_step_names() {
        let config = parse(json!({"pipeline": {"steps": [script_step(), script_step()]}}));
        assert!(config.validate().unwrap_err().to_string().contains("duplicate step name"));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let config = parse(json!({
            "parallelInference": {"workers": 0},
            "pipeline": {"steps": [script_step()]}
        }));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_image_step_needs_fixed_size() {
        let config = parse(json!({
            "pipeline": {"steps": [{"type": "image", "name": "img", "layout": "nchw"}]}
        }));
        assert!(config.validate().unwrap_err().to_string().contains("resize or crop"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(
            &path,
            json!({"http_port": 7000, "pipeline": {"steps": [script_step()]}}).to_string(),
        )
        .unwrap();
        let config = GatewayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.http_port, 7000);
        assert_eq!(config.pipeline.steps.len(), 1);
    }
}
