//! Dense-layer backend loaded from a JSON weights file.
//!
//! ```json
//! {
//!   "input": "features",
//!   "output": "scores",
//!   "weights": [[0.1, 0.9], [0.4, -0.2], [0.0, 1.0]],
//!   "bias": [0.0, 0.5],
//!   "activation": "softmax"
//! }
//! ```
//!
//! `weights` is `[inputs][outputs]`. Each row of the input tensor (leading
//! axis for rank ≥ 2) produces one row of the output tensor.

use std::path::Path;

use serde::Deserialize;

use modelgate_common::{Record, Tensor, Value};

use super::{input_tensor, rows_and_features, BackendError, ModelBackend, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    None,
    Softmax,
    Sigmoid,
}

#[derive(Debug, Clone, Deserialize)]
struct LinearModel {
    #[serde(default = "default_input")]
    input: String,
    #[serde(default = "default_output")]
    output: String,
    weights: Vec<Vec<f32>>,
    #[serde(default)]
    bias: Vec<f32>,
    #[serde(default)]
    activation: Activation,
}

fn default_input() -> String {
    "input".to_string()
}

fn default_output() -> String {
    "output".to_string()
}

/// A single dense layer `y = act(x · W + b)`.
#[derive(Debug, Default)]
pub struct LinearBackend {
    model: Option<LinearModel>,
}

impl LinearBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(model: &LinearModel) -> Result<()> {
        let outputs = model.weights.first().map(Vec::len).unwrap_or(0);
        if model.weights.is_empty() || outputs == 0 {
            return Err(BackendError::LoadFailed("weights must be a non-empty matrix".into()));
        }
        if let Some(row) = model.weights.iter().position(|r| r.len() != outputs) {
            return Err(BackendError::LoadFailed(format!(
                "weights row {} has {} columns, expected {}",
                row,
                model.weights[row].len(),
                outputs
            )));
        }
        if !model.bias.is_empty() && model.bias.len() != outputs {
            return Err(BackendError::LoadFailed(format!(
                "bias has {} entries, expected {}",
                model.bias.len(),
                outputs
            )));
        }
        Ok(())
    }

    fn forward(model: &LinearModel, record: &Record) -> Result<Record> {
        let tensor = input_tensor(record, &model.input)?;
        let (rows, features) = rows_and_features(tensor);
        let inputs = model.weights.len();
        let outputs = model.weights[0].len();
        if features != inputs {
            return Err(BackendError::InvalidInput(format!(
                "expected {} features per row, got {}",
                inputs, features
            )));
        }
        let x = tensor
            .to_f32_vec()
            .map_err(|e| BackendError::InvalidInput(e.to_string()))?;

        let mut y = Vec::with_capacity(rows * outputs);
        for row in x.chunks_exact(inputs.max(1)).take(rows) {
            let mut out: Vec<f32> = (0..outputs)
                .map(|j| {
                    let dot: f32 = row.iter().zip(&model.weights).map(|(xi, w)| xi * w[j]).sum();
                    dot + model.bias.get(j).copied().unwrap_or(0.0)
                })
                .collect();
            apply_activation(model.activation, &mut out);
            y.extend(out);
        }

        let output = Tensor::from_f32(vec![rows, outputs], &y)
            .map_err(|e| BackendError::InferenceFailed(e.to_string()))?;
        Record::new()
            .with(model.output.clone(), Value::Tensor(output))
            .map_err(|e| BackendError::InferenceFailed(e.to_string()))
    }
}

fn apply_activation(activation: Activation, values: &mut [f32]) {
    match activation {
        Activation::None => {}
        Activation::Sigmoid => {
            for v in values.iter_mut() {
                *v = 1.0 / (1.0 + (-*v).exp());
            }
        }
        Activation::Softmax => {
            let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for v in values.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            if sum > 0.0 {
                for v in values.iter_mut() {
                    *v /= sum;
                }
            }
        }
    }
}

impl ModelBackend for LinearBackend {
    fn kind(&self) -> &'static str {
        "linear"
    }

    fn reentrant(&self) -> bool {
        true
    }

    fn load(&mut self, path: Option<&Path>) -> Result<()> {
        let path = path.ok_or_else(|| BackendError::LoadFailed("linear backend needs a model path".into()))?;
        let raw = std::fs::read_to_string(path)?;
        let model: LinearModel = serde_json::from_str(&raw)?;
        Self::validate(&model)?;
        tracing::info!(
            "Loaded linear model from {} ({}x{}, {:?})",
            path.display(),
            model.weights.len(),
            model.weights[0].len(),
            model.activation
        );
        self.model = Some(model);
        Ok(())
    }

    fn run(&self, batch: &[Record]) -> Result<Vec<Record>> {
        let model = self.model.as_ref().ok_or(BackendError::NotLoaded)?;
        batch.iter().map(|record| Self::forward(model, record)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load(json: &str) -> Result<LinearBackend> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let mut backend = LinearBackend::new();
        backend.load(Some(file.path()))?;
        Ok(backend)
    }

    #[test]
    fn test_forward_pass() {
        let backend = load(
            r#"{"input": "x", "output": "y", "weights": [[1.0, 0.0], [0.0, 2.0]], "bias": [0.5, 0.0]}"#,
        )
        .unwrap();
        let record = Record::new()
            .with("x", Tensor::from_f32(vec![2, 2], &[1.0, 1.0, 2.0, 3.0]).unwrap())
            .unwrap();
        let out = backend.run(&[record]).unwrap();
        let y = out[0].get("y").and_then(Value::as_tensor).unwrap();
        assert_eq!(y.shape(), &[2, 2]);
        assert_eq!(y.to_f32_vec().unwrap(), vec![1.5, 2.0, 2.5, 6.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let backend = load(r#"{"weights": [[1.0, 2.0, 3.0]], "activation": "softmax"}"#).unwrap();
        let record = Record::new()
            .with("input", Tensor::from_f32(vec![1, 1], &[1.0]).unwrap())
            .unwrap();
        let out = backend.run(&[record]).unwrap();
        let y = out[0].get("output").and_then(Value::as_tensor).unwrap().to_f32_vec().unwrap();
        assert!((y.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(y[2] > y[1] && y[1] > y[0]);
    }

    #[test]
    fn test_feature_mismatch() {
        let backend = load(r#"{"weights": [[1.0], [1.0]]}"#).unwrap();
        let record = Record::new()
            .with("input", Tensor::from_f32(vec![1, 3], &[1.0, 2.0, 3.0]).unwrap())
            .unwrap();
        assert!(matches!(backend.run(&[record]), Err(BackendError::InvalidInput(_))));
    }

    #[test]
    fn test_ragged_weights_rejected() {
        assert!(matches!(
            load(r#"{"weights": [[1.0, 2.0], [1.0]]}"#),
            Err(BackendError::LoadFailed(_))
        ));
    }

    #[test]
    fn test_run_before_load() {
        let backend = LinearBackend::new();
        assert!(matches!(backend.run(&[Record::new()]), Err(BackendError::NotLoaded)));
    }
}
