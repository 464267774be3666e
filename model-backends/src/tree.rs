//! Tree-ensemble backend (gradient-boosted / random-forest style).
//!
//! The model file lists trees as flat node arrays. Node 0 is the root and
//! children always come after their parent:
//!
//! ```json
//! {
//!   "base_score": 0.5,
//!   "objective": "binary",
//!   "trees": [
//!     {"nodes": [
//!       {"feature": 0, "threshold": 1.5, "left": 1, "right": 2},
//!       {"leaf": -0.4},
//!       {"leaf": 0.7}
//!     ]}
//!   ]
//! }
//! ```

use std::path::Path;

use serde::Deserialize;

use modelgate_common::{Record, Tensor, Value};

use super::{input_tensor, rows_and_features, BackendError, ModelBackend, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    /// Raw sum of leaves plus base score.
    #[default]
    Regression,
    /// Sigmoid of the raw sum.
    Binary,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Node {
    Leaf {
        leaf: f32,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
        /// Direction taken when the feature is NaN.
        #[serde(default)]
        missing_left: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn evaluate(&self, features: &[f32]) -> f32 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { leaf } => return *leaf,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    missing_left,
                } => {
                    let x = features.get(*feature).copied().unwrap_or(f32::NAN);
                    let go_left = if x.is_nan() { *missing_left } else { x < *threshold };
                    index = if go_left { *left } else { *right };
                }
            }
        }
    }

    /// Highest feature index referenced, and structural checks that make
    /// `evaluate` terminate.
    fn check(&self, tree: usize) -> Result<Option<usize>> {
        if self.nodes.is_empty() {
            return Err(BackendError::LoadFailed(format!("tree {} has no nodes", tree)));
        }
        let mut max_feature = None;
        for (i, node) in self.nodes.iter().enumerate() {
            if let Node::Split {
                feature, left, right, ..
            } = node
            {
                for child in [*left, *right] {
                    if child <= i || child >= self.nodes.len() {
                        return Err(BackendError::LoadFailed(format!(
                            "tree {} node {} has invalid child {}",
                            tree, i, child
                        )));
                    }
                }
                max_feature = max_feature.max(Some(*feature));
            }
        }
        Ok(max_feature)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TreeModel {
    #[serde(default = "default_input")]
    input: String,
    #[serde(default = "default_output")]
    output: String,
    #[serde(default)]
    base_score: f32,
    #[serde(default)]
    objective: Objective,
    trees: Vec<Tree>,
}

fn default_input() -> String {
    "input".to_string()
}

fn default_output() -> String {
    "output".to_string()
}

/// Sums the leaf reached in every tree for each input row.
#[derive(Debug, Default)]
pub struct TreeEnsembleBackend {
    model: Option<TreeModel>,
    features: usize,
}

impl TreeEnsembleBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn predict(model: &TreeModel, row: &[f32]) -> f32 {
        let raw = model.base_score + model.trees.iter().map(|t| t.evaluate(row)).sum::<f32>();
        match model.objective {
            Objective::Regression => raw,
            Objective::Binary => 1.0 / (1.0 + (-raw).exp()),
        }
    }
}

impl ModelBackend for TreeEnsembleBackend {
    fn kind(&self) -> &'static str {
        "tree-ensemble"
    }

    fn reentrant(&self) -> bool {
        true
    }

    fn load(&mut self, path: Option<&Path>) -> Result<()> {
        let path = path
            .ok_or_else(|| BackendError::LoadFailed("tree-ensemble backend needs a model path".into()))?;
        let raw = std::fs::read_to_string(path)?;
        let model: TreeModel = serde_json::from_str(&raw)?;
        let mut max_feature = None;
        for (i, tree) in model.trees.iter().enumerate() {
            max_feature = max_feature.max(tree.check(i)?);
        }
        self.features = max_feature.map(|f| f + 1).unwrap_or(0);
        tracing::info!(
            "Loaded tree ensemble from {} ({} trees, {} features)",
            path.display(),
            model.trees.len(),
            self.features
        );
        self.model = Some(model);
        Ok(())
    }

    fn run(&self, batch: &[Record]) -> Result<Vec<Record>> {
        let model = self.model.as_ref().ok_or(BackendError::NotLoaded)?;
        batch
            .iter()
            .map(|record| {
                let tensor = input_tensor(record, &model.input)?;
                let (rows, width) = rows_and_features(tensor);
                if width < self.features {
                    return Err(BackendError::InvalidInput(format!(
                        "expected at least {} features per row, got {}",
                        self.features, width
                    )));
                }
                let x = tensor
                    .to_f32_vec()
                    .map_err(|e| BackendError::InvalidInput(e.to_string()))?;
                let y: Vec<f32> = (0..rows)
                    .map(|r| Self::predict(model, &x[r * width..(r + 1) * width]))
                    .collect();
                let output = Tensor::from_f32(vec![rows, 1], &y)
                    .map_err(|e| BackendError::InferenceFailed(e.to_string()))?;
                Record::new()
                    .with(model.output.clone(), Value::Tensor(output))
                    .map_err(|e| BackendError::InferenceFailed(e.to_string()))
            })
            .collect()
    }
}
