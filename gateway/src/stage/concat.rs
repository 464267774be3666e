//! Tensor concatenation along one axis.

use async_trait::async_trait;
use bytes::BytesMut;

use modelgate_common::{DType, FieldSpec, Record, Schema, Tensor, Value};

use crate::config::ConcatStepConfig;
use crate::error::{GatewayError, Result};
use crate::stage::{RequestContext, Stage};

pub struct ConcatStage {
    config: ConcatStepConfig,
    schema_in: Schema,
    schema_out: Schema,
}

impl ConcatStage {
    pub fn new(config: ConcatStepConfig) -> Self {
        let spec = |name: &str| match config.dtype {
            Some(dtype) => FieldSpec::tensor(name).with_dtype(dtype),
            None => FieldSpec::tensor(name),
        };
        Self {
            schema_in: Schema::new(config.inputs.iter().map(|n| spec(n)).collect()),
            schema_out: Schema::new(vec![spec(&config.output)]),
            config,
        }
    }
}

#[async_trait]
impl Stage for ConcatStage {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> &'static str {
        "concat"
    }

    fn schema_in(&self) -> &Schema {
        &self.schema_in
    }

    fn schema_out(&self) -> &Schema {
        &self.schema_out
    }

    async fn apply(&self, input: &Record, _ctx: &RequestContext) -> Result<Record> {
        let tensors = self
            .config
            .inputs
            .iter()
            .map(|name| {
                input
                    .get(name)
                    .and_then(Value::as_tensor)
                    .map(|t| (name.as_str(), t))
                    .ok_or_else(|| GatewayError::BadRequest(format!("missing tensor field '{}'", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        let joined = concat(&tensors, self.config.axis)
            .map_err(|e| GatewayError::SchemaMismatch(format!("stage '{}': {}", self.config.name, e)))?;
        Ok(Record::new().with(self.config.output.clone(), joined)?)
    }
}

/// Resolve a possibly negative axis against `rank`.
fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&axis).then_some(axis as usize)
}

/// Concatenate named tensors along `axis`. Every tensor must share the
/// element type, rank and all extents except the one on `axis`.
pub fn concat(tensors: &[(&str, &Tensor)], axis: i64) -> std::result::Result<Tensor, String> {
    let (first_name, first) = *tensors.first().ok_or("nothing to concatenate")?;
    let rank = first.rank();
    let axis = normalize_axis(axis, rank)
        .ok_or_else(|| format!("axis {} is out of range for rank {}", axis, rank))?;

    for (name, tensor) in &tensors[1..] {
        if tensor.dtype() != first.dtype() {
            return Err(format!(
                "field '{}': element type {} does not match '{}' ({})",
                name,
                tensor.dtype(),
                first_name,
                first.dtype()
            ));
        }
        if tensor.rank() != rank {
            return Err(format!(
                "field '{}': rank {} does not match '{}' (rank {})",
                name,
                tensor.rank(),
                first_name,
                rank
            ));
        }
        for (dim, (a, b)) in first.shape().iter().zip(tensor.shape()).enumerate() {
            if dim != axis && a != b {
                return Err(format!(
                    "field '{}': dimension {} is {}, expected {}",
                    name, dim, b, a
                ));
            }
        }
    }

    let mut shape = first.shape().to_vec();
    shape[axis] = tensors.iter().map(|(_, t)| t.shape()[axis]).sum();
    let outer: usize = first.shape()[..axis].iter().product();
    // elements in one slab of a tensor below `axis`
    let inner: usize = first.shape()[axis + 1..].iter().product();

    if first.dtype() == DType::String {
        let mut out = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for (_, tensor) in tensors {
                let slab = tensor.shape()[axis] * inner;
                let strings = tensor.strings().unwrap_or_default();
                out.extend_from_slice(&strings[o * slab..(o + 1) * slab]);
            }
        }
        return Tensor::from_strings(shape, out).map_err(|e| e.to_string());
    }

    let width = first.dtype().width().ok_or("tensor has no fixed element width")?;
    let mut out = BytesMut::with_capacity(shape.iter().product::<usize>() * width);
    for o in 0..outer {
        for (name, tensor) in tensors {
            let payload = tensor
                .payload()
                .ok_or_else(|| format!("field '{}' has no numeric payload", name))?;
            let slab = tensor.shape()[axis] * inner * width;
            out.extend_from_slice(&payload[o * slab..(o + 1) * slab]);
        }
    }
    Tensor::new(first.dtype(), shape, out.freeze()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_concat_last_axis() {
        let a = Tensor::from_i32(vec![2, 2], &[1, 2, 3, 4]).unwrap();
        let b = Tensor::from_i32(vec![2, 1], &[5, 6]).unwrap();
        let joined = concat(&[("a", &a), ("b", &b)], -1).unwrap();
        assert_eq!(joined.shape(), &[2, 3]);
        assert_eq!(joined.to_i64_vec().unwrap(), vec![1, 2, 5, 3, 4, 6]);
    }

    #[test]
    fn test_concat_first_axis() {
        let a = Tensor::from_f32(vec![1, 2], &[1.0, 2.0]).unwrap();
        let b = Tensor::from_f32(vec![2, 2], &[3.0, 4.0, 5.0, 6.0]).unwrap();
        let joined = concat(&[("a", &a), ("b", &b)], 0).unwrap();
        assert_eq!(joined.shape(), &[3, 2]);
        assert_eq!(joined.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_concat_strings() {
        let a = Tensor::from_strings(vec![2], vec!["a".into(), "b".into()]).unwrap();
        let b = Tensor::from_strings(vec![1], vec!["c".into()]).unwrap();
        let joined = concat(&[("a", &a), ("b", &b)], 0).unwrap();
        assert_eq!(joined.strings().unwrap(), &["a", "b", "c"]);
    }

    #[test]
    fn test_zero_extent_input() {
        let a = Tensor::from_f32(vec![2, 0], &[]).unwrap();
        let b = Tensor::from_f32(vec![2, 1], &[1.0, 2.0]).unwrap();
        let joined = concat(&[("a", &a), ("b", &b)], 1).unwrap();
        assert_eq!(joined.shape(), &[2, 1]);
    }

    #[test]
    fn test_mismatched_extent() {
        let a = Tensor::from_f32(vec![2, 2], &[0.0; 4]).unwrap();
        let b = Tensor::from_f32(vec![3, 2], &[0.0; 6]).unwrap();
        let err = concat(&[("a", &a), ("b", &b)], 1).unwrap_err();
        assert_eq!(err, "field 'b': dimension 0 is 3, expected 2");
    }

    #[test]
    fn test_mismatched_dtype() {
        let a = Tensor::from_f32(vec![1], &[0.0]).unwrap();
        let b = Tensor::from_i32(vec![1], &[0]).unwrap();
        assert!(concat(&[("a", &a), ("b", &b)], 0).unwrap_err().contains("element type"));
    }

    #[test]
    fn test_axis_out_of_range() {
        let a = Tensor::from_f32(vec![1], &[0.0]).unwrap();
        assert!(concat(&[("a", &a), ("b", &a)], 2).unwrap_err().contains("out of range"));
    }

    #[tokio::test]
    async fn test_stage_apply() {
        let stage = ConcatStage::new(ConcatStepConfig {
            name: "join".into(),
            inputs: vec!["left".into(), "right".into()],
            output: "both".into(),
            axis: 0,
            dtype: Some(DType::F32),
        });
        let input = Record::new()
            .with("left", Tensor::from_f32(vec![1], &[1.0]).unwrap())
            .unwrap()
            .with("right", Tensor::from_f32(vec![1], &[2.0]).unwrap())
            .unwrap();
        let output = stage
            .apply(&input, &RequestContext::new(Duration::from_secs(1)))
            .await
            .unwrap();
        stage.schema_out().validate(&output).unwrap();
        let both = output.get("both").and_then(Value::as_tensor).unwrap();
        assert_eq!(both.to_f32_vec().unwrap(), vec![1.0, 2.0]);
    }
}
