//! The polymorphic value carried by record fields.

use bytes::Bytes;

use crate::bbox::BoundingBox;
use crate::error::ValueError;
use crate::image::Image;
use crate::record::Record;
use crate::schema::ValueKind;
use crate::table::Table;
use crate::tensor::Tensor;

/// A tagged value. Equality is structural.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Bytes),
    Tensor(Tensor),
    Image(Image),
    Table(Table),
    List(Vec<Value>),
    Record(Record),
    BoundingBoxes(Vec<BoundingBox>),
}

impl Value {
    /// Build a list, checking that every element has the same kind.
    pub fn list(values: Vec<Value>) -> Result<Self, ValueError> {
        if let Some(first) = values.first() {
            let kind = first.kind();
            if let Some(other) = values.iter().find(|v| v.kind() != kind) {
                return Err(ValueError::HeterogeneousList {
                    first: kind.to_string(),
                    other: other.kind().to_string(),
                });
            }
        }
        Ok(Value::List(values))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int32(_) => ValueKind::Int32,
            Value::Int64(_) => ValueKind::Int64,
            Value::Float32(_) => ValueKind::Float32,
            Value::Float64(_) => ValueKind::Float64,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Tensor(_) => ValueKind::Tensor,
            Value::Image(_) => ValueKind::Image,
            Value::Table(_) => ValueKind::Table,
            Value::List(_) => ValueKind::List,
            Value::Record(_) => ValueKind::Record,
            Value::BoundingBoxes(_) => ValueKind::BoundingBoxes,
        }
    }

    /// True for the scalar kinds (numbers, booleans, strings, byte buffers).
    pub fn is_scalar(&self) -> bool {
        self.kind().is_scalar()
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&Image> {
        match self {
            Value::Image(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric scalar widened to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// A zero value of the given kind, used to pre-warm stages.
    pub fn zero_of(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int32 => Value::Int32(0),
            ValueKind::Int64 => Value::Int64(0),
            ValueKind::Float32 => Value::Float32(0.0),
            ValueKind::Float64 => Value::Float64(0.0),
            ValueKind::String => Value::String(String::new()),
            ValueKind::Bytes => Value::Bytes(Bytes::new()),
            ValueKind::Tensor => Value::Tensor(Tensor::zeros(crate::dtype::DType::F32, vec![])),
            ValueKind::Image => Value::Image(Image::zeroed(crate::image::PixelFormat::Rgb8, 1, 1)),
            ValueKind::Table => Value::Table(Table::default()),
            ValueKind::List => Value::List(Vec::new()),
            ValueKind::Record => Value::Record(Record::new()),
            ValueKind::BoundingBoxes => Value::BoundingBoxes(Vec::new()),
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Tensor(t)
    }
}

impl From<Image> for Value {
    fn from(i: Image) -> Self {
        Value::Image(i)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Value::Table(t)
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Self {
        Value::Record(r)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_requires_homogeneous_kind() {
        assert!(Value::list(vec![Value::Int64(1), Value::Int64(2)]).is_ok());
        assert!(Value::list(vec![]).is_ok());
        let err = Value::list(vec![Value::Int64(1), Value::String("a".into())]).unwrap_err();
        assert_eq!(
            err,
            ValueError::HeterogeneousList {
                first: "int64".into(),
                other: "string".into()
            }
        );
    }

    #[test]
    fn test_structural_equality() {
        let a = Value::Tensor(Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap());
        let b = Value::Tensor(Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap());
        let c = Value::Tensor(Tensor::from_f32(vec![1, 2], &[1.0, 2.0]).unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_zero_values_match_kind() {
        for kind in ValueKind::ALL {
            assert_eq!(Value::zero_of(kind).kind(), kind);
        }
    }
}
