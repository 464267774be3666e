//! Schemas describing the fields that cross a stage boundary.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::dtype::DType;
use crate::error::SchemaError;
use crate::record::Record;
use crate::tensor::Tensor;
use crate::value::Value;

/// The tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueKind {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
    Tensor,
    Image,
    Table,
    List,
    Record,
    BoundingBoxes,
}

impl ValueKind {
    pub const ALL: [ValueKind; 13] = [
        ValueKind::Bool,
        ValueKind::Int32,
        ValueKind::Int64,
        ValueKind::Float32,
        ValueKind::Float64,
        ValueKind::String,
        ValueKind::Bytes,
        ValueKind::Tensor,
        ValueKind::Image,
        ValueKind::Table,
        ValueKind::List,
        ValueKind::Record,
        ValueKind::BoundingBoxes,
    ];

    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            ValueKind::Bool
                | ValueKind::Int32
                | ValueKind::Int64
                | ValueKind::Float32
                | ValueKind::Float64
                | ValueKind::String
                | ValueKind::Bytes
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Bool => "bool",
            ValueKind::Int32 => "int32",
            ValueKind::Int64 => "int64",
            ValueKind::Float32 => "float32",
            ValueKind::Float64 => "float64",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::Tensor => "tensor",
            ValueKind::Image => "image",
            ValueKind::Table => "table",
            ValueKind::List => "list",
            ValueKind::Record => "record",
            ValueKind::BoundingBoxes => "boundingBoxes",
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One extent of a declared tensor shape. Serialized as an integer, with
/// `-1` standing for a dynamic extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    Fixed(usize),
    Any,
}

impl Serialize for Dim {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Dim::Fixed(n) => serializer.serialize_i64(*n as i64),
            Dim::Any => serializer.serialize_i64(-1),
        }
    }
}

impl<'de> Deserialize<'de> for Dim {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = i64::deserialize(deserializer)?;
        Ok(if n < 0 { Dim::Any } else { Dim::Fixed(n as usize) })
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{}", n),
            Dim::Any => f.write_str("N"),
        }
    }
}

/// A named field with its expected kind and, for tensors, optional element
/// type and shape constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<Dim>>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            dtype: None,
            shape: None,
        }
    }

    pub fn tensor(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Tensor)
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_shape(mut self, shape: Vec<Dim>) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Check that a field produced as `producer` satisfies this (consumer)
    /// field. Dynamic extents on either side are compatible with anything.
    pub fn accepts(&self, producer: &FieldSpec) -> Result<(), String> {
        if self.kind != producer.kind {
            return Err(format!(
                "field '{}': consumer expects {}, producer declares {}",
                self.name, self.kind, producer.kind
            ));
        }
        if let (Some(want), Some(have)) = (self.dtype, producer.dtype) {
            if want != have {
                return Err(format!(
                    "field '{}': consumer expects element type {}, producer declares {}",
                    self.name, want, have
                ));
            }
        }
        if let (Some(want), Some(have)) = (&self.shape, &producer.shape) {
            if want.len() != have.len() {
                return Err(format!(
                    "field '{}': consumer expects rank {}, producer declares rank {}",
                    self.name,
                    want.len(),
                    have.len()
                ));
            }
            for (i, (w, h)) in want.iter().zip(have).enumerate() {
                if let (Dim::Fixed(w), Dim::Fixed(h)) = (w, h) {
                    if w != h {
                        return Err(format!(
                            "field '{}': dimension {} consumer expects {}, producer declares {}",
                            self.name, i, w, h
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Check a concrete value against this field.
    pub fn check(&self, value: &Value) -> Result<(), SchemaError> {
        if value.kind() != self.kind {
            return Err(SchemaError::KindMismatch {
                field: self.name.clone(),
                expected: self.kind.to_string(),
                actual: value.kind().to_string(),
            });
        }
        if let Value::Tensor(tensor) = value {
            self.check_tensor(tensor)?;
        }
        Ok(())
    }

    fn check_tensor(&self, tensor: &Tensor) -> Result<(), SchemaError> {
        if let Some(shape) = &self.shape {
            if shape.len() != tensor.rank() {
                return Err(SchemaError::RankMismatch {
                    field: self.name.clone(),
                    expected: shape.len(),
                    actual: tensor.rank(),
                });
            }
            for (dim, (want, &have)) in shape.iter().zip(tensor.shape()).enumerate() {
                if let Dim::Fixed(want) = *want {
                    if want != have {
                        return Err(SchemaError::DimMismatch {
                            field: self.name.clone(),
                            dim,
                            expected: want,
                            actual: have,
                        });
                    }
                }
            }
        }
        if let Some(dtype) = self.dtype {
            if dtype != tensor.dtype() {
                return Err(SchemaError::DTypeMismatch {
                    field: self.name.clone(),
                    expected: dtype,
                    actual: tensor.dtype(),
                });
            }
        }
        Ok(())
    }

    /// A zero value satisfying this field. Dynamic extents become 1.
    pub fn zero_value(&self) -> Value {
        match self.kind {
            ValueKind::Tensor => {
                let shape = self
                    .shape
                    .as_ref()
                    .map(|dims| {
                        dims.iter()
                            .map(|d| match d {
                                Dim::Fixed(n) => *n,
                                Dim::Any => 1,
                            })
                            .collect()
                    })
                    .unwrap_or_else(|| vec![1]);
                Value::Tensor(Tensor::zeros(self.dtype.unwrap_or(DType::F32), shape))
            }
            kind => Value::zero_of(kind),
        }
    }
}

/// An ordered list of field specifications.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// `self ⊑ consumer`: every field the consumer needs is produced here
    /// with an equal kind and compatible constraints.
    pub fn is_subtype_of(&self, consumer: &Schema) -> Result<(), String> {
        for want in &consumer.fields {
            let have = self
                .field(&want.name)
                .ok_or_else(|| format!("field '{}' is not produced", want.name))?;
            want.accepts(have)?;
        }
        Ok(())
    }

    /// Check that `record` carries every declared field with a conforming
    /// value. Extra fields are allowed.
    pub fn validate(&self, record: &Record) -> Result<(), SchemaError> {
        for spec in &self.fields {
            let value = record
                .get(&spec.name)
                .ok_or_else(|| SchemaError::MissingField(spec.name.clone()))?;
            spec.check(value)?;
        }
        Ok(())
    }

    /// A record of zero values satisfying this schema.
    pub fn zero_record(&self) -> Record {
        let mut record = Record::new();
        for spec in &self.fields {
            // names in a schema are unique, so this cannot collide
            let _ = record.insert(spec.name.clone(), spec.zero_value());
        }
        record
    }
}

impl From<Vec<FieldSpec>> for Schema {
    fn from(fields: Vec<FieldSpec>) -> Self {
        Self::new(fields)
    }
}
