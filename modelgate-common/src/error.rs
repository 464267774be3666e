//! Error types for value construction and schema validation.

use thiserror::Error;

use crate::dtype::DType;

/// A value violated one of its construction invariants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("tensor payload is {actual} bytes but {dtype} shape {shape:?} requires {expected}")]
    PayloadLength {
        dtype: DType,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("tensor holds {actual} elements but shape {shape:?} requires {expected}")]
    ElementCount {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("shape {shape:?} holds more elements than fit in memory")]
    ShapeOverflow { shape: Vec<usize> },

    #[error("{0} tensors have no fixed-width numeric payload")]
    NotNumeric(DType),

    #[error("image buffer is {actual} bytes, expected {expected} for {width}x{height}")]
    ImageBuffer {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("cannot build image from tensor: {0}")]
    ImageTensor(String),

    #[error("field name must not be empty")]
    EmptyFieldName,

    #[error("duplicate field '{0}'")]
    DuplicateField(String),

    #[error("column '{column}' has {actual} rows, expected {expected}")]
    RaggedTable {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),

    #[error("list elements must share one kind: found {first} and {other}")]
    HeterogeneousList { first: String, other: String },
}

/// A record did not satisfy a declared schema.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}': expected {expected}, got {actual}")]
    KindMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("field '{field}': element type expected {expected}, got {actual}")]
    DTypeMismatch {
        field: String,
        expected: DType,
        actual: DType,
    },

    #[error("field '{field}': expected rank {expected}, got rank {actual}")]
    RankMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("field '{field}': dimension {dim} expected {expected}, got {actual}")]
    DimMismatch {
        field: String,
        dim: usize,
        expected: usize,
        actual: usize,
    },
}

impl SchemaError {
    /// Name of the offending field.
    pub fn field(&self) -> &str {
        match self {
            SchemaError::MissingField(field)
            | SchemaError::KindMismatch { field, .. }
            | SchemaError::DTypeMismatch { field, .. }
            | SchemaError::RankMismatch { field, .. }
            | SchemaError::DimMismatch { field, .. } => field,
        }
    }
}
