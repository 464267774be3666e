//! Columnar tables.

use crate::dtype::DType;
use crate::error::ValueError;
use crate::tensor::Tensor;

/// A homogeneous column vector.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Bool(Vec<bool>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Bool(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float32(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Utf8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type of the column expressed as a tensor element type.
    pub fn dtype(&self) -> DType {
        match self {
            ColumnData::Bool(_) => DType::Bool,
            ColumnData::Int32(_) => DType::I32,
            ColumnData::Int64(_) => DType::I64,
            ColumnData::Float32(_) => DType::F32,
            ColumnData::Float64(_) => DType::F64,
            ColumnData::Utf8(_) => DType::String,
        }
    }

    /// Convert the column to a 1-D tensor.
    pub fn to_tensor(&self) -> Result<Tensor, ValueError> {
        let shape = vec![self.len()];
        match self {
            ColumnData::Bool(v) => {
                Tensor::new(DType::Bool, shape, v.iter().map(|&b| u8::from(b)).collect::<Vec<_>>())
            }
            ColumnData::Int32(v) => Tensor::from_i32(shape, v),
            ColumnData::Int64(v) => Tensor::from_i64(shape, v),
            ColumnData::Float32(v) => Tensor::from_f32(shape, v),
            ColumnData::Float64(v) => Tensor::from_f64(shape, v),
            ColumnData::Utf8(v) => Tensor::from_strings(shape, v.clone()),
        }
    }

    /// Build a column from a 1-D tensor. Narrow integer and float types are
    /// widened to the nearest column type.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self, ValueError> {
        if let Some(strings) = tensor.strings() {
            return Ok(ColumnData::Utf8(strings.to_vec()));
        }
        Ok(match tensor.dtype() {
            DType::Bool => ColumnData::Bool(tensor.to_i64_vec()?.into_iter().map(|v| v != 0).collect()),
            DType::I8 | DType::I16 | DType::I32 | DType::U8 | DType::U16 => {
                ColumnData::Int32(tensor.to_i64_vec()?.into_iter().map(|v| v as i32).collect())
            }
            DType::I64 | DType::U32 | DType::U64 => ColumnData::Int64(tensor.to_i64_vec()?),
            DType::F16 | DType::Bf16 | DType::F32 => ColumnData::Float32(tensor.to_f32_vec()?),
            DType::F64 => ColumnData::Float64(tensor.to_f64_vec()?),
            DType::String => ColumnData::Utf8(Vec::new()),
        })
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// An ordered set of equally long, uniquely named columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self, ValueError> {
        if let Some(first) = columns.first() {
            let expected = first.data.len();
            for (i, column) in columns.iter().enumerate() {
                if column.data.len() != expected {
                    return Err(ValueError::RaggedTable {
                        column: column.name.clone(),
                        expected,
                        actual: column.data.len(),
                    });
                }
                if columns[..i].iter().any(|c| c.name == column.name) {
                    return Err(ValueError::DuplicateColumn(column.name.clone()));
                }
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or(0)
    }
}
