//! Dense row-major tensors.
//!
//! Numeric payloads are stored little-endian in an immutable [`Bytes`]
//! buffer so that tensors can be cloned and shared across threads without
//! copying. String tensors keep one owned string per element.

use std::sync::Arc;

use bytes::Bytes;
use half::{bf16, f16};

use crate::dtype::DType;
use crate::error::ValueError;

/// Backing storage of a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// Little-endian fixed-width elements.
    Bytes(Bytes),
    /// One string per element.
    Strings(Arc<[String]>),
}

/// A typed, shaped, contiguous tensor. A scalar tensor has an empty shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: TensorData,
}

/// Number of elements described by `shape`. An empty shape holds one element.
/// Only for shapes already checked by [`checked_element_count`].
fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Number of elements described by `shape`, or `ShapeOverflow` when the
/// product of the extents does not fit in a `usize`.
pub fn checked_element_count(shape: &[usize]) -> Result<usize, ValueError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| ValueError::ShapeOverflow { shape: shape.to_vec() })
}

/// Payload size in bytes of `shape` elements that are `width` bytes wide.
pub fn checked_byte_len(shape: &[usize], width: usize) -> Result<usize, ValueError> {
    checked_element_count(shape)?
        .checked_mul(width)
        .ok_or_else(|| ValueError::ShapeOverflow { shape: shape.to_vec() })
}

impl Tensor {
    /// Create a numeric tensor, checking that the payload length matches
    /// the shape and element width.
    pub fn new(dtype: DType, shape: Vec<usize>, payload: impl Into<Bytes>) -> Result<Self, ValueError> {
        let width = dtype.width().ok_or(ValueError::NotNumeric(dtype))?;
        let payload = payload.into();
        let expected = checked_byte_len(&shape, width)?;
        if payload.len() != expected {
            return Err(ValueError::PayloadLength {
                dtype,
                shape,
                expected,
                actual: payload.len(),
            });
        }
        Ok(Self {
            dtype,
            shape,
            data: TensorData::Bytes(payload),
        })
    }

    pub(crate) fn from_checked_payload(dtype: DType, shape: Vec<usize>, payload: Bytes) -> Self {
        Self {
            dtype,
            shape,
            data: TensorData::Bytes(payload),
        }
    }

    /// Create a string tensor.
    pub fn from_strings(shape: Vec<usize>, values: Vec<String>) -> Result<Self, ValueError> {
        let expected = checked_element_count(&shape)?;
        if values.len() != expected {
            return Err(ValueError::ElementCount {
                shape,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self {
            dtype: DType::String,
            shape,
            data: TensorData::Strings(values.into()),
        })
    }

    /// A tensor of the given type and shape filled with zeros (or empty strings).
    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let count = element_count(&shape);
        let data = match dtype.width() {
            Some(width) => TensorData::Bytes(Bytes::from(vec![0u8; count * width])),
            None => TensorData::Strings(vec![String::new(); count].into()),
        };
        Self { dtype, shape, data }
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, ValueError> {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::F32, shape, payload)
    }

    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self, ValueError> {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::F64, shape, payload)
    }

    pub fn from_i32(shape: Vec<usize>, values: &[i32]) -> Result<Self, ValueError> {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::I32, shape, payload)
    }

    pub fn from_i64(shape: Vec<usize>, values: &[i64]) -> Result<Self, ValueError> {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::I64, shape, payload)
    }

    pub fn from_u8(shape: Vec<usize>, values: &[u8]) -> Result<Self, ValueError> {
        Self::new(DType::U8, shape, values.to_vec())
    }

    /// Build a numeric tensor of `dtype` from `f64` values, casting each one.
    pub fn from_f64_values(dtype: DType, shape: Vec<usize>, values: &[f64]) -> Result<Self, ValueError> {
        let width = dtype.width().ok_or(ValueError::NotNumeric(dtype))?;
        let mut payload = Vec::with_capacity(values.len() * width);
        for &v in values {
            encode_f64(dtype, v, &mut payload);
        }
        Self::new(dtype, shape, payload)
    }

    /// Build a numeric tensor of `dtype` from `i64` values, casting each one.
    pub fn from_i64_values(dtype: DType, shape: Vec<usize>, values: &[i64]) -> Result<Self, ValueError> {
        if dtype.is_float() {
            let floats: Vec<f64> = values.iter().map(|&v| v as f64).collect();
            return Self::from_f64_values(dtype, shape, &floats);
        }
        let width = dtype.width().ok_or(ValueError::NotNumeric(dtype))?;
        let mut payload = Vec::with_capacity(values.len() * width);
        for &v in values {
            encode_i64(dtype, v, &mut payload);
        }
        Self::new(dtype, shape, payload)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Raw little-endian payload, `None` for string tensors.
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.data {
            TensorData::Bytes(bytes) => Some(bytes),
            TensorData::Strings(_) => None,
        }
    }

    /// String elements, `None` for numeric tensors.
    pub fn strings(&self) -> Option<&[String]> {
        match &self.data {
            TensorData::Strings(values) => Some(values),
            TensorData::Bytes(_) => None,
        }
    }

    /// Same payload under a different shape with the same element count.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self, ValueError> {
        let expected = checked_element_count(&shape)?;
        if expected != self.element_count() {
            return Err(ValueError::ElementCount {
                shape,
                expected,
                actual: self.element_count(),
            });
        }
        Ok(Self { shape, ..self })
    }

    /// Every element widened to `f64`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>, ValueError> {
        let (payload, width) = self.numeric()?;
        Ok(payload
            .chunks_exact(width)
            .map(|chunk| decode_f64(self.dtype, chunk))
            .collect())
    }

    /// Every element converted to `f32`.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>, ValueError> {
        Ok(self.to_f64_vec()?.into_iter().map(|v| v as f32).collect())
    }

    /// Every element converted to `i64`. Floats are truncated.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>, ValueError> {
        let (payload, width) = self.numeric()?;
        Ok(payload
            .chunks_exact(width)
            .map(|chunk| {
                if self.dtype.is_float() {
                    decode_f64(self.dtype, chunk) as i64
                } else {
                    decode_i64(self.dtype, chunk)
                }
            })
            .collect())
    }

    /// Convert to another numeric element type.
    pub fn cast(&self, dtype: DType) -> Result<Tensor, ValueError> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        if self.dtype.is_float() || dtype.is_float() {
            Tensor::from_f64_values(dtype, self.shape.clone(), &self.to_f64_vec()?)
        } else {
            Tensor::from_i64_values(dtype, self.shape.clone(), &self.to_i64_vec()?)
        }
    }

    fn numeric(&self) -> Result<(&Bytes, usize), ValueError> {
        match (&self.data, self.dtype.width()) {
            (TensorData::Bytes(bytes), Some(width)) => Ok((bytes, width)),
            _ => Err(ValueError::NotNumeric(self.dtype)),
        }
    }
}

fn encode_f64(dtype: DType, v: f64, out: &mut Vec<u8>) {
    match dtype {
        DType::F16 => out.extend_from_slice(&f16::from_f64(v).to_le_bytes()),
        DType::Bf16 => out.extend_from_slice(&bf16::from_f64(v).to_le_bytes()),
        DType::F32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
        DType::F64 => out.extend_from_slice(&v.to_le_bytes()),
        DType::Bool => out.push(u8::from(v != 0.0)),
        _ => encode_i64(dtype, v as i64, out),
    }
}

fn encode_i64(dtype: DType, v: i64, out: &mut Vec<u8>) {
    match dtype {
        DType::Bool => out.push(u8::from(v != 0)),
        DType::I8 => out.extend_from_slice(&(v as i8).to_le_bytes()),
        DType::I16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
        DType::I32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
        DType::I64 => out.extend_from_slice(&v.to_le_bytes()),
        DType::U8 => out.extend_from_slice(&(v as u8).to_le_bytes()),
        DType::U16 => out.extend_from_slice(&(v as u16).to_le_bytes()),
        DType::U32 => out.extend_from_slice(&(v as u32).to_le_bytes()),
        DType::U64 => out.extend_from_slice(&(v as u64).to_le_bytes()),
        DType::F16 | DType::Bf16 | DType::F32 | DType::F64 => encode_f64(dtype, v as f64, out),
        DType::String => {}
    }
}

fn decode_f64(dtype: DType, chunk: &[u8]) -> f64 {
    match dtype {
        DType::F16 => f16::from_le_bytes([chunk[0], chunk[1]]).to_f64(),
        DType::Bf16 => bf16::from_le_bytes([chunk[0], chunk[1]]).to_f64(),
        DType::F32 => f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
        DType::F64 => f64::from_le_bytes(eight(chunk)),
        DType::U64 => u64::from_le_bytes(eight(chunk)) as f64,
        _ => decode_i64(dtype, chunk) as f64,
    }
}

fn decode_i64(dtype: DType, chunk: &[u8]) -> i64 {
    match dtype {
        DType::Bool => i64::from(chunk[0] != 0),
        DType::I8 => chunk[0] as i8 as i64,
        DType::U8 => chunk[0] as i64,
        DType::I16 => i16::from_le_bytes([chunk[0], chunk[1]]) as i64,
        DType::U16 => u16::from_le_bytes([chunk[0], chunk[1]]) as i64,
        DType::I32 => i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64,
        DType::U32 => u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64,
        DType::I64 => i64::from_le_bytes(eight(chunk)),
        DType::U64 => u64::from_le_bytes(eight(chunk)) as i64,
        DType::F16 | DType::Bf16 | DType::F32 | DType::F64 => decode_f64(dtype, chunk) as i64,
        DType::String => 0,
    }
}

fn eight(chunk: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&chunk[..8]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_length_is_checked() {
        let err = Tensor::new(DType::F32, vec![2, 2], vec![0u8; 12]).unwrap_err();
        assert_eq!(
            err,
            ValueError::PayloadLength {
                dtype: DType::F32,
                shape: vec![2, 2],
                expected: 16,
                actual: 12,
            }
        );
    }

    #[test]
    fn test_zero_extent_accepts_empty_payload() {
        let tensor = Tensor::new(DType::F32, vec![3, 0], Vec::<u8>::new()).unwrap();
        assert_eq!(tensor.element_count(), 0);
        assert!(tensor.to_f32_vec().unwrap().is_empty());
    }

    #[test]
    fn test_overflowing_shape_is_rejected() {
        let shape = vec![1usize << 32, 1usize << 32];
        let err = Tensor::new(DType::F32, shape.clone(), Vec::<u8>::new()).unwrap_err();
        assert_eq!(err, ValueError::ShapeOverflow { shape: shape.clone() });

        let err = Tensor::from_strings(shape.clone(), Vec::new()).unwrap_err();
        assert_eq!(err, ValueError::ShapeOverflow { shape });

        // element count fits, byte length does not
        let err = Tensor::new(DType::F64, vec![usize::MAX / 4], Vec::<u8>::new()).unwrap_err();
        assert!(matches!(err, ValueError::ShapeOverflow { .. }));
    }

    #[test]
    fn test_reshape_to_overflowing_shape() {
        let tensor = Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap();
        let err = tensor.reshape(vec![usize::MAX, 2]).unwrap_err();
        assert!(matches!(err, ValueError::ShapeOverflow { .. }));
    }

    #[test]
    fn test_scalar_tensor_has_one_element() {
        let tensor = Tensor::from_f64(vec![], &[2.5]).unwrap();
        assert_eq!(tensor.rank(), 0);
        assert_eq!(tensor.element_count(), 1);
    }

    #[test]
    fn test_half_precision_conversion() {
        let tensor = Tensor::from_f64_values(DType::F16, vec![3], &[0.5, -1.0, 2.0]).unwrap();
        assert_eq!(tensor.payload().unwrap().len(), 6);
        assert_eq!(tensor.to_f64_vec().unwrap(), vec![0.5, -1.0, 2.0]);

        let tensor = Tensor::from_f64_values(DType::Bf16, vec![2], &[1.0, 4.0]).unwrap();
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.0, 4.0]);
    }

    #[test]
    fn test_cast_between_ints_and_floats() {
        let tensor = Tensor::from_i32(vec![3], &[1, -2, 3]).unwrap();
        let floats = tensor.cast(DType::F32).unwrap();
        assert_eq!(floats.to_f32_vec().unwrap(), vec![1.0, -2.0, 3.0]);

        let back = floats.cast(DType::I64).unwrap();
        assert_eq!(back.to_i64_vec().unwrap(), vec![1, -2, 3]);
    }

    #[test]
    fn test_string_tensor() {
        let tensor = Tensor::from_strings(vec![2], vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(tensor.strings().unwrap(), &["a".to_string(), "b".to_string()]);
        assert!(tensor.to_f64_vec().is_err());
        assert!(Tensor::from_strings(vec![3], vec!["a".into()]).is_err());
    }

    #[test]
    fn test_reshape_keeps_payload() {
        let tensor = Tensor::from_i64(vec![2, 3], &[1, 2, 3, 4, 5, 6]).unwrap();
        let reshaped = tensor.reshape(vec![3, 2]).unwrap();
        assert_eq!(reshaped.shape(), &[3, 2]);
        assert!(reshaped.reshape(vec![4]).is_err());
    }
}
