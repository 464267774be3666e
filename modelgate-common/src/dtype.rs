//! Tensor element types.

use serde::{Deserialize, Serialize};

/// Element type of a tensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    #[serde(alias = "int8")]
    I8,
    #[serde(alias = "int16")]
    I16,
    #[serde(alias = "int32", alias = "int")]
    I32,
    #[serde(alias = "int64", alias = "long")]
    I64,
    #[serde(alias = "uint8")]
    U8,
    #[serde(alias = "uint16")]
    U16,
    #[serde(alias = "uint32")]
    U32,
    #[serde(alias = "uint64")]
    U64,
    #[serde(alias = "float16", alias = "half")]
    F16,
    #[serde(alias = "bfloat16")]
    Bf16,
    #[serde(alias = "float32", alias = "float")]
    F32,
    #[serde(alias = "float64", alias = "double")]
    F64,
    #[serde(alias = "utf8")]
    String,
}

impl DType {
    /// All element types, in declaration order.
    pub const ALL: [DType; 14] = [
        DType::Bool,
        DType::I8,
        DType::I16,
        DType::I32,
        DType::I64,
        DType::U8,
        DType::U16,
        DType::U32,
        DType::U64,
        DType::F16,
        DType::Bf16,
        DType::F32,
        DType::F64,
        DType::String,
    ];

    /// Width of one element in bytes. `None` for strings.
    pub fn width(self) -> Option<usize> {
        match self {
            DType::Bool | DType::I8 | DType::U8 => Some(1),
            DType::I16 | DType::U16 | DType::F16 | DType::Bf16 => Some(2),
            DType::I32 | DType::U32 | DType::F32 => Some(4),
            DType::I64 | DType::U64 | DType::F64 => Some(8),
            DType::String => None,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32 | DType::F64)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::I8
                | DType::I16
                | DType::I32
                | DType::I64
                | DType::U8
                | DType::U16
                | DType::U32
                | DType::U64
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::String => "string",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_serialization() {
        assert_eq!(serde_json::to_string(&DType::Bf16).unwrap(), r#""bf16""#);
        let parsed: DType = serde_json::from_str(r#""float32""#).unwrap();
        assert_eq!(parsed, DType::F32);
    }

    #[test]
    fn test_display_matches_serde_name() {
        for dtype in DType::ALL {
            let json = serde_json::to_string(&dtype).unwrap();
            assert_eq!(json, format!("\"{}\"", dtype));
        }
    }

    #[test]
    fn test_widths() {
        assert_eq!(DType::Bool.width(), Some(1));
        assert_eq!(DType::Bf16.width(), Some(2));
        assert_eq!(DType::F64.width(), Some(8));
        assert_eq!(DType::String.width(), None);
    }
}
