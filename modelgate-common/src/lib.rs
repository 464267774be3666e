//! modelgate Common Types
//!
//! The data model shared by the gateway and the model backends: the
//! [`Record`] that flows between pipeline stages, the [`Value`] variants it
//! holds, and the [`Schema`] each stage boundary declares.

pub mod bbox;
pub mod dtype;
pub mod error;
pub mod image;
pub mod record;
pub mod schema;
pub mod table;
pub mod tensor;
pub mod value;

pub use bbox::BoundingBox;
pub use dtype::DType;
pub use error::{SchemaError, ValueError};
pub use image::{Image, PixelFormat};
pub use record::Record;
pub use schema::{Dim, FieldSpec, Schema, ValueKind};
pub use table::{Column, ColumnData, Table};
pub use tensor::{checked_byte_len, checked_element_count, Tensor, TensorData};
pub use value::Value;
