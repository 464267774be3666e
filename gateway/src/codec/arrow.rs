//! Arrow IPC file bodies.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use bytes::Bytes;

use modelgate_common::{Column, ColumnData, Record, Schema, Table, Value, ValueKind};

use crate::error::{GatewayError, Result};

pub const CONTENT_TYPE: &str = "application/vnd.apache.arrow.file";

fn bad(msg: impl std::fmt::Display) -> GatewayError {
    GatewayError::BadRequest(format!("malformed arrow body: {}", msg))
}

/// Decode an IPC file into one table, concatenating its record batches.
pub fn decode(data: &[u8]) -> Result<Table> {
    let reader = FileReader::try_new(Cursor::new(data), None).map_err(bad)?;
    let schema = reader.schema();
    let mut columns: Vec<Option<ColumnData>> = vec![None; schema.fields().len()];

    for batch in reader {
        let batch = batch.map_err(bad)?;
        for (i, array) in batch.columns().iter().enumerate() {
            let field = schema.field(i);
            let chunk = column_from_array(field.name(), array)?;
            columns[i] = Some(match columns[i].take() {
                None => chunk,
                Some(existing) => append(field.name(), existing, chunk)?,
            });
        }
    }

    let columns = schema
        .fields()
        .iter()
        .zip(columns)
        .map(|(field, data)| {
            let data = data.unwrap_or_else(|| empty_column(field.data_type()));
            Column::new(field.name().clone(), data)
        })
        .collect();
    Ok(Table::new(columns)?)
}

fn empty_column(data_type: &DataType) -> ColumnData {
    match native_type(data_type) {
        DataType::Boolean => ColumnData::Bool(Vec::new()),
        DataType::Int32 => ColumnData::Int32(Vec::new()),
        DataType::Int64 => ColumnData::Int64(Vec::new()),
        DataType::Float32 => ColumnData::Float32(Vec::new()),
        DataType::Utf8 => ColumnData::Utf8(Vec::new()),
        _ => ColumnData::Float64(Vec::new()),
    }
}

/// Column type an arrow type is widened to.
fn native_type(data_type: &DataType) -> DataType {
    match data_type {
        DataType::Boolean => DataType::Boolean,
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::UInt8 | DataType::UInt16 => {
            DataType::Int32
        }
        DataType::Int64 | DataType::UInt32 | DataType::UInt64 => DataType::Int64,
        DataType::Float16 | DataType::Float32 => DataType::Float32,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => DataType::Utf8,
        _ => DataType::Float64,
    }
}

fn column_from_array(name: &str, array: &ArrayRef) -> Result<ColumnData> {
    if array.null_count() > 0 {
        return Err(bad(format!("column '{}' contains nulls", name)));
    }
    let target = native_type(array.data_type());
    let array = if array.data_type() == &target {
        array.clone()
    } else {
        cast(array, &target)
            .map_err(|e| bad(format!("column '{}' has unsupported type: {}", name, e)))?
    };

    let wrong = || bad(format!("column '{}' could not be read", name));
    Ok(match target {
        DataType::Boolean => {
            let a = array.as_any().downcast_ref::<BooleanArray>().ok_or_else(wrong)?;
            ColumnData::Bool(a.iter().map(|v| v.unwrap_or(false)).collect())
        }
        DataType::Int32 => {
            let a = array.as_any().downcast_ref::<Int32Array>().ok_or_else(wrong)?;
            ColumnData::Int32(a.values().to_vec())
        }
        DataType::Int64 => {
            let a = array.as_any().downcast_ref::<Int64Array>().ok_or_else(wrong)?;
            ColumnData::Int64(a.values().to_vec())
        }
        DataType::Float32 => {
            let a = array.as_any().downcast_ref::<Float32Array>().ok_or_else(wrong)?;
            ColumnData::Float32(a.values().to_vec())
        }
        DataType::Utf8 => {
            let a = array.as_any().downcast_ref::<StringArray>().ok_or_else(wrong)?;
            ColumnData::Utf8(a.iter().map(|v| v.unwrap_or_default().to_string()).collect())
        }
        _ => {
            let a = array.as_any().downcast_ref::<Float64Array>().ok_or_else(wrong)?;
            ColumnData::Float64(a.values().to_vec())
        }
    })
}

fn append(name: &str, existing: ColumnData, chunk: ColumnData) -> Result<ColumnData> {
    Ok(match (existing, chunk) {
        (ColumnData::Bool(mut a), ColumnData::Bool(b)) => {
            a.extend(b);
            ColumnData::Bool(a)
        }
        (ColumnData::Int32(mut a), ColumnData::Int32(b)) => {
            a.extend(b);
            ColumnData::Int32(a)
        }
        (ColumnData::Int64(mut a), ColumnData::Int64(b)) => {
            a.extend(b);
            ColumnData::Int64(a)
        }
        (ColumnData::Float32(mut a), ColumnData::Float32(b)) => {
            a.extend(b);
            ColumnData::Float32(a)
        }
        (ColumnData::Float64(mut a), ColumnData::Float64(b)) => {
            a.extend(b);
            ColumnData::Float64(a)
        }
        (ColumnData::Utf8(mut a), ColumnData::Utf8(b)) => {
            a.extend(b);
            ColumnData::Utf8(a)
        }
        _ => return Err(bad(format!("column '{}' changes type between batches", name))),
    })
}

/// Bind a decoded table to the consumer's schema: the whole table when it
/// asks for a single table field, otherwise one field per column.
pub fn table_to_record(table: Table, schema: &Schema) -> Result<Record> {
    let mut record = Record::new();
    if let [only] = schema.fields() {
        if only.kind == ValueKind::Table {
            record.insert(only.name.clone(), Value::Table(table))?;
            return Ok(record);
        }
    }

    for column in table.into_columns() {
        let kind = schema.field(&column.name).map(|f| f.kind);
        let value = match (kind, &column.data) {
            (Some(ValueKind::List), data) => Value::list(column_scalars(data, data.len()))?,
            (Some(k), data) if k.is_scalar() && data.len() == 1 => column_scalars(data, 1)
                .into_iter()
                .next()
                .ok_or_else(|| bad(format!("column '{}' is empty", column.name)))?,
            (_, data) => Value::Tensor(data.to_tensor()?),
        };
        record.insert(column.name, value)?;
    }
    Ok(record)
}

fn column_scalars(data: &ColumnData, len: usize) -> Vec<Value> {
    let values: Vec<Value> = match data {
        ColumnData::Bool(v) => v.iter().map(|x| Value::Bool(*x)).collect(),
        ColumnData::Int32(v) => v.iter().map(|x| Value::Int32(*x)).collect(),
        ColumnData::Int64(v) => v.iter().map(|x| Value::Int64(*x)).collect(),
        ColumnData::Float32(v) => v.iter().map(|x| Value::Float32(*x)).collect(),
        ColumnData::Float64(v) => v.iter().map(|x| Value::Float64(*x)).collect(),
        ColumnData::Utf8(v) => v.iter().map(|x| Value::String(x.clone())).collect(),
    };
    values.into_iter().take(len).collect()
}

/// The inverse of [`table_to_record`] for responses: a single table field,
/// or a record of equally long 1-D tensors. `None` when the record has
/// another shape.
pub fn record_to_table(record: &Record) -> Option<Table> {
    let mut fields = record.iter();
    if let (Some((_, Value::Table(table))), None) = (fields.next(), fields.next()) {
        return Some(table.clone());
    }
    if record.is_empty() {
        return None;
    }
    let columns = record
        .iter()
        .map(|(name, value)| match value {
            Value::Tensor(t) if t.rank() == 1 => ColumnData::from_tensor(t)
                .ok()
                .map(|data| Column::new(name, data)),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Table::new(columns).ok()
}

fn column_array(data: &ColumnData) -> (DataType, ArrayRef) {
    match data {
        ColumnData::Bool(v) => (DataType::Boolean, Arc::new(BooleanArray::from(v.clone()))),
        ColumnData::Int32(v) => (DataType::Int32, Arc::new(Int32Array::from(v.clone()))),
        ColumnData::Int64(v) => (DataType::Int64, Arc::new(Int64Array::from(v.clone()))),
        ColumnData::Float32(v) => (DataType::Float32, Arc::new(Float32Array::from(v.clone()))),
        ColumnData::Float64(v) => (DataType::Float64, Arc::new(Float64Array::from(v.clone()))),
        ColumnData::Utf8(v) => (DataType::Utf8, Arc::new(StringArray::from(v.clone()))),
    }
}

/// Encode a table as an IPC file with a single record batch.
pub fn encode(table: &Table) -> Result<Bytes> {
    let internal = |e: arrow::error::ArrowError| GatewayError::Internal(format!("arrow: {}", e));

    let (fields, arrays): (Vec<Field>, Vec<ArrayRef>) = table
        .columns()
        .iter()
        .map(|c| {
            let (data_type, array) = column_array(&c.data);
            (Field::new(c.name.clone(), data_type, false), array)
        })
        .unzip();
    let schema = Arc::new(ArrowSchema::new(fields));
    let options = RecordBatchOptions::new().with_row_count(Some(table.row_count()));
    let batch = RecordBatch::try_new_with_options(schema.clone(), arrays, &options).map_err(internal)?;

    let mut writer = FileWriter::try_new(Vec::new(), &schema).map_err(internal)?;
    writer.write(&batch).map_err(internal)?;
    writer.finish().map_err(internal)?;
    Ok(Bytes::from(writer.into_inner().map_err(internal)?))
}
