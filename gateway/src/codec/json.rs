//! The JSON encoding.
//!
//! Plain JSON values map onto scalars, lists and nested records. Richer
//! values use single-key wrapper objects:
//!
//! ```json
//! {"ndArray": {"type": "float32", "shape": [2, 2], "data": [[1, 2], [3, 4]]}}
//! {"image": {"format": "rgb8", "width": 2, "height": 1, "data": "<base64>"}}
//! {"bytes": "<base64>"}
//! {"table": {"columns": [{"name": "age", "type": "int64", "values": [3, 4]}]}}
//! ```
//!
//! Decoding is guided by the consumer's schema: a plain array sent for a
//! tensor field becomes a tensor, for a list field a list.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::{json, Map, Number, Value as Json};

use modelgate_common::{
    checked_element_count, BoundingBox, Column, ColumnData, DType, FieldSpec, Image, PixelFormat,
    Record, Schema, Table, Tensor, Value, ValueKind,
};

use crate::codec::image;
use crate::error::{GatewayError, Result};

fn bad(field: &str, msg: impl std::fmt::Display) -> GatewayError {
    GatewayError::BadRequest(format!("field '{}': {}", field, msg))
}

/// Decode a JSON object body into a record.
pub fn decode_record(body: &[u8], schema: &Schema) -> Result<Record> {
    let parsed: Json = serde_json::from_slice(body)
        .map_err(|e| GatewayError::BadRequest(format!("malformed JSON body: {}", e)))?;
    let object = match parsed {
        Json::Object(object) => object,
        other => {
            return Err(GatewayError::BadRequest(format!(
                "JSON body must be an object, got {}",
                json_type(&other)
            )))
        }
    };
    object_to_record(&object, Some(schema))
}

fn object_to_record(object: &Map<String, Json>, schema: Option<&Schema>) -> Result<Record> {
    let mut record = Record::new();
    for (name, json) in object {
        let spec = schema.and_then(|s| s.field(name));
        record.insert(name.clone(), value_from_json(name, json, spec)?)?;
    }
    Ok(record)
}

/// Convert one JSON value. `spec` is the consumer's declaration of the field,
/// when it has one.
pub fn value_from_json(name: &str, json: &Json, spec: Option<&FieldSpec>) -> Result<Value> {
    let kind = spec.map(|s| s.kind);

    if let Json::Object(object) = json {
        if object.len() == 1 {
            let (key, inner) = object.iter().next().map(|(k, v)| (k.as_str(), v)).unwrap_or(("", json));
            match key {
                "ndArray" => return Ok(Value::Tensor(nd_array(name, inner)?)),
                "image" => return Ok(Value::Image(image_object(name, inner)?)),
                "bytes" => return Ok(Value::Bytes(base64_field(name, inner)?)),
                "table" => return Ok(Value::Table(table_object(name, inner)?)),
                _ => {}
            }
        }
        return Ok(Value::Record(object_to_record(object, None)?));
    }

    match (json, kind) {
        (Json::Null, _) => Err(bad(name, "null is not a value")),
        (Json::Bool(b), Some(ValueKind::Tensor)) => Ok(Value::Tensor(Tensor::new(
            DType::Bool,
            vec![],
            vec![u8::from(*b)],
        )?)),
        (Json::Bool(b), _) => Ok(Value::Bool(*b)),
        (Json::Number(n), kind) => number(name, n, kind, spec.and_then(|s| s.dtype)),
        (Json::String(s), Some(ValueKind::Bytes)) => Ok(Value::Bytes(decode_base64(name, s)?)),
        (Json::String(s), Some(ValueKind::Image)) => {
            Ok(Value::Image(image::decode(&decode_base64(name, s)?)?))
        }
        (Json::String(s), _) => Ok(Value::String(s.clone())),
        (Json::Array(items), Some(ValueKind::Tensor)) => {
            let dtype = spec.and_then(|s| s.dtype);
            Ok(Value::Tensor(nested_to_tensor(name, json, items, dtype)?))
        }
        (Json::Array(_), Some(ValueKind::BoundingBoxes)) => Ok(Value::BoundingBoxes(
            serde_json::from_value(json.clone()).map_err(|e| bad(name, e))?,
        )),
        (Json::Array(items), _) => {
            if !items.is_empty() && items.iter().all(looks_like_box) {
                let boxes: Vec<BoundingBox> =
                    serde_json::from_value(json.clone()).map_err(|e| bad(name, e))?;
                return Ok(Value::BoundingBoxes(boxes));
            }
            let values = items
                .iter()
                .map(|item| value_from_json(name, item, None))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::list(values)?)
        }
        (Json::Object(_), _) => Err(bad(name, "unexpected object")),
    }
}

fn looks_like_box(json: &Json) -> bool {
    json.as_object()
        .map(|o| ["cx", "cy", "w", "h"].iter().all(|k| o.contains_key(*k)))
        .unwrap_or(false)
}

fn number(name: &str, n: &Number, kind: Option<ValueKind>, dtype: Option<DType>) -> Result<Value> {
    let float = n.as_f64().ok_or_else(|| bad(name, "number out of range"))?;
    Ok(match kind {
        Some(ValueKind::Int32) => {
            let v = n.as_i64().ok_or_else(|| bad(name, "expected an integer"))?;
            Value::Int32(i32::try_from(v).map_err(|_| bad(name, "integer out of int32 range"))?)
        }
        Some(ValueKind::Int64) => {
            Value::Int64(n.as_i64().ok_or_else(|| bad(name, "expected an integer"))?)
        }
        Some(ValueKind::Float32) => Value::Float32(float as f32),
        Some(ValueKind::Float64) => Value::Float64(float),
        Some(ValueKind::Tensor) => match (n.as_i64(), dtype) {
            (Some(i), None) => Value::Tensor(Tensor::from_i64(vec![], &[i])?),
            (Some(i), Some(dtype)) => Value::Tensor(Tensor::from_i64_values(dtype, vec![], &[i])?),
            (None, dtype) => Value::Tensor(Tensor::from_f64_values(
                dtype.unwrap_or(DType::F64),
                vec![],
                &[float],
            )?),
        },
        _ => match n.as_i64() {
            Some(i) => Value::Int64(i),
            None => Value::Float64(float),
        },
    })
}

fn json_type(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "an array",
        Json::Object(_) => "an object",
    }
}

fn decode_base64(name: &str, s: &str) -> Result<Bytes> {
    BASE64
        .decode(s.trim())
        .map(Bytes::from)
        .map_err(|e| bad(name, format!("invalid base64: {}", e)))
}

fn base64_field(name: &str, json: &Json) -> Result<Bytes> {
    let s = json.as_str().ok_or_else(|| bad(name, "base64 data must be a string"))?;
    decode_base64(name, s)
}

/// Shape of a nested array, checking that it is not ragged.
fn infer_shape(name: &str, json: &Json) -> Result<Vec<usize>> {
    match json {
        Json::Array(items) => {
            let mut shape = vec![items.len()];
            if let Some(first) = items.first() {
                let inner = infer_shape(name, first)?;
                for item in &items[1..] {
                    if infer_shape(name, item)? != inner {
                        return Err(bad(name, "ragged nested array"));
                    }
                }
                shape.extend(inner);
            }
            Ok(shape)
        }
        _ => Ok(Vec::new()),
    }
}

fn flatten<'a>(json: &'a Json, out: &mut Vec<&'a Json>) {
    match json {
        Json::Array(items) => items.iter().for_each(|item| flatten(item, out)),
        leaf => out.push(leaf),
    }
}

fn nested_to_tensor(name: &str, json: &Json, items: &[Json], dtype: Option<DType>) -> Result<Tensor> {
    let shape = infer_shape(name, json)?;
    let mut leaves = Vec::new();
    items.iter().for_each(|item| flatten(item, &mut leaves));
    let dtype = dtype.unwrap_or_else(|| infer_dtype(&leaves));
    leaves_to_tensor(name, dtype, shape, &leaves)
}

fn infer_dtype(leaves: &[&Json]) -> DType {
    if leaves.iter().all(|l| l.is_boolean()) && !leaves.is_empty() {
        DType::Bool
    } else if leaves.iter().all(|l| l.is_string()) && !leaves.is_empty() {
        DType::String
    } else if leaves.iter().all(|l| l.is_i64()) {
        DType::I64
    } else {
        DType::F64
    }
}

fn leaves_to_tensor(name: &str, dtype: DType, shape: Vec<usize>, leaves: &[&Json]) -> Result<Tensor> {
    match dtype {
        DType::String => {
            let values = leaves
                .iter()
                .map(|l| l.as_str().map(str::to_owned).ok_or_else(|| bad(name, "expected strings")))
                .collect::<Result<Vec<_>>>()?;
            Ok(Tensor::from_strings(shape, values)?)
        }
        DType::Bool => {
            let values = leaves
                .iter()
                .map(|l| match l {
                    Json::Bool(b) => Ok(i64::from(*b)),
                    other => other.as_i64().ok_or_else(|| bad(name, "expected booleans")),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Tensor::from_i64_values(DType::Bool, shape, &values)?)
        }
        d if d.is_float() => {
            let values = leaves
                .iter()
                .map(|l| l.as_f64().ok_or_else(|| bad(name, "expected numbers")))
                .collect::<Result<Vec<_>>>()?;
            Ok(Tensor::from_f64_values(d, shape, &values)?)
        }
        d => {
            let values = leaves
                .iter()
                .map(|l| {
                    l.as_i64()
                        .or_else(|| l.as_u64().map(|u| u as i64))
                        .ok_or_else(|| bad(name, format!("expected {} integers", d)))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Tensor::from_i64_values(d, shape, &values)?)
        }
    }
}

fn nd_array(name: &str, json: &Json) -> Result<Tensor> {
    let object = json.as_object().ok_or_else(|| bad(name, "ndArray must be an object"))?;
    let dtype: DType = match object.get("type") {
        Some(t) => serde_json::from_value(t.clone())
            .map_err(|_| bad(name, format!("unknown ndArray type {}", t)))?,
        None => return Err(bad(name, "ndArray has no type")),
    };
    let data = object.get("data").ok_or_else(|| bad(name, "ndArray has no data"))?;
    let mut leaves = Vec::new();
    flatten(data, &mut leaves);
    let shape = match object.get("shape") {
        Some(shape) => serde_json::from_value::<Vec<usize>>(shape.clone())
            .map_err(|_| bad(name, "ndArray shape must be a list of extents"))?,
        None => infer_shape(name, data)?,
    };
    let expected = checked_element_count(&shape).map_err(|e| bad(name, e))?;
    if leaves.len() != expected {
        return Err(GatewayError::SchemaMismatch(format!(
            "field '{}': ndArray has {} elements but shape {:?} needs {}",
            name,
            leaves.len(),
            shape,
            expected
        )));
    }
    leaves_to_tensor(name, dtype, shape, &leaves)
}

fn image_object(name: &str, json: &Json) -> Result<Image> {
    let object = json.as_object().ok_or_else(|| bad(name, "image must be an object"))?;
    let data = base64_field(name, object.get("data").unwrap_or(&Json::Null))?;
    let format = object.get("format").and_then(Json::as_str).unwrap_or("png");
    match format {
        "png" | "jpeg" | "jpg" | "bmp" => image::decode(&data),
        raw => {
            let format: PixelFormat = serde_json::from_value(json!(raw))
                .map_err(|_| bad(name, format!("unknown image format '{}'", raw)))?;
            let dim = |key: &str| {
                object
                    .get(key)
                    .and_then(Json::as_u64)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| bad(name, format!("raw image needs a {}", key)))
            };
            Ok(Image::new(format, dim("width")?, dim("height")?, data)?)
        }
    }
}

fn table_object(name: &str, json: &Json) -> Result<Table> {
    let columns = json
        .get("columns")
        .and_then(Json::as_array)
        .ok_or_else(|| bad(name, "table needs a columns array"))?;
    let mut out = Vec::with_capacity(columns.len());
    for column in columns {
        let column_name = column
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| bad(name, "table column needs a name"))?;
        let values = column
            .get("values")
            .and_then(Json::as_array)
            .ok_or_else(|| bad(name, format!("column '{}' needs values", column_name)))?;
        let leaves: Vec<&Json> = values.iter().collect();
        let dtype = match column.get("type") {
            Some(t) => serde_json::from_value(t.clone())
                .map_err(|_| bad(name, format!("unknown column type {}", t)))?,
            None => infer_dtype(&leaves),
        };
        let tensor = leaves_to_tensor(name, dtype, vec![leaves.len()], &leaves)?;
        out.push(Column::new(column_name, ColumnData::from_tensor(&tensor)?));
    }
    Ok(Table::new(out)?)
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a record as a JSON object body.
pub fn encode_record(record: &Record) -> Result<Bytes> {
    serde_json::to_vec(&record_to_json(record))
        .map(Bytes::from)
        .map_err(|e| GatewayError::Internal(format!("cannot encode JSON: {}", e)))
}

pub fn record_to_json(record: &Record) -> Json {
    Json::Object(
        record
            .iter()
            .map(|(name, value)| (name.to_string(), value_to_json(value)))
            .collect(),
    )
}

/// An `f32` through its shortest decimal representation, so `0.87f32`
/// is written as `0.87` rather than `0.8700000047683716`.
fn f32_json(v: f32) -> Json {
    v.to_string()
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Json::Number)
        .unwrap_or(Json::Null)
}

fn f64_json(v: f64) -> Json {
    Number::from_f64(v).map(Json::Number).unwrap_or(Json::Null)
}

pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Bool(v) => json!(v),
        Value::Int32(v) => json!(v),
        Value::Int64(v) => json!(v),
        Value::Float32(v) => f32_json(*v),
        Value::Float64(v) => f64_json(*v),
        Value::String(v) => json!(v),
        Value::Bytes(v) => json!({ "bytes": BASE64.encode(v) }),
        Value::Tensor(t) => json!({
            "ndArray": {
                "type": t.dtype(),
                "shape": t.shape(),
                "data": tensor_data(t),
            }
        }),
        Value::Image(i) => json!({
            "image": {
                "format": i.format(),
                "width": i.width(),
                "height": i.height(),
                "data": BASE64.encode(i.pixels()),
            }
        }),
        Value::Table(t) => json!({
            "table": {
                "columns": t.columns().iter().map(|c| json!({
                    "name": c.name,
                    "type": c.data.dtype(),
                    "values": column_values(&c.data),
                })).collect::<Vec<_>>(),
            }
        }),
        Value::List(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Record(r) => record_to_json(r),
        Value::BoundingBoxes(boxes) => Json::Array(boxes.iter().map(bbox_json).collect()),
    }
}

fn bbox_json(b: &BoundingBox) -> Json {
    let mut object = Map::new();
    object.insert("cx".into(), f32_json(b.cx));
    object.insert("cy".into(), f32_json(b.cy));
    object.insert("w".into(), f32_json(b.w));
    object.insert("h".into(), f32_json(b.h));
    if let Some(label) = &b.label {
        object.insert("label".into(), json!(label));
    }
    if let Some(p) = b.probability {
        object.insert("probability".into(), f32_json(p));
    }
    Json::Object(object)
}

fn tensor_data(t: &Tensor) -> Json {
    if let Some(strings) = t.strings() {
        return json!(strings);
    }
    let dtype = t.dtype();
    let values: Vec<Json> = if dtype == DType::F64 {
        t.to_f64_vec().unwrap_or_default().into_iter().map(f64_json).collect()
    } else if dtype.is_float() {
        t.to_f32_vec().unwrap_or_default().into_iter().map(f32_json).collect()
    } else if dtype == DType::Bool {
        t.to_i64_vec().unwrap_or_default().into_iter().map(|v| json!(v != 0)).collect()
    } else {
        t.to_i64_vec().unwrap_or_default().into_iter().map(|v| json!(v)).collect()
    };
    Json::Array(values)
}

fn column_values(data: &ColumnData) -> Json {
    match data {
        ColumnData::Bool(v) => json!(v),
        ColumnData::Int32(v) => json!(v),
        ColumnData::Int64(v) => json!(v),
        ColumnData::Float32(v) => Json::Array(v.iter().map(|x| f32_json(*x)).collect()),
        ColumnData::Float64(v) => Json::Array(v.iter().map(|x| f64_json(*x)).collect()),
        ColumnData::Utf8(v) => json!(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_common::Dim;

    fn decode(body: Json, schema: &Schema) -> Result<Record> {
        decode_record(body.to_string().as_bytes(), schema)
    }

    #[test]
    fn test_plain_list_without_schema() {
        let record = decode(json!({"first": [1, 2, 3]}), &Schema::default()).unwrap();
        assert_eq!(
            record.get("first"),
            Some(&Value::List(vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)]))
        );
    }

    #[test]
    fn test_plain_array_for_tensor_field() {
        let schema = Schema::new(vec![FieldSpec::tensor("x")
            .with_dtype(DType::F32)
            .with_shape(vec![Dim::Any, Dim::Fixed(2)])]);
        let record = decode(json!({"x": [[1, 2], [3, 4.5]]}), &schema).unwrap();
        let tensor = record.get("x").and_then(Value::as_tensor).unwrap();
        assert_eq!(tensor.dtype(), DType::F32);
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.5]);
    }

    #[test]
    fn test_nd_array_keeps_declared_type() {
        let body = json!({"first": {"ndArray": {"type": "int32", "shape": [1, 3], "data": [1, 2, 3]}}});
        let record = decode(body, &Schema::default()).unwrap();
        let tensor = record.get("first").and_then(Value::as_tensor).unwrap();
        assert_eq!(tensor.dtype(), DType::I32);
        assert_eq!(tensor.shape(), &[1, 3]);
    }

    #[test]
    fn test_nd_array_element_count_mismatch() {
        let body = json!({"x": {"ndArray": {"type": "float32", "shape": [2, 2], "data": [1, 2, 3]}}});
        assert_eq!(decode(body, &Schema::default()).unwrap_err().kind(), "SchemaMismatch");
    }

    #[test]
    fn test_nd_array_overflowing_shape() {
        let body = br#"{"x":{"ndArray":{"type":"float32","shape":[4294967296,4294967296],"data":[]}}}"#;
        let err = decode_record(body, &Schema::default()).unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
        assert!(err.to_string().contains("field 'x'"));
    }

    #[test]
    fn test_field_order_is_kept() {
        let record = decode_record(br#"{"zeta": 1, "alpha": 2, "mid": 3}"#, &Schema::default()).unwrap();
        assert_eq!(record.names().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid"]);

        let body = encode_record(&record).unwrap();
        assert_eq!(&body[..], br#"{"zeta":1,"alpha":2,"mid":3}"#);
    }

    #[test]
    fn test_non_object_body() {
        let err = decode_record(b"[1, 2]", &Schema::default()).unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
        let err = decode_record(b"{not json", &Schema::default()).unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }

    #[test]
    fn test_heterogeneous_list_is_rejected() {
        let err = decode(json!({"x": [1, "two"]}), &Schema::default()).unwrap_err();
        assert_eq!(err.kind(), "SchemaMismatch");
    }

    #[test]
    fn test_bounding_boxes() {
        let body = json!({"boxes": [{"cx": 0.5, "cy": 0.5, "w": 0.2, "h": 0.1, "label": "cat"}]});
        let record = decode(body, &Schema::default()).unwrap();
        match record.get("boxes") {
            Some(Value::BoundingBoxes(boxes)) => assert_eq!(boxes[0].label.as_deref(), Some("cat")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_f32_written_shortest() {
        assert_eq!(value_to_json(&Value::Float32(0.87)).to_string(), "0.87");
        assert_eq!(value_to_json(&Value::Float32(f32::NAN)), Json::Null);
    }

    #[test]
    fn test_round_trip_rich_values() {
        let table = Table::new(vec![
            Column::new("age", ColumnData::Int64(vec![3, 4])),
            Column::new("name", ColumnData::Utf8(vec!["a".into(), "b".into()])),
        ])
        .unwrap();
        let record = Record::new()
            .with("t", Tensor::from_f32(vec![2, 1], &[0.25, -1.0]).unwrap())
            .unwrap()
            .with("img", Image::new(PixelFormat::Gray8, 2, 1, vec![0u8, 255]).unwrap())
            .unwrap()
            .with("table", table)
            .unwrap()
            .with("raw", Value::Bytes(Bytes::from_static(b"\x00\x01")))
            .unwrap()
            .with("nested", Record::new().with("k", "v").unwrap())
            .unwrap();

        let body = encode_record(&record).unwrap();
        let decoded = decode_record(&body, &Schema::default()).unwrap();
        assert_eq!(decoded, record);
    }
}
