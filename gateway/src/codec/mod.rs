//! Wire codecs: turning request bodies into records and records into
//! response bodies.

pub mod arrow;
pub mod image;
pub mod json;
pub mod multipart;
pub mod npy;

use std::path::Path;
use std::str::FromStr;

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use modelgate_common::{Record, Schema, Tensor, Value};

use crate::error::{GatewayError, Result};

/// A wire encoding named in the `/{out}/{in}` URL segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Json,
    Numpy,
    Arrow,
    Image,
    /// Same framing as `numpy`, served as `application/octet-stream`.
    Nd4j,
}

impl Encoding {
    pub const ALL: [Encoding; 5] = [
        Encoding::Json,
        Encoding::Numpy,
        Encoding::Arrow,
        Encoding::Image,
        Encoding::Nd4j,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Numpy => "numpy",
            Encoding::Arrow => "arrow",
            Encoding::Image => "image",
            Encoding::Nd4j => "nd4j",
        }
    }

    /// Media type of a single-field body in this encoding.
    pub fn content_type(self) -> &'static str {
        match self {
            Encoding::Json => "application/json",
            Encoding::Numpy => npy::CONTENT_TYPE,
            Encoding::Nd4j => "application/octet-stream",
            Encoding::Arrow => arrow::CONTENT_TYPE,
            Encoding::Image => "image/png",
        }
    }

    fn is_tensor_blob(self) -> bool {
        matches!(self, Encoding::Numpy | Encoding::Nd4j)
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        Encoding::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| GatewayError::UnsupportedMedia(format!("unknown encoding '{}'", s)))
    }
}

/// Resolve the `/{out}/{in}` pair, checking it against the configured formats.
pub fn negotiate(
    out: &str,
    input: &str,
    configured_out: Option<Encoding>,
    configured_in: Option<Encoding>,
) -> Result<(Encoding, Encoding)> {
    let out: Encoding = out.parse()?;
    let input: Encoding = input.parse()?;
    for (label, requested, configured) in [
        ("input", input, configured_in),
        ("output", out, configured_out),
    ] {
        if let Some(configured) = configured {
            if configured != requested {
                return Err(GatewayError::UnsupportedMedia(format!(
                    "{} encoding '{}' is not served; this gateway is configured for '{}'",
                    label, requested, configured
                )));
            }
        }
    }
    Ok((out, input))
}

/// Collect a request body, failing as soon as it grows past `limit` bytes.
/// A body of exactly `limit` bytes is accepted.
pub async fn read_body(body: Body, limit: usize) -> Result<Bytes> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| GatewayError::BadRequest(format!("failed to read request body: {}", e)))?;
        if buf.len() + chunk.len() > limit {
            return Err(GatewayError::PayloadTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// What a decoder needs to know about the pipeline it feeds.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// Input schema of the first stage that will run.
    pub schema: &'a Schema,
    /// Where large multipart parts are spooled.
    pub uploads_dir: Option<&'a Path>,
}

impl DecodeContext<'_> {
    /// Field a bare single-value body binds to: the only input field, or
    /// `default` when the stage declares no inputs.
    fn single_field(&self) -> Result<String> {
        match self.schema.fields() {
            [] => Ok("default".to_string()),
            [only] => Ok(only.name.clone()),
            fields => Err(GatewayError::BadRequest(format!(
                "the pipeline expects {} input fields ({}); send them as multipart/form-data",
                fields.len(),
                self.schema.names().collect::<Vec<_>>().join(", ")
            ))),
        }
    }
}

fn is_multipart(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

/// Decode a request body into the record fed to the pipeline.
pub async fn decode(
    encoding: Encoding,
    content_type: Option<&str>,
    body: Bytes,
    ctx: &DecodeContext<'_>,
) -> Result<Record> {
    if let Some(content_type) = content_type.filter(|ct| is_multipart(Some(ct))) {
        return multipart::decode(body, content_type, encoding, ctx).await;
    }

    match encoding {
        Encoding::Json => json::decode_record(&body, ctx.schema),
        Encoding::Numpy | Encoding::Nd4j => {
            let tensor = npy::decode(&body)?;
            bind_single(ctx, Value::Tensor(tensor))
        }
        Encoding::Image => {
            let image = image::decode(&body)?;
            bind_single(ctx, Value::Image(image))
        }
        Encoding::Arrow => {
            let table = arrow::decode(&body)?;
            arrow::table_to_record(table, ctx.schema)
        }
    }
}

fn bind_single(ctx: &DecodeContext<'_>, value: Value) -> Result<Record> {
    let mut record = Record::new();
    record.insert(ctx.single_field()?, value)?;
    Ok(record)
}

/// An encoded response body.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub content_type: String,
    pub body: Bytes,
}

/// Encode the terminal record. Non-json encodings carrying more than one
/// field are framed as multipart with one part per field.
pub fn encode(encoding: Encoding, record: &Record) -> Result<Encoded> {
    if encoding == Encoding::Json {
        return Ok(Encoded {
            content_type: Encoding::Json.content_type().to_string(),
            body: json::encode_record(record)?,
        });
    }

    if encoding == Encoding::Arrow {
        if let Some(table) = arrow::record_to_table(record) {
            return Ok(Encoded {
                content_type: arrow::CONTENT_TYPE.to_string(),
                body: arrow::encode(&table)?,
            });
        }
    }

    let mut fields = record.iter();
    match (fields.next(), fields.next()) {
        (Some((_, value)), None) => {
            let (content_type, body) = encode_value(encoding, value)?;
            Ok(Encoded { content_type, body })
        }
        _ => multipart::encode(encoding, record),
    }
}

/// Encode one value in `encoding`, returning its media type and bytes.
pub(crate) fn encode_value(encoding: Encoding, value: &Value) -> Result<(String, Bytes)> {
    let unsupported = || {
        GatewayError::UnsupportedMedia(format!(
            "a {} value cannot be encoded as {}",
            value.kind(),
            encoding
        ))
    };

    match encoding {
        Encoding::Json => Ok((
            encoding.content_type().to_string(),
            Bytes::from(serde_json::to_vec(&json::value_to_json(value))
                .map_err(|e| GatewayError::Internal(e.to_string()))?),
        )),
        e if e.is_tensor_blob() => {
            let tensor = match value {
                Value::Tensor(t) => t.clone(),
                Value::Image(i) => i.to_tensor(),
                scalar => scalar_tensor(scalar).ok_or_else(unsupported)?,
            };
            Ok((e.content_type().to_string(), npy::encode(&tensor)?))
        }
        Encoding::Image => {
            let image = match value {
                Value::Image(i) => i.clone(),
                Value::Tensor(t) => image::image_from_tensor(t).ok_or_else(unsupported)?,
                _ => return Err(unsupported()),
            };
            Ok((image::PNG_CONTENT_TYPE.to_string(), image::encode_png(&image)?))
        }
        Encoding::Arrow => {
            let table = match value {
                Value::Table(t) => t.clone(),
                _ => return Err(unsupported()),
            };
            Ok((arrow::CONTENT_TYPE.to_string(), arrow::encode(&table)?))
        }
        _ => Err(unsupported()),
    }
}

/// A numeric scalar as a rank-0 tensor.
fn scalar_tensor(value: &Value) -> Option<Tensor> {
    match value {
        Value::Bool(v) => Tensor::new(modelgate_common::DType::Bool, vec![], vec![u8::from(*v)]).ok(),
        Value::Int32(v) => Tensor::from_i32(vec![], &[*v]).ok(),
        Value::Int64(v) => Tensor::from_i64(vec![], &[*v]).ok(),
        Value::Float32(v) => Tensor::from_f32(vec![], &[*v]).ok(),
        Value::Float64(v) => Tensor::from_f64(vec![], &[*v]).ok(),
        _ => None,
    }
}
