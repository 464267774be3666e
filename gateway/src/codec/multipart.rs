//! `multipart/form-data` framing: one part per record field.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use tempfile::NamedTempFile;
use uuid::Uuid;

use modelgate_common::{FieldSpec, Record, Value, ValueKind};

use crate::codec::{arrow, encode_value, image, json, npy, DecodeContext, Encoded, Encoding};
use crate::error::{GatewayError, Result};

/// Parts larger than this are spooled to `uploads_directory` while they
/// are being received.
const SPOOL_THRESHOLD: usize = 1024 * 1024;

fn bad(msg: impl std::fmt::Display) -> GatewayError {
    GatewayError::BadRequest(format!("malformed multipart body: {}", msg))
}

/// Accumulates one part in memory, moving it to a temp file once it grows
/// past [`SPOOL_THRESHOLD`]. The file is removed when the buffer is dropped.
struct PartBuffer<'a> {
    memory: BytesMut,
    spool: Option<NamedTempFile>,
    dir: Option<&'a Path>,
}

impl<'a> PartBuffer<'a> {
    fn new(dir: Option<&'a Path>) -> Self {
        Self {
            memory: BytesMut::new(),
            spool: None,
            dir,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<()> {
        if let Some(file) = self.spool.as_mut() {
            return file.write_all(chunk).map_err(spool_error);
        }
        self.memory.extend_from_slice(chunk);
        if let (Some(dir), true) = (self.dir, self.memory.len() > SPOOL_THRESHOLD) {
            let mut file = tempfile::Builder::new()
                .prefix("modelgate-upload-")
                .tempfile_in(dir)
                .map_err(spool_error)?;
            file.write_all(&self.memory).map_err(spool_error)?;
            tracing::debug!(path = %file.path().display(), "Spooling multipart part to disk");
            self.memory.clear();
            self.spool = Some(file);
        }
        Ok(())
    }

    fn contents(&mut self) -> Result<Bytes> {
        match self.spool.as_mut() {
            Some(file) => {
                let mut data = Vec::new();
                let handle = file.as_file_mut();
                handle.seek(SeekFrom::Start(0)).map_err(spool_error)?;
                handle.read_to_end(&mut data).map_err(spool_error)?;
                Ok(Bytes::from(data))
            }
            None => Ok(std::mem::take(&mut self.memory).freeze()),
        }
    }
}

fn spool_error(e: std::io::Error) -> GatewayError {
    GatewayError::Internal(format!("cannot spool upload: {}", e))
}

/// Decode a multipart body. Each part's media type selects its decoder;
/// parts without one are decoded according to the consumer's declared kind,
/// falling back to the URL encoding.
pub async fn decode(
    body: Bytes,
    content_type: &str,
    encoding: Encoding,
    ctx: &DecodeContext<'_>,
) -> Result<Record> {
    let boundary = multer::parse_boundary(content_type).map_err(bad)?;
    let stream = futures_util::stream::once(async move { Ok::<Bytes, std::convert::Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut record = Record::new();
    while let Some(mut field) = multipart.next_field().await.map_err(bad)? {
        let name = field
            .name()
            .filter(|n| !n.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| bad("every part needs a name"))?;
        let part_type = field.content_type().map(|m| m.essence_str().to_ascii_lowercase());

        let mut buffer = PartBuffer::new(ctx.uploads_dir);
        while let Some(chunk) = field.chunk().await.map_err(bad)? {
            buffer.push(&chunk)?;
        }
        let data = buffer.contents()?;
        drop(buffer);

        if record.contains(&name) {
            return Err(bad(format!("duplicate part '{}'", name)));
        }
        let value = decode_part(&name, part_type.as_deref(), &data, ctx.schema.field(&name), encoding)?;
        record.insert(name, value)?;
    }
    Ok(record)
}

fn decode_part(
    name: &str,
    part_type: Option<&str>,
    data: &Bytes,
    spec: Option<&FieldSpec>,
    encoding: Encoding,
) -> Result<Value> {
    let kind = spec.map(|s| s.kind);
    if kind == Some(ValueKind::Bytes) {
        return Ok(Value::Bytes(data.clone()));
    }

    let decode_json = || -> Result<Value> {
        let parsed: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| bad(format!("part '{}' is not valid JSON: {}", name, e)))?;
        json::value_from_json(name, &parsed, spec)
    };
    let decode_text = || -> Result<Value> {
        String::from_utf8(data.to_vec())
            .map(Value::String)
            .map_err(|_| bad(format!("part '{}' is not UTF-8 text", name)))
    };

    match part_type {
        Some("application/json") => decode_json(),
        Some("application/x-npy") | Some("application/octet-stream") => {
            Ok(Value::Tensor(npy::decode(data)?))
        }
        Some(arrow::CONTENT_TYPE) => Ok(Value::Table(arrow::decode(data)?)),
        Some("text/plain") => decode_text(),
        Some(t) if t.starts_with("image/") => Ok(Value::Image(image::decode(data)?)),
        Some(other) => Err(GatewayError::UnsupportedMedia(format!(
            "part '{}' has unsupported media type '{}'",
            name, other
        ))),
        None => match (kind, encoding) {
            (Some(ValueKind::Tensor), _) => Ok(Value::Tensor(npy::decode(data)?)),
            (Some(ValueKind::Image), _) => Ok(Value::Image(image::decode(data)?)),
            (Some(ValueKind::Table), _) => Ok(Value::Table(arrow::decode(data)?)),
            (Some(ValueKind::String), _) => decode_text(),
            (Some(_), _) | (None, Encoding::Json) => decode_json(),
            (None, Encoding::Numpy | Encoding::Nd4j) => Ok(Value::Tensor(npy::decode(data)?)),
            (None, Encoding::Image) => Ok(Value::Image(image::decode(data)?)),
            (None, Encoding::Arrow) => Ok(Value::Table(arrow::decode(data)?)),
        },
    }
}

/// Encode every field as its own part. Values the encoding cannot carry
/// (scalars in an image response, say) are written as JSON parts.
pub fn encode(encoding: Encoding, record: &Record) -> Result<Encoded> {
    let boundary = format!("modelgate-{}", Uuid::new_v4().simple());
    let mut out = BytesMut::new();

    for (name, value) in record.iter() {
        let (content_type, body) = match encode_value(encoding, value) {
            Err(GatewayError::UnsupportedMedia(_)) => encode_value(Encoding::Json, value)?,
            other => other?,
        };
        out.put_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                boundary,
                name.replace('"', "%22"),
                content_type
            )
            .as_bytes(),
        );
        out.put_slice(&body);
        out.put_slice(b"\r\n");
    }
    out.put_slice(format!("--{}--\r\n", boundary).as_bytes());

    Ok(Encoded {
        content_type: format!("multipart/form-data; boundary={}", boundary),
        body: out.freeze(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_common::{DType, Schema, Tensor};

    fn ctx<'a>(schema: &'a Schema, dir: Option<&'a Path>) -> DecodeContext<'a> {
        DecodeContext {
            schema,
            uploads_dir: dir,
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_multer() {
        let record = Record::new()
            .with("a", Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap())
            .unwrap()
            .with("label", "cat")
            .unwrap();
        let encoded = encode(Encoding::Numpy, &record).unwrap();

        let schema = Schema::default();
        let decoded = decode(encoded.body, &encoded.content_type, Encoding::Numpy, &ctx(&schema, None))
            .await
            .unwrap();
        assert_eq!(decoded, record);
    }

    #[tokio::test]
    async fn test_untyped_part_follows_declared_kind() {
        let tensor = Tensor::from_i64(vec![1], &[9]).unwrap();
        let npy_body = npy::encode(&tensor).unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(b"--XYZ\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\n");
        body.extend_from_slice(&npy_body);
        body.extend_from_slice(b"\r\n--XYZ\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--XYZ--\r\n");

        let schema = Schema::new(vec![
            FieldSpec::tensor("x").with_dtype(DType::I64),
            FieldSpec::new("note", ValueKind::String),
        ]);
        let record = decode(
            Bytes::from(body),
            "multipart/form-data; boundary=XYZ",
            Encoding::Json,
            &ctx(&schema, None),
        )
        .await
        .unwrap();
        assert_eq!(record.get("x"), Some(&Value::Tensor(tensor)));
        assert_eq!(record.get("note"), Some(&Value::String("hello".into())));
    }

    #[tokio::test]
    async fn test_large_part_is_spooled_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0x5au8; SPOOL_THRESHOLD + 10];
        let mut body = Vec::new();
        body.extend_from_slice(
            b"--B\r\nContent-Disposition: form-data; name=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        );
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"\r\n--B--\r\n");

        let schema = Schema::new(vec![FieldSpec::new("blob", ValueKind::Bytes)]);
        let record = decode(
            Bytes::from(body),
            "multipart/form-data; boundary=B",
            Encoding::Numpy,
            &ctx(&schema, Some(dir.path())),
        )
        .await
        .unwrap();

        assert_eq!(record.get("blob"), Some(&Value::Bytes(Bytes::from(payload))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_boundary() {
        let schema = Schema::default();
        let err = decode(Bytes::new(), "multipart/form-data", Encoding::Json, &ctx(&schema, None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }
}
