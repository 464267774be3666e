//! `POST /{out}/{in}` and `POST /{out}/{in}/{step}`: run the pipeline.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::codec::{self, DecodeContext};
use crate::error::{GatewayError, Result};
use crate::stage::RequestContext;
use crate::AppState;

pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// POST /{out}/{in} - run the whole pipeline
pub async fn predict(
    State(state): State<Arc<AppState>>,
    Path((out, input)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    run(&state, &out, &input, None, &headers, body).await
}

/// POST /{out}/{in}/{step} - run the pipeline starting at `step`
pub async fn predict_from(
    State(state): State<Arc<AppState>>,
    Path((out, input, step)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    run(&state, &out, &input, Some(&step), &headers, body).await
}

async fn run(
    state: &AppState,
    out: &str,
    input: &str,
    step: Option<&str>,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response> {
    let (out_encoding, in_encoding) = codec::negotiate(
        out,
        input,
        state.config.output_data_format,
        state.config.input_data_format,
    )?;

    let _in_flight = state.lifecycle.admit()?;
    let pipeline = state.lifecycle.pipeline();
    let start = pipeline.start_index(step)?;

    let limit = state.config.max_body_bytes;
    if content_length(headers).is_some_and(|len| len > limit) {
        return Err(GatewayError::PayloadTooLarge { limit });
    }
    let timeout = request_timeout(headers, Duration::from_millis(state.config.request_timeout_ms))?;
    let ctx = RequestContext::new(timeout);

    let body = codec::read_body(body, limit).await?;
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let decode_ctx = DecodeContext {
        schema: pipeline.schema_in(start),
        uploads_dir: state.config.uploads_directory.as_deref(),
    };
    let record = codec::decode(in_encoding, content_type, body, &decode_ctx).await?;

    tracing::debug!(
        request_id = %ctx.request_id,
        fields = record.len(),
        start,
        "Decoded request"
    );

    let output = tokio::time::timeout_at(ctx.deadline, pipeline.apply_from(start, record, &ctx))
        .await
        .map_err(|_| GatewayError::DeadlineExceeded(format!("request exceeded its {:?} deadline", timeout)))??;

    let encoded = codec::encode(out_encoding, &output)?;
    let mut response = (StatusCode::OK, encoded.body).into_response();
    let response_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&encoded.content_type) {
        response_headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id.to_string()) {
        response_headers.insert("x-request-id", value);
    }
    Ok(response)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Deadline for this request: `X-Request-Timeout` (`250ms`, `2s`, or bare
/// milliseconds) clamped to `max`, or `max` when the header is absent.
pub fn request_timeout(headers: &HeaderMap, max: Duration) -> Result<Duration> {
    let Some(value) = headers.get(REQUEST_TIMEOUT_HEADER) else {
        return Ok(max);
    };
    let text = value
        .to_str()
        .map_err(|_| GatewayError::BadRequest("X-Request-Timeout is not valid text".into()))?;
    let requested = parse_duration(text).ok_or_else(|| {
        GatewayError::BadRequest(format!(
            "X-Request-Timeout '{}' is not a duration (e.g. 250ms, 2s)",
            text
        ))
    })?;
    Ok(requested.min(max))
}

fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let (number, scale) = if let Some(ms) = text.strip_suffix("ms") {
        (ms, 1e-3)
    } else if let Some(s) = text.strip_suffix('s') {
        (s, 1.0)
    } else {
        (text, 1e-3)
    };
    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(value * scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_TIMEOUT_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    const MAX: Duration = Duration::from_secs(30);

    #[test]
    fn test_timeout_units() {
        assert_eq!(request_timeout(&headers("50ms"), MAX).unwrap(), Duration::from_millis(50));
        assert_eq!(request_timeout(&headers("2s"), MAX).unwrap(), Duration::from_secs(2));
        assert_eq!(request_timeout(&headers("1.5s"), MAX).unwrap(), Duration::from_millis(1500));
        assert_eq!(request_timeout(&headers("120"), MAX).unwrap(), Duration::from_millis(120));
    }

    #[test]
    fn test_timeout_clamped_to_server_limit() {
        assert!(request_timeout(&headers("10m0s"), MAX).is_err());
        assert_eq!(request_timeout(&headers("600s"), MAX).unwrap(), MAX);
        assert_eq!(request_timeout(&HeaderMap::new(), MAX).unwrap(), MAX);
    }

    #[test]
    fn test_timeout_rejects_garbage() {
        for bad in ["soon", "-5ms", "ms"] {
            let err = request_timeout(&headers(bad), MAX).unwrap_err();
            assert_eq!(err.kind(), "BadRequest", "{}", bad);
        }
    }

    #[test]
    fn test_content_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(content_length(&headers), Some(42));
    }
}
