//! Error types for the gateway and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use modelgate_common::{SchemaError, ValueError};

use crate::config::ConfigError;

/// Every failure a request or the startup sequence can hit.
///
/// The `IntoResponse` impl is the only place where errors are turned into
/// status codes.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    UnsupportedMedia(String),

    #[error("{0}")]
    SchemaMismatch(String),

    #[error("request body exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    #[error("script stage '{stage}' failed: {message}")]
    UserScript { stage: String, message: String },

    /// `detail` is logged but never sent to the client.
    #[error("stage '{stage}' backend '{backend}' failed")]
    Backend {
        stage: String,
        backend: String,
        detail: String,
    },

    #[error("stage '{stage}' could not load backend '{backend}': {detail}")]
    BackendLoad {
        stage: String,
        backend: String,
        detail: String,
    },

    #[error("{0}")]
    Overloaded(String),

    #[error("{0}")]
    DeadlineExceeded(String),

    #[error("{0}")]
    NotReady(String),

    #[error("{0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnsupportedMedia(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            GatewayError::SchemaMismatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UserScript { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::BackendLoad { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The stable kind tag sent in the `kind` field of error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "BadRequest",
            GatewayError::UnsupportedMedia(_) => "UnsupportedMedia",
            GatewayError::SchemaMismatch(_) => "SchemaMismatch",
            GatewayError::PayloadTooLarge { .. } => "PayloadTooLarge",
            GatewayError::UserScript { .. } => "UserScriptError",
            GatewayError::Backend { .. } | GatewayError::BackendLoad { .. } => "BackendError",
            GatewayError::Overloaded(_) => "Overloaded",
            GatewayError::DeadlineExceeded(_) => "DeadlineExceeded",
            GatewayError::NotReady(_) => "NotReady",
            GatewayError::Config(_) => "ConfigError",
            GatewayError::Internal(_) => "InternalError",
        }
    }

    /// Process exit code when this error aborts startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::BackendLoad { .. } => 3,
            _ => 2,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            GatewayError::Backend {
                stage,
                backend,
                detail,
            } => {
                tracing::error!(stage = %stage, backend = %backend, "Backend invocation failed: {}", detail);
            }
            GatewayError::Internal(msg) => tracing::error!("Internal error: {}", msg),
            _ if status.is_server_error() => tracing::warn!(kind = self.kind(), "{}", self),
            _ => tracing::debug!(kind = self.kind(), "{}", self),
        }

        let body = Json(json!({
            "kind": self.kind(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

impl From<SchemaError> for GatewayError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::MissingField(_) => GatewayError::BadRequest(err.to_string()),
            other => GatewayError::SchemaMismatch(other.to_string()),
        }
    }
}

impl From<ValueError> for GatewayError {
    fn from(err: ValueError) -> Self {
        GatewayError::SchemaMismatch(err.to_string())
    }
}

impl From<ConfigError> for GatewayError {
    fn from(err: ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
