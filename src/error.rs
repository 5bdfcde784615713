//! Error types for the proxy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Missing required parameters: {}", .fields.join(", "))]
    MissingFields { fields: Vec<&'static str> },

    #[error("Invalid request body: {message}")]
    InvalidBody { message: String },

    #[error("Server configuration error: {env} not set")]
    MissingApiKey { env: String },

    #[error("Upstream returned status {status}")]
    Upstream { status: u16, body: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn invalid_body(msg: impl Into<String>) -> Self {
        Self::InvalidBody {
            message: msg.into(),
        }
    }

    pub fn missing_api_key(env: impl Into<String>) -> Self {
        Self::MissingApiKey { env: env.into() }
    }

    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            body: body.into(),
        }
    }

    /// HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingFields { .. } | Self::InvalidBody { .. } => StatusCode::BAD_REQUEST,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            Self::MissingFields { fields } => json!({
                "error": "Missing required parameters: model and messages are required",
                "missing": fields,
            }),
            Self::InvalidBody { message } => json!({
                "error": "Invalid request body",
                "message": message,
            }),
            Self::MissingApiKey { env } => json!({
                "error": format!("Server configuration error: {env} not set"),
            }),
            Self::Upstream { body, .. } => json!({
                "error": "Gemini API request failed",
                "details": body,
            }),
            other => json!({
                "error": "Internal server error",
                "message": other.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
