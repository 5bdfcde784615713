use crate::config::{ApiKey, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::logging::{LogLevel, SharedLogger};
use crate::proxy;
use crate::translate::openai_types::ChatRequestBody;
use crate::translate::request::validate;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Path of the chat endpoint. Also served at `/v1/chat/completions`.
pub const CHAT_PATH: &str = "/api/gemini";

#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    /// `None` when the credential is not configured; chat calls then fail with 500.
    pub api_key: Option<ApiKey>,
    pub client: reqwest::Client,
    pub logger: SharedLogger,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_info))
        .route("/health", get(handle_health))
        .route("/api/test-env", get(handle_test_env))
        .route(CHAT_PATH, chat_route())
        .route("/v1/chat/completions", chat_route())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn chat_route() -> MethodRouter<Arc<AppState>> {
    post(handle_chat)
        .options(handle_preflight)
        .fallback(handle_method_not_allowed)
}

async fn handle_chat(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match chat_completions(&state, &body).await {
        Ok(resp) => resp,
        Err(e) => {
            let status = e.status_code();
            let level = if status.is_server_error() {
                LogLevel::Error
            } else {
                LogLevel::Warn
            };
            state.logger.log_with_context(
                level,
                "server",
                format!("Request failed: {e}"),
                json!({ "status": status.as_u16() }),
            );
            e.into_response()
        }
    }
}

async fn chat_completions(state: &AppState, body: &[u8]) -> Result<Response> {
    // Checked before anything else: without a key no request can succeed.
    let api_key = state
        .api_key
        .as_ref()
        .ok_or_else(|| ProxyError::missing_api_key(&state.config.upstream.api_key_env))?;

    let body: ChatRequestBody =
        serde_json::from_slice(body).map_err(|e| ProxyError::invalid_body(e.to_string()))?;
    let req = validate(body)?;

    state.logger.info(
        "server",
        format!(
            "Request: model={} streaming={} messages={}",
            req.model,
            req.stream,
            req.messages.len()
        ),
    );

    if req.stream {
        let sse_stream =
            proxy::proxy_streaming(&req, &state.config, api_key, &state.client, &state.logger)
                .await?;

        let event_stream = sse_stream
            .map(|data| -> std::result::Result<Event, Infallible> { Ok(Event::default().data(data)) });

        Ok(Sse::new(event_stream).into_response())
    } else {
        let resp =
            proxy::proxy_non_streaming(&req, &state.config, api_key, &state.client, &state.logger)
                .await?;
        Ok(Json(resp).into_response())
    }
}

async fn handle_preflight() -> StatusCode {
    StatusCode::OK
}

async fn handle_method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "Method Not Allowed" })),
    )
        .into_response()
}

async fn handle_info() -> Json<serde_json::Value> {
    Json(json!({
        "name": "Gemini Proxy",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "gemini": {
                "path": CHAT_PATH,
                "method": "POST",
                "description": "OpenAI-compatible chat completions backed by Gemini",
            },
            "openai": {
                "path": "/v1/chat/completions",
                "method": "POST",
                "description": "Alias of the gemini endpoint",
            },
        },
        "usage": {
            "example": {
                "url": CHAT_PATH,
                "method": "POST",
                "headers": { "Content-Type": "application/json" },
                "body": {
                    "model": "gemini-2.0-flash-exp",
                    "messages": [{ "role": "user", "content": "Hello" }],
                },
            },
        },
    }))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Reports whether the credential is configured. Only a masked prefix is shown.
async fn handle_test_env(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let key = state.api_key.as_ref();
    Json(json!({
        "hasApiKey": key.is_some(),
        "apiKeyLength": key.map_or(0, ApiKey::char_count),
        "apiKeyPrefix": key.map_or_else(|| "NOT SET".to_string(), ApiKey::masked_prefix),
        "apiKeyEnv": state.config.upstream.api_key_env,
    }))
}
