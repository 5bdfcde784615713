//! End-to-end tests of the router against a mocked Gemini API.
//!
//! wiremock stands in for Gemini; requests go through the full axum stack via
//! `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use gemini_proxy::config::ProxyConfig;
use gemini_proxy::logging::LogLevel;
use gemini_proxy::{build_router, ApiKey, AppState, SharedLogger};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;
use wiremock::matchers::{any, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_KEY: &str = "test-key-0123456789abcdef";

fn test_state(server: &MockServer, api_key: Option<&str>) -> Arc<AppState> {
    state_for(server.uri(), api_key, SharedLogger::in_memory())
}

fn state_for(base_url: String, api_key: Option<&str>, logger: SharedLogger) -> Arc<AppState> {
    let mut config = ProxyConfig::default();
    config.upstream.base_url = base_url;

    Arc::new(AppState {
        config,
        api_key: api_key.and_then(ApiKey::new),
        client: reqwest::Client::new(),
        logger,
    })
}

fn app(server: &MockServer) -> Router {
    build_router(test_state(server, Some(TEST_KEY)))
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, String, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, String::from_utf8(body.to_vec()).unwrap())
}

fn hello_request() -> Value {
    json!({
        "model": "gemini-2.0-flash-exp",
        "messages": [{"role": "user", "content": "hello"}]
    })
}

fn gemini_text(text: &str) -> Value {
    json!({"candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]})
}

/// Read one HTTP request off `socket`, headers and body.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| {
                    let line = line.to_ascii_lowercase();
                    line.strip_prefix("content-length:")
                        .and_then(|v| v.trim().parse::<usize>().ok())
                })
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return;
            }
        }
    }
}

/// An upstream that answers once with a 503 whose body is cut off mid-way.
async fn truncated_error_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        socket
            .write_all(
                b"HTTP/1.1 503 Service Unavailable\r\n\
                  content-type: text/plain\r\n\
                  content-length: 100\r\n\
                  \r\n\
                  partial",
            )
            .await
            .unwrap();
    });

    format!("http://{addr}")
}

fn assert_key_not_logged(logger: &SharedLogger) {
    let entries = logger.recent(usize::MAX);
    assert!(!entries.is_empty());
    for entry in entries {
        assert!(!entry.message.contains(TEST_KEY), "key in log message: {}", entry.message);
        if let Some(context) = &entry.context {
            assert!(!context.to_string().contains(TEST_KEY), "key in log context: {context}");
        }
    }
}

/// Split an SSE body into its `data` payloads.
fn sse_payloads(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|event| !event.is_empty())
        .map(|event| {
            event
                .strip_prefix("data: ")
                .unwrap_or_else(|| panic!("unexpected event framing: {event:?}"))
                .to_string()
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────
// Non-streaming
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_non_streaming_completion() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash-exp:generateContent"))
        .and(query_param("key", TEST_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello from Gemini"}]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {
                "promptTokenCount": 3,
                "candidatesTokenCount": 4,
                "totalTokenCount": 7
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (status, _, body) = send(app(&server), post("/api/gemini", &hello_request())).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_str(&body).unwrap();
    assert!(json["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(json["object"], "chat.completion");
    assert!(json["created"].as_i64().unwrap() > 0);
    assert_eq!(json["model"], "gemini-2.0-flash-exp");
    assert_eq!(json["choices"][0]["index"], 0);
    assert_eq!(json["choices"][0]["message"]["role"], "assistant");
    assert_eq!(json["choices"][0]["message"]["content"], "Hello from Gemini");
    assert_eq!(json["choices"][0]["finish_reason"], "stop");
    assert_eq!(json["usage"]["prompt_tokens"], 3);
    assert_eq!(json["usage"]["completion_tokens"], 4);
    assert_eq!(json["usage"]["total_tokens"], 7);
}

#[tokio::test]
async fn test_outbound_payload_shape() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text("ok")))
        .mount(&server)
        .await;

    let request = json!({
        "model": "gemini-pro",
        "messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
            {"role": "user", "content": "again"}
        ],
        "temperature": 0.3,
        "top_p": 0.8
    });

    let (status, _, _) = send(app(&server), post("/api/gemini", &request)).await;
    assert_eq!(status, StatusCode::OK);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let sent: Value = serde_json::from_slice(&received[0].body).unwrap();

    assert_eq!(
        sent["contents"],
        json!([
            {"role": "user", "parts": [{"text": "be brief"}]},
            {"role": "user", "parts": [{"text": "hi"}]},
            {"role": "model", "parts": [{"text": "hello"}]},
            {"role": "user", "parts": [{"text": "again"}]}
        ])
    );
    assert_eq!(sent["generationConfig"]["temperature"], 0.3);
    assert_eq!(sent["generationConfig"]["maxOutputTokens"], 2048);
    assert_eq!(sent["generationConfig"]["topP"], 0.8);
}

#[tokio::test]
async fn test_odd_message_fields_are_forwarded() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let request = json!({
        "model": "gemini-pro",
        "messages": [
            {"role": null, "content": "a"},
            {"role": 1, "content": "b"},
            "hi"
        ],
        "temperature": "0.5",
        "max_tokens": "lots"
    });

    let (status, _, _) = send(app(&server), post("/api/gemini", &request)).await;
    assert_eq!(status, StatusCode::OK);

    let received = server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&received[0].body).unwrap();

    let contents = sent["contents"].as_array().unwrap();
    assert_eq!(contents.len(), 3);
    assert!(contents.iter().all(|c| c["role"] == "user"));
    assert_eq!(contents[0]["parts"][0]["text"], "a");
    assert_eq!(contents[1]["parts"][0]["text"], "b");
    assert_eq!(contents[2]["parts"][0]["text"], Value::Null);
    assert_eq!(sent["generationConfig"]["temperature"], 0.7);
    assert_eq!(sent["generationConfig"]["maxOutputTokens"], 2048);
}

#[tokio::test]
async fn test_model_cannot_rewrite_upstream_url() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let request = json!({
        "model": "x:streamGenerateContent?alt=json#",
        "messages": [{"role": "user", "content": "hi"}]
    });

    let (status, _, _) = send(app(&server), post("/api/gemini", &request)).await;
    assert_eq!(status, StatusCode::OK);

    let received = server.received_requests().await.unwrap();
    let url = &received[0].url;
    assert!(url.path().starts_with("/models/"));
    assert!(url.path().ends_with(":generateContent"));
    assert_eq!(url.path_segments().unwrap().count(), 2);
    let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert_eq!(params, vec![("key".to_string(), TEST_KEY.to_string())]);
}

#[tokio::test]
async fn test_missing_usage_and_text_default_to_zero_and_empty() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
        .mount(&server)
        .await;

    let (status, _, body) = send(app(&server), post("/api/gemini", &hello_request())).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["choices"][0]["message"]["content"], "");
    assert_eq!(json["usage"], json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}));
}

#[tokio::test]
async fn test_openai_path_alias() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash-exp:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text("alias")))
        .mount(&server)
        .await;

    let (status, _, body) =
        send(app(&server), post("/v1/chat/completions", &hello_request())).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["choices"][0]["message"]["content"], "alias");
}

// ────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_fields_is_client_error() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let cases = [
        (json!({}), vec!["model", "messages"]),
        (json!({"model": "gemini-pro"}), vec!["messages"]),
        (json!({"messages": [{"role": "user", "content": "hi"}]}), vec!["model"]),
    ];

    for (request, missing) in cases {
        let (status, _, body) = send(app(&server), post("/api/gemini", &request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["missing"], json!(missing));
        assert!(json["error"].as_str().unwrap().contains("model and messages"));
    }
}

#[tokio::test]
async fn test_invalid_json_body_is_client_error() {
    let server = MockServer::start().await;

    let request = Request::builder()
        .uri("/api/gemini")
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let (status, _, body) = send(app(&server), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "Invalid request body");
}

#[tokio::test]
async fn test_missing_api_key_never_calls_upstream() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let app = build_router(test_state(&server, None));
    let (status, _, body) = send(app, post("/api/gemini", &hello_request())).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        json["error"],
        "Server configuration error: GEMINI_API_KEY not set"
    );
}

#[tokio::test]
async fn test_upstream_error_is_passed_through() {
    let server = MockServer::start().await;
    let raw = r#"{"error":{"code":429,"message":"Resource has been exhausted","status":"RESOURCE_EXHAUSTED"}}"#;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string(raw))
        .expect(1)
        .mount(&server)
        .await;

    let (status, _, body) = send(app(&server), post("/api/gemini", &hello_request())).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "Gemini API request failed");
    assert_eq!(json["details"], raw);
    assert!(!body.contains(TEST_KEY));
}

#[tokio::test]
async fn test_unreadable_upstream_error_body_keeps_status() {
    let base_url = truncated_error_upstream().await;
    let state = state_for(base_url, Some(TEST_KEY), SharedLogger::in_memory());
    let logger = state.logger.clone();

    let (status, _, body) = send(build_router(state), post("/api/gemini", &hello_request())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "Gemini API request failed");
    assert_eq!(json["details"], "");

    let logged = logger
        .recent(20)
        .iter()
        .any(|e| e.message.contains("Failed to read upstream error body"));
    assert!(logged);
}

#[tokio::test]
async fn test_api_key_never_logged() {
    let server = MockServer::start().await;
    let logger = SharedLogger::in_memory();

    Mock::given(method("POST"))
        .and(path("/models/good:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text("ok")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/bad:generateContent"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream broke"))
        .mount(&server)
        .await;

    let reachable = state_for(server.uri(), Some(TEST_KEY), logger.clone());
    let unreachable = state_for("http://127.0.0.1:1".to_string(), Some(TEST_KEY), logger.clone());

    let cases = [
        (reachable.clone(), "good", StatusCode::OK),
        (reachable, "bad", StatusCode::INTERNAL_SERVER_ERROR),
        (unreachable, "good", StatusCode::INTERNAL_SERVER_ERROR),
    ];

    for (state, model, expected) in cases {
        let request = json!({"model": model, "messages": [{"role": "user", "content": "hi"}]});
        let (status, _, body) = send(build_router(state), post("/api/gemini", &request)).await;
        assert_eq!(status, expected, "model {model}: {body}");
        assert!(!body.contains(TEST_KEY));
    }

    assert!(logger.recent(usize::MAX).iter().any(|e| e.level == LogLevel::Error));
    assert_key_not_logged(&logger);
}

#[tokio::test]
async fn test_unparseable_upstream_success_is_internal_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let (status, _, body) = send(app(&server), post("/api/gemini", &hello_request())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "Internal server error");
    assert!(json["message"].as_str().is_some());
}

#[tokio::test]
async fn test_non_post_methods() {
    let server = MockServer::start().await;

    let get = Request::builder()
        .uri("/api/gemini")
        .method(Method::GET)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(app(&server), get).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "Method Not Allowed");

    let options = Request::builder()
        .uri("/api/gemini")
        .method(Method::OPTIONS)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(app(&server), options).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

// ────────────────────────────────────────────────────────────────
// Streaming
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_streaming_single_chunk_then_done() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash-exp:streamGenerateContent"))
        .and(query_param("key", TEST_KEY))
        .and(query_param("alt", "sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\n\n",
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let mut request = hello_request();
    request["stream"] = json!(true);

    let (status, content_type, body) = send(app(&server), post("/api/gemini", &request)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("text/event-stream"));
    assert!(body.ends_with("data: [DONE]\n\n"));

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 2);

    let chunk: Value = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(chunk["object"], "chat.completion.chunk");
    assert_eq!(chunk["model"], "gemini-2.0-flash-exp");
    assert_eq!(chunk["choices"][0]["delta"]["content"], "Hi");
    assert!(chunk["choices"][0]["finish_reason"].is_null());
    assert_eq!(payloads[1], "[DONE]");
}

#[tokio::test]
async fn test_streaming_tolerates_bare_json_and_bad_lines() {
    let server = MockServer::start().await;

    let upstream = concat!(
        "[{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n",
        "this is not json\n",
        ",{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}]}\n",
        "]"
    );

    Mock::given(method("POST"))
        .and(path("/models/gemini-pro:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(upstream, "application/json"))
        .mount(&server)
        .await;

    let request = json!({
        "model": "gemini-pro",
        "messages": [{"role": "user", "content": "hello"}],
        "stream": true
    });

    let state = test_state(&server, Some(TEST_KEY));
    let logger = state.logger.clone();
    let (status, _, body) = send(build_router(state), post("/api/gemini", &request)).await;
    assert_eq!(status, StatusCode::OK);

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 3);

    let first: Value = serde_json::from_str(&payloads[0]).unwrap();
    let second: Value = serde_json::from_str(&payloads[1]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
    assert_eq!(second["choices"][0]["delta"]["content"], "lo");
    assert_eq!(second["choices"][0]["finish_reason"], "stop");
    assert_eq!(payloads[2], "[DONE]");

    let skipped = logger
        .recent(50)
        .iter()
        .any(|e| e.component == "stream" && e.message.contains("this is not json"));
    assert!(skipped);
}

#[tokio::test]
async fn test_streaming_upstream_error_keeps_status() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("API key not valid"))
        .mount(&server)
        .await;

    let mut request = hello_request();
    request["stream"] = json!(true);

    let (status, content_type, body) = send(app(&server), post("/api/gemini", &request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(content_type.starts_with("application/json"));

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["details"], "API key not valid");
}

// ────────────────────────────────────────────────────────────────
// Info and diagnostics
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_diagnostic_endpoint_masks_key() {
    let server = MockServer::start().await;

    let get = Request::builder()
        .uri("/api/test-env")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(app(&server), get).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.contains(TEST_KEY));

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["hasApiKey"], true);
    assert_eq!(json["apiKeyLength"], TEST_KEY.len());
    assert_eq!(json["apiKeyPrefix"], "test-k...");

    let get = Request::builder()
        .uri("/api/test-env")
        .body(Body::empty())
        .unwrap();
    let (_, _, body) = send(build_router(test_state(&server, None)), get).await;
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["hasApiKey"], false);
    assert_eq!(json["apiKeyLength"], 0);
    assert_eq!(json["apiKeyPrefix"], "NOT SET");
}

#[tokio::test]
async fn test_info_and_health() {
    let server = MockServer::start().await;

    let get = Request::builder().uri("/").body(Body::empty()).unwrap();
    let (status, _, body) = send(app(&server), get).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "running");
    assert_eq!(json["endpoints"]["gemini"]["path"], "/api/gemini");

    let get = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, _, body) = send(app(&server), get).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
}
