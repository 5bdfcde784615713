use crate::config::{ApiKey, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::logging::{LogLevel, SharedLogger};
use crate::translate::gemini_types::GenerateContentResponse;
use crate::translate::openai_types::{ChatCompletionResponse, ChatRequest};
use crate::translate::request::openai_to_gemini;
use crate::translate::response::gemini_to_openai;
use crate::translate::streaming::{Decoded, StreamDecoder, DONE_SENTINEL};

use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use reqwest::Url;
use std::pin::Pin;

/// Stream of SSE `data` payloads: chunk JSON, then the `[DONE]` sentinel.
pub type SseStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// `{base_url}/models/{model}:generateContent`, or `:streamGenerateContent`.
/// The credential is added as a query parameter at send time, never here.
///
/// `model` is pushed as one percent-encoded path segment, so `/`, `?` and `#`
/// in it cannot escape into another path, the query or a fragment.
pub fn upstream_url(base_url: &str, model: &str, stream: bool) -> Result<Url> {
    let operation = if stream {
        "streamGenerateContent"
    } else {
        "generateContent"
    };

    let mut url = Url::parse(base_url)
        .map_err(|e| ProxyError::config(format!("Invalid upstream base_url {base_url}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| ProxyError::config(format!("Upstream base_url {base_url} cannot be a base")))?
        .pop_if_empty()
        .push("models")
        .push(&format!("{model}:{operation}"));

    Ok(url)
}

/// Forward a non-streaming chat request and translate the reply.
pub async fn proxy_non_streaming(
    req: &ChatRequest,
    config: &ProxyConfig,
    api_key: &ApiKey,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<ChatCompletionResponse> {
    let response = send_upstream(req, config, api_key, client, logger).await?;

    let body = response
        .text()
        .await
        .map_err(|e| ProxyError::Http(e.without_url()))?;

    logger.debug("proxy", format!("Response body_len={}", body.len()));

    let gemini_resp: GenerateContentResponse = serde_json::from_str(&body)?;
    let openai_resp = gemini_to_openai(&gemini_resp, &req.model);

    logger.info(
        "proxy",
        format!(
            "Completed: prompt={} completion={} total={} tokens",
            openai_resp.usage.prompt_tokens,
            openai_resp.usage.completion_tokens,
            openai_resp.usage.total_tokens
        ),
    );

    Ok(openai_resp)
}

/// Forward a streaming chat request, returning the translated SSE payloads.
///
/// Upstream errors are reported before any byte is streamed, so the caller can
/// still answer with the upstream's status.
pub async fn proxy_streaming(
    req: &ChatRequest,
    config: &ProxyConfig,
    api_key: &ApiKey,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<SseStream> {
    let response = send_upstream(req, config, api_key, client, logger).await?;

    let byte_stream = response.bytes_stream();
    let event_stream = sse_translate_stream(byte_stream, req.model.clone(), logger.clone());

    Ok(Box::pin(event_stream))
}

async fn send_upstream(
    req: &ChatRequest,
    config: &ProxyConfig,
    api_key: &ApiKey,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<reqwest::Response> {
    let url = upstream_url(&config.upstream.base_url, &req.model, req.stream)?;
    let gemini_req = openai_to_gemini(req, &config.generation, &config.params);

    logger.log_with_context(
        LogLevel::Info,
        "proxy",
        format!("POST {url}"),
        serde_json::json!({
            "model": req.model,
            "stream": req.stream,
            "contents": gemini_req.contents.len(),
        }),
    );

    let mut query = vec![("key", api_key.expose())];
    if req.stream && config.upstream.sse {
        query.push(("alt", "sse"));
    }

    let response = client
        .post(url)
        .query(&query)
        .json(&gemini_req)
        .send()
        .await
        .map_err(|e| ProxyError::Http(e.without_url()))?;

    let status = response.status();
    if !status.is_success() {
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                logger.warn(
                    "proxy",
                    format!("Failed to read upstream error body: {}", e.without_url()),
                );
                String::new()
            }
        };
        logger.warn(
            "proxy",
            format!("Upstream error status={}: {}", status.as_u16(), truncate(&body, 500)),
        );
        return Err(ProxyError::upstream(status.as_u16(), body));
    }

    Ok(response)
}

/// Decode the Gemini byte stream and re-frame it as OpenAI chunk payloads.
///
/// Unparseable lines are logged and skipped. A transport error ends the stream
/// without the `[DONE]` sentinel.
fn sse_translate_stream(
    byte_stream: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
    model: String,
    logger: SharedLogger,
) -> impl Stream<Item = String> + Send + 'static {
    async_stream::stream! {
        let mut decoder = StreamDecoder::new(&model);
        let mut emitted = 0usize;
        let mut failed = false;

        tokio::pin!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    logger.error("stream", format!("Byte stream error: {}", e.without_url()));
                    failed = true;
                    break;
                }
            };

            for decoded in decoder.push(&chunk) {
                if let Some(data) = render(decoded, &logger) {
                    emitted += 1;
                    yield data;
                }
            }
        }

        if !failed {
            for decoded in decoder.finish() {
                if let Some(data) = render(decoded, &logger) {
                    emitted += 1;
                    yield data;
                }
            }

            logger.info("stream", format!("Stream completed: {emitted} chunks"));
            yield DONE_SENTINEL.to_string();
        }
    }
}

fn render(decoded: Decoded, logger: &SharedLogger) -> Option<String> {
    match decoded {
        Ok(chunk) => match serde_json::to_string(&chunk) {
            Ok(json) => Some(json),
            Err(e) => {
                logger.error("stream", format!("Failed to serialize chunk: {e}"));
                None
            }
        },
        Err(e) => {
            logger.warn("stream", format!("Skipping line: {e}"));
            None
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
