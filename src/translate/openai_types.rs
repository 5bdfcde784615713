//! Type definitions for the [OpenAI Chat Completions API](https://platform.openai.com/docs/api-reference/chat).
//!
//! The request side is what clients send us; the response and chunk types are
//! what we synthesize from the Gemini reply.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Request types (what clients send TO the proxy)
// ---------------------------------------------------------------------------

/// Chat request exactly as it arrives on the wire. Required fields are still
/// optional here; [`super::request::validate`] turns this into a [`ChatRequest`].
///
/// Known fields are read leniently: a value of the wrong JSON type is treated
/// as absent, so only the body's JSON syntax can make it unreadable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequestBody {
    #[serde(default, deserialize_with = "lenient")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default, deserialize_with = "lenient")]
    pub stream: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub max_tokens: Option<u64>,
    /// Anything else the client sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A validated chat request: `model` and `messages` are present and non-empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub extra: Map<String, Value>,
}

/// One conversation message. Any JSON value is accepted: `role` is only
/// inspected for `"assistant"`, and an entry that is not an object carries
/// no role and no content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value")]
pub struct ChatMessage {
    pub role: Value,
    /// Forwarded untouched; a non-string value is the upstream's problem.
    pub content: Value,
}

impl From<Value> for ChatMessage {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(mut fields) => Self {
                role: fields.remove("role").unwrap_or(Value::Null),
                content: fields.remove("content").unwrap_or(Value::Null),
            },
            _ => Self::default(),
        }
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

// ---------------------------------------------------------------------------
// Response types (what the proxy sends back)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: ChatUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u64,
    pub message: ChoiceMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

// ---------------------------------------------------------------------------
// Streaming chunk types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u64,
    pub delta: ChunkDelta,
    /// Serialized as `null` while the stream is still going.
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    pub content: String,
}
