//! Validate OpenAI chat requests and translate them into Gemini `generateContent` requests.
//!
//! Only `model` and `messages` are checked. Message roles and contents are not
//! inspected: anything malformed is forwarded and surfaces as an upstream error.

use serde_json::{Map, Value};

use super::gemini_types::{Content, GenerateContentRequest, GenerationConfig, Part};
use super::openai_types::{ChatMessage, ChatRequest, ChatRequestBody};
use crate::config::{GenerationDefaults, ParamsConfig};
use crate::error::{ProxyError, Result};

/// OpenAI parameter names with a different Gemini spelling.
const RENAMED_PARAMS: &[(&str, &str)] = &[
    ("top_p", "topP"),
    ("top_k", "topK"),
    ("presence_penalty", "presencePenalty"),
    ("frequency_penalty", "frequencyPenalty"),
    ("stop", "stopSequences"),
];

/// Check that `model` and `messages` are present and non-empty.
///
/// On failure the error lists every missing field, `model` first.
pub fn validate(body: ChatRequestBody) -> Result<ChatRequest> {
    let model = body.model.filter(|m| !m.is_empty());
    let messages = body.messages.filter(|m| !m.is_empty());

    match (model, messages) {
        (Some(model), Some(messages)) => Ok(ChatRequest {
            model,
            messages,
            stream: body.stream.unwrap_or(false),
            temperature: body.temperature,
            max_tokens: body.max_tokens,
            extra: body.extra,
        }),
        (model, messages) => {
            let mut fields = Vec::new();
            if model.is_none() {
                fields.push("model");
            }
            if messages.is_none() {
                fields.push("messages");
            }
            Err(ProxyError::MissingFields { fields })
        }
    }
}

/// Translate a validated chat request into a Gemini request.
/// Pure function: the same input always yields the same output.
pub fn openai_to_gemini(
    req: &ChatRequest,
    defaults: &GenerationDefaults,
    params: &ParamsConfig,
) -> GenerateContentRequest {
    let contents = req.messages.iter().map(translate_message).collect();

    GenerateContentRequest {
        contents,
        generation_config: GenerationConfig {
            temperature: req.temperature.unwrap_or(defaults.temperature),
            max_output_tokens: req.max_tokens.unwrap_or(defaults.max_tokens),
            extra: passthrough_params(&req.extra, &params.drop),
        },
    }
}

/// `assistant` becomes `model`; every other role, `system` included, becomes `user`.
pub fn gemini_role(role: &str) -> &'static str {
    if role == "assistant" {
        "model"
    } else {
        "user"
    }
}

fn translate_message(msg: &ChatMessage) -> Content {
    Content {
        role: gemini_role(msg.role.as_str().unwrap_or_default()).to_string(),
        parts: vec![Part {
            text: msg.content.clone(),
        }],
    }
}

fn passthrough_params(extra: &Map<String, Value>, drop: &[String]) -> Map<String, Value> {
    let mut out = Map::new();

    for (key, value) in extra {
        if drop.iter().any(|d| d == key) || value.is_null() {
            continue;
        }

        let name = RENAMED_PARAMS
            .iter()
            .find(|(openai, _)| *openai == key.as_str())
            .map_or(key.as_str(), |(_, gemini)| *gemini);

        // Explicit fields always win over passthrough.
        if name == "temperature" || name == "maxOutputTokens" {
            continue;
        }

        let value = match (name, value) {
            ("stopSequences", Value::String(s)) => Value::Array(vec![Value::String(s.clone())]),
            _ => value.clone(),
        };

        out.insert(name.to_string(), value);
    }

    out
}
