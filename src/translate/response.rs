use super::gemini_types::GenerateContentResponse;
use super::openai_types::{
    ChatCompletionChunk, ChatCompletionResponse, ChatUsage, Choice, ChoiceMessage, ChunkChoice,
    ChunkDelta,
};

/// Translate a complete Gemini response into an OpenAI chat completion.
/// `model` is echoed back as the client sent it.
///
/// `finish_reason` is always `"stop"`, whatever the candidate reported.
pub fn gemini_to_openai(resp: &GenerateContentResponse, model: &str) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: resp.first_text().to_string(),
            },
            finish_reason: "stop".to_string(),
        }],
        usage: usage_from_gemini(resp),
    }
}

/// Translate one streamed Gemini fragment into an OpenAI chunk.
///
/// Returns `None` when the fragment carries neither text nor a finish reason.
pub fn gemini_chunk_to_openai(
    resp: &GenerateContentResponse,
    model: &str,
) -> Option<ChatCompletionChunk> {
    let content = resp.first_text();
    let finish_reason = map_finish_reason(resp.first_finish_reason());

    if content.is_empty() && finish_reason.is_none() {
        return None;
    }

    Some(ChatCompletionChunk {
        id: completion_id(),
        object: "chat.completion.chunk".to_string(),
        created: unix_timestamp(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                content: content.to_string(),
            },
            finish_reason,
        }],
    })
}

/// Only a normal `STOP` is reported to streaming clients; anything else stays null.
pub fn map_finish_reason(reason: Option<&str>) -> Option<String> {
    match reason {
        Some("STOP") => Some("stop".to_string()),
        _ => None,
    }
}

fn usage_from_gemini(resp: &GenerateContentResponse) -> ChatUsage {
    resp.usage_metadata.as_ref().map_or_else(ChatUsage::default, |u| ChatUsage {
        prompt_tokens: u.prompt_token_count.unwrap_or(0),
        completion_tokens: u.candidates_token_count.unwrap_or(0),
        total_tokens: u.total_token_count.unwrap_or(0),
    })
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
