//! Line decoder for Gemini's streamed responses.
//!
//! [`StreamDecoder`] is fed raw bytes as they arrive and yields one OpenAI
//! [`ChatCompletionChunk`] per upstream fragment that carries text. It accepts
//! both SSE framing (`data: {...}`) and bare JSON lines, including the array
//! punctuation of the non-SSE stream (`[{...}`, `,{...}`, `]`).
//!
//! An incomplete trailing line is kept in the buffer until the next read, or
//! until [`StreamDecoder::finish`] is called at end of stream.

use thiserror::Error;

use super::gemini_types::GenerateContentResponse;
use super::openai_types::ChatCompletionChunk;
use super::response::gemini_chunk_to_openai;

/// Final event sent to the client once upstream closes.
pub const DONE_SENTINEL: &str = "[DONE]";

/// SSE fields other than `data` carry nothing we translate.
const IGNORED_SSE_FIELDS: &[&str] = &["event:", "id:", "retry:"];

/// A stream line that looked like payload but was not valid JSON.
#[derive(Debug, Error)]
#[error("unparseable stream line {line:?}: {source}")]
pub struct MalformedLine {
    pub line: String,
    #[source]
    pub source: serde_json::Error,
}

pub type Decoded = std::result::Result<ChatCompletionChunk, MalformedLine>;

#[derive(Debug)]
pub struct StreamDecoder {
    model: String,
    buffer: Vec<u8>,
}

impl StreamDecoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            buffer: Vec::new(),
        }
    }

    /// Feed newly received bytes, returning results for every completed line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        self.buffer.extend_from_slice(bytes);

        let mut out = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            self.decode_line(&line, &mut out);
        }
        out
    }

    /// Flush whatever is left in the buffer as a final line.
    pub fn finish(&mut self) -> Vec<Decoded> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, &mut out);
        }
        out
    }

    /// Bytes received but not yet terminated by a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn decode_line(&self, raw: &[u8], out: &mut Vec<Decoded>) {
        let line = String::from_utf8_lossy(raw);
        let Some(payload) = line_payload(&line) else {
            return;
        };

        match serde_json::from_str::<GenerateContentResponse>(payload) {
            Ok(resp) => {
                if let Some(chunk) = gemini_chunk_to_openai(&resp, &self.model) {
                    out.push(Ok(chunk));
                }
            }
            Err(source) => out.push(Err(MalformedLine {
                line: payload.to_string(),
                source,
            })),
        }
    }
}

/// Strip line framing, returning the JSON text to parse.
///
/// `None` means the line is skipped without comment: blank lines, SSE comments
/// and non-data fields, an upstream `[DONE]`, or bare array punctuation.
pub fn line_payload(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim();
        if data.is_empty() || data == DONE_SENTINEL {
            return None;
        }
        return Some(data);
    }

    if IGNORED_SSE_FIELDS.iter().any(|f| line.starts_with(f)) {
        return None;
    }

    let bare = line
        .trim_start_matches(['[', ','])
        .trim_end_matches([']', ','])
        .trim();
    if bare.is_empty() {
        None
    } else {
        Some(bare)
    }
}
