//! API translation between `OpenAI` chat completions and Gemini `generateContent`.
//!
//! The core of the proxy: validates and converts requests, converts whole
//! responses, and re-frames streamed fragments. All translation functions are
//! pure (no I/O).

pub mod gemini_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
