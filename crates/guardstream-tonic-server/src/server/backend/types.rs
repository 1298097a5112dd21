//! Wire types exchanged with the HTTP backends.

use serde::{Deserialize, Serialize};

/// One event of a plain generation stream, in TGI `generate_stream` shape.
///
/// OpenAI-compatible completion chunks are converted into this shape by the
/// OpenAI backend.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct GenerateEvent {
    pub token: Option<TokenEvent>,
    #[serde(default)]
    pub generated_text: Option<String>,
    #[serde(default)]
    pub details: Option<GenerateDetails>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct TokenEvent {
    pub id: u32,
    pub text: String,
    #[serde(default)]
    pub logprob: Option<f32>,
    #[serde(default)]
    pub special: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct GenerateDetails {
    pub finish_reason: String,
    #[serde(default)]
    pub generated_tokens: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// One `chat.completion.chunk` object.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// One streamed chunk of an OpenAI `/v1/completions` response.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Non-streaming chat completion, as returned by the safeguard server.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<CompletionMessageChoice>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct CompletionMessageChoice {
    pub message: AssistantMessage,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// A chat message as sent to the backends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

impl WireMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_owned(),
            content: content.into(),
        }
    }
}
