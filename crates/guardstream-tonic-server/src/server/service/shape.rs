//! Casting backend items into gRPC chunks, one [`ResponseShape`] per RPC.

use crate::server::backend::types::{ChatCompletionChunk, GenerateEvent};
use guardstream_tonic_core::{
    guardstream::{Error, RefusalEnd, RefusalToken, ResponseShape, Result},
    proto::{
        ChatChoice, ChatCompletionStreamResponse, ChoiceDelta, GenerateStreamResponse,
        StreamDetails, Token, Usage,
    },
};
use std::sync::Arc;

const ASSISTANT_ROLE: &str = "assistant";

/// Instruction markers removed from generated text.
#[derive(Clone, Debug, Default)]
pub struct InstTokens(Arc<[String]>);

impl InstTokens {
    pub fn new(tokens: &[String]) -> Self {
        Self(tokens.iter().filter(|t| !t.is_empty()).cloned().collect())
    }

    pub fn strip(&self, text: &str) -> String {
        self.0
            .iter()
            .fold(text.to_owned(), |acc, token| acc.replace(token.as_str(), ""))
    }
}

fn position_u32(position: usize) -> u32 {
    u32::try_from(position).unwrap_or(u32::MAX)
}

/// `GenerateStream` responses.
#[derive(Clone, Debug, Default)]
pub struct GenerateShape {
    inst_tokens: InstTokens,
}

impl GenerateShape {
    pub const fn new(inst_tokens: InstTokens) -> Self {
        Self { inst_tokens }
    }
}

impl ResponseShape for GenerateShape {
    type Raw = GenerateEvent;
    type Chunk = GenerateStreamResponse;

    fn cast(&self, raw: GenerateEvent, position: usize) -> Result<GenerateStreamResponse> {
        let token = raw.token.ok_or_else(|| Error::Cast {
            reason: format!("generate event #{position} carries no token"),
        })?;

        Ok(GenerateStreamResponse {
            token: Some(Token {
                id: token.id,
                text: self.inst_tokens.strip(&token.text),
                logprob: token.logprob,
                special: token.special,
            }),
            generated_text: raw.generated_text.map(|text| self.inst_tokens.strip(&text)),
            details: raw.details.map(|details| StreamDetails {
                finish_reason: details.finish_reason,
                generated_tokens: details
                    .generated_tokens
                    .unwrap_or_else(|| position_u32(position)),
                seed: details.seed,
            }),
        })
    }

    fn refusal_chunk(&self, token: RefusalToken<'_>, end: Option<RefusalEnd<'_>>) -> GenerateStreamResponse {
        GenerateStreamResponse {
            token: Some(Token {
                id: token.id,
                text: token.text.to_owned(),
                logprob: None,
                special: false,
            }),
            generated_text: end.map(|end| end.generated_text.to_owned()),
            details: end.map(|end| StreamDetails {
                finish_reason: end.finish_reason.to_owned(),
                generated_tokens: end.generated_tokens,
                seed: None,
            }),
        }
    }
}

/// `ChatCompletionStream` responses.
///
/// Refusal chunks carry the request ID as the completion ID and the
/// configured model name.
#[derive(Clone, Debug)]
pub struct ChatShape {
    id: String,
    model: String,
    created: i64,
    inst_tokens: InstTokens,
}

impl ChatShape {
    pub fn new(request_id: &str, model: &str, created: i64, inst_tokens: InstTokens) -> Self {
        Self {
            id: request_id.to_owned(),
            model: model.to_owned(),
            created,
            inst_tokens,
        }
    }
}

impl ResponseShape for ChatShape {
    type Raw = ChatCompletionChunk;
    type Chunk = ChatCompletionStreamResponse;

    fn cast(&self, raw: ChatCompletionChunk, position: usize) -> Result<ChatCompletionStreamResponse> {
        // A usage-only chunk is legitimate (OpenAI `stream_options`), an
        // empty one is not.
        if raw.choices.is_empty() && raw.usage.is_none() {
            return Err(Error::Cast {
                reason: format!("chat chunk #{position} has neither choices nor usage"),
            });
        }

        let choices = raw
            .choices
            .into_iter()
            .map(|choice| ChatChoice {
                index: choice.index,
                delta: Some(ChoiceDelta {
                    role: choice.delta.role,
                    content: choice.delta.content.map(|c| self.inst_tokens.strip(&c)),
                }),
                finish_reason: choice.finish_reason,
            })
            .collect();

        Ok(ChatCompletionStreamResponse {
            id: raw.id,
            created: raw.created,
            model: raw.model,
            choices,
            usage: raw.usage.map(|usage| Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
        })
    }

    fn refusal_chunk(&self, token: RefusalToken<'_>, end: Option<RefusalEnd<'_>>) -> ChatCompletionStreamResponse {
        ChatCompletionStreamResponse {
            id: self.id.clone(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                delta: Some(ChoiceDelta {
                    role: (token.index == 0).then(|| ASSISTANT_ROLE.to_owned()),
                    content: Some(token.text.to_owned()),
                }),
                finish_reason: end.map(|end| end.finish_reason.to_owned()),
            }],
            usage: end.map(|end| Usage {
                prompt_tokens: 0,
                completion_tokens: end.generated_tokens,
                total_tokens: end.generated_tokens,
            }),
        }
    }
}
