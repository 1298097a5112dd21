//! OpenAI-compatible client (vLLM and friends).

use super::{
    GenerateParams, HttpBackend, sse,
    types::{CompletionChunk, GenerateDetails, GenerateEvent, TokenEvent},
};
use futures::{StreamExt, TryStreamExt, future};
use guardstream_tonic_core::guardstream::{Error, Result, TokenSource};
use serde::Serialize;

#[derive(Serialize)]
struct CompletionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repetition_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logprobs: Option<u32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    echo: bool,
    stream: bool,
}

impl<'a> CompletionBody<'a> {
    fn new(model: Option<&'a str>, prompt: &'a str, params: &'a GenerateParams) -> Self {
        Self {
            model,
            prompt,
            max_tokens: params.max_new_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            seed: params.seed,
            frequency_penalty: params.frequency_penalty,
            repetition_penalty: params.repetition_penalty,
            logprobs: params.top_n_tokens,
            stop: &params.stop_sequences,
            echo: false,
            stream: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OpenAiBackend {
    http: HttpBackend,
}

impl OpenAiBackend {
    pub const fn new(http: HttpBackend) -> Self {
        Self { http }
    }

    pub const fn http(&self) -> &HttpBackend {
        &self.http
    }

    /// `POST {base}/v1/completions`, with every chunk converted to the TGI
    /// event shape.
    pub fn generate_stream(&self, prompt: &str, params: &GenerateParams) -> TokenSource<GenerateEvent> {
        let body = CompletionBody::new(self.http.model_id.as_deref(), prompt, params);
        self.http
            .post_sse(self.http.url("v1/completions"), &body)
            .and_then(|data| future::ready(sse::parse_payload(&data).and_then(into_generate_event)))
            .boxed()
    }
}

/// OpenAI completion chunks carry no token IDs; the token is reported with ID
/// 0 and the generated-token count is left to the caster.
fn into_generate_event(chunk: CompletionChunk) -> Result<GenerateEvent> {
    let choice = chunk.choices.into_iter().next().ok_or_else(|| Error::Cast {
        reason: "completion chunk has no choices".to_owned(),
    })?;

    Ok(GenerateEvent {
        token: Some(TokenEvent {
            id: 0,
            text: choice.text,
            logprob: None,
            special: false,
        }),
        generated_text: None,
        details: choice.finish_reason.map(|finish_reason| GenerateDetails {
            finish_reason,
            generated_tokens: None,
            seed: None,
        }),
    })
}
