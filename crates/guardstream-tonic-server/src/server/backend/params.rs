//! Normalization of caller-supplied generation parameters.
//!
//! Unset, zero and negative numeric values are treated as absent and omitted
//! from the backend request, with three exceptions: the token limit and the
//! temperature fall back to the configured defaults, and `n` falls back to 1.

use guardstream_tonic_core::proto::{ChatCompletionStreamRequest, GenerateParameters};
use serde::Serialize;

/// Server-wide fallbacks for parameters every backend request must carry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamDefaults {
    pub max_new_tokens: u32,
    pub temperature: f32,
}

/// Parameters of a plain generation request, serialized in TGI
/// `parameters` shape.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerateParams {
    pub do_sample: bool,
    pub max_new_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    pub return_full_text: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(rename = "stop", skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typical_p: Option<f32>,
    pub watermark: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_n_tokens: Option<u32>,
}

impl GenerateParams {
    pub fn normalize(
        request_id: &str,
        params: Option<&GenerateParameters>,
        defaults: ParamDefaults,
    ) -> Self {
        let fallback = GenerateParameters::default();
        let p = params.unwrap_or(&fallback);

        Self {
            do_sample: p.do_sample.unwrap_or(false),
            max_new_tokens: token_limit(request_id, "max_new_tokens", p.max_new_tokens, defaults),
            repetition_penalty: positive_f32(p.repetition_penalty),
            frequency_penalty: positive_f32(p.frequency_penalty),
            return_full_text: p.return_full_text.unwrap_or(true),
            seed: p.seed.filter(|&seed| seed > 0),
            stop_sequences: p.stop_sequences.clone(),
            temperature: positive_f32(p.temperature).unwrap_or(defaults.temperature),
            top_k: positive_u32(p.top_k),
            top_p: positive_f32(p.top_p),
            truncate: positive_u32(p.truncate),
            typical_p: positive_f32(p.typical_p),
            watermark: p.watermark.unwrap_or(false),
            top_n_tokens: positive_u32(p.top_n_tokens),
        }
    }
}

/// Sampling parameters of a chat request, serialized in OpenAI shape.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<u32>,
    pub max_tokens: u32,
    pub n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl ChatParams {
    pub fn normalize(request: &ChatCompletionStreamRequest, defaults: ParamDefaults) -> Self {
        Self {
            frequency_penalty: positive_f32(request.frequency_penalty),
            presence_penalty: positive_f32(request.presence_penalty),
            repetition_penalty: positive_f32(request.repetition_penalty),
            logprobs: request.logprobs,
            top_logprobs: positive_u32(request.top_logprobs),
            max_tokens: token_limit(&request.request_id, "max_tokens", request.max_tokens, defaults),
            n: positive_u32(request.n).unwrap_or(1),
            seed: request.seed.filter(|&seed| seed > 0),
            temperature: positive_f32(request.temperature).unwrap_or(defaults.temperature),
            top_p: positive_f32(request.top_p),
        }
    }
}

fn token_limit(request_id: &str, name: &str, value: Option<i32>, defaults: ParamDefaults) -> u32 {
    positive_u32(value).unwrap_or_else(|| {
        tracing::warn!(
            "request id: {request_id} | msg: '{name}' is negative, zero or unset, \
             and will be set to default value ({})",
            defaults.max_new_tokens
        );
        defaults.max_new_tokens
    })
}

fn positive_f32(value: Option<f32>) -> Option<f32> {
    value.filter(|&v| v > 0.0)
}

fn positive_u32(value: Option<i32>) -> Option<u32> {
    value
        .filter(|&v| v > 0)
        .and_then(|v| u32::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULTS: ParamDefaults = ParamDefaults {
        max_new_tokens: 512,
        temperature: 0.7,
    };

    #[test]
    fn non_positive_values_are_dropped() {
        let raw = GenerateParameters {
            max_new_tokens: Some(-1),
            repetition_penalty: Some(0.0),
            top_k: Some(-5),
            top_p: Some(0.9),
            temperature: Some(-0.3),
            seed: Some(0),
            ..Default::default()
        };
        let params = GenerateParams::normalize("req-1", Some(&raw), DEFAULTS);

        assert_eq!(params.max_new_tokens, 512);
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.repetition_penalty, None);
        assert_eq!(params.top_k, None);
        assert_eq!(params.top_p, Some(0.9));
        assert_eq!(params.seed, None);
    }

    #[test]
    fn absent_parameters_use_defaults() {
        let params = GenerateParams::normalize("req-1", None, DEFAULTS);
        assert_eq!(params.max_new_tokens, 512);
        assert!(params.return_full_text);
        assert!(!params.do_sample);

        let json = serde_json::to_value(&params).unwrap();
        assert!(json.get("top_k").is_none());
        assert!(json.get("stop").is_none());
        assert_eq!(json["max_new_tokens"], 512);
    }

    #[test]
    fn stop_sequences_serialize_as_stop() {
        let raw = GenerateParameters {
            stop_sequences: vec!["</s>".into()],
            max_new_tokens: Some(20),
            ..Default::default()
        };
        let json = serde_json::to_value(GenerateParams::normalize("r", Some(&raw), DEFAULTS)).unwrap();
        assert_eq!(json["stop"], serde_json::json!(["</s>"]));
        assert_eq!(json["max_new_tokens"], 20);
    }

    #[test]
    fn chat_defaults_n_to_one() {
        let request = ChatCompletionStreamRequest {
            request_id: "req-2".into(),
            n: Some(0),
            max_tokens: Some(64),
            temperature: Some(0.2),
            ..Default::default()
        };
        let params = ChatParams::normalize(&request, DEFAULTS);
        assert_eq!(params.n, 1);
        assert_eq!(params.max_tokens, 64);
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.top_logprobs, None);
    }
}
