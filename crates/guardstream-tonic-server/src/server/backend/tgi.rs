//! Hugging Face text-generation-inference client.

use super::{GenerateParams, HttpBackend, sse, types::GenerateEvent};
use futures::{StreamExt, TryStreamExt, future};
use guardstream_tonic_core::guardstream::TokenSource;
use serde::Serialize;

#[derive(Serialize)]
struct GenerateBody<'a> {
    inputs: &'a str,
    parameters: TgiParameters<'a>,
    stream: bool,
}

#[derive(Serialize)]
struct TgiParameters<'a> {
    #[serde(flatten)]
    params: &'a GenerateParams,
    /// Required for the final event to carry `details`.
    details: bool,
}

#[derive(Clone, Debug)]
pub struct TgiBackend {
    http: HttpBackend,
}

impl TgiBackend {
    pub const fn new(http: HttpBackend) -> Self {
        Self { http }
    }

    pub const fn http(&self) -> &HttpBackend {
        &self.http
    }

    /// `POST {base}/generate_stream`.
    pub fn generate_stream(&self, prompt: &str, params: &GenerateParams) -> TokenSource<GenerateEvent> {
        let body = GenerateBody {
            inputs: prompt,
            parameters: TgiParameters {
                params,
                details: true,
            },
            stream: true,
        };
        self.http
            .post_sse(self.http.url("generate_stream"), &body)
            .and_then(|data| future::ready(sse::parse_payload::<GenerateEvent>(&data)))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::backend::ParamDefaults;

    #[test]
    fn body_nests_parameters() {
        let params = GenerateParams::normalize(
            "req",
            None,
            ParamDefaults {
                max_new_tokens: 32,
                temperature: 0.5,
            },
        );
        let body = GenerateBody {
            inputs: "Hello",
            parameters: TgiParameters {
                params: &params,
                details: true,
            },
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["inputs"], "Hello");
        assert_eq!(json["parameters"]["max_new_tokens"], 32);
        assert_eq!(json["parameters"]["details"], true);
    }

    #[test]
    fn decodes_stream_events() {
        let event: GenerateEvent = sse::parse_payload(
            r#"{"index":3,"token":{"id":42,"text":" world","logprob":-0.25,"special":false},"generated_text":null,"details":null}"#,
        )
        .unwrap();
        let token = event.token.unwrap();
        assert_eq!(token.id, 42);
        assert_eq!(token.text, " world");
        assert!(event.details.is_none());

        let last: GenerateEvent = sse::parse_payload(
            r#"{"token":{"id":2,"text":"</s>","logprob":0.0,"special":true},"generated_text":"Hello world","details":{"finish_reason":"eos_token","generated_tokens":4,"seed":null}}"#,
        )
        .unwrap();
        let details = last.details.unwrap();
        assert_eq!(details.finish_reason, "eos_token");
        assert_eq!(details.generated_tokens, Some(4));
        assert_eq!(last.generated_text.as_deref(), Some("Hello world"));
    }
}
