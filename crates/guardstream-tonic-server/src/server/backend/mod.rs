//! HTTP clients for the generation backend and the safeguard server.
//!
//! - [`LlmBackend`] - streaming generation, TGI or OpenAI-compatible.
//! - [`SafeguardClient`] - one-shot prompt classification.
//! - [`sse`] - SSE framing shared by both generation flavors.
//! - [`params`] - generation parameter normalization.
//!
//! Generation streams are lazy: the HTTP request is sent when the returned
//! [`TokenSource`] is first polled, and dropping the source closes the
//! upstream response.

mod openai;
pub mod params;
mod safeguard;
pub mod sse;
mod tgi;
pub mod types;

pub use params::{ChatParams, GenerateParams, ParamDefaults};
pub use safeguard::SafeguardClient;

use crate::server::config::ServerConfig;
use core::str::FromStr;
use futures::{StreamExt, TryStreamExt, stream};
use guardstream_tonic_core::guardstream::{Error, Result, TokenSource};
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use types::{ChatCompletionChunk, GenerateEvent, WireMessage};

/// Which HTTP API the generation backend speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Hugging Face text-generation-inference.
    Tgi,
    /// vLLM or any other OpenAI-compatible server.
    OpenAi,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tgi" => Ok(Self::Tgi),
            "openai" | "vllm" => Ok(Self::OpenAi),
            other => Err(Error::Validation {
                reason: format!("unsupported backend {other:?}, expected one of: tgi, openai"),
            }),
        }
    }
}

/// Endpoint and payload used to check that the generation backend answers.
#[derive(Clone, Debug)]
pub struct ProbeTarget {
    pub url: String,
    pub payload: serde_json::Value,
}

/// Streaming generation client.
#[derive(Clone, Debug)]
pub enum LlmBackend {
    Tgi(tgi::TgiBackend),
    OpenAi(openai::OpenAiBackend),
}

impl LlmBackend {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the configured headers or cookies
    /// are not valid HTTP.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let client = build_client(config)?;
        let http = HttpBackend {
            client,
            base_url: config.backend_url.clone(),
            model_id: config.model_id.clone(),
        };
        Ok(match config.backend {
            BackendKind::Tgi => Self::Tgi(tgi::TgiBackend::new(http)),
            BackendKind::OpenAi => Self::OpenAi(openai::OpenAiBackend::new(http)),
        })
    }

    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Tgi(_) => BackendKind::Tgi,
            Self::OpenAi(_) => BackendKind::OpenAi,
        }
    }

    pub fn generate_stream(&self, prompt: &str, params: &GenerateParams) -> TokenSource<GenerateEvent> {
        match self {
            Self::Tgi(backend) => backend.generate_stream(prompt, params),
            Self::OpenAi(backend) => backend.generate_stream(prompt, params),
        }
    }

    pub fn chat_stream(&self, messages: Vec<WireMessage>, params: &ChatParams) -> TokenSource<ChatCompletionChunk> {
        self.http().chat_stream(messages, params)
    }

    pub fn probe_target(&self) -> ProbeTarget {
        self.http().probe_target()
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.http().client
    }

    fn http(&self) -> &HttpBackend {
        match self {
            Self::Tgi(backend) => backend.http(),
            Self::OpenAi(backend) => backend.http(),
        }
    }
}

/// Connection details shared by both backend flavors.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    model_id: Option<String>,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(flatten)]
    params: &'a ChatParams,
}

impl HttpBackend {
    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// `POST {base}/v1/chat/completions` with `stream: true`. TGI exposes the
    /// same OpenAI-compatible route.
    fn chat_stream(&self, messages: Vec<WireMessage>, params: &ChatParams) -> TokenSource<ChatCompletionChunk> {
        let body = ChatBody {
            model: self.model_id.as_deref(),
            messages,
            stream: true,
            params,
        };
        self.post_sse(self.url("v1/chat/completions"), &body)
            .and_then(|data| futures::future::ready(sse::parse_payload::<ChatCompletionChunk>(&data)))
            .boxed()
    }

    /// Sends `body` on first poll and yields the SSE payloads of the response.
    fn post_sse<B: Serialize>(&self, url: String, body: &B) -> TokenSource<String> {
        let request = self.client.post(&url).json(body);
        stream::once(async move {
            let response = request.send().await.map_err(|e| Error::Backend {
                context: format!("POST {url} failed: {e}"),
            })?;
            let response = ensure_success(&url, response).await?;
            tracing::debug!(url = %url, "backend stream opened");
            Ok::<_, Error>(sse::data_payloads(response.bytes_stream().boxed()))
        })
        .try_flatten()
        .boxed()
    }

    fn probe_target(&self) -> ProbeTarget {
        ProbeTarget {
            url: self.url("v1/chat/completions"),
            payload: serde_json::json!({
                "model": self.model_id,
                "messages": [{"role": "user", "content": "test"}],
                "temperature": 0.01,
                "max_tokens": 4,
                "stream": false,
            }),
        }
    }
}

/// Maps non-2xx responses to [`Error::Backend`], keeping the body for
/// diagnostics.
async fn ensure_success(url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<unreadable body: {e}>"));
    Err(Error::Backend {
        context: format!("{url} answered {status}: {body}"),
    })
}

/// Builds the process-wide HTTP client: default headers, cookies as a single
/// `Cookie` header, and the request timeout.
///
/// # Errors
///
/// Returns [`Error::Validation`] for header names or values that are not
/// valid HTTP, or if the client cannot be constructed.
pub fn build_client(config: &ServerConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::Validation {
            reason: format!("invalid header name {name:?}: {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| Error::Validation {
            reason: format!("invalid value for header {name}: {e}"),
        })?;
        headers.insert(name, value);
    }

    if !config.cookies.is_empty() {
        let cookie = config
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        let value = HeaderValue::from_str(&cookie).map_err(|e| Error::Validation {
            reason: format!("invalid cookie value: {e}"),
        })?;
        headers.insert(COOKIE, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(config.http_timeout)
        .connect_timeout(core::time::Duration::from_secs(10))
        .tcp_nodelay(true)
        .build()
        .map_err(|e| Error::Validation {
            reason: format!("failed to build HTTP client: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parsing() {
        assert_eq!("tgi".parse::<BackendKind>().unwrap(), BackendKind::Tgi);
        assert_eq!(" OpenAI ".parse::<BackendKind>().unwrap(), BackendKind::OpenAi);
        assert_eq!("vllm".parse::<BackendKind>().unwrap(), BackendKind::OpenAi);
        assert!(matches!(
            "triton".parse::<BackendKind>(),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn chat_body_flattens_params() {
        let params = ChatParams::normalize(
            &guardstream_tonic_core::proto::ChatCompletionStreamRequest {
                max_tokens: Some(16),
                ..Default::default()
            },
            ParamDefaults {
                max_new_tokens: 512,
                temperature: 0.5,
            },
        );
        let body = ChatBody {
            model: Some("llama"),
            messages: vec![WireMessage::user("hi")],
            stream: true,
            params: &params,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "llama");
        assert_eq!(json["max_tokens"], 16);
        assert_eq!(json["n"], 1);
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
