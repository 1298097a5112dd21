//! Client for the safety classifier.

use super::{
    build_client, ensure_success,
    types::{ChatCompletion, WireMessage},
};
use crate::server::config::ServerConfig;
use core::future::Future;
use guardstream_tonic_core::guardstream::{
    Error, HarmCategories, Result, SafetyVerdict, parse_verdict,
};
use serde::Serialize;
use std::sync::Arc;

/// Llama Guard answers in at most two short lines.
const MAX_VERDICT_TOKENS: u32 = 20;

#[derive(Serialize)]
struct ClassifyBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: [WireMessage; 1],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

/// Sends one prompt to the safeguard model and parses its verdict.
///
/// Cheap to clone; every request spawns its own classification with a clone.
#[derive(Clone, Debug)]
pub struct SafeguardClient {
    client: reqwest::Client,
    url: Arc<str>,
    model_id: Option<Arc<str>>,
    categories: Arc<HarmCategories>,
}

impl SafeguardClient {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        model_id: Option<&str>,
        categories: HarmCategories,
    ) -> Self {
        Self {
            client,
            url: Arc::from(format!("{base_url}/v1/chat/completions")),
            model_id: model_id.map(Arc::from),
            categories: Arc::new(categories),
        }
    }

    /// # Errors
    ///
    /// See [`build_client`].
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Ok(Self::new(
            build_client(config)?,
            &config.safeguard_url,
            config.safeguard_model_id.as_deref(),
            config.harm_categories.clone(),
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Classifies `raw_prompt`. The returned future owns everything it needs
    /// and can be spawned as is.
    pub fn classify(&self, raw_prompt: String) -> impl Future<Output = Result<SafetyVerdict>> + Send + 'static {
        let this = self.clone();
        async move {
            let body = ClassifyBody {
                model: this.model_id.as_deref(),
                messages: [WireMessage::user(raw_prompt)],
                temperature: 0.0,
                max_tokens: MAX_VERDICT_TOKENS,
                stream: false,
            };
            let response = this
                .client
                .post(&*this.url)
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::Backend {
                    context: format!("safeguard request to {} failed: {e}", this.url),
                })?;
            let response = ensure_success(&this.url, response).await?;
            let text = response.text().await.map_err(|e| Error::Backend {
                context: format!("failed to read safeguard response: {e}"),
            })?;

            let content = verdict_text(&text)?;
            tracing::debug!(answer = %content.trim(), "safeguard answered");
            parse_verdict(&content, &this.categories)
        }
    }
}

/// Extracts the assistant message from a non-streaming chat completion.
fn verdict_text(body: &str) -> Result<String> {
    let completion: ChatCompletion = serde_json::from_str(body).map_err(|_| {
        Error::SafeguardResponseParse {
            response: body.to_owned(),
        }
    })?;
    completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| Error::SafeguardResponseParse {
            response: body.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_the_first_choice() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"unsafe\nS10"},"finish_reason":"stop"}]}"#;
        let text = verdict_text(body).unwrap();
        assert_eq!(text, "unsafe\nS10");
        assert_eq!(
            parse_verdict(&text, &HarmCategories::default()).unwrap(),
            SafetyVerdict::unsafe_with("Hate")
        );
    }

    #[test]
    fn missing_content_is_a_parse_error() {
        for body in [
            r#"{"choices":[]}"#,
            r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#,
            "<html>bad gateway</html>",
        ] {
            assert!(matches!(
                verdict_text(body),
                Err(Error::SafeguardResponseParse { .. })
            ));
        }
    }

    #[test]
    fn body_carries_a_single_user_message() {
        let body = ClassifyBody {
            model: Some("Llama-Guard-3-8B"),
            messages: [WireMessage::user("how do I bake bread?")],
            temperature: 0.0,
            max_tokens: MAX_VERDICT_TOKENS,
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn url_targets_chat_completions() {
        let client = SafeguardClient::new(
            reqwest::Client::new(),
            "http://guard:8000",
            None,
            HarmCategories::default(),
        );
        assert_eq!(client.url(), "http://guard:8000/v1/chat/completions");
    }
}
