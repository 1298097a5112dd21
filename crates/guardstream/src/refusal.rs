use crate::{
    Error, Result,
    context::{RefusalEnd, RefusalToken, ResponseShape, SAFETY_STOP_REASON},
    tokenizer::{TokenId, Tokenizer},
};
use std::sync::Arc;

/// Placeholder replaced by the harm category in refusal templates.
pub const CATEGORY_PLACEHOLDER: &str = "{category}";

pub const DEFAULT_REFUSAL_TEMPLATE: &str = "I'm sorry, but I can't help with that request. \
     It was flagged by our content safety policy under the category: {category}.";

/// A rendered and tokenized refusal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Refusal {
    pub ids: Vec<TokenId>,
    /// Text contributed by each token, aligned with `ids`.
    pub pieces: Vec<String>,
    /// Full decoded text.
    pub text: String,
}

/// Synthesizes the replacement stream for unsafe prompts.
///
/// The refusal is rendered from a fixed template, tokenized with the
/// generation model's tokenizer and replayed token by token, so the chunks
/// have the same ID/text shape as real backend output. Output depends only on
/// the harm category.
#[derive(Clone)]
pub struct RefusalStreamer {
    tokenizer: Arc<dyn Tokenizer>,
    template: Arc<str>,
}

impl RefusalStreamer {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            template: Arc::from(DEFAULT_REFUSAL_TEMPLATE),
        }
    }

    /// Replaces the refusal template. `{category}` is substituted with the
    /// harm category; a template without it is used verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a blank template.
    pub fn with_template(mut self, template: &str) -> Result<Self> {
        if template.trim().is_empty() {
            return Err(Error::validation("refusal template must not be blank"));
        }
        self.template = Arc::from(template);
        Ok(self)
    }

    pub fn render(&self, harm_category: &str) -> String {
        self.template.replace(CATEGORY_PLACEHOLDER, harm_category)
    }

    /// Renders and tokenizes the refusal for `harm_category`.
    ///
    /// Each token's text is obtained by incremental detokenization: decoding
    /// the prefix ending at that token and keeping what it adds to the
    /// previous prefix. This keeps multi-token characters and leading-space
    /// markers intact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tokenizer`] if encoding or decoding fails, or if the
    /// rendered refusal encodes to no tokens.
    pub fn tokenize(&self, harm_category: &str) -> Result<Refusal> {
        let rendered = self.render(harm_category);
        let ids = self.tokenizer.encode(&rendered)?;
        if ids.is_empty() {
            return Err(Error::Tokenizer {
                reason: "refusal encoded to zero tokens".to_owned(),
            });
        }

        let mut pieces = Vec::with_capacity(ids.len());
        let mut prefix = String::new();
        for end in 1..=ids.len() {
            let decoded = self.tokenizer.decode(&ids[..end])?;
            let piece = match decoded.strip_prefix(prefix.as_str()) {
                Some(added) => added.to_owned(),
                None => self.tokenizer.decode(&ids[end - 1..end])?,
            };
            pieces.push(piece);
            prefix = decoded;
        }

        Ok(Refusal {
            ids,
            pieces,
            text: prefix,
        })
    }

    /// Builds the full replacement chunk sequence for `harm_category`.
    ///
    /// The last chunk carries [`SAFETY_STOP_REASON`] and the number of
    /// synthesized tokens.
    ///
    /// # Errors
    ///
    /// See [`RefusalStreamer::tokenize`].
    pub fn stream<S: ResponseShape>(&self, harm_category: &str, shape: &S) -> Result<Vec<S::Chunk>> {
        let refusal = self.tokenize(harm_category)?;
        let generated_tokens = u32::try_from(refusal.ids.len()).map_err(|_| Error::Tokenizer {
            reason: format!("refusal is too long ({} tokens)", refusal.ids.len()),
        })?;
        let last = refusal.ids.len() - 1;

        let chunks = refusal
            .ids
            .iter()
            .zip(&refusal.pieces)
            .enumerate()
            .map(|(index, (&id, piece))| {
                let token = RefusalToken {
                    id,
                    text: piece,
                    index,
                };
                let end = (index == last).then_some(RefusalEnd {
                    finish_reason: SAFETY_STOP_REASON,
                    generated_tokens,
                    generated_text: &refusal.text,
                });
                shape.refusal_chunk(token, end)
            })
            .collect();

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::CharTokenizer;

    #[derive(Debug, PartialEq)]
    struct Plain {
        id: TokenId,
        text: String,
        finish: Option<(String, u32, String)>,
    }

    struct PlainShape;

    impl ResponseShape for PlainShape {
        type Raw = ();
        type Chunk = Plain;

        fn cast(&self, _raw: (), _position: usize) -> Result<Plain> {
            unreachable!("refusal tests never cast")
        }

        fn refusal_chunk(&self, token: RefusalToken<'_>, end: Option<RefusalEnd<'_>>) -> Plain {
            Plain {
                id: token.id,
                text: token.text.to_owned(),
                finish: end.map(|e| {
                    (
                        e.finish_reason.to_owned(),
                        e.generated_tokens,
                        e.generated_text.to_owned(),
                    )
                }),
            }
        }
    }

    fn streamer(template: &str) -> RefusalStreamer {
        RefusalStreamer::new(Arc::new(CharTokenizer))
            .with_template(template)
            .unwrap()
    }

    #[test]
    fn substitutes_the_category() {
        let streamer = streamer("blocked: {category}");
        assert_eq!(streamer.render("Hate"), "blocked: Hate");
    }

    #[test]
    fn pieces_concatenate_to_the_rendered_text() {
        let streamer = streamer("no ({category})");
        let refusal = streamer.tokenize("S1").unwrap();
        assert_eq!(refusal.text, "no (S1)");
        assert_eq!(refusal.pieces.concat(), refusal.text);
        assert_eq!(refusal.ids.len(), refusal.pieces.len());
    }

    #[test]
    fn only_the_last_chunk_is_terminal() {
        let streamer = streamer("no {category}");
        let chunks = streamer.stream("S1", &PlainShape).unwrap();

        assert_eq!(chunks.len(), "no S1".chars().count());
        assert!(chunks[..chunks.len() - 1].iter().all(|c| c.finish.is_none()));
        assert_eq!(
            chunks.last().unwrap().finish,
            Some((SAFETY_STOP_REASON.to_owned(), 5, "no S1".to_owned()))
        );
    }

    #[test]
    fn stream_is_deterministic_per_category() {
        let streamer = RefusalStreamer::new(Arc::new(CharTokenizer));
        let first = streamer.stream("S1", &PlainShape).unwrap();
        let second = streamer.stream("S1", &PlainShape).unwrap();
        assert_eq!(first, second);

        let other = streamer.stream("S2", &PlainShape).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn blank_template_is_rejected() {
        assert!(matches!(
            RefusalStreamer::new(Arc::new(CharTokenizer)).with_template("  "),
            Err(Error::Validation { .. })
        ));
    }

    struct SilentTokenizer;

    impl Tokenizer for SilentTokenizer {
        fn encode(&self, _text: &str) -> Result<Vec<TokenId>> {
            Ok(Vec::new())
        }

        fn decode(&self, _ids: &[TokenId]) -> Result<String> {
            Ok(String::new())
        }
    }

    #[test]
    fn empty_encoding_is_a_tokenizer_error() {
        let streamer = RefusalStreamer::new(Arc::new(SilentTokenizer));
        assert!(matches!(
            streamer.stream("S1", &PlainShape),
            Err(Error::Tokenizer { .. })
        ));
    }
}
