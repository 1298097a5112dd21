//! Tokenizer abstraction used to synthesize refusals.
//!
//! Refusal chunks must look like the backend's own chunks (same token IDs,
//! same text segmentation), so they are produced with the tokenizer of the
//! generation model. [`HfTokenizer`] loads a Hugging Face `tokenizer.json`
//! when the `hf-tokenizer` feature is enabled.

use crate::Result;

pub type TokenId = u32;

pub trait Tokenizer: Send + Sync {
    /// Encodes `text` without adding special tokens.
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;

    /// Decodes `ids`, skipping special tokens.
    fn decode(&self, ids: &[TokenId]) -> Result<String>;
}

#[cfg(feature = "hf-tokenizer")]
pub use hf::HfTokenizer;

#[cfg(feature = "hf-tokenizer")]
mod hf {
    use super::{TokenId, Tokenizer};
    use crate::{Error, Result};
    use std::path::Path;

    /// Hugging Face `tokenizers` backed implementation.
    pub struct HfTokenizer {
        inner: tokenizers::Tokenizer,
    }

    impl HfTokenizer {
        /// Loads a serialized `tokenizer.json`.
        ///
        /// # Errors
        ///
        /// Returns [`Error::Tokenizer`] if the file cannot be read or parsed.
        pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| Error::Tokenizer {
                reason: format!("failed to load {}: {e}", path.display()),
            })?;
            tracing::info!(path = %path.display(), vocab = inner.get_vocab_size(true), "tokenizer loaded");
            Ok(Self { inner })
        }
    }

    impl Tokenizer for HfTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
            let encoding = self.inner.encode(text, false).map_err(|e| Error::Tokenizer {
                reason: format!("encode failed: {e}"),
            })?;
            Ok(encoding.get_ids().to_vec())
        }

        fn decode(&self, ids: &[TokenId]) -> Result<String> {
            self.inner.decode(ids, true).map_err(|e| Error::Tokenizer {
                reason: format!("decode failed: {e}"),
            })
        }
    }
}

/// One token per Unicode scalar value; IDs are the code points.
#[cfg(test)]
pub(crate) struct CharTokenizer;

#[cfg(test)]
impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        Ok(text.chars().map(u32::from).collect())
    }

    fn decode(&self, ids: &[TokenId]) -> Result<String> {
        ids.iter()
            .map(|id| {
                char::from_u32(*id).ok_or_else(|| crate::Error::Tokenizer {
                    reason: format!("invalid code point {id}"),
                })
            })
            .collect()
    }
}
