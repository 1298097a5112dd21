//! Error taxonomy for safety-gated generation.
//!
//! Every variant is request-scoped: it aborts the stream of the request that
//! produced it and nothing else. Variants split into two groups that the
//! transport layer logs differently:
//!
//! - *expected* failures ([`Error::Validation`], the safeguard family and
//!   [`Error::RequestCancelled`]) are logged with their message only;
//! - *unexpected* failures ([`Error::Backend`], [`Error::Cast`],
//!   [`Error::Tokenizer`] and [`Error::Internal`]) are logged with their full
//!   debug chain. For [`Error::Internal`] that includes the backtrace captured
//!   by `anyhow` when `RUST_BACKTRACE` is set.
//!
//! See [`Error::wants_diagnostics`].

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors the orchestration engine and its collaborators can surface.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed construction-time arguments (backend selection, URLs,
    /// headers, timeouts, generation parameters).
    #[error("validation error: {reason}")]
    Validation { reason: String },

    /// The safeguard did not produce a verdict within the configured timeout
    /// after generation finished.
    #[error("safeguard did not respond within {timeout_secs}s for prompt of {prompt_chars} chars")]
    SafeguardNotResponsive { timeout_secs: u64, prompt_chars: usize },

    /// The safeguard answered with something that is neither `safe` nor a
    /// well-formed `unsafe` verdict.
    #[error("could not parse safeguard response: {response:?}")]
    SafeguardResponseParse { response: String },

    /// The safeguard flagged the prompt with a harm code that is not in the
    /// configured category table.
    #[error("unrecognized safeguard harm category: {code}")]
    SafeguardUnrecognizedCategory { code: String },

    /// The generation or safeguard backend failed at the transport level or
    /// answered with an error status.
    #[error("backend error: {context}")]
    Backend { context: String },

    /// A backend response did not have the shape the caster expects.
    #[error("unexpected backend response: {reason}")]
    Cast { reason: String },

    /// Encoding or decoding through the generation tokenizer failed.
    #[error("tokenizer error: {reason}")]
    Tokenizer { reason: String },

    /// The caller went away before the stream finished.
    #[error("request cancelled by client")]
    RequestCancelled,

    /// Anything else.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error should be logged with its full diagnostic chain.
    ///
    /// Expected failures are reported by message only; unexpected ones carry
    /// the debug representation, which for [`Error::Internal`] includes a
    /// backtrace when one was captured.
    pub const fn wants_diagnostics(&self) -> bool {
        matches!(
            self,
            Self::Backend { .. } | Self::Cast { .. } | Self::Tokenizer { .. } | Self::Internal(_)
        )
    }

    /// Whether the error belongs to the known taxonomy, as opposed to
    /// [`Error::Internal`].
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}
