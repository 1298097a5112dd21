//! Per-request wiring of the orchestrator.
//!
//! The orchestrator serves every RPC shape with the same logic. What differs
//! per shape is how a raw backend item becomes a caller-facing chunk and how a
//! refusal token is dressed up as one; both live behind [`ResponseShape`],
//! which is chosen once when the request is built and dispatched statically.

use crate::{RefusalStreamer, Result, tokenizer::TokenId};
use futures::stream::BoxStream;

/// Finish reason carried by the last chunk of a synthesized refusal.
pub const SAFETY_STOP_REASON: &str = "stream ended due to safety stop";

/// The backend's per-request stream of raw generation responses.
///
/// The orchestrator may drop it before exhaustion; implementations release
/// their upstream resources on drop.
pub type TokenSource<R> = BoxStream<'static, Result<R>>;

/// One token of a synthesized refusal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefusalToken<'a> {
    pub id: TokenId,
    /// Text this token adds to the refusal.
    pub text: &'a str,
    /// Zero-based position within the refusal.
    pub index: usize,
}

/// Terminal information attached to the last refusal token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefusalEnd<'a> {
    pub finish_reason: &'a str,
    pub generated_tokens: u32,
    pub generated_text: &'a str,
}

/// Response caster and refusal chunk builder for one RPC shape.
pub trait ResponseShape: Send + Sync + 'static {
    /// Raw item yielded by the token source.
    type Raw: Send + 'static;
    /// Caller-facing chunk.
    type Chunk: Send + 'static;

    /// Casts a raw backend item. `position` is the one-based index of the
    /// item within the token source.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Cast`] when the raw item does not have the
    /// expected shape.
    fn cast(&self, raw: Self::Raw, position: usize) -> Result<Self::Chunk>;

    /// Builds the chunk for one refusal token. `end` is set on the last one.
    fn refusal_chunk(&self, token: RefusalToken<'_>, end: Option<RefusalEnd<'_>>) -> Self::Chunk;
}

/// Everything the orchestrator needs for one request, built once.
pub struct GenerationContext<S: ResponseShape> {
    pub source: TokenSource<S::Raw>,
    pub shape: S,
    pub refusal: RefusalStreamer,
}

impl<S: ResponseShape> GenerationContext<S> {
    pub fn new(source: TokenSource<S::Raw>, shape: S, refusal: RefusalStreamer) -> Self {
        Self {
            source,
            shape,
            refusal,
        }
    }
}
