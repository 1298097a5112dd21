//! The safety gate between a token source and the caller.
//!
//! [`Orchestrator::run`] drives one request: it consumes the token source,
//! casts each item, and holds the resulting chunks in a [`PendingQueue`] until
//! the [`SafeguardTask`] has produced a verdict.
//!
//! ## Protocol
//!
//! 1. After every produced chunk the classifier is checked without blocking.
//!    The verdict is read at most once.
//! 2. Safe: the queue is flushed in order and every later chunk passes
//!    straight through.
//! 3. Unsafe: the token source is dropped immediately, the queue is discarded
//!    unread and the refusal produced by the [`RefusalStreamer`] is sent
//!    instead.
//! 4. Source exhausted with no verdict yet: the classifier is polled once per
//!    [`SafeguardWait::poll_interval`] until [`SafeguardWait::timeout`]. On
//!    timeout the classifier task is aborted and the request fails with
//!    [`Error::SafeguardNotResponsive`]. A short generation never shortcuts to
//!    "safe".
//!
//! ## Cancellation
//!
//! The orchestrator watches the response channel. If the caller drops the
//! receiving side, it returns [`Error::RequestCancelled`]; the token source and
//! the classifier task are dropped with it, which closes the upstream
//! response and aborts the classification.
//!
//! [`RefusalStreamer`]: crate::RefusalStreamer

use crate::{
    Error, GenerationContext, PendingQueue, ResponseShape, Result, SafeguardTask, SafeguardWait,
    SafetyVerdict,
};
use core::time::Duration;
use futures::StreamExt;
use tokio::sync::mpsc;

/// How a request that did not fail came to an end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The token source ended naturally and every chunk was delivered.
    Completed { chunks: usize },
    /// The prompt was unsafe; the backend output was replaced.
    Replaced {
        harm_category: String,
        /// Casted chunks dropped without being delivered.
        discarded: usize,
        /// Refusal chunks delivered.
        chunks: usize,
    },
}

/// Runs the safety gate for individual requests.
///
/// Holds only process-wide configuration; all per-request state lives inside
/// [`Orchestrator::run`].
#[derive(Clone, Copy, Debug)]
pub struct Orchestrator {
    wait: SafeguardWait,
}

impl Orchestrator {
    pub const fn new(wait: SafeguardWait) -> Self {
        Self { wait }
    }

    /// Streams the gated output of one request into `tx`.
    ///
    /// `safeguard` must already be running. Only `Ok` values are ever sent;
    /// errors are returned so the caller can decide how to surface them.
    ///
    /// # Errors
    ///
    /// - [`Error::SafeguardNotResponsive`] if no verdict arrived in time.
    /// - [`Error::RequestCancelled`] if the receiver was dropped.
    /// - Any error yielded by the token source, the caster, the classifier or
    ///   the refusal tokenizer.
    pub async fn run<S, E>(
        &self,
        ctx: GenerationContext<S>,
        mut safeguard: SafeguardTask,
        tx: &mpsc::Sender<core::result::Result<S::Chunk, E>>,
    ) -> Result<Outcome>
    where
        S: ResponseShape,
        E: Send,
    {
        let GenerationContext {
            mut source,
            shape,
            refusal,
        } = ctx;
        let mut pending = PendingQueue::new();
        let mut produced = 0_usize;
        let mut delivered = 0_usize;

        loop {
            let item = tokio::select! {
                biased;
                () = tx.closed() => return Err(Error::RequestCancelled),
                item = source.next() => item,
            };
            let Some(raw) = item else {
                break;
            };

            produced += 1;
            pending.push(shape.cast(raw?, produced)?);

            match safeguard.try_resolve().await?.map(SafetyVerdict::is_safe) {
                Some(true) => delivered += flush(&mut pending, tx).await?,
                Some(false) => break,
                None => {}
            }
        }

        // Whether exhausted or cut short, the upstream is no longer needed.
        drop(source);

        let resolved = safeguard.try_resolve().await?.cloned();
        let verdict = match resolved {
            Some(verdict) => verdict,
            None => {
                tracing::debug!(buffered = pending.len(), "token source exhausted before verdict");
                self.wait_for_verdict(&mut safeguard, tx).await?
            }
        };

        match verdict {
            SafetyVerdict::Safe => {
                delivered += flush(&mut pending, tx).await?;
                tracing::debug!(produced, delivered, "generation completed");
                Ok(Outcome::Completed { chunks: delivered })
            }
            SafetyVerdict::Unsafe { harm_category } => {
                let discarded = pending.discard();
                tracing::warn!(
                    harm_category = %harm_category,
                    produced,
                    discarded,
                    "unsafe prompt, replacing generated output"
                );

                let chunks = refusal.stream(&harm_category, &shape)?;
                let sent = chunks.len();
                for chunk in chunks {
                    send(tx, chunk).await?;
                }

                Ok(Outcome::Replaced {
                    harm_category,
                    discarded,
                    chunks: sent,
                })
            }
        }
    }

    async fn wait_for_verdict<T>(
        &self,
        safeguard: &mut SafeguardTask,
        tx: &mpsc::Sender<T>,
    ) -> Result<SafetyVerdict> {
        let mut waited = Duration::ZERO;

        while waited < self.wait.timeout() {
            tokio::select! {
                biased;
                () = tx.closed() => return Err(Error::RequestCancelled),
                () = tokio::time::sleep(self.wait.poll_interval()) => {}
            }
            if let Some(verdict) = safeguard.try_resolve().await?.cloned() {
                return Ok(verdict);
            }
            waited += self.wait.poll_interval();
        }

        safeguard.cancel();
        tracing::warn!(
            timeout_secs = self.wait.timeout().as_secs(),
            "safeguard not responsive, request aborted"
        );
        Err(Error::SafeguardNotResponsive {
            timeout_secs: self.wait.timeout().as_secs(),
            prompt_chars: safeguard.prompt_chars(),
        })
    }
}

async fn flush<C, E>(
    pending: &mut PendingQueue<C>,
    tx: &mpsc::Sender<core::result::Result<C, E>>,
) -> Result<usize> {
    let mut sent = 0;
    for chunk in pending.drain() {
        send(tx, chunk).await?;
        sent += 1;
    }
    Ok(sent)
}

async fn send<C, E>(tx: &mpsc::Sender<core::result::Result<C, E>>, chunk: C) -> Result<()> {
    tx.send(Ok(chunk))
        .await
        .map_err(|_| Error::RequestCancelled)
}
