//! Admission and draining of gated streams.
//!
//! Every accepted RPC holds a [`StreamGuard`] for as long as its orchestrator
//! task runs. Shutdown stops admitting new streams, waits for the in-flight
//! ones to finish, then cancels whatever is left through the token handed out
//! by [`Lifecycle::cancelled`].

use crate::server::telemetry::{decrement_streams_inflight, increment_streams_inflight};
use core::time::Duration;
use guardstream_tonic_core::Error;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Shared {
    closing: AtomicBool,
    inflight: AtomicUsize,
    cancel: CancellationToken,
}

/// Shared by the service and the shutdown path.
#[derive(Clone, Debug, Default)]
pub struct Lifecycle {
    shared: Arc<Shared>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a new stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] once shutdown has started.
    pub fn track(&self) -> Result<StreamGuard, Error> {
        if self.is_closing() {
            return Err(Error::ServiceShutdown);
        }
        self.shared.inflight.fetch_add(1, Ordering::AcqRel);
        increment_streams_inflight();
        Ok(StreamGuard {
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Token cancelled when shutdown gives up on draining.
    pub fn cancelled(&self) -> CancellationToken {
        self.shared.cancel.child_token()
    }

    /// Stops admitting streams and waits up to `drain_timeout` for the
    /// in-flight ones to finish, then cancels the stragglers.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        tracing::info!("Refusing new requests");
        self.shared.closing.store(true, Ordering::Release);

        tracing::info!("Draining in-flight streams ({} active)", self.inflight());
        let drained = timeout(drain_timeout, async {
            while self.inflight() > 0 {
                sleep(DRAIN_POLL).await;
            }
        })
        .await;

        match drained {
            Ok(()) => tracing::debug!("All in-flight streams drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} streams still active)",
                self.inflight()
            ),
        }

        self.shared.cancel.cancel();
    }
}

/// Marks one in-flight stream; released on drop.
#[derive(Debug)]
pub struct StreamGuard {
    shared: Arc<Shared>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
        decrement_streams_inflight();
    }
}
