//! Generation backend liveness.
//!
//! [`BackendProber`] periodically sends a tiny chat completion to the
//! generation backend and mirrors the outcome into `grpc.health.v1`: the
//! `TextGenerator` service is reported `SERVING` only while the last probe
//! succeeded. Until the first success it probes every second, afterwards at
//! the configured interval.

use crate::server::{
    backend::{LlmBackend, ProbeTarget},
    service::handler::TextGeneratorService,
};
use core::time::Duration;
use guardstream_tonic_core::proto::text_generator_server::TextGeneratorServer;
use portable_atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic_health::server::HealthReporter;

const STARTUP_INTERVAL: Duration = Duration::from_secs(1);

/// Result of the most recent probe.
#[derive(Debug, Default)]
pub struct ProbeState {
    ready: AtomicBool,
    /// HTTP status of the last probe, 0 if the request itself failed.
    last_status: AtomicU16,
}

impl ProbeState {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn last_status(&self) -> u16 {
        self.last_status.load(Ordering::Acquire)
    }

    fn record(&self, status: u16, ready: bool) -> bool {
        self.last_status.store(status, Ordering::Release);
        self.ready.swap(ready, Ordering::AcqRel)
    }
}

pub struct BackendProber {
    client: reqwest::Client,
    target: ProbeTarget,
    interval: Duration,
    state: Arc<ProbeState>,
}

impl BackendProber {
    pub fn new(backend: &LlmBackend, interval: Duration) -> Self {
        Self::with_target(backend.client().clone(), backend.probe_target(), interval)
    }

    fn with_target(client: reqwest::Client, target: ProbeTarget, interval: Duration) -> Self {
        Self {
            client,
            target,
            interval,
            state: Arc::default(),
        }
    }

    pub fn state(&self) -> Arc<ProbeState> {
        Arc::clone(&self.state)
    }

    /// Sends one probe and records its outcome. Returns whether the backend
    /// is ready.
    pub async fn probe_once(&self) -> bool {
        let (status, ready) = match self
            .client
            .post(&self.target.url)
            .json(&self.target.payload)
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status();
                (status.as_u16(), status.is_success())
            }
            Err(e) => {
                tracing::debug!(url = %self.target.url, "backend probe failed: {e}");
                (0, false)
            }
        };

        let was_ready = self.state.record(status, ready);
        match (was_ready, ready) {
            (false, true) => tracing::info!(status, "generation backend is ready"),
            (true, false) => tracing::warn!(status, "generation backend stopped answering"),
            _ => {}
        }
        ready
    }

    fn next_delay(&self, ever_ready: bool) -> Duration {
        if ever_ready {
            self.interval
        } else {
            STARTUP_INTERVAL
        }
    }

    /// Probes until `cancel` fires, keeping `reporter` in sync.
    pub async fn run(self, reporter: HealthReporter, cancel: CancellationToken) {
        let mut ever_ready = false;
        let mut serving = false;

        loop {
            let ready = tokio::select! {
                () = cancel.cancelled() => break,
                ready = self.probe_once() => ready,
            };
            ever_ready |= ready;

            if ready != serving {
                if ready {
                    reporter
                        .set_serving::<TextGeneratorServer<TextGeneratorService>>()
                        .await;
                } else {
                    reporter
                        .set_not_serving::<TextGeneratorServer<TextGeneratorService>>()
                        .await;
                }
                serving = ready;
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.next_delay(ever_ready)) => {}
            }
        }
        tracing::debug!("backend prober stopped");
    }
}
