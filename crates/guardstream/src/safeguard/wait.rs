use crate::{Error, Result};
use core::time::Duration;

/// How long the orchestrator waits for a verdict once the token source is
/// exhausted.
///
/// The wait is a fixed-granularity poll: sleep one `poll_interval`, check the
/// classifier, repeat until `timeout` worth of intervals have elapsed. With the
/// default one-second interval a verdict that lands mid-interval is picked up
/// at the next whole second.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SafeguardWait {
    timeout: Duration,
    poll_interval: Duration,
}

impl SafeguardWait {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Builds a policy that waits up to `timeout_secs`, polling once a second.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `timeout_secs` is zero.
    pub fn from_secs(timeout_secs: u64) -> Result<Self> {
        Self::new(Duration::from_secs(timeout_secs), Self::DEFAULT_POLL_INTERVAL)
    }

    /// # Errors
    ///
    /// Returns [`Error::Validation`] if either duration is zero.
    pub fn new(timeout: Duration, poll_interval: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(Error::validation("safeguard timeout must be greater than 0"));
        }
        if poll_interval.is_zero() {
            return Err(Error::validation(
                "safeguard poll interval must be greater than 0",
            ));
        }
        Ok(Self {
            timeout,
            poll_interval,
        })
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
