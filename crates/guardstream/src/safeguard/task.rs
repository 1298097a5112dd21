use crate::{Error, Result, SafetyVerdict};
use core::future::Future;
use tokio::task::{JoinError, JoinHandle};

enum State {
    Pending(JoinHandle<Result<SafetyVerdict>>),
    Resolved(SafetyVerdict),
    /// Cancelled, or the classifier failed. The join handle is gone either
    /// way, so there is nothing left to read.
    Closed,
}

/// Handle to the one-shot safety classification of a single request.
///
/// The classifier runs on its own tokio task from the moment
/// [`SafeguardTask::spawn`] is called. The orchestrator checks it without
/// blocking after every produced chunk, and the task's result is read at most
/// once: the first successful check stores the verdict, every later check
/// observes the stored value.
///
/// Dropping a still-pending handle aborts the classifier task, so a request
/// that goes away for any reason never leaks it.
pub struct SafeguardTask {
    prompt_chars: usize,
    state: State,
}

impl SafeguardTask {
    /// Starts classifying `raw_prompt` on a new tokio task.
    ///
    /// `classify` is expected to already own whatever it needs (client,
    /// prompt); `raw_prompt` is only kept for diagnostics.
    pub fn spawn<F>(raw_prompt: &str, classify: F) -> Self
    where
        F: Future<Output = Result<SafetyVerdict>> + Send + 'static,
    {
        Self {
            prompt_chars: raw_prompt.chars().count(),
            state: State::Pending(tokio::spawn(classify)),
        }
    }

    /// Number of characters in the classified prompt.
    pub const fn prompt_chars(&self) -> usize {
        self.prompt_chars
    }

    /// The verdict, if it has already been read.
    #[cfg(test)]
    fn verdict(&self) -> Option<&SafetyVerdict> {
        match &self.state {
            State::Resolved(verdict) => Some(verdict),
            State::Pending(_) | State::Closed => None,
        }
    }

    /// Whether the classifier task has completed (read or not).
    #[cfg(test)]
    fn is_finished(&self) -> bool {
        match &self.state {
            State::Pending(handle) => handle.is_finished(),
            State::Resolved(_) => true,
            State::Closed => false,
        }
    }

    /// Non-blocking check: reads the verdict if the classifier has completed.
    ///
    /// Returns `Ok(None)` while the classifier is still running. Once a
    /// verdict has been read it is returned on every subsequent call without
    /// touching the task again.
    ///
    /// # Errors
    ///
    /// Propagates the classifier's own error (parse failures, unrecognized
    /// categories, backend errors), or [`Error::Internal`] if the task
    /// panicked or was cancelled.
    pub async fn try_resolve(&mut self) -> Result<Option<&SafetyVerdict>> {
        if let State::Pending(handle) = &mut self.state {
            if !handle.is_finished() {
                return Ok(None);
            }
            let joined = handle.await;
            self.state = State::Closed;
            let verdict = flatten(joined)?;
            tracing::debug!(is_safe = verdict.is_safe(), "safeguard verdict read");
            self.state = State::Resolved(verdict);
        }

        match &self.state {
            State::Resolved(verdict) => Ok(Some(verdict)),
            State::Pending(_) => Ok(None),
            State::Closed => Err(Error::Internal(anyhow::anyhow!(
                "safeguard task is no longer available"
            ))),
        }
    }

    /// Aborts the classifier task if it is still pending.
    pub fn cancel(&mut self) {
        if let State::Pending(handle) = &self.state {
            handle.abort();
            self.state = State::Closed;
            tracing::debug!("safeguard task cancelled");
        }
    }
}

impl Drop for SafeguardTask {
    fn drop(&mut self) {
        if let State::Pending(handle) = &self.state {
            handle.abort();
        }
    }
}

fn flatten(joined: Result<Result<SafetyVerdict>, JoinError>) -> Result<SafetyVerdict> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(Error::Internal(anyhow::anyhow!(
            "safeguard task panicked: {e}"
        ))),
        Err(e) => Err(Error::Internal(anyhow::anyhow!(
            "safeguard task was cancelled: {e}"
        ))),
    }
}
