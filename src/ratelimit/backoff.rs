//! Cancellable backoff timer.

use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::{DispatchError, Result};

/// A timer that resolves after a backoff delay unless it is cancelled first.
///
/// The sleep runs on its own task so the limiter can abort it through an
/// [`AbortHandle`] when a newer backoff supersedes it or the dispatcher shuts
/// down. Dropping the timer aborts it as well.
#[derive(Debug)]
pub struct BackoffTimer {
    delay: Duration,
    handle: JoinHandle<()>,
}

impl BackoffTimer {
    /// Start a timer on the current tokio runtime.
    pub(crate) fn start(delay: Duration) -> Self {
        let handle = tokio::spawn(tokio::time::sleep(delay));
        Self { delay, handle }
    }

    /// The delay this timer was started with.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub(crate) fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    /// Wait for the timer to fire.
    pub async fn wait(mut self) -> Result<()> {
        match (&mut self.handle).await {
            Ok(()) => Ok(()),
            Err(_) => Err(DispatchError::Cancelled),
        }
    }
}

impl Drop for BackoffTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
