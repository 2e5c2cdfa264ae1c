//! Processing watchdog: resets the turn if the backend never answers.

use std::time::Duration;

use tokio::time::Instant;

/// One-shot deadline armed when a turn enters `Processing`.
///
/// The actor polls [`expired`](Self::expired) inside its select loop, so the
/// timer dies with the actor and can never fire after teardown.
#[derive(Debug, Clone)]
pub struct ProcessingWatchdog {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl ProcessingWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// Start (or restart) the countdown.
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.timeout);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves at the deadline; never resolves while disarmed.
    pub fn expired(&self) -> impl Future<Output = ()> + use<> {
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        }
    }
}
