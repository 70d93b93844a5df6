//! Phase deadlines as cancellation tokens

use crate::error::Interruption;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Child token that fires when its parent fires or its timeout elapses
///
/// The token is cancelled on drop, which also stops the timer task.
#[derive(Debug)]
pub struct Deadline {
    token: CancellationToken,
    expires_at: Instant,
}

impl Deadline {
    pub fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        let token = parent.child_token();
        let expires_at = Instant::now() + timeout;

        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(expires_at) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });

        Self { token, expires_at }
    }

    /// Deadline that only its own timeout can end
    pub fn detached(timeout: Duration) -> Self {
        Self::new(&CancellationToken::new(), timeout)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Why the phase must stop, if it must
    pub fn interruption(&self) -> Option<Interruption> {
        if Instant::now() >= self.expires_at {
            Some(Interruption::DeadlineExceeded)
        } else if self.token.is_cancelled() {
            Some(Interruption::Cancelled)
        } else {
            None
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
