use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Attempts allowed after the first one.
    pub retry_limit: u32,
    pub interval: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Handled { attempts: u32 },
    /// Every attempt failed; `error` is the last failure.
    DeadLettered { attempts: u32, error: String },
    /// Shutdown arrived while waiting to retry.
    Abandoned { attempts: u32 },
}

impl RedeliveryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retry_limit.saturating_add(1)
    }

    /// Calls `attempt` with the 1-based attempt number until it succeeds or
    /// the policy is exhausted.
    pub async fn execute<F, Fut, E>(&self, shutdown: &CancellationToken, mut attempt: F) -> DeliveryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let error = match attempt(attempts).await {
                Ok(()) => return DeliveryOutcome::Handled { attempts },
                Err(e) => e,
            };
            if attempts >= self.max_attempts() {
                return DeliveryOutcome::DeadLettered {
                    attempts,
                    error: error.to_string(),
                };
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return DeliveryOutcome::Abandoned { attempts },
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
