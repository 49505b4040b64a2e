//! Bounded retry policy for polling remote state.
//!
//! The only component-level poll in the system is the preview URL lookup: the
//! sandbox tunnel may take a few seconds to come up after the dev server
//! starts. [`RetryPolicy`] captures the attempt budget and fixed delay, and
//! [`Sleeper`] abstracts the wait so tests can run without wall-clock time.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay between consecutive attempts.
    #[serde(with = "crate::config::duration_ms")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget and delay.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Upper bound on time spent sleeping if every attempt comes back empty.
    pub fn ceiling(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }

    /// Run `attempt` until it yields `Some`, an error, or the budget runs out.
    ///
    /// Sleeps between attempts but never after the last one. Errors are
    /// returned immediately and are not retried.
    ///
    /// Returns `Ok(None)` when every attempt came back empty.
    pub async fn poll<T, E, F, Fut>(
        &self,
        sleeper: &dyn Sleeper,
        mut attempt: F,
    ) -> Result<Option<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        for n in 1..=self.max_attempts {
            if let Some(value) = attempt(n).await? {
                return Ok(Some(value));
            }
            if n < self.max_attempts {
                sleeper.sleep(self.delay).await;
            }
        }
        Ok(None)
    }
}

/// Something that can wait for a duration.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use recording::RecordingSleeper;

/// Test doubles, available with the `test-util` feature.
#[cfg(any(test, feature = "test-util"))]
mod recording {
    use std::fmt;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::Sleeper;

    /// Sleeper that returns immediately and records every requested wait.
    #[derive(Default)]
    pub struct RecordingSleeper {
        sleeps: Mutex<Vec<Duration>>,
    }

    impl fmt::Debug for RecordingSleeper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RecordingSleeper")
                .field("sleeps", &self.sleeps())
                .finish()
        }
    }

    impl RecordingSleeper {
        /// Create a sleeper with an empty log.
        pub fn new() -> Self {
            Self::default()
        }

        /// Every duration requested so far, in order.
        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.sleeps
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(duration);
        }
    }
}
