use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// What the waiter saw when it stopped polling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WaitOutcome {
    pub expected: usize,
    pub observed: usize,
    /// `false` when the wait timed out short of `expected`.
    pub complete: bool,
    pub waited: Duration,
}

impl WaitOutcome {
    pub fn is_partial(&self) -> bool {
        !self.complete
    }
}

/// Polls a chunk count until it reaches the expected total or time runs out.
#[derive(Debug, Clone)]
pub struct ChunkWaiter {
    poll_interval: Duration,
}

impl ChunkWaiter {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub async fn wait_for<F, Fut>(&self, expected: usize, max_wait: Duration, mut count: F) -> WaitOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = usize>,
    {
        let started = Instant::now();
        loop {
            let observed = count().await;
            let waited = started.elapsed();
            if observed >= expected {
                debug!(expected, observed, ?waited, "chunk set complete");
                return WaitOutcome {
                    expected,
                    observed,
                    complete: true,
                    waited,
                };
            }
            if waited >= max_wait {
                info!(expected, observed, ?waited, "chunk wait timed out with a partial set");
                return WaitOutcome {
                    expected,
                    observed,
                    complete: false,
                    waited,
                };
            }
            let remaining = max_wait - waited;
            sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

impl Default for ChunkWaiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
