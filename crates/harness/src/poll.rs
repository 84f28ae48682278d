//! Poll-with-timeout for readiness checks

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

/// How often to probe and how long to keep trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Probe until it reports ready.
///
/// The probe is always run at least once. Errors from the probe end the wait
/// immediately; a probe that keeps returning `false` past the policy's timeout
/// yields [`HarnessError::Timeout`].
pub async fn poll_until<F, Fut>(what: &str, policy: PollPolicy, mut probe: F) -> HarnessResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HarnessResult<bool>>,
{
    let start = Instant::now();
    let mut attempts = 0usize;

    loop {
        attempts += 1;
        if probe().await? {
            debug!(what, attempts, elapsed = ?start.elapsed(), "ready");
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(HarnessError::Timeout {
                what: what.to_string(),
                elapsed,
            });
        }

        sleep(policy.interval.min(policy.timeout - elapsed)).await;
    }
}
