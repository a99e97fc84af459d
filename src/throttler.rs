//! Write throttling.
//!
//! The appliers only await a permit; deciding *when* to throttle (replication
//! lag, operator pause) belongs to the throttler implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::sleep;

const THROTTLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub trait Throttler: Send + Sync {
    fn throttled(&self) -> bool;
}

/// Operator-controlled pause switch.
#[derive(Default)]
pub struct PauserThrottler {
    paused: AtomicBool,
}

impl PauserThrottler {
    pub fn new(paused: bool) -> Self {
        Self {
            paused: AtomicBool::new(paused),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

impl Throttler for PauserThrottler {
    fn throttled(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Block until the throttler (when present) grants a permit.
pub async fn wait_for_throttle(throttler: Option<&dyn Throttler>) {
    let Some(throttler) = throttler else { return };
    while throttler.throttled() {
        sleep(THROTTLE_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unthrottled_returns_immediately() {
        let throttler = PauserThrottler::new(false);
        wait_for_throttle(Some(&throttler)).await;
        wait_for_throttle(None).await;
    }

    #[tokio::test]
    async fn test_wait_resumes_after_unpause() {
        let throttler = Arc::new(PauserThrottler::new(true));

        let unpause = throttler.clone();
        let unpauser = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            unpause.set_paused(false);
        });

        wait_for_throttle(Some(throttler.as_ref())).await;
        assert!(!throttler.throttled());
        unpauser.await.unwrap();
    }
}
