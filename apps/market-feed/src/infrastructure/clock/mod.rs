//! Production clock backed by `tokio::time`.
//!
//! Under `#[tokio::test(start_paused = true)]` this clock runs on virtual
//! time, so TTL and backoff tests complete instantly.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::application::ports::Clock;

/// `tokio::time` clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_advances_virtual_time() {
        let clock = TokioClock;
        let start = clock.now();
        clock.sleep(Duration::from_secs(30)).await;
        assert_eq!(clock.now() - start, Duration::from_secs(30));
    }
}
