use std::time::Duration;

/// Doubling delay, capped at `max`. Each operation owns its own instance.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    next: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            next: start.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }
}
