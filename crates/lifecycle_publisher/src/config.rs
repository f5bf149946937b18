use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Upper bound for one bulk envelope and for one network call
    pub max_publish_size_bytes: usize,
    pub max_send_attempts: usize,
    pub retry_delay: Duration,
    /// Picks of the endpoint that just failed tolerated before reusing it
    pub max_failing_endpoint_picks: usize,
    pub pxs_commands_batch_size: usize,
    /// Allows force completion of non-export commands
    pub test_environment: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_publish_size_bytes: 500 * 1024,
            max_send_attempts: 3,
            retry_delay: Duration::from_secs(1),
            max_failing_endpoint_picks: 5,
            pxs_commands_batch_size: 300,
            test_environment: false,
        }
    }
}
