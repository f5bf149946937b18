use common::priority::Priority;
use std::time::Duration;

/// Checkpoint and retry tuning for a receiver sink
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub checkpoint_timeout: Duration,
    pub retry_backoff_start: Duration,
    pub retry_backoff_max: Duration,
    pub retry_publish_attempts: usize,
    /// Failed payload bytes that trigger a flush without waiting for a checkpoint
    pub max_failed_bytes: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            checkpoint_timeout: Duration::from_secs(15 * 60),
            retry_backoff_start: Duration::from_secs(5),
            retry_backoff_max: Duration::from_secs(13),
            retry_publish_attempts: 4,
            max_failed_bytes: 100 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Prefix of every partition identifier in logs
    pub moniker: String,
    pub consumer_group: String,
    /// Name checked against the slowdown flag
    pub handler_name: String,
    pub priority: Priority,
    pub receive_batch_size: usize,
    pub receive_wait: Duration,
    pub enable_keep_alive: bool,
    pub keep_alive_interval: Duration,
    pub keep_alive_log_interval: Duration,
    pub slowdown_check_interval: Duration,
    pub max_slowdown: Duration,
    pub error_delay: Duration,
    /// How often a partition held elsewhere is tried again
    pub lease_retry_interval: Duration,
    /// Must be well under the lease time-to-live
    pub lease_renew_interval: Duration,
    pub sink: SinkConfig,
    pub work_items: QueueWorkerConfig,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            moniker: "lifecycle".to_string(),
            consumer_group: "default".to_string(),
            handler_name: "default".to_string(),
            priority: Priority::High,
            receive_batch_size: 100,
            receive_wait: Duration::from_secs(1),
            enable_keep_alive: true,
            keep_alive_interval: Duration::from_secs(1),
            keep_alive_log_interval: Duration::from_secs(60),
            slowdown_check_interval: Duration::from_secs(1),
            max_slowdown: Duration::from_secs(20),
            error_delay: Duration::from_secs(1),
            lease_retry_interval: Duration::from_secs(10),
            lease_renew_interval: Duration::from_secs(20),
            sink: SinkConfig::default(),
            work_items: QueueWorkerConfig::default(),
        }
    }
}

/// Polling behavior of a work-item queue worker
#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    pub batch_size: usize,
    pub lease: Duration,
    pub min_idle_backoff: Duration,
    pub max_idle_backoff: Duration,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            lease: Duration::from_secs(5 * 60),
            min_idle_backoff: Duration::from_secs(1),
            max_idle_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryQueueHandlerConfig {
    pub consumer_group: String,
    pub max_messages: usize,
    pub lease: Duration,
    /// Upper bound of the jittered delay before each dequeue; never below 100ms
    pub max_delay_ms: u64,
    pub disabled_poll_interval: Duration,
    pub empty_queue_delay: Duration,
    pub backup: QueueWorkerConfig,
}

impl Default for RetryQueueHandlerConfig {
    fn default() -> Self {
        Self {
            consumer_group: "default".to_string(),
            max_messages: 10,
            lease: Duration::from_secs(5 * 60),
            max_delay_ms: 100,
            disabled_poll_interval: Duration::from_secs(30),
            empty_queue_delay: Duration::from_secs(30),
            backup: QueueWorkerConfig::default(),
        }
    }
}
