use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

use common::flags::FlagConfig;
use common::priority::Priority;
use lifecycle_receiver::{QueueWorkerConfig, ReceiverConfig, RetryQueueHandlerConfig, SinkConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Service name attached to every log line
    #[serde(default = "default_service_name")]
    pub service_name: String,

    // NATS configuration
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Startup timeout for initializing dependencies (in seconds)
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// JetStream stream carrying lifecycle events
    #[serde(default = "default_event_stream")]
    pub event_stream: String,

    /// Number of partitions of the event stream
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,

    /// Ack wait of the partition consumers (in seconds)
    #[serde(default = "default_partition_ack_wait_secs")]
    pub partition_ack_wait_secs: u64,

    /// Key-value bucket holding partition leases
    #[serde(default = "default_lease_bucket")]
    pub lease_bucket: String,

    /// Lease time-to-live (in seconds), renewed every third of it.
    /// Longer than the partition ack wait so a crashed owner's messages are
    /// redelivered before anyone else takes the partition.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Largest batch the keep-alive and fallback senders publish at once
    #[serde(default = "default_max_send_batch_bytes")]
    pub max_send_batch_bytes: usize,

    // Receiver configuration
    /// Prefix of every partition identifier
    #[serde(default = "default_moniker")]
    pub moniker: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Name checked against the slowdown flag
    #[serde(default = "default_handler_name")]
    pub handler_name: String,

    /// Semaphore priority of partition batches (High or Background)
    #[serde(default)]
    pub priority: Priority,

    #[serde(default = "default_receive_batch_size")]
    pub receive_batch_size: usize,

    /// Send a noop event to idle partitions
    #[serde(default = "default_enable_keep_alive")]
    pub enable_keep_alive: bool,

    /// Upper bound on a single processor checkpoint (in seconds)
    #[serde(default = "default_checkpoint_timeout_secs")]
    pub checkpoint_timeout_secs: u64,

    // Queue configuration
    /// Queue holding failed events of this consumer group
    #[serde(default = "default_work_item_queue")]
    pub work_item_queue: String,

    /// Durable queue drained by the retry queue handler
    #[serde(default = "default_retry_queue")]
    pub retry_queue: String,

    /// Lease on a dequeued message (in seconds)
    #[serde(default = "default_queue_lease_secs")]
    pub queue_lease_secs: u64,

    /// Largest message either queue accepts
    #[serde(default = "default_queue_max_message_bytes")]
    pub queue_max_message_bytes: usize,

    /// Run the retry queue backup and drain loops in this process
    #[serde(default = "default_enable_retry_queue_handler")]
    pub enable_retry_queue_handler: bool,

    // Admission control
    /// Permits shared by every partition and queue worker
    #[serde(default = "default_total_permits")]
    pub total_permits: usize,

    /// Share of the permits background work may hold at once
    #[serde(default = "default_background_permits")]
    pub background_permits: usize,

    // Logging checkpoint processor
    /// Checkpoint once this many events have been applied
    #[serde(default = "default_checkpoint_every_events")]
    pub checkpoint_every_events: usize,

    /// Checkpoint pending events after this long (in seconds)
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    // Feature flags, lists are comma separated
    #[serde(default)]
    pub flag_publish_uncompressed: bool,

    #[serde(default)]
    pub flag_disabled_endpoints: String,

    #[serde(default)]
    pub flag_retry_queue_disabled_consumer_groups: String,

    #[serde(default)]
    pub flag_retry_queue_handler_consumer_groups: String,

    #[serde(default)]
    pub flag_slowdown_handlers: String,

    #[serde(default)]
    pub flag_full_throttle: bool,

    #[serde(default)]
    pub flag_test_in_production_tenants: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "lifecycle-worker".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_event_stream() -> String {
    "lifecycle".to_string()
}

fn default_partition_count() -> u32 {
    4
}

fn default_partition_ack_wait_secs() -> u64 {
    60
}

fn default_lease_bucket() -> String {
    "lifecycle-leases".to_string()
}

fn default_lease_ttl_secs() -> u64 {
    90
}

fn default_max_send_batch_bytes() -> usize {
    1024 * 1024
}

fn default_moniker() -> String {
    "lifecycle".to_string()
}

fn default_consumer_group() -> String {
    "default".to_string()
}

fn default_handler_name() -> String {
    "default".to_string()
}

fn default_receive_batch_size() -> usize {
    100
}

fn default_enable_keep_alive() -> bool {
    true
}

fn default_checkpoint_timeout_secs() -> u64 {
    15 * 60
}

fn default_work_item_queue() -> String {
    "lifecycle-work-items".to_string()
}

fn default_retry_queue() -> String {
    "lifecycle-retry".to_string()
}

fn default_queue_lease_secs() -> u64 {
    5 * 60
}

fn default_queue_max_message_bytes() -> usize {
    64 * 1024
}

fn default_enable_retry_queue_handler() -> bool {
    true
}

fn default_total_permits() -> usize {
    16
}

fn default_background_permits() -> usize {
    4
}

fn default_checkpoint_every_events() -> usize {
    1000
}

fn default_checkpoint_interval_secs() -> u64 {
    10
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("LIFECYCLE"))
            .build()?
            .try_deserialize()
    }

    pub fn flag_config(&self) -> FlagConfig {
        FlagConfig {
            publish_uncompressed: self.flag_publish_uncompressed,
            disabled_endpoints: split_list(&self.flag_disabled_endpoints),
            retry_queue_disabled_consumer_groups: split_list(
                &self.flag_retry_queue_disabled_consumer_groups,
            ),
            retry_queue_handler_consumer_groups: split_list(
                &self.flag_retry_queue_handler_consumer_groups,
            ),
            slowdown_handlers: split_list(&self.flag_slowdown_handlers),
            full_throttle: self.flag_full_throttle,
            test_in_production_tenants: split_list(&self.flag_test_in_production_tenants),
        }
    }

    fn queue_worker_config(&self) -> QueueWorkerConfig {
        QueueWorkerConfig {
            lease: Duration::from_secs(self.queue_lease_secs),
            ..Default::default()
        }
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            moniker: self.moniker.clone(),
            consumer_group: self.consumer_group.clone(),
            handler_name: self.handler_name.clone(),
            priority: self.priority,
            receive_batch_size: self.receive_batch_size,
            enable_keep_alive: self.enable_keep_alive,
            lease_renew_interval: Duration::from_secs(self.lease_ttl_secs) / 3,
            sink: SinkConfig {
                checkpoint_timeout: Duration::from_secs(self.checkpoint_timeout_secs),
                ..Default::default()
            },
            work_items: self.queue_worker_config(),
            ..Default::default()
        }
    }

    pub fn retry_queue_handler_config(&self) -> RetryQueueHandlerConfig {
        RetryQueueHandlerConfig {
            consumer_group: self.consumer_group.clone(),
            lease: Duration::from_secs(self.queue_lease_secs),
            backup: self.queue_worker_config(),
            ..Default::default()
        }
    }
}
