use serde::Deserialize;
use std::sync::RwLock;

/// Runtime switches consulted by the pipeline.
///
/// Lookups are cheap and may be called on every batch.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait FeatureFlags: Send + Sync {
    /// Publish bulk envelopes as raw JSON instead of Brotli
    fn publish_uncompressed(&self) -> bool;

    fn is_endpoint_disabled(&self, endpoint_name: &str) -> bool;

    /// Skip the per-partition work-item drain for this consumer group
    fn is_retry_queue_disabled(&self, consumer_group: &str) -> bool;

    fn is_retry_queue_handler_enabled(&self, consumer_group: &str) -> bool;

    fn is_receiver_slowdown_enabled(&self, handler_name: &str) -> bool;

    /// Bypass the priority semaphore entirely
    fn is_full_throttle(&self) -> bool;

    fn is_test_in_production_tenant(&self, tenant_id: &str) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FlagConfig {
    pub publish_uncompressed: bool,
    pub disabled_endpoints: Vec<String>,
    pub retry_queue_disabled_consumer_groups: Vec<String>,
    pub retry_queue_handler_consumer_groups: Vec<String>,
    pub slowdown_handlers: Vec<String>,
    pub full_throttle: bool,
    pub test_in_production_tenants: Vec<String>,
}

/// [`FeatureFlags`] backed by static configuration that can be swapped at runtime
pub struct ConfigFeatureFlags {
    config: RwLock<FlagConfig>,
}

impl ConfigFeatureFlags {
    pub fn new(config: FlagConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn replace(&self, config: FlagConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    fn read<T>(&self, f: impl FnOnce(&FlagConfig) -> T) -> T {
        match self.config.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

fn contains(values: &[String], value: &str) -> bool {
    values.iter().any(|v| v == value)
}

impl FeatureFlags for ConfigFeatureFlags {
    fn publish_uncompressed(&self) -> bool {
        self.read(|c| c.publish_uncompressed)
    }

    fn is_endpoint_disabled(&self, endpoint_name: &str) -> bool {
        self.read(|c| contains(&c.disabled_endpoints, endpoint_name))
    }

    fn is_retry_queue_disabled(&self, consumer_group: &str) -> bool {
        self.read(|c| contains(&c.retry_queue_disabled_consumer_groups, consumer_group))
    }

    fn is_retry_queue_handler_enabled(&self, consumer_group: &str) -> bool {
        self.read(|c| contains(&c.retry_queue_handler_consumer_groups, consumer_group))
    }

    fn is_receiver_slowdown_enabled(&self, handler_name: &str) -> bool {
        self.read(|c| contains(&c.slowdown_handlers, handler_name))
    }

    fn is_full_throttle(&self) -> bool {
        self.read(|c| c.full_throttle)
    }

    fn is_test_in_production_tenant(&self, tenant_id: &str) -> bool {
        self.read(|c| {
            c.test_in_production_tenants
                .iter()
                .any(|t| t.eq_ignore_ascii_case(tenant_id))
        })
    }
}
