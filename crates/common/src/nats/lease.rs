use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::kv::{self, CreateErrorKind, Operation};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::domain::PartitionLease;

/// Key-value bucket holding one entry per leased partition.
///
/// The bucket's `max_age` is the lease time-to-live: an entry that is not
/// renewed within it disappears and the partition is free again.
pub struct NatsLeaseStore {
    store: kv::Store,
    owner: Bytes,
}

impl NatsLeaseStore {
    pub fn new(store: kv::Store, owner: &str) -> Self {
        Self {
            store,
            owner: Bytes::copy_from_slice(owner.as_bytes()),
        }
    }

    /// Lease on `{consumer_group}.{partition_id}`
    pub fn lease(&self, consumer_group: &str, partition_id: &str) -> Arc<NatsPartitionLease> {
        Arc::new(NatsPartitionLease {
            store: self.store.clone(),
            key: format!("{}.{}", consumer_group, partition_id),
            owner: self.owner.clone(),
            revision: Mutex::new(None),
        })
    }
}

pub struct NatsPartitionLease {
    store: kv::Store,
    key: String,
    owner: Bytes,
    revision: Mutex<Option<u64>>,
}

impl NatsPartitionLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the current entry belongs to this owner
    async fn held_by_us(&self) -> Result<bool> {
        let entry = self
            .store
            .entry(self.key.as_str())
            .await
            .with_context(|| format!("Failed to read lease {}", self.key))?;
        Ok(matches!(
            entry,
            Some(entry) if entry.operation == Operation::Put && entry.value == self.owner
        ))
    }
}

#[async_trait]
impl PartitionLease for NatsPartitionLease {
    #[instrument(skip(self), fields(lease = %self.key))]
    async fn acquire(&self) -> Result<bool> {
        match self.store.create(self.key.as_str(), self.owner.clone()).await {
            Ok(revision) => {
                *self.revision.lock().await = Some(revision);
                debug!(revision = revision, "Acquired partition lease");
                Ok(true)
            }
            Err(e) if e.kind() == CreateErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(anyhow!("Failed to acquire lease {}: {e}", self.key)),
        }
    }

    async fn renew(&self) -> Result<bool> {
        let mut revision = self.revision.lock().await;
        let Some(current) = *revision else {
            return Ok(false);
        };

        match self
            .store
            .update(self.key.as_str(), self.owner.clone(), current)
            .await
        {
            Ok(next) => {
                *revision = Some(next);
                Ok(true)
            }
            Err(e) => {
                if self.held_by_us().await? {
                    return Err(anyhow!("Failed to renew lease {}: {e}", self.key));
                }
                *revision = None;
                Ok(false)
            }
        }
    }

    async fn release(&self) -> Result<()> {
        let Some(current) = self.revision.lock().await.take() else {
            return Ok(());
        };

        // A revision mismatch means the lease already expired or moved on
        if let Err(e) = self
            .store
            .delete_expect_revision(self.key.as_str(), Some(current))
            .await
        {
            debug!(lease = %self.key, error = %e, "Lease was no longer held at release");
        }
        Ok(())
    }
}
