use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::domain::Envelope;

/// An envelope read from a partition, tagged with its position in the partition
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub sequence: u64,
    pub envelope: Envelope,
}

/// A leased message read from a retry queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: String,
    pub body: Bytes,
    pub dequeue_count: u32,
}

/// Outbound stream endpoint in the publisher's pool
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait StreamEndpoint: Send + Sync {
    fn name(&self) -> &str;

    /// Send envelopes in one network call; the key selects the partition
    async fn send(&self, partition_key: &str, envelopes: Vec<Envelope>) -> anyhow::Result<()>;
}

/// Inbound partition with a checkpointed cursor
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PartitionStream: Send + Sync {
    fn partition_id(&self) -> &str;

    async fn receive(&self, max_messages: usize, wait: Duration)
        -> anyhow::Result<Vec<StreamMessage>>;

    /// Advance the cursor past every message received so far
    async fn checkpoint(&self) -> anyhow::Result<()>;

    /// Return every message received since the last checkpoint for redelivery
    async fn abandon(&self) -> anyhow::Result<()>;
}

/// Exclusive ownership of one partition by one receiver instance.
///
/// A held lease expires unless renewed, so a crashed owner frees the
/// partition on its own.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PartitionLease: Send + Sync {
    /// Take the lease; `false` while another instance holds it
    async fn acquire(&self) -> anyhow::Result<bool>;

    /// Extend the held lease; `false` once it has been lost
    async fn renew(&self) -> anyhow::Result<bool>;

    async fn release(&self) -> anyhow::Result<()>;
}

/// Direct writer into a single partition, used for keep-alives and fallback republish
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PartitionSender: Send + Sync {
    async fn send_batch(&self, envelopes: Vec<Envelope>) -> anyhow::Result<()>;

    fn max_batch_size_bytes(&self) -> usize;
}

/// Durable queue holding batches that failed in-line processing
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RetryQueue: Send + Sync {
    async fn enqueue(&self, body: Bytes) -> anyhow::Result<()>;

    /// Lease up to `max_messages`; unleased messages become visible again after `lease`
    async fn dequeue(&self, max_messages: usize, lease: Duration)
        -> anyhow::Result<Vec<QueueMessage>>;

    async fn delete(&self, message: &QueueMessage) -> anyhow::Result<()>;

    async fn depth(&self) -> anyhow::Result<u64>;

    fn max_message_size(&self) -> usize;
}
