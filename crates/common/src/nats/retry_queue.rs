use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{self, consumer::PullConsumer, Message};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::domain::{QueueMessage, RetryQueue};

/// Messages this reader holds a lease on, keyed by stream sequence.
///
/// A redelivered message lands on the same key, and entries older than the
/// lease are dropped since the server has already handed them out again.
struct LeaseTable<T> {
    lease: Duration,
    entries: HashMap<u64, (Instant, T)>,
}

impl<T> LeaseTable<T> {
    fn new(lease: Duration) -> Self {
        Self {
            lease,
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, sequence: u64, item: T) {
        self.entries.insert(sequence, (Instant::now(), item));
    }

    fn remove(&mut self, sequence: u64) -> Option<T> {
        self.entries.remove(&sequence).map(|(_, item)| item)
    }

    fn evict_expired(&mut self) -> usize {
        let before = self.entries.len();
        let lease = self.lease;
        self.entries
            .retain(|_, (leased_at, _)| leased_at.elapsed() < lease);
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Retry queue on a work-queue stream. Deleting a message acknowledges it.
///
/// The lease is the consumer's `ack_wait`, fixed when the consumer is created.
/// Message ids are stream sequences.
pub struct NatsRetryQueue {
    context: jetstream::Context,
    queue_name: String,
    consumer: PullConsumer,
    max_message_size: usize,
    leased: Mutex<LeaseTable<Message>>,
}

impl NatsRetryQueue {
    pub fn new(
        context: jetstream::Context,
        queue_name: &str,
        consumer: PullConsumer,
        lease: Duration,
        max_message_size: usize,
    ) -> Self {
        Self {
            context,
            queue_name: queue_name.to_string(),
            consumer,
            max_message_size,
            leased: Mutex::new(LeaseTable::new(lease)),
        }
    }
}

#[async_trait]
impl RetryQueue for NatsRetryQueue {
    #[instrument(skip(self, body), fields(queue = %self.queue_name, size = body.len()))]
    async fn enqueue(&self, body: Bytes) -> Result<()> {
        let ack = self
            .context
            .publish(self.queue_name.clone(), body)
            .await
            .context("Failed to publish retry message")?;
        ack.await.context("Failed to receive retry message acknowledgment")?;
        Ok(())
    }

    async fn dequeue(&self, max_messages: usize, _lease: Duration) -> Result<Vec<QueueMessage>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(Duration::from_secs(1))
            .messages()
            .await
            .context("Failed to fetch retry messages")?;

        let mut dequeued = Vec::new();
        let mut leased = self.leased.lock().await;
        let expired = leased.evict_expired();
        if expired > 0 {
            debug!(queue = %self.queue_name, expired = expired, "Dropped expired retry leases");
        }

        while let Some(result) = batch.next().await {
            match result {
                Ok(message) => {
                    let (sequence, delivered) = match message.info() {
                        Ok(info) => (info.stream_sequence, info.delivered),
                        Err(e) => {
                            warn!(error = %e, queue = %self.queue_name, "Retry message without JetStream info");
                            continue;
                        }
                    };
                    dequeued.push(QueueMessage {
                        id: sequence.to_string(),
                        body: message.payload.clone(),
                        dequeue_count: u32::try_from(delivered).unwrap_or(u32::MAX),
                    });
                    leased.insert(sequence, message);
                }
                Err(e) => {
                    warn!(error = %e, queue = %self.queue_name, "Error receiving retry message");
                }
            }
        }

        Ok(dequeued)
    }

    async fn delete(&self, message: &QueueMessage) -> Result<()> {
        let sequence: u64 = message
            .id
            .parse()
            .with_context(|| format!("Invalid retry message id {}", message.id))?;
        let leased = self.leased.lock().await.remove(sequence);
        let Some(leased) = leased else {
            return Err(anyhow!("Message {} is not leased by this reader", message.id));
        };
        leased
            .double_ack()
            .await
            .map_err(|e| anyhow!("Failed to delete retry message: {e}"))
    }

    async fn depth(&self) -> Result<u64> {
        let mut stream = self
            .context
            .get_stream(&self.queue_name)
            .await
            .context("Failed to get retry queue stream")?;
        let info = stream.info().await.context("Failed to read retry queue info")?;
        Ok(info.state.messages)
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}
