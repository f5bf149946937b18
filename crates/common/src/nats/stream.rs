use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{self, consumer::PullConsumer, AckKind, Message};
use async_trait::async_trait;
use futures::{future::try_join_all, StreamExt};
use sha2::{Digest, Sha256};
use std::future::IntoFuture;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::domain::{Envelope, PartitionSender, PartitionStream, StreamEndpoint, StreamMessage};
use crate::nats::{envelope_from_parts, envelope_headers};

async fn publish_all(
    context: &jetstream::Context,
    subject: &str,
    envelopes: Vec<Envelope>,
) -> Result<()> {
    let mut acks = Vec::with_capacity(envelopes.len());
    for envelope in envelopes {
        let ack = context
            .publish_with_headers(
                subject.to_string(),
                envelope_headers(&envelope),
                envelope.payload,
            )
            .await
            .context("Failed to publish message to JetStream")?;
        acks.push(ack.into_future());
    }

    try_join_all(acks)
        .await
        .context("Failed to receive JetStream acknowledgment")?;
    Ok(())
}

/// One stream in the publisher's pool. Keys are hashed onto partition subjects.
pub struct NatsStreamEndpoint {
    name: String,
    context: jetstream::Context,
    stream_name: String,
    partition_count: u32,
}

impl NatsStreamEndpoint {
    pub fn new(
        name: &str,
        context: jetstream::Context,
        stream_name: &str,
        partition_count: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            context,
            stream_name: stream_name.to_string(),
            partition_count: partition_count.max(1),
        }
    }

    fn subject_for(&self, partition_key: &str) -> String {
        format!(
            "{}.{}",
            self.stream_name,
            partition_for(partition_key, self.partition_count)
        )
    }
}

/// Partition of a key. Stable across builds and platforms so every publisher
/// routes one command to the same partition.
pub fn partition_for(partition_key: &str, partition_count: u32) -> u32 {
    let digest = Sha256::digest(partition_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partition_count.max(1))) as u32
}

#[async_trait]
impl StreamEndpoint for NatsStreamEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, envelopes), fields(endpoint = %self.name, count = envelopes.len()))]
    async fn send(&self, partition_key: &str, envelopes: Vec<Envelope>) -> Result<()> {
        let subject = self.subject_for(partition_key);
        publish_all(&self.context, &subject, envelopes).await
    }
}

/// Writes straight into one partition subject
pub struct NatsPartitionSender {
    context: jetstream::Context,
    subject: String,
    max_batch_size_bytes: usize,
}

impl NatsPartitionSender {
    pub fn new(context: jetstream::Context, subject: String, max_batch_size_bytes: usize) -> Self {
        Self {
            context,
            subject,
            max_batch_size_bytes,
        }
    }
}

#[async_trait]
impl PartitionSender for NatsPartitionSender {
    async fn send_batch(&self, envelopes: Vec<Envelope>) -> Result<()> {
        publish_all(&self.context, &self.subject, envelopes).await
    }

    fn max_batch_size_bytes(&self) -> usize {
        self.max_batch_size_bytes
    }
}

/// Pull consumer over one partition subject.
///
/// Received messages are held until checkpoint; acking the newest moves the
/// durable cursor past everything received before it. Abandoning naks them
/// so the next owner of the partition sees them again.
pub struct NatsPartitionStream {
    partition_id: String,
    consumer: PullConsumer,
    in_flight: Mutex<Vec<Message>>,
}

impl NatsPartitionStream {
    pub fn new(partition_id: &str, consumer: PullConsumer) -> Self {
        Self {
            partition_id: partition_id.to_string(),
            consumer,
            in_flight: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PartitionStream for NatsPartitionStream {
    fn partition_id(&self) -> &str {
        &self.partition_id
    }

    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<StreamMessage>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(wait)
            .messages()
            .await
            .context("Failed to fetch messages")?;

        let mut received = Vec::new();
        let mut messages = Vec::new();
        while let Some(result) = batch.next().await {
            match result {
                Ok(message) => {
                    let sequence = message
                        .info()
                        .map_err(|e| anyhow!("Message without JetStream info: {e}"))?
                        .stream_sequence;
                    received.push(StreamMessage {
                        sequence,
                        envelope: envelope_from_parts(
                            message.headers.as_ref(),
                            message.payload.clone(),
                        ),
                    });
                    messages.push(message);
                }
                Err(e) => {
                    warn!(error = %e, partition = %self.partition_id, "Error receiving message from batch");
                }
            }
        }

        self.in_flight.lock().await.extend(messages);

        debug!(partition = %self.partition_id, count = received.len(), "Received partition batch");
        Ok(received)
    }

    async fn checkpoint(&self) -> Result<()> {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(newest) = in_flight.last() {
            newest
                .double_ack()
                .await
                .map_err(|e| anyhow!("Failed to acknowledge checkpoint message: {e}"))?;
            in_flight.clear();
        }
        Ok(())
    }

    async fn abandon(&self) -> Result<()> {
        let in_flight: Vec<Message> = self.in_flight.lock().await.drain(..).collect();
        let count = in_flight.len();
        for message in in_flight {
            message
                .ack_with(AckKind::Nak(None))
                .await
                .map_err(|e| anyhow!("Failed to return message for redelivery: {e}"))?;
        }
        debug!(partition = %self.partition_id, count = count, "Abandoned in-flight messages");
        Ok(())
    }
}
