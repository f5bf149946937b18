use anyhow::Context;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use common::backoff::ExponentialBackoff;
use common::codec::{package_with_split, parse_envelope};
use common::{
    CheckpointProcessor, Envelope, LifecycleError, LifecycleResult, PartitionSender,
    PartitionStream, ProcessorFactory, RetryQueue, StreamMessage,
};

use crate::SinkConfig;

/// Per-partition state machine between the stream and the checkpoint processor.
///
/// Every message received since the last stream checkpoint stays in `seen`
/// until the processor commits it. Messages that fail to parse or apply move to
/// `failed`, which must reach the work-item queue (or be republished to the
/// partition) before the stream cursor may advance.
pub struct ReceiverSink {
    identifier: String,
    factory: ProcessorFactory,
    processor: Box<dyn CheckpointProcessor>,
    work_items: Arc<dyn RetryQueue>,
    fallback: Arc<dyn PartitionSender>,
    config: SinkConfig,
    seen: BTreeMap<u64, Envelope>,
    failed: BTreeMap<u64, Envelope>,
    failed_bytes: usize,
}

impl ReceiverSink {
    pub fn new(
        identifier: &str,
        factory: ProcessorFactory,
        work_items: Arc<dyn RetryQueue>,
        fallback: Arc<dyn PartitionSender>,
        config: SinkConfig,
    ) -> Self {
        let processor = factory();
        Self {
            identifier: identifier.to_string(),
            factory,
            processor,
            work_items,
            fallback,
            config,
            seen: BTreeMap::new(),
            failed: BTreeMap::new(),
            failed_bytes: 0,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn failed_bytes(&self) -> usize {
        self.failed_bytes
    }

    #[instrument(skip(self, messages, stream), fields(identifier = %self.identifier, count = messages.len()))]
    pub async fn handle_event_batch(
        &mut self,
        messages: Vec<StreamMessage>,
        stream: &dyn PartitionStream,
    ) -> LifecycleResult<()> {
        for message in messages {
            self.seen.insert(message.sequence, message.envelope.clone());

            if let Err(e) = self.apply_envelope(&message.envelope).await {
                warn!(
                    identifier = %self.identifier,
                    sequence = message.sequence,
                    type_name = message.envelope.type_name().unwrap_or_default(),
                    error = %e,
                    "Failed to handle message, moving it to the failed buffer"
                );
                self.copy_to_failed(message.sequence, message.envelope);
            }
        }

        debug!(
            identifier = %self.identifier,
            seen = self.seen.len(),
            failed = self.failed.len(),
            "Batch handled"
        );

        if self.processor.should_checkpoint() {
            self.checkpoint_processor().await?;

            // An error here keeps the failed buffer and the stream cursor in place
            self.publish_retries().await?;
            self.seen.clear();

            stream
                .checkpoint()
                .await
                .context("Failed to checkpoint partition stream")?;
            info!(identifier = %self.identifier, "Partition checkpointed");
        } else if self.failed_bytes > self.config.max_failed_bytes {
            info!(
                identifier = %self.identifier,
                failed_bytes = self.failed_bytes,
                "Failed buffer is large, publishing retries early"
            );
            self.publish_retries().await?;
        }

        Ok(())
    }

    async fn apply_envelope(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        for event in parse_envelope(envelope)? {
            event.apply(self.processor.as_mut()).await?;
        }
        Ok(())
    }

    async fn checkpoint_processor(&mut self) -> LifecycleResult<()> {
        info!(identifier = %self.identifier, "Checkpointing initiated");
        let timeout = self.config.checkpoint_timeout;

        match tokio::time::timeout(timeout, self.processor.checkpoint()).await {
            Ok(Ok(())) => {
                info!(identifier = %self.identifier, "Checkpointing completed");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(
                    identifier = %self.identifier,
                    error = %e,
                    "Processor checkpoint failed, replaying everything since the last checkpoint"
                );
                self.processor = (self.factory)();
                let seen = std::mem::take(&mut self.seen);
                for (sequence, envelope) in seen {
                    self.copy_to_failed(sequence, envelope);
                }
                Ok(())
            }
            Err(_) => {
                error!(identifier = %self.identifier, timeout = ?timeout, "Processor checkpoint timed out");
                Err(LifecycleError::CheckpointTimeout(timeout))
            }
        }
    }

    fn copy_to_failed(&mut self, sequence: u64, envelope: Envelope) {
        let size = envelope.payload.len();
        if self.failed.insert(sequence, envelope).is_none() {
            self.failed_bytes += size;
        }
    }

    /// Moves the failed buffer to the work-item queue, falling back to the
    /// partition itself once the queue retries are exhausted. The buffer is
    /// only cleared when one of the two succeeds.
    pub async fn publish_retries(&mut self) -> LifecycleResult<()> {
        if self.failed.is_empty() {
            return Ok(());
        }

        let envelopes: Vec<Envelope> = self.failed.values().cloned().collect();
        let mut backoff =
            ExponentialBackoff::new(self.config.retry_backoff_start, self.config.retry_backoff_max);
        let mut attempt = 0;

        let queued = loop {
            attempt += 1;
            match enqueue_work_items(self.work_items.as_ref(), &envelopes).await {
                Ok(()) => break Ok(()),
                Err(e) if attempt >= self.config.retry_publish_attempts => break Err(e),
                Err(e) => {
                    warn!(
                        identifier = %self.identifier,
                        attempt = attempt,
                        error = %e,
                        "Failed to publish to the work-item queue, retrying"
                    );
                    backoff.wait().await;
                }
            }
        };

        if let Err(e) = queued {
            error!(
                identifier = %self.identifier,
                attempts = attempt,
                error = %e,
                "Work-item queue publish failed, republishing to the partition"
            );
            republish_to_partition(self.fallback.as_ref(), &envelopes)
                .await
                .map_err(|source| LifecycleError::RetryExternalizationFailed {
                    count: envelopes.len(),
                    source,
                })?;
        }

        info!(
            identifier = %self.identifier,
            count = envelopes.len(),
            "Failed messages externalized"
        );
        self.failed.clear();
        self.failed_bytes = 0;
        Ok(())
    }
}

async fn enqueue_work_items(queue: &dyn RetryQueue, envelopes: &[Envelope]) -> anyhow::Result<()> {
    for body in package_with_split(envelopes, queue.max_message_size())? {
        queue.enqueue(body).await?;
    }
    Ok(())
}

/// Sends envelopes back to their partition in batches under the sender's size limit
async fn republish_to_partition(
    sender: &dyn PartitionSender,
    envelopes: &[Envelope],
) -> anyhow::Result<()> {
    let max = sender.max_batch_size_bytes();
    let mut batch = Vec::new();
    let mut batch_size = 0;

    for envelope in envelopes {
        let size = envelope.size();
        if !batch.is_empty() && batch_size + size > max {
            warn!(count = batch.len(), "Partition batch is full");
            sender
                .send_batch(std::mem::take(&mut batch))
                .await
                .context("Failed to republish batch to partition")?;
            batch_size = 0;
        }
        batch_size += size;
        batch.push(envelope.clone());
    }

    if !batch.is_empty() {
        sender
            .send_batch(batch)
            .await
            .context("Failed to republish batch to partition")?;
    }
    Ok(())
}
