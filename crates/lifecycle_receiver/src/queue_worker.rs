use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::codec::unpackage;
use common::priority::{Priority, PrioritySemaphore};
use common::{Envelope, QueueMessage, RetryQueue};

use crate::QueueWorkerConfig;

/// Outcome of handling one work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueProcessResult {
    /// Delete the item
    Success,
    /// Leave the item for redelivery after its lease and back off before the next poll
    TransientFailure,
}

#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    fn priority(&self) -> Priority;

    async fn process_work_item(&self, envelopes: Vec<Envelope>) -> Result<QueueProcessResult>;
}

/// Poll loop over a queue of packaged envelope arrays
pub struct QueueWorker {
    name: String,
    queue: Arc<dyn RetryQueue>,
    semaphore: PrioritySemaphore,
    config: QueueWorkerConfig,
}

impl QueueWorker {
    pub fn new(
        name: &str,
        queue: Arc<dyn RetryQueue>,
        semaphore: PrioritySemaphore,
        config: QueueWorkerConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            queue,
            semaphore,
            config,
        }
    }

    pub async fn run(&self, handler: Arc<dyn WorkItemHandler>, ctx: CancellationToken) -> Result<()> {
        info!(queue = %self.name, "Starting queue worker");

        loop {
            let result = tokio::select! {
                _ = ctx.cancelled() => break,
                result = self.poll_once(handler.as_ref()) => result,
            };

            let back_off = match result {
                Ok(processed) => processed == 0,
                Err(e) => {
                    error!(queue = %self.name, error = %e, "Error processing work items");
                    true
                }
            };

            if back_off {
                let delay = self.random_backoff();
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!(queue = %self.name, "Queue worker stopped");
        Ok(())
    }

    /// Handles one dequeued batch. Returns how many items completed successfully;
    /// zero means the caller should back off.
    pub async fn poll_once(&self, handler: &dyn WorkItemHandler) -> Result<usize> {
        let messages = self
            .queue
            .dequeue(self.config.batch_size, self.config.lease)
            .await
            .context("Failed to dequeue work items")?;

        if messages.is_empty() {
            return Ok(0);
        }
        debug!(queue = %self.name, count = messages.len(), "Dequeued work items");

        let mut completed = 0;
        for message in messages {
            let _permit = self.semaphore.acquire(handler.priority()).await?;
            if self.handle_message(handler, &message).await {
                completed += 1;
            }
        }
        Ok(completed)
    }

    async fn handle_message(&self, handler: &dyn WorkItemHandler, message: &QueueMessage) -> bool {
        let envelopes = match unpackage(&message.body) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                // Undecodable bodies can never succeed
                error!(
                    queue = %self.name,
                    message_id = %message.id,
                    error = %e,
                    "Dropping undecodable work item"
                );
                self.delete(message).await;
                return false;
            }
        };

        match handler.process_work_item(envelopes).await {
            Ok(QueueProcessResult::Success) => {
                self.delete(message).await;
                true
            }
            Ok(QueueProcessResult::TransientFailure) => {
                debug!(queue = %self.name, message_id = %message.id, "Work item left for redelivery");
                false
            }
            Err(e) => {
                warn!(
                    queue = %self.name,
                    message_id = %message.id,
                    dequeue_count = message.dequeue_count,
                    error = %e,
                    "Work item failed, leaving it for redelivery"
                );
                false
            }
        }
    }

    async fn delete(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.delete(message).await {
            warn!(queue = %self.name, message_id = %message.id, error = %e, "Failed to delete work item");
        }
    }

    fn random_backoff(&self) -> Duration {
        let min = self.config.min_idle_backoff;
        let max = self.config.max_idle_backoff;
        if max <= min {
            return min;
        }
        rand::thread_rng().gen_range(min..max)
    }
}
