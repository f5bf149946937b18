use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::codec::{package_with_split, parse_envelope, unpackage};
use common::flags::FeatureFlags;
use common::priority::{Priority, PrioritySemaphore};
use common::{CheckpointProcessor, Envelope, LifecycleEvent, QueueMessage, RetryQueue};

use crate::{QueueProcessResult, QueueWorker, RetryQueueHandlerConfig, WorkItemHandler};

const MIN_DRAIN_DELAY_MS: u64 = 100;

/// Background replay of the durable retry queue for one consumer group.
///
/// `run_backup` copies the receiver's work items into the durable queue and
/// `run_drain` replays the durable queue through a checkpoint processor.
pub struct RetryQueueHandler {
    config: RetryQueueHandlerConfig,
    flags: Arc<dyn FeatureFlags>,
    work_items: Arc<dyn RetryQueue>,
    retry_queue: Arc<dyn RetryQueue>,
    semaphore: PrioritySemaphore,
}

impl RetryQueueHandler {
    pub fn new(
        config: RetryQueueHandlerConfig,
        flags: Arc<dyn FeatureFlags>,
        work_items: Arc<dyn RetryQueue>,
        retry_queue: Arc<dyn RetryQueue>,
        semaphore: PrioritySemaphore,
    ) -> Self {
        Self {
            config,
            flags,
            work_items,
            retry_queue,
            semaphore,
        }
    }

    fn enabled(&self) -> bool {
        self.flags
            .is_retry_queue_handler_enabled(&self.config.consumer_group)
    }

    pub async fn run_backup(&self, ctx: CancellationToken) -> Result<()> {
        info!(consumer_group = %self.config.consumer_group, "Starting retry queue backup");

        let worker = QueueWorker::new(
            &format!("{}.work-items", self.config.consumer_group),
            self.work_items.clone(),
            self.semaphore.clone(),
            self.config.backup.clone(),
        );
        let handler: Arc<dyn WorkItemHandler> = Arc::new(BackupHandler {
            consumer_group: self.config.consumer_group.clone(),
            flags: self.flags.clone(),
            retry_queue: self.retry_queue.clone(),
        });
        worker.run(handler, ctx).await
    }

    pub async fn run_drain(
        &self,
        mut processor: Box<dyn CheckpointProcessor>,
        ctx: CancellationToken,
    ) -> Result<()> {
        info!(consumer_group = %self.config.consumer_group, "Starting retry queue drain");
        let mut processed = Vec::new();

        loop {
            let result = tokio::select! {
                _ = ctx.cancelled() => break,
                result = self.drain_once(processor.as_mut(), &mut processed) => result,
            };

            if let Err(e) = result {
                error!(
                    consumer_group = %self.config.consumer_group,
                    error = %e,
                    "Error processing retry queue"
                );
                processed.clear();
            }
        }

        info!(consumer_group = %self.config.consumer_group, "Retry queue drain stopped");
        Ok(())
    }

    /// One pass of the drain loop: wait, lease a batch and replay it
    pub async fn drain_once(
        &self,
        processor: &mut dyn CheckpointProcessor,
        processed: &mut Vec<QueueMessage>,
    ) -> Result<()> {
        if !self.enabled() {
            debug!(consumer_group = %self.config.consumer_group, "Retry queue handler disabled");
            tokio::time::sleep(self.config.disabled_poll_interval).await;
            return Ok(());
        }

        match self.retry_queue.depth().await {
            Ok(depth) => {
                debug!(consumer_group = %self.config.consumer_group, depth = depth, "Retry queue depth")
            }
            Err(e) => warn!(
                consumer_group = %self.config.consumer_group,
                error = %e,
                "Failed to read retry queue depth"
            ),
        }

        tokio::time::sleep(self.jittered_delay()).await;

        let messages = self
            .retry_queue
            .dequeue(self.config.max_messages, self.config.lease)
            .await
            .context("Failed to dequeue retry messages")?;

        if messages.is_empty() {
            tokio::time::sleep(self.config.empty_queue_delay).await;
            self.checkpoint_processed(processor, processed).await;
            return Ok(());
        }

        let _permit = self.semaphore.acquire(Priority::Background).await?;
        for message in messages {
            for event in self.parse_message(&message) {
                event.apply(&mut *processor).await?;
            }
            processed.push(message);
            self.checkpoint_processed(processor, processed).await;
        }
        Ok(())
    }

    fn jittered_delay(&self) -> Duration {
        let max = self.config.max_delay_ms;
        let millis = if max > MIN_DRAIN_DELAY_MS {
            rand::thread_rng().gen_range(MIN_DRAIN_DELAY_MS..max)
        } else {
            MIN_DRAIN_DELAY_MS
        };
        Duration::from_millis(millis)
    }

    /// Valid events of every envelope in the message; bad envelopes are logged and skipped
    fn parse_message(&self, message: &QueueMessage) -> Vec<LifecycleEvent> {
        let envelopes = match unpackage(&message.body) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to unpackage retry message");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for envelope in &envelopes {
            match parse_envelope(envelope) {
                Ok(parsed) => events.extend(parsed),
                Err(e) => {
                    error!(
                        message_id = %message.id,
                        properties = ?envelope.properties,
                        error = %e,
                        "Failed to parse retry envelope"
                    );
                }
            }
        }
        events
    }

    /// Deletes processed messages once the processor has committed them
    async fn checkpoint_processed(
        &self,
        processor: &mut dyn CheckpointProcessor,
        processed: &mut Vec<QueueMessage>,
    ) {
        if !processor.should_checkpoint() {
            return;
        }

        if let Err(e) = processor.checkpoint().await {
            let summary: Vec<String> = processed
                .iter()
                .flat_map(|message| self.parse_message(message))
                .map(|event| {
                    let header = event.header();
                    format!(
                        "{} command={} type={} agent={} asset_group={}",
                        event.name(),
                        header.command_id,
                        header.command_type,
                        header.agent_id,
                        header.asset_group_id
                    )
                })
                .collect();
            error!(
                consumer_group = %self.config.consumer_group,
                events = ?summary,
                error = %e,
                "Failed to checkpoint retry messages"
            );
            return;
        }

        for message in processed.drain(..) {
            if let Err(e) = self.retry_queue.delete(&message).await {
                // Most likely already handled by another worker
                warn!(message_id = %message.id, error = %e, "Failed to delete retry message");
            }
        }
    }
}

/// Copies each work item into the durable retry queue while the handler is enabled
struct BackupHandler {
    consumer_group: String,
    flags: Arc<dyn FeatureFlags>,
    retry_queue: Arc<dyn RetryQueue>,
}

#[async_trait]
impl WorkItemHandler for BackupHandler {
    fn priority(&self) -> Priority {
        Priority::Background
    }

    async fn process_work_item(&self, envelopes: Vec<Envelope>) -> Result<QueueProcessResult> {
        if !self
            .flags
            .is_retry_queue_handler_enabled(&self.consumer_group)
        {
            return Ok(QueueProcessResult::TransientFailure);
        }

        for body in package_with_split(&envelopes, self.retry_queue.max_message_size())? {
            self.retry_queue
                .enqueue(body)
                .await
                .context("Failed to copy work item to retry queue")?;
        }
        debug!(consumer_group = %self.consumer_group, count = envelopes.len(), "Work item copied");
        Ok(QueueProcessResult::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CountingProcessor;
    use bytes::Bytes;
    use common::codec::{package, serialize_events};
    use common::{
        command_failed, AgentId, AssetGroupId, CommandId, CommandIdentity, MockFeatureFlags,
        MockRetryQueue, PrivacyCommandType,
    };
    use mockall::predicate::*;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    fn flags(enabled: bool) -> Arc<dyn FeatureFlags> {
        let mut flags = MockFeatureFlags::new();
        flags
            .expect_is_retry_queue_handler_enabled()
            .with(eq("cg"))
            .return_const(enabled);
        Arc::new(flags)
    }

    fn config() -> RetryQueueHandlerConfig {
        RetryQueueHandlerConfig {
            consumer_group: "cg".to_string(),
            ..Default::default()
        }
    }

    fn failed_body(count: usize) -> Bytes {
        let identity = CommandIdentity {
            agent_id: AgentId::random(),
            asset_group_id: AssetGroupId::random(),
            asset_group_qualifier: "AssetType=AzureSql".to_string(),
            command_id: CommandId::random(),
            command_type: PrivacyCommandType::Export,
            command_creation_time: None,
        };
        let events: Vec<_> = (0..count).map(|_| command_failed(&identity)).collect();
        let envelopes = serialize_events(&events, 500 * 1024, true).unwrap();
        package(&envelopes).unwrap()
    }

    fn queue_message(id: &str, body: Bytes) -> QueueMessage {
        QueueMessage {
            id: id.to_string(),
            body,
            dequeue_count: 1,
        }
    }

    fn handler(flags: Arc<dyn FeatureFlags>, retry_queue: MockRetryQueue) -> RetryQueueHandler {
        RetryQueueHandler::new(
            config(),
            flags,
            Arc::new(MockRetryQueue::new()),
            Arc::new(retry_queue),
            PrioritySemaphore::new(2, 1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_handler_sleeps_without_dequeue() {
        let mut queue = MockRetryQueue::new();
        queue.expect_dequeue().times(0);
        let handler = handler(flags(false), queue);
        let mut processor = CountingProcessor::default();
        let started = tokio::time::Instant::now();

        handler
            .drain_once(&mut processor, &mut Vec::new())
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_deleted_only_after_checkpoint() {
        // Arrange
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let recorder = deleted.clone();
        let mut queue = MockRetryQueue::new();
        queue.expect_depth().returning(|| Ok(2));
        queue
            .expect_dequeue()
            .with(eq(10usize), eq(Duration::from_secs(300)))
            .times(1)
            .returning(|_, _| {
                Ok(vec![
                    queue_message("m1", failed_body(2)),
                    queue_message("m2", failed_body(1)),
                ])
            });
        queue.expect_delete().returning(move |message| {
            recorder.lock().unwrap().push(message.id.clone());
            Ok(())
        });
        let handler = handler(flags(true), queue);
        let mut processor = CountingProcessor {
            checkpoint_ready: true,
            ..Default::default()
        };
        let mut processed = Vec::new();

        // Act
        handler.drain_once(&mut processor, &mut processed).await.unwrap();

        // Assert
        assert_eq!(processor.applied.load(Ordering::SeqCst), 3);
        assert_eq!(processor.checkpoints.load(Ordering::SeqCst), 2);
        assert_eq!(*deleted.lock().unwrap(), vec!["m1", "m2"]);
        assert!(processed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_checkpoint_keeps_messages() {
        let mut queue = MockRetryQueue::new();
        queue.expect_depth().returning(|| Ok(1));
        queue
            .expect_dequeue()
            .returning(|_, _| Ok(vec![queue_message("m1", failed_body(1))]));
        queue.expect_delete().times(0);
        let handler = handler(flags(true), queue);
        let mut processor = CountingProcessor {
            checkpoint_ready: true,
            fail_checkpoint: true,
            ..Default::default()
        };
        let mut processed = Vec::new();

        handler.drain_once(&mut processor, &mut processed).await.unwrap();

        assert_eq!(processed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_waits_for_background_permit() {
        // Arrange
        let mut queue = MockRetryQueue::new();
        queue.expect_depth().returning(|| Ok(1));
        queue
            .expect_dequeue()
            .returning(|_, _| Ok(vec![queue_message("m1", failed_body(1))]));
        let semaphore = PrioritySemaphore::new(4, 1);
        let handler = RetryQueueHandler::new(
            config(),
            flags(true),
            Arc::new(MockRetryQueue::new()),
            Arc::new(queue),
            semaphore.clone(),
        );
        let mut processor = CountingProcessor::default();
        let held = semaphore.acquire(Priority::Background).await.unwrap();

        // Act
        let blocked = tokio::time::timeout(
            Duration::from_secs(5),
            handler.drain_once(&mut processor, &mut Vec::new()),
        )
        .await;
        let applied_while_blocked = processor.applied.load(Ordering::SeqCst);
        drop(held);
        handler
            .drain_once(&mut processor, &mut Vec::new())
            .await
            .unwrap();

        // Assert
        assert!(blocked.is_err());
        assert_eq!(applied_while_blocked, 0);
        assert_eq!(processor.applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_envelope_does_not_block_the_rest() {
        let mut envelopes = unpackage(&failed_body(1)).unwrap();
        envelopes.insert(0, Envelope::new("NotAnEvent", "{}"));
        let body = package(&envelopes).unwrap();
        let mut queue = MockRetryQueue::new();
        queue.expect_depth().returning(|| Ok(1));
        queue
            .expect_dequeue()
            .returning(move |_, _| Ok(vec![queue_message("m1", body.clone())]));
        let handler = handler(flags(true), queue);
        let mut processor = CountingProcessor::default();
        let mut processed = Vec::new();

        handler.drain_once(&mut processor, &mut processed).await.unwrap();

        assert_eq!(processor.applied.load(Ordering::SeqCst), 1);
        assert_eq!(processed.len(), 1);
    }

    #[tokio::test]
    async fn test_backup_leaves_item_while_disabled() {
        let mut retry_queue = MockRetryQueue::new();
        retry_queue.expect_enqueue().times(0);
        let backup = BackupHandler {
            consumer_group: "cg".to_string(),
            flags: flags(false),
            retry_queue: Arc::new(retry_queue),
        };

        let result = backup
            .process_work_item(vec![Envelope::noop()])
            .await
            .unwrap();

        assert_eq!(result, QueueProcessResult::TransientFailure);
    }

    #[tokio::test]
    async fn test_backup_copies_item_when_enabled() {
        let copied = Arc::new(Mutex::new(Vec::new()));
        let recorder = copied.clone();
        let mut retry_queue = MockRetryQueue::new();
        retry_queue
            .expect_max_message_size()
            .return_const(64 * 1024usize);
        retry_queue.expect_enqueue().times(1).returning(move |body| {
            recorder.lock().unwrap().push(body);
            Ok(())
        });
        let backup = BackupHandler {
            consumer_group: "cg".to_string(),
            flags: flags(true),
            retry_queue: Arc::new(retry_queue),
        };
        let envelopes = unpackage(&failed_body(3)).unwrap();

        let result = backup.process_work_item(envelopes.clone()).await.unwrap();

        assert_eq!(result, QueueProcessResult::Success);
        let copied = copied.lock().unwrap();
        assert_eq!(unpackage(&copied[0]).unwrap(), envelopes);
    }
}
