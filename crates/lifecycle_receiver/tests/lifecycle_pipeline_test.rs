use common::codec::{package, serialize_events, unpackage};
use common::flags::{ConfigFeatureFlags, FlagConfig};
use common::priority::PrioritySemaphore;
use common::{
    command_completed, command_pending, AgentId, AssetGroupId, CommandId, CommandIdentity,
    CompletedDetails, Envelope, LifecycleEvent, PrivacyCommandType, RetryQueue, StreamMessage,
};
use lifecycle_receiver::{
    run_partition, LifecycleEventReceiver, PartitionBinding, PartitionResources,
    QueueWorkerConfig, ReceiverConfig, ReceiverSink, RetryQueueHandler, RetryQueueHandlerConfig,
    SinkConfig,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// Recording fakes shared by the pipeline tests
mod fakes {
    use async_trait::async_trait;
    use bytes::Bytes;
    use common::{
        CheckpointProcessor, CommandCompletedEvent, CommandDroppedEvent, CommandRawDataEvent,
        CommandSoftDeletedEvent, CommandStartedEvent, Envelope, EventHeader,
        LifecycleEventProcessor, PartitionLease, PartitionSender, PartitionStream,
        ProcessorFactory, QueueMessage, RetryQueue, StreamMessage,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Ordered log of externally visible side effects
    pub type Journal = Arc<Mutex<Vec<String>>>;

    pub struct InMemoryQueue {
        name: String,
        journal: Journal,
        next_id: AtomicUsize,
        pending: Mutex<VecDeque<QueueMessage>>,
        leased: Mutex<Vec<QueueMessage>>,
    }

    impl InMemoryQueue {
        pub fn new(name: &str, journal: Journal) -> Self {
            Self {
                name: name.to_string(),
                journal,
                next_id: AtomicUsize::new(0),
                pending: Mutex::new(VecDeque::new()),
                leased: Mutex::new(Vec::new()),
            }
        }

        pub fn bodies(&self) -> Vec<Bytes> {
            self.pending.lock().unwrap().iter().map(|m| m.body.clone()).collect()
        }

        pub fn is_drained(&self) -> bool {
            self.pending.lock().unwrap().is_empty() && self.leased.lock().unwrap().is_empty()
        }
    }

    #[async_trait]
    impl RetryQueue for InMemoryQueue {
        async fn enqueue(&self, body: Bytes) -> anyhow::Result<()> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.pending.lock().unwrap().push_back(QueueMessage {
                id: format!("{}-{}", self.name, id),
                body,
                dequeue_count: 0,
            });
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}.enqueue", self.name));
            Ok(())
        }

        async fn dequeue(
            &self,
            max_messages: usize,
            _lease: Duration,
        ) -> anyhow::Result<Vec<QueueMessage>> {
            let mut pending = self.pending.lock().unwrap();
            let count = max_messages.min(pending.len());
            let messages: Vec<QueueMessage> = pending
                .drain(..count)
                .map(|mut m| {
                    m.dequeue_count += 1;
                    m
                })
                .collect();
            self.leased.lock().unwrap().extend(messages.clone());
            Ok(messages)
        }

        async fn delete(&self, message: &QueueMessage) -> anyhow::Result<()> {
            self.leased.lock().unwrap().retain(|m| m.id != message.id);
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}.delete", self.name));
            Ok(())
        }

        async fn depth(&self) -> anyhow::Result<u64> {
            Ok(self.pending.lock().unwrap().len() as u64)
        }

        fn max_message_size(&self) -> usize {
            64 * 1024
        }
    }

    /// Hands out scripted batches, then idles
    pub struct ScriptedStream {
        batches: Mutex<VecDeque<Vec<StreamMessage>>>,
        journal: Journal,
        pub receives: AtomicUsize,
    }

    impl ScriptedStream {
        pub fn new(batches: Vec<Vec<StreamMessage>>, journal: Journal) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                journal,
                receives: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PartitionStream for ScriptedStream {
        fn partition_id(&self) -> &str {
            "0"
        }

        async fn receive(
            &self,
            _max_messages: usize,
            wait: Duration,
        ) -> anyhow::Result<Vec<StreamMessage>> {
            self.receives.fetch_add(1, Ordering::SeqCst);
            let next = self.batches.lock().unwrap().pop_front();
            match next {
                Some(batch) => Ok(batch),
                None => {
                    tokio::time::sleep(wait).await;
                    Ok(Vec::new())
                }
            }
        }

        async fn checkpoint(&self) -> anyhow::Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push("stream.checkpoint".to_string());
            Ok(())
        }

        async fn abandon(&self) -> anyhow::Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push("stream.abandon".to_string());
            Ok(())
        }
    }

    /// Lease shared by every instance created from the same holder slot
    pub struct InMemoryLease {
        owner: String,
        holder: Arc<Mutex<Option<String>>>,
    }

    impl InMemoryLease {
        pub fn exclusive() -> Self {
            Self::contending("only", Arc::new(Mutex::new(None)))
        }

        pub fn contending(owner: &str, holder: Arc<Mutex<Option<String>>>) -> Self {
            Self {
                owner: owner.to_string(),
                holder,
            }
        }

        fn held(&self, holder: &Option<String>) -> bool {
            holder.as_deref() == Some(self.owner.as_str())
        }
    }

    #[async_trait]
    impl PartitionLease for InMemoryLease {
        async fn acquire(&self) -> anyhow::Result<bool> {
            let mut holder = self.holder.lock().unwrap();
            if holder.is_none() {
                *holder = Some(self.owner.clone());
            }
            Ok(self.held(&holder))
        }

        async fn renew(&self) -> anyhow::Result<bool> {
            Ok(self.held(&self.holder.lock().unwrap()))
        }

        async fn release(&self) -> anyhow::Result<()> {
            let mut holder = self.holder.lock().unwrap();
            if self.held(&holder) {
                *holder = None;
            }
            Ok(())
        }
    }

    pub struct NullSender;

    #[async_trait]
    impl PartitionSender for NullSender {
        async fn send_batch(&self, _envelopes: Vec<Envelope>) -> anyhow::Result<()> {
            Ok(())
        }

        fn max_batch_size_bytes(&self) -> usize {
            1024 * 1024
        }
    }

    /// Counts applies across every processor the factory creates
    pub struct RecordingProcessor {
        applied: Arc<AtomicUsize>,
        checkpoints: Arc<AtomicUsize>,
        always_checkpoint: bool,
    }

    impl RecordingProcessor {
        fn record(&self) -> anyhow::Result<()> {
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl LifecycleEventProcessor for RecordingProcessor {
        async fn process_started(&mut self, _: &CommandStartedEvent) -> anyhow::Result<()> {
            self.record()
        }
        async fn process_completed(&mut self, _: &CommandCompletedEvent) -> anyhow::Result<()> {
            self.record()
        }
        async fn process_soft_deleted(&mut self, _: &CommandSoftDeletedEvent) -> anyhow::Result<()> {
            self.record()
        }
        async fn process_sent_to_agent(&mut self, _: &EventHeader) -> anyhow::Result<()> {
            self.record()
        }
        async fn process_pending(&mut self, _: &EventHeader) -> anyhow::Result<()> {
            self.record()
        }
        async fn process_failed(&mut self, _: &EventHeader) -> anyhow::Result<()> {
            self.record()
        }
        async fn process_unexpected(&mut self, _: &EventHeader) -> anyhow::Result<()> {
            self.record()
        }
        async fn process_verification_failed(&mut self, _: &EventHeader) -> anyhow::Result<()> {
            self.record()
        }
        async fn process_unexpected_verification_failure(
            &mut self,
            _: &EventHeader,
        ) -> anyhow::Result<()> {
            self.record()
        }
        async fn process_raw_data(&mut self, _: &CommandRawDataEvent) -> anyhow::Result<()> {
            self.record()
        }
        async fn process_dropped(&mut self, _: &CommandDroppedEvent) -> anyhow::Result<()> {
            self.record()
        }
    }

    #[async_trait]
    impl CheckpointProcessor for RecordingProcessor {
        fn should_checkpoint(&self) -> bool {
            self.always_checkpoint
        }

        async fn checkpoint(&mut self) -> anyhow::Result<()> {
            self.checkpoints.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    pub struct Counters {
        pub applied: Arc<AtomicUsize>,
        pub checkpoints: Arc<AtomicUsize>,
    }

    impl Counters {
        pub fn processor(&self, always_checkpoint: bool) -> RecordingProcessor {
            RecordingProcessor {
                applied: self.applied.clone(),
                checkpoints: self.checkpoints.clone(),
                always_checkpoint,
            }
        }

        pub fn factory(&self, always_checkpoint: bool) -> ProcessorFactory {
            let counters = self.clone();
            Arc::new(move || {
                Box::new(counters.processor(always_checkpoint)) as Box<dyn CheckpointProcessor>
            })
        }
    }
}

use fakes::{Counters, InMemoryLease, InMemoryQueue, Journal, NullSender, ScriptedStream};

fn identity() -> CommandIdentity {
    CommandIdentity {
        agent_id: AgentId::random(),
        asset_group_id: AssetGroupId::random(),
        asset_group_qualifier: "AssetType=CosmosStructuredStream".to_string(),
        command_id: CommandId::random(),
        command_type: PrivacyCommandType::Delete,
        command_creation_time: None,
    }
}

fn valid_envelope() -> Envelope {
    let id = identity();
    let event = command_completed(&id, CompletedDetails::default(), false).unwrap();
    single_bulk(&[event])
}

fn single_bulk(events: &[LifecycleEvent]) -> Envelope {
    let mut envelopes = serialize_events(events, 500 * 1024, true).unwrap();
    assert_eq!(envelopes.len(), 1);
    envelopes.remove(0)
}

fn malformed_envelope() -> Envelope {
    Envelope::new("$bulk$", "[1, 2, 3]").with_property("CompressionAlgorithm", "None")
}

fn ten_valid_two_malformed() -> Vec<StreamMessage> {
    (0..12u64)
        .map(|sequence| StreamMessage {
            sequence,
            envelope: if sequence == 3 || sequence == 9 {
                malformed_envelope()
            } else {
                valid_envelope()
            },
        })
        .collect()
}

fn new_journal() -> Journal {
    Arc::new(std::sync::Mutex::new(Vec::new()))
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_malformed_messages_reach_retry_queue_before_stream_checkpoint() {
    // Arrange
    let journal = new_journal();
    let counters = Counters::default();
    let work_items = Arc::new(InMemoryQueue::new("work-items", journal.clone()));
    let stream = ScriptedStream::new(vec![], journal.clone());
    let mut sink = ReceiverSink::new(
        "lifecycle.audit.0",
        counters.factory(true),
        work_items.clone(),
        Arc::new(NullSender),
        SinkConfig::default(),
    );

    // Act
    sink.handle_event_batch(ten_valid_two_malformed(), &stream)
        .await
        .unwrap();

    // Assert
    assert_eq!(counters.applied.load(Ordering::SeqCst), 10);
    assert_eq!(counters.checkpoints.load(Ordering::SeqCst), 1);
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["work-items.enqueue", "stream.checkpoint"]
    );
    let bodies = work_items.bodies();
    assert_eq!(bodies.len(), 1);
    let retried = unpackage(&bodies[0]).unwrap();
    assert_eq!(retried, vec![malformed_envelope(), malformed_envelope()]);
    assert_eq!(sink.failed_count(), 0);
    assert_eq!(sink.seen_count(), 0);
}

#[tokio::test]
async fn test_receiver_runs_partition_until_cancelled() {
    // Arrange
    let journal = new_journal();
    let counters = Counters::default();
    let work_items = Arc::new(InMemoryQueue::new("work-items", journal.clone()));
    let flags = Arc::new(ConfigFeatureFlags::new(FlagConfig {
        retry_queue_disabled_consumer_groups: vec!["audit".to_string()],
        ..Default::default()
    }));
    let stream = Arc::new(ScriptedStream::new(
        vec![ten_valid_two_malformed()],
        journal.clone(),
    ));
    let receiver = LifecycleEventReceiver::new(
        ReceiverConfig {
            consumer_group: "audit".to_string(),
            enable_keep_alive: false,
            receive_wait: Duration::from_millis(10),
            ..Default::default()
        },
        flags,
        PrioritySemaphore::new(4, 1),
        counters.factory(true),
        work_items.clone(),
        vec![PartitionBinding {
            stream,
            sender: Arc::new(NullSender),
            lease: Arc::new(InMemoryLease::exclusive()),
        }],
    );
    let ctx = CancellationToken::new();
    let handle = tokio::spawn(receiver.run(ctx.clone()));

    // Act
    let observed = journal.clone();
    wait_until(|| observed.lock().unwrap().contains(&"stream.checkpoint".to_string())).await;
    ctx.cancel();
    let result = handle.await.unwrap();

    // Assert
    assert!(result.is_ok());
    assert_eq!(counters.applied.load(Ordering::SeqCst), 10);
    assert_eq!(work_items.bodies().len(), 1);
}

#[tokio::test]
async fn test_partition_replays_work_items_in_background() {
    // Arrange
    let journal = new_journal();
    let counters = Counters::default();
    let work_items = Arc::new(InMemoryQueue::new("work-items", journal.clone()));
    let events = vec![command_pending(&identity()), command_pending(&identity())];
    let body = package(&[single_bulk(&events[..1]), single_bulk(&events[1..])]).unwrap();
    work_items.enqueue(body).await.unwrap();
    let receiver = LifecycleEventReceiver::new(
        ReceiverConfig {
            consumer_group: "audit".to_string(),
            enable_keep_alive: false,
            receive_wait: Duration::from_millis(10),
            work_items: QueueWorkerConfig {
                min_idle_backoff: Duration::from_millis(5),
                max_idle_backoff: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        },
        Arc::new(ConfigFeatureFlags::new(FlagConfig::default())),
        PrioritySemaphore::new(4, 1),
        counters.factory(false),
        work_items.clone(),
        vec![PartitionBinding {
            stream: Arc::new(ScriptedStream::new(vec![], journal.clone())),
            sender: Arc::new(NullSender),
            lease: Arc::new(InMemoryLease::exclusive()),
        }],
    );
    let ctx = CancellationToken::new();
    let handle = tokio::spawn(receiver.run(ctx.clone()));

    // Act
    let queue = work_items.clone();
    wait_until(|| queue.is_drained()).await;
    ctx.cancel();
    handle.await.unwrap().unwrap();

    // Assert: replay checkpoints even though the processor never asks to
    assert_eq!(counters.applied.load(Ordering::SeqCst), 2);
    assert_eq!(counters.checkpoints.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_backup_and_drain_move_work_items_through_retry_queue() {
    // Arrange
    let journal = new_journal();
    let counters = Counters::default();
    let work_items = Arc::new(InMemoryQueue::new("work-items", journal.clone()));
    let retry_queue = Arc::new(InMemoryQueue::new("retry", journal.clone()));
    let body = package(&[valid_envelope(), valid_envelope(), valid_envelope()]).unwrap();
    work_items.enqueue(body).await.unwrap();
    let flags = Arc::new(ConfigFeatureFlags::new(FlagConfig {
        retry_queue_handler_consumer_groups: vec!["audit".to_string()],
        ..Default::default()
    }));
    let idle = QueueWorkerConfig {
        min_idle_backoff: Duration::from_millis(5),
        max_idle_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    let handler = Arc::new(RetryQueueHandler::new(
        RetryQueueHandlerConfig {
            consumer_group: "audit".to_string(),
            empty_queue_delay: Duration::from_millis(10),
            backup: idle,
            ..Default::default()
        },
        flags,
        work_items.clone(),
        retry_queue.clone(),
        PrioritySemaphore::new(4, 1),
    ));
    let ctx = CancellationToken::new();
    let backup = {
        let (handler, ctx) = (handler.clone(), ctx.clone());
        tokio::spawn(async move { handler.run_backup(ctx).await })
    };
    let drain = {
        let (handler, ctx) = (handler.clone(), ctx.clone());
        let processor = Box::new(counters.processor(true));
        tokio::spawn(async move { handler.run_drain(processor, ctx).await })
    };

    // Act
    let (source, target) = (work_items.clone(), retry_queue.clone());
    wait_until(|| source.is_drained() && target.is_drained()).await;
    ctx.cancel();
    backup.await.unwrap().unwrap();
    drain.await.unwrap().unwrap();

    // Assert
    assert_eq!(counters.applied.load(Ordering::SeqCst), 3);
    let journal = journal.lock().unwrap();
    assert_eq!(
        journal.iter().filter(|e| e.as_str() == "retry.delete").count(),
        1
    );
}

#[tokio::test]
async fn test_only_lease_holder_receives_from_partition() {
    // Arrange
    let journal = new_journal();
    let counters = Counters::default();
    let resources = PartitionResources {
        config: Arc::new(ReceiverConfig {
            consumer_group: "audit".to_string(),
            enable_keep_alive: false,
            receive_wait: Duration::from_millis(10),
            lease_retry_interval: Duration::from_millis(10),
            ..Default::default()
        }),
        flags: Arc::new(ConfigFeatureFlags::new(FlagConfig {
            retry_queue_disabled_consumer_groups: vec!["audit".to_string()],
            ..Default::default()
        })),
        semaphore: PrioritySemaphore::new(4, 1),
        factory: counters.factory(true),
        work_items: Arc::new(InMemoryQueue::new("work-items", journal.clone())),
    };
    let holder = Arc::new(std::sync::Mutex::new(None));
    let binding = |owner: &str| {
        let stream = Arc::new(ScriptedStream::new(
            vec![vec![StreamMessage {
                sequence: 1,
                envelope: valid_envelope(),
            }]],
            journal.clone(),
        ));
        let binding = PartitionBinding {
            stream: stream.clone(),
            sender: Arc::new(NullSender),
            lease: Arc::new(InMemoryLease::contending(owner, holder.clone())),
        };
        (stream, binding)
    };
    let (first_stream, first) = binding("first");
    let (second_stream, second) = binding("second");
    let first_ctx = CancellationToken::new();
    let second_ctx = CancellationToken::new();

    // Act: the first instance takes the partition, the second waits on the lease
    let first_task = tokio::spawn(run_partition(resources.clone(), first, first_ctx.clone()));
    wait_until(|| counters.checkpoints.load(Ordering::SeqCst) == 1).await;
    let second_task = tokio::spawn(run_partition(resources, second, second_ctx.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second_receives_while_held = second_stream.receives.load(Ordering::SeqCst);

    first_ctx.cancel();
    first_task.await.unwrap().unwrap();
    wait_until(|| counters.checkpoints.load(Ordering::SeqCst) == 2).await;
    second_ctx.cancel();
    second_task.await.unwrap().unwrap();

    // Assert
    assert_eq!(second_receives_while_held, 0);
    assert!(first_stream.receives.load(Ordering::SeqCst) > 0);
    assert_eq!(counters.applied.load(Ordering::SeqCst), 2);
    let journal = journal.lock().unwrap();
    let first_abandon = journal.iter().position(|e| e == "stream.abandon").unwrap();
    let second_checkpoint = journal
        .iter()
        .rposition(|e| e == "stream.checkpoint")
        .unwrap();
    assert!(first_abandon < second_checkpoint);
}
