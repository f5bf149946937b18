use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::codec::parse_envelope;
use common::flags::FeatureFlags;
use common::priority::{Priority, PrioritySemaphore};
use common::{
    Envelope, LifecycleResult, PartitionLease, PartitionSender, PartitionStream, ProcessorFactory,
    RetryQueue, StreamMessage,
};

use crate::{QueueProcessResult, QueueWorker, ReceiverConfig, ReceiverSink, WorkItemHandler};

type LastReceived = Arc<Mutex<Option<DateTime<Utc>>>>;

/// Everything a partition processor needs from the process-wide receiver
#[derive(Clone)]
pub struct PartitionResources {
    pub config: Arc<ReceiverConfig>,
    pub flags: Arc<dyn FeatureFlags>,
    pub semaphore: PrioritySemaphore,
    pub factory: ProcessorFactory,
    pub work_items: Arc<dyn RetryQueue>,
}

/// Owns one partition while its lease is held.
///
/// `open` starts the lease renewal, keep-alive and work-item tasks.
/// `process_events` feeds the sink. `close` stops the tasks, hands uncommitted
/// messages back to the stream and releases the lease.
pub struct PartitionProcessor {
    identifier: String,
    resources: PartitionResources,
    sender: Arc<dyn PartitionSender>,
    lease: Arc<dyn PartitionLease>,
    sink: ReceiverSink,
    last_received: LastReceived,
    lease_lost: CancellationToken,
    ctx: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PartitionProcessor {
    pub fn new(
        partition_id: &str,
        resources: PartitionResources,
        sender: Arc<dyn PartitionSender>,
        lease: Arc<dyn PartitionLease>,
    ) -> Self {
        let config = &resources.config;
        let identifier = format!("{}.{}.{}", config.moniker, config.consumer_group, partition_id);
        let sink = ReceiverSink::new(
            &identifier,
            resources.factory.clone(),
            resources.work_items.clone(),
            sender.clone(),
            config.sink.clone(),
        );

        Self {
            identifier,
            resources,
            sender,
            lease,
            sink,
            last_received: Arc::new(Mutex::new(None)),
            lease_lost: CancellationToken::new(),
            ctx: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Cancelled once the lease could not be renewed
    pub fn lease_lost(&self) -> CancellationToken {
        self.lease_lost.clone()
    }

    /// Starts the partition tasks. The lease must already be held.
    pub fn open(&mut self) {
        let config = self.resources.config.clone();
        debug!(identifier = %self.identifier, "Acquired partition");

        self.tasks.push(tokio::spawn(renew_lease(
            self.identifier.clone(),
            self.lease.clone(),
            config.lease_renew_interval,
            self.lease_lost.clone(),
            self.ctx.child_token(),
        )));

        if config.enable_keep_alive {
            self.tasks.push(tokio::spawn(keep_alive(
                self.identifier.clone(),
                self.sender.clone(),
                self.last_received.clone(),
                config.clone(),
                self.ctx.child_token(),
            )));
        }

        if self
            .resources
            .flags
            .is_retry_queue_disabled(&config.consumer_group)
        {
            info!(
                identifier = %self.identifier,
                consumer_group = %config.consumer_group,
                "Work-item queue processing disabled"
            );
            return;
        }

        let worker = QueueWorker::new(
            &format!("{}.work-items", self.identifier),
            self.resources.work_items.clone(),
            self.resources.semaphore.clone(),
            config.work_items.clone(),
        );
        let handler: Arc<dyn WorkItemHandler> = Arc::new(WorkItemReplayHandler {
            factory: self.resources.factory.clone(),
        });
        let ctx = self.ctx.child_token();
        let identifier = self.identifier.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = worker.run(handler, ctx).await {
                error!(identifier = %identifier, error = %e, "Work-item worker exited");
            }
        }));
    }

    pub async fn process_events(
        &mut self,
        messages: Vec<StreamMessage>,
        stream: &dyn PartitionStream,
    ) -> LifecycleResult<()> {
        if let Ok(mut last) = self.last_received.lock() {
            *last = Some(Utc::now());
        }

        slow_down(self.resources.flags.as_ref(), &self.resources.config).await;

        let _permit = if self.resources.flags.is_full_throttle() {
            None
        } else {
            Some(
                self.resources
                    .semaphore
                    .acquire(self.resources.config.priority)
                    .await?,
            )
        };

        debug!(identifier = %self.identifier, count = messages.len(), "Processing partition batch");
        self.sink.handle_event_batch(messages, stream).await
    }

    pub async fn close(mut self, stream: &dyn PartitionStream) {
        self.ctx.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(identifier = %self.identifier, error = %e, "Partition task ended abnormally");
            }
        }

        // Redelivery must be possible before another instance can take over
        if let Err(e) = stream.abandon().await {
            warn!(identifier = %self.identifier, error = %e, "Failed to return in-flight messages");
        }
        if let Err(e) = self.lease.release().await {
            warn!(identifier = %self.identifier, error = %e, "Failed to release partition lease");
        }
        debug!(identifier = %self.identifier, "Released partition");
    }
}

/// Keeps the lease alive; cancels `lease_lost` once another owner has it
async fn renew_lease(
    identifier: String,
    lease: Arc<dyn PartitionLease>,
    interval: Duration,
    lease_lost: CancellationToken,
    ctx: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match lease.renew().await {
            Ok(true) => debug!(identifier = %identifier, "Renewed partition lease"),
            Ok(false) => {
                warn!(identifier = %identifier, "Partition lease lost");
                lease_lost.cancel();
                break;
            }
            Err(e) => warn!(identifier = %identifier, error = %e, "Failed to renew partition lease"),
        }
    }
}

/// Holds a batch back while the slowdown flag is on, for at most `max_slowdown`
async fn slow_down(flags: &dyn FeatureFlags, config: &ReceiverConfig) {
    let started = Instant::now();
    while flags.is_receiver_slowdown_enabled(&config.handler_name) {
        tokio::time::sleep(config.slowdown_check_interval).await;
        if started.elapsed() >= config.max_slowdown {
            break;
        }
    }
}

/// Pokes the partition with a noop envelope so checkpoints keep happening on idle partitions
async fn keep_alive(
    identifier: String,
    sender: Arc<dyn PartitionSender>,
    last_received: LastReceived,
    config: Arc<ReceiverConfig>,
    ctx: CancellationToken,
) {
    let mut last_log: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = tokio::time::sleep(config.keep_alive_interval) => {}
        }

        if last_log.map_or(true, |at| at.elapsed() > config.keep_alive_log_interval) {
            let most_recent = last_received.lock().ok().and_then(|last| *last);
            info!(
                identifier = %identifier,
                most_recent_receive = ?most_recent,
                "Partition keep-alive"
            );
            last_log = Some(Instant::now());
        }

        if let Err(e) = sender.send_batch(vec![Envelope::noop()]).await {
            warn!(identifier = %identifier, error = %e, "Failed to send keep-alive");
        }
    }
}

/// Replays a work item through a fresh processor and checkpoints it right away
struct WorkItemReplayHandler {
    factory: ProcessorFactory,
}

#[async_trait]
impl WorkItemHandler for WorkItemReplayHandler {
    fn priority(&self) -> Priority {
        Priority::Background
    }

    async fn process_work_item(&self, envelopes: Vec<Envelope>) -> anyhow::Result<QueueProcessResult> {
        let mut processor = (self.factory)();
        for envelope in &envelopes {
            for event in parse_envelope(envelope)? {
                event.apply(processor.as_mut()).await?;
            }
        }
        processor.checkpoint().await?;
        Ok(QueueProcessResult::Success)
    }
}
