use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::flags::FeatureFlags;
use common::priority::PrioritySemaphore;
use common::{
    LifecycleResult, PartitionLease, PartitionSender, PartitionStream, ProcessorFactory,
    RetryQueue,
};

use crate::{PartitionProcessor, PartitionResources, ReceiverConfig};

/// Inbound and outbound handles for one partition, plus its ownership lease
#[derive(Clone)]
pub struct PartitionBinding {
    pub stream: Arc<dyn PartitionStream>,
    pub sender: Arc<dyn PartitionSender>,
    pub lease: Arc<dyn PartitionLease>,
}

/// Receives lifecycle events from every partition of one consumer group
pub struct LifecycleEventReceiver {
    resources: PartitionResources,
    partitions: Vec<PartitionBinding>,
}

impl LifecycleEventReceiver {
    pub fn new(
        config: ReceiverConfig,
        flags: Arc<dyn FeatureFlags>,
        semaphore: PrioritySemaphore,
        factory: ProcessorFactory,
        work_items: Arc<dyn RetryQueue>,
        partitions: Vec<PartitionBinding>,
    ) -> Self {
        Self {
            resources: PartitionResources {
                config: Arc::new(config),
                flags,
                semaphore,
                factory,
                work_items,
            },
            partitions,
        }
    }

    /// Runs every partition until cancelled. A fatal partition error stops the others.
    pub async fn run(self, ctx: CancellationToken) -> Result<()> {
        info!(
            consumer_group = %self.resources.config.consumer_group,
            partitions = self.partitions.len(),
            "Starting lifecycle event receiver"
        );

        let mut tasks = JoinSet::new();
        for binding in self.partitions {
            tasks.spawn(run_partition(
                self.resources.clone(),
                binding,
                ctx.child_token(),
            ));
        }

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result.map_err(anyhow::Error::from),
                Err(e) => Err(anyhow::Error::from(e)),
            };
            if let Err(e) = result {
                error!(error = %e, "Partition stopped, shutting down receiver");
                ctx.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        info!(consumer_group = %self.resources.config.consumer_group, "Lifecycle event receiver stopped");
        outcome
    }
}

/// Ownership loop for one partition: wait for the lease, then receive until
/// cancelled, a fatal error, or the lease is lost. A lost lease starts over.
pub async fn run_partition(
    resources: PartitionResources,
    binding: PartitionBinding,
    ctx: CancellationToken,
) -> LifecycleResult<()> {
    loop {
        if !acquire_lease(&binding, &resources.config, &ctx).await {
            return Ok(());
        }

        match own_partition(resources.clone(), &binding, &ctx).await? {
            Ownership::Cancelled => return Ok(()),
            Ownership::LeaseLost => continue,
        }
    }
}

enum Ownership {
    Cancelled,
    LeaseLost,
}

/// Retries until the lease is held; `false` when cancelled first
async fn acquire_lease(
    binding: &PartitionBinding,
    config: &ReceiverConfig,
    ctx: &CancellationToken,
) -> bool {
    let partition_id = binding.stream.partition_id();
    loop {
        match binding.lease.acquire().await {
            Ok(true) => return true,
            Ok(false) => {
                debug!(partition = %partition_id, "Partition lease held by another instance")
            }
            Err(e) => warn!(partition = %partition_id, error = %e, "Failed to acquire partition lease"),
        }

        tokio::select! {
            _ = ctx.cancelled() => return false,
            _ = tokio::time::sleep(config.lease_retry_interval) => {}
        }
    }
}

async fn own_partition(
    resources: PartitionResources,
    binding: &PartitionBinding,
    ctx: &CancellationToken,
) -> LifecycleResult<Ownership> {
    let config = resources.config.clone();
    let stream = binding.stream.clone();
    let mut processor = PartitionProcessor::new(
        stream.partition_id(),
        resources,
        binding.sender.clone(),
        binding.lease.clone(),
    );
    let lease_lost = processor.lease_lost();
    processor.open();

    let result = loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!(identifier = %processor.identifier(), "Received shutdown signal, closing partition");
                break Ok(Ownership::Cancelled);
            }
            _ = lease_lost.cancelled() => {
                warn!(identifier = %processor.identifier(), "Lost partition lease, closing partition");
                break Ok(Ownership::LeaseLost);
            }
            batch = stream.receive(config.receive_batch_size, config.receive_wait) => {
                let messages = match batch {
                    Ok(messages) if messages.is_empty() => continue,
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(identifier = %processor.identifier(), error = %e, "Failed to receive from partition");
                        tokio::time::sleep(config.error_delay).await;
                        continue;
                    }
                };

                if let Err(e) = processor.process_events(messages, stream.as_ref()).await {
                    if e.is_fatal() {
                        error!(identifier = %processor.identifier(), error = %e, "Fatal partition error");
                        break Err(e);
                    }
                    error!(identifier = %processor.identifier(), error = %e, "Error processing partition batch");
                    tokio::time::sleep(config.error_delay).await;
                }
            }
        }
    };

    processor.close(stream.as_ref()).await;
    result
}
