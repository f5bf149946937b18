mod config;
mod processor;

use anyhow::Result;
use common::flags::{ConfigFeatureFlags, FeatureFlags};
use common::nats::NatsClient;
use common::priority::PrioritySemaphore;
use common::telemetry::{init_telemetry, TelemetryConfig};
use common::{
    CheckpointProcessor, PartitionLease, PartitionSender, PartitionStream, ProcessorFactory,
    RetryQueue,
};
use config::ServiceConfig;
use lifecycle_receiver::{LifecycleEventReceiver, PartitionBinding, RetryQueueHandler};
use processor::LoggingProcessor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

struct SharedDependencies {
    nats_client: NatsClient,
    work_items: Arc<dyn RetryQueue>,
    retry_queue: Arc<dyn RetryQueue>,
    partitions: Vec<PartitionBinding>,
}

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&TelemetryConfig {
        service_name: config.service_name.clone(),
        log_level: config.log_level.clone(),
        with_spans: true,
    }) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    info!(
        consumer_group = %config.consumer_group,
        partitions = config.partition_count,
        "Starting lifecycle worker"
    );
    debug!("Configuration: {:?}", config);

    let deps = match initialize_shared_dependencies(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("Failed to initialize shared dependencies: {}", e);
            std::process::exit(1);
        }
    };

    let flags: Arc<dyn FeatureFlags> = Arc::new(ConfigFeatureFlags::new(config.flag_config()));
    let semaphore = PrioritySemaphore::new(config.total_permits, config.background_permits);
    let factory = processor_factory(&config);
    let ctx = CancellationToken::new();

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    let receiver = LifecycleEventReceiver::new(
        config.receiver_config(),
        flags.clone(),
        semaphore.clone(),
        factory.clone(),
        deps.work_items.clone(),
        deps.partitions,
    );
    tasks.spawn(receiver.run(ctx.child_token()));

    if config.enable_retry_queue_handler {
        let handler = Arc::new(RetryQueueHandler::new(
            config.retry_queue_handler_config(),
            flags,
            deps.work_items,
            deps.retry_queue,
            semaphore,
        ));

        let backup = handler.clone();
        let backup_ctx = ctx.child_token();
        tasks.spawn(async move { backup.run_backup(backup_ctx).await });

        let drain_ctx = ctx.child_token();
        let drain_processor = factory();
        tasks.spawn(async move { handler.run_drain(drain_processor, drain_ctx).await });
    }

    let shutdown = ctx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        shutdown.cancel();
    });

    let mut exit_code = 0;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(anyhow::Error::from).and_then(|r| r);
        if let Err(e) = result {
            error!("Worker task failed: {:#}", e);
            exit_code = 1;
            ctx.cancel();
        }
    }

    deps.nats_client.close().await;
    info!("Lifecycle worker stopped");

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn processor_factory(config: &ServiceConfig) -> ProcessorFactory {
    let checkpoint_every = config.checkpoint_every_events;
    let checkpoint_interval = Duration::from_secs(config.checkpoint_interval_secs);
    Arc::new(move || {
        Box::new(LoggingProcessor::new(checkpoint_every, checkpoint_interval))
            as Box<dyn CheckpointProcessor>
    })
}

async fn initialize_shared_dependencies(config: &ServiceConfig) -> Result<SharedDependencies> {
    let startup_timeout = Duration::from_secs(config.startup_timeout_secs);
    let nats_client = NatsClient::connect(&config.nats_url, startup_timeout).await?;

    nats_client.ensure_event_stream(&config.event_stream).await?;

    let queue_lease = Duration::from_secs(config.queue_lease_secs);
    let work_items: Arc<dyn RetryQueue> = nats_client
        .retry_queue(&config.work_item_queue, queue_lease, config.queue_max_message_bytes)
        .await?;
    let retry_queue: Arc<dyn RetryQueue> = nats_client
        .retry_queue(&config.retry_queue, queue_lease, config.queue_max_message_bytes)
        .await?;

    let leases = nats_client
        .lease_store(&config.lease_bucket, Duration::from_secs(config.lease_ttl_secs))
        .await?;

    let ack_wait = Duration::from_secs(config.partition_ack_wait_secs);
    let mut partitions = Vec::with_capacity(config.partition_count as usize);
    for partition in 0..config.partition_count {
        let partition_id = partition.to_string();
        let stream: Arc<dyn PartitionStream> = Arc::new(
            nats_client
                .partition_stream(
                    &config.event_stream,
                    &config.consumer_group,
                    &partition_id,
                    ack_wait,
                )
                .await?,
        );
        let sender: Arc<dyn PartitionSender> = nats_client.partition_sender(
            &config.event_stream,
            &partition_id,
            config.max_send_batch_bytes,
        );
        let lease: Arc<dyn PartitionLease> = leases.lease(&config.consumer_group, &partition_id);
        partitions.push(PartitionBinding {
            stream,
            sender,
            lease,
        });
    }

    info!(
        partitions = partitions.len(),
        "Initialized NATS streams and queues"
    );

    Ok(SharedDependencies {
        nats_client,
        work_items,
        retry_queue,
        partitions,
    })
}
