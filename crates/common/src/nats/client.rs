use anyhow::{Context, Result};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy},
    kv,
    stream::{Config as StreamConfig, RetentionPolicy},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::nats::{
    NatsLeaseStore, NatsPartitionSender, NatsPartitionStream, NatsRetryQueue, NatsStreamEndpoint,
};

pub struct NatsClient {
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client);

        info!("Successfully connected to NATS");
        Ok(Self { jetstream })
    }

    /// Lifecycle event stream; each partition is the subject `{stream}.{partition}`
    pub async fn ensure_event_stream(&self, stream_name: &str) -> Result<()> {
        self.ensure_stream(StreamConfig {
            name: stream_name.to_string(),
            subjects: vec![format!("{}.*", stream_name)],
            description: Some("Command lifecycle events".to_string()),
            ..Default::default()
        })
        .await
    }

    /// Work-queue stream: a message is removed once it is acknowledged
    pub async fn ensure_queue_stream(&self, queue_name: &str) -> Result<()> {
        self.ensure_stream(StreamConfig {
            name: queue_name.to_string(),
            subjects: vec![queue_name.to_string()],
            description: Some("Command lifecycle retry queue".to_string()),
            retention: RetentionPolicy::WorkQueue,
            ..Default::default()
        })
        .await
    }

    async fn ensure_stream(&self, config: StreamConfig) -> Result<()> {
        let stream_name = config.name.clone();
        info!(stream = %stream_name, "Ensuring stream exists");

        match self.jetstream.get_stream(&stream_name).await {
            Ok(_) => {
                info!(stream = %stream_name, "Stream already exists");
            }
            Err(_) => {
                self.jetstream
                    .create_stream(config)
                    .await
                    .with_context(|| format!("Failed to create stream {stream_name}"))?;
                info!(stream = %stream_name, "Created stream");
            }
        }

        Ok(())
    }

    /// Partition lease bucket. Entries expire after `ttl` unless renewed.
    ///
    /// Every call hands out a fresh owner id, so one store per process.
    pub async fn lease_store(&self, bucket: &str, ttl: Duration) -> Result<NatsLeaseStore> {
        info!(bucket = %bucket, ttl_secs = ttl.as_secs(), "Ensuring lease bucket exists");

        let store = match self.jetstream.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => self
                .jetstream
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    description: "Command lifecycle partition leases".to_string(),
                    history: 1,
                    max_age: ttl,
                    ..Default::default()
                })
                .await
                .with_context(|| format!("Failed to create lease bucket {bucket}"))?,
        };

        Ok(NatsLeaseStore::new(store, &Uuid::new_v4().to_string()))
    }

    pub fn stream_endpoint(
        &self,
        name: &str,
        stream_name: &str,
        partition_count: u32,
    ) -> Arc<NatsStreamEndpoint> {
        Arc::new(NatsStreamEndpoint::new(
            name,
            self.jetstream.clone(),
            stream_name,
            partition_count,
        ))
    }

    pub fn partition_sender(
        &self,
        stream_name: &str,
        partition_id: &str,
        max_batch_size_bytes: usize,
    ) -> Arc<NatsPartitionSender> {
        Arc::new(NatsPartitionSender::new(
            self.jetstream.clone(),
            format!("{}.{}", stream_name, partition_id),
            max_batch_size_bytes,
        ))
    }

    /// Durable cursor for one partition and consumer group.
    ///
    /// `AckPolicy::All` makes acknowledging the newest message a checkpoint of
    /// everything before it.
    pub async fn partition_stream(
        &self,
        stream_name: &str,
        consumer_group: &str,
        partition_id: &str,
        ack_wait: Duration,
    ) -> Result<NatsPartitionStream> {
        let durable = format!("{}-{}", consumer_group, partition_id);
        let consumer = self
            .jetstream
            .create_consumer_on_stream(
                pull::Config {
                    name: Some(durable.clone()),
                    durable_name: Some(durable),
                    filter_subject: format!("{}.{}", stream_name, partition_id),
                    ack_policy: AckPolicy::All,
                    ack_wait,
                    max_ack_pending: -1,
                    ..Default::default()
                },
                stream_name,
            )
            .await
            .context("Failed to create partition consumer")?;

        Ok(NatsPartitionStream::new(partition_id, consumer))
    }

    pub async fn retry_queue(
        &self,
        queue_name: &str,
        lease: Duration,
        max_message_size: usize,
    ) -> Result<Arc<NatsRetryQueue>> {
        self.ensure_queue_stream(queue_name).await?;

        let consumer = self
            .jetstream
            .create_consumer_on_stream(
                pull::Config {
                    name: Some(format!("{}-reader", queue_name)),
                    durable_name: Some(format!("{}-reader", queue_name)),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: lease,
                    ..Default::default()
                },
                queue_name,
            )
            .await
            .context("Failed to create retry queue consumer")?;

        Ok(Arc::new(NatsRetryQueue::new(
            self.jetstream.clone(),
            queue_name,
            consumer,
            lease,
            max_message_size,
        )))
    }

    pub async fn close(self) {
        info!("Closing NATS connection");
    }
}
