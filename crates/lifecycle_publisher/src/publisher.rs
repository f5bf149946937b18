use futures::future::try_join_all;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use common::codec::serialize_events;
use common::flags::FeatureFlags;
use common::{
    command_completed, command_dropped, command_failed, command_pending, command_raw_data,
    command_sent_to_agent, command_soft_deleted, command_started, command_unexpected,
    command_unexpected_verification_failure, command_verification_failed, CommandIdentity,
    CompletedDetails, DroppedDetails, Envelope, LifecycleError, LifecycleEvent,
    LifecycleEventBatch, LifecycleResult, StartedDetails, StreamEndpoint,
};

use crate::{mark_export_test_in_production, PublisherConfig};

/// Chooses an index in `0..len`
pub type IndexPicker = Box<dyn Fn(usize) -> usize + Send + Sync>;

const DISABLED_PICKS_PER_ENDPOINT: usize = 20;

/// Publishes lifecycle events to a pool of stream endpoints.
///
/// Each network call goes to a randomly chosen enabled endpoint. A failed call
/// is retried on a different endpoint after `retry_delay`.
pub struct LifecycleEventPublisher {
    endpoints: Vec<Arc<dyn StreamEndpoint>>,
    flags: Arc<dyn FeatureFlags>,
    config: PublisherConfig,
    picker: IndexPicker,
}

impl LifecycleEventPublisher {
    pub fn new(
        endpoints: Vec<Arc<dyn StreamEndpoint>>,
        flags: Arc<dyn FeatureFlags>,
        config: PublisherConfig,
    ) -> LifecycleResult<Self> {
        if endpoints.is_empty() {
            return Err(LifecycleError::Configuration(
                "no stream endpoints are configured".to_string(),
            ));
        }

        info!(
            endpoints = ?endpoints.iter().map(|e| e.name().to_string()).collect::<Vec<_>>(),
            max_publish_size_bytes = config.max_publish_size_bytes,
            "Lifecycle event publisher created"
        );

        Ok(Self {
            endpoints,
            flags,
            config,
            picker: Box::new(|len| rand::thread_rng().gen_range(0..len)),
        })
    }

    /// Replace the random endpoint picker
    pub fn with_picker(mut self, picker: impl Fn(usize) -> usize + Send + Sync + 'static) -> Self {
        self.picker = Box::new(picker);
        self
    }

    pub async fn publish_batch(&self, batch: &LifecycleEventBatch) -> LifecycleResult<()> {
        self.publish(batch.events()).await
    }

    #[instrument(skip(self, events), fields(event_count = events.len()))]
    pub async fn publish(&self, events: &[LifecycleEvent]) -> LifecycleResult<()> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let partition_key = first.command_id().to_string();

        let envelopes = serialize_events(
            events,
            self.config.max_publish_size_bytes,
            !self.flags.publish_uncompressed(),
        )?;
        let chunks = chunk_envelopes(envelopes, self.config.max_publish_size_bytes);

        debug!(
            command_id = %first.command_id(),
            chunk_count = chunks.len(),
            "Publishing lifecycle events"
        );

        try_join_all(
            chunks
                .into_iter()
                .map(|chunk| self.send_with_failover(&partition_key, chunk)),
        )
        .await?;
        Ok(())
    }

    async fn send_with_failover(
        &self,
        partition_key: &str,
        envelopes: Vec<Envelope>,
    ) -> LifecycleResult<()> {
        let total_size: usize = envelopes.iter().map(|e| e.payload.len()).sum();
        let mut index = self.pick_endpoint(None)?;
        let mut last_error = None;

        for attempt in 1..=self.config.max_send_attempts {
            let endpoint = &self.endpoints[index];
            match endpoint.send(partition_key, envelopes.clone()).await {
                Ok(()) => {
                    debug!(
                        endpoint = endpoint.name(),
                        command_id = partition_key,
                        attempt = attempt,
                        event_count = envelopes.len(),
                        total_size_bytes = total_size,
                        "Lifecycle events published"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        endpoint = endpoint.name(),
                        command_id = partition_key,
                        attempt = attempt,
                        error = %e,
                        "Failed to publish lifecycle events"
                    );
                    last_error = Some(e.context(format!("endpoint {}", endpoint.name())));
                }
            }

            if attempt < self.config.max_send_attempts {
                tokio::time::sleep(self.config.retry_delay).await;
                index = self.pick_endpoint(Some(index))?;
            }
        }

        error!(command_id = partition_key, "Unable to publish to any endpoint");
        Err(LifecycleError::PublishFailed(last_error.unwrap_or_else(|| {
            anyhow::anyhow!("no send attempts were made")
        })))
    }

    /// Random pick among enabled endpoints, avoiding `failing` when possible.
    ///
    /// Drawing `failing` again counts toward `max_failing_endpoint_picks`, after
    /// which it is reused. Disabled draws do not count but are bounded.
    fn pick_endpoint(&self, failing: Option<usize>) -> LifecycleResult<usize> {
        let count = self.endpoints.len();
        let max_disabled_picks = DISABLED_PICKS_PER_ENDPOINT * count;
        let mut failing_picks = 0;
        let mut disabled_picks = 0;

        loop {
            let index = (self.picker)(count) % count;

            if Some(index) == failing {
                failing_picks += 1;
                if failing_picks >= self.config.max_failing_endpoint_picks {
                    warn!(
                        endpoint = self.endpoints[index].name(),
                        "Reusing failing endpoint"
                    );
                    return Ok(index);
                }
                continue;
            }

            if self.flags.is_endpoint_disabled(self.endpoints[index].name()) {
                disabled_picks += 1;
                if disabled_picks >= max_disabled_picks {
                    return Err(LifecycleError::Configuration(
                        "every stream endpoint is disabled".to_string(),
                    ));
                }
                continue;
            }

            return Ok(index);
        }
    }

    pub async fn publish_command_started(
        &self,
        identity: &CommandIdentity,
        details: StartedDetails,
    ) -> LifecycleResult<()> {
        self.publish(&[command_started(identity, details)]).await
    }

    pub async fn publish_command_completed(
        &self,
        identity: &CommandIdentity,
        details: CompletedDetails,
    ) -> LifecycleResult<()> {
        let event = command_completed(identity, details, self.config.test_environment)?;
        self.publish(&[event]).await
    }

    pub async fn publish_command_soft_deleted(
        &self,
        identity: &CommandIdentity,
        non_transient_exceptions: Option<String>,
    ) -> LifecycleResult<()> {
        self.publish(&[command_soft_deleted(identity, non_transient_exceptions)])
            .await
    }

    pub async fn publish_command_sent_to_agent(
        &self,
        identity: &CommandIdentity,
    ) -> LifecycleResult<()> {
        self.publish(&[command_sent_to_agent(identity)]).await
    }

    pub async fn publish_command_pending(&self, identity: &CommandIdentity) -> LifecycleResult<()> {
        self.publish(&[command_pending(identity)]).await
    }

    pub async fn publish_command_failed(&self, identity: &CommandIdentity) -> LifecycleResult<()> {
        self.publish(&[command_failed(identity)]).await
    }

    pub async fn publish_command_unexpected(
        &self,
        identity: &CommandIdentity,
    ) -> LifecycleResult<()> {
        self.publish(&[command_unexpected(identity)]).await
    }

    pub async fn publish_command_verification_failed(
        &self,
        identity: &CommandIdentity,
    ) -> LifecycleResult<()> {
        self.publish(&[command_verification_failed(identity)]).await
    }

    pub async fn publish_command_unexpected_verification_failure(
        &self,
        identity: &CommandIdentity,
    ) -> LifecycleResult<()> {
        self.publish(&[command_unexpected_verification_failure(identity)])
            .await
    }

    pub async fn publish_command_dropped(
        &self,
        identity: &CommandIdentity,
        details: DroppedDetails,
    ) -> LifecycleResult<()> {
        self.publish(&[command_dropped(identity, details)]).await
    }

    /// Publishes raw front-door commands, one raw data event per
    /// `pxs_commands_batch_size` commands.
    #[instrument(skip(self, pxs_commands), fields(command_count = pxs_commands.len()))]
    pub async fn publish_command_raw_data(
        &self,
        mut pxs_commands: Vec<Value>,
    ) -> LifecycleResult<()> {
        mark_export_test_in_production(&mut pxs_commands, self.flags.as_ref());

        let batch_size = self.config.pxs_commands_batch_size.max(1);
        let chunks: Vec<Vec<Value>> = pxs_commands
            .chunks(batch_size)
            .map(<[Value]>::to_vec)
            .collect();

        if chunks.len() > 1 {
            info!(
                command_count = pxs_commands.len(),
                batch_size = batch_size,
                chunk_count = chunks.len(),
                "Split raw commands into chunks"
            );
        }

        let events: Vec<LifecycleEvent> = chunks.into_iter().map(command_raw_data).collect();
        try_join_all(events.iter().map(|event| self.publish(std::slice::from_ref(event)))).await?;
        Ok(())
    }
}

/// Groups envelopes so each group's payload total stays within `max_size_bytes`.
/// A group always holds at least one envelope.
fn chunk_envelopes(envelopes: Vec<Envelope>, max_size_bytes: usize) -> Vec<Vec<Envelope>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut remaining = max_size_bytes;

    for envelope in envelopes {
        let size = envelope.payload.len();
        if !current.is_empty() && size > remaining {
            chunks.push(std::mem::take(&mut current));
            remaining = max_size_bytes;
        }
        remaining = remaining.saturating_sub(size);
        current.push(envelope);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
