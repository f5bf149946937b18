use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use common::{
    CheckpointProcessor, CommandCompletedEvent, CommandDroppedEvent, CommandRawDataEvent,
    CommandSoftDeletedEvent, CommandStartedEvent, EventHeader, LifecycleEventProcessor,
};

/// Checkpoint processor that records lifecycle events to the log.
///
/// Events are held until a checkpoint, which fires after `checkpoint_every`
/// events or once `checkpoint_interval` has passed with something pending.
pub struct LoggingProcessor {
    pending: usize,
    checkpointed: usize,
    checkpoint_every: usize,
    checkpoint_interval: Duration,
    last_checkpoint: Instant,
}

impl LoggingProcessor {
    pub fn new(checkpoint_every: usize, checkpoint_interval: Duration) -> Self {
        Self {
            pending: 0,
            checkpointed: 0,
            checkpoint_every: checkpoint_every.max(1),
            checkpoint_interval,
            last_checkpoint: Instant::now(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn checkpointed(&self) -> usize {
        self.checkpointed
    }

    fn record(&mut self, kind: &str, header: &EventHeader) -> anyhow::Result<()> {
        debug!(
            event = kind,
            command_id = %header.command_id,
            agent_id = %header.agent_id,
            asset_group_id = %header.asset_group_id,
            command_type = ?header.command_type,
            "Applied lifecycle event"
        );
        self.pending += 1;
        Ok(())
    }
}

#[async_trait]
impl LifecycleEventProcessor for LoggingProcessor {
    async fn process_started(&mut self, event: &CommandStartedEvent) -> anyhow::Result<()> {
        self.record("started", &event.header)
    }

    async fn process_completed(&mut self, event: &CommandCompletedEvent) -> anyhow::Result<()> {
        debug!(
            command_id = %event.header.command_id,
            affected_rows = event.affected_rows,
            force_complete_reason = ?event.force_complete_reason_code,
            "Command completed"
        );
        self.record("completed", &event.header)
    }

    async fn process_soft_deleted(&mut self, event: &CommandSoftDeletedEvent) -> anyhow::Result<()> {
        self.record("soft_deleted", &event.header)
    }

    async fn process_sent_to_agent(&mut self, event: &EventHeader) -> anyhow::Result<()> {
        self.record("sent_to_agent", event)
    }

    async fn process_pending(&mut self, event: &EventHeader) -> anyhow::Result<()> {
        self.record("pending", event)
    }

    async fn process_failed(&mut self, event: &EventHeader) -> anyhow::Result<()> {
        self.record("failed", event)
    }

    async fn process_unexpected(&mut self, event: &EventHeader) -> anyhow::Result<()> {
        self.record("unexpected", event)
    }

    async fn process_verification_failed(&mut self, event: &EventHeader) -> anyhow::Result<()> {
        self.record("verification_failed", event)
    }

    async fn process_unexpected_verification_failure(
        &mut self,
        event: &EventHeader,
    ) -> anyhow::Result<()> {
        self.record("unexpected_verification_failure", event)
    }

    async fn process_raw_data(&mut self, event: &CommandRawDataEvent) -> anyhow::Result<()> {
        debug!(commands = event.pxs_commands.len(), "Raw command data");
        self.record("raw_data", &event.header)
    }

    async fn process_dropped(&mut self, event: &CommandDroppedEvent) -> anyhow::Result<()> {
        self.record("dropped", &event.header)
    }
}

#[async_trait]
impl CheckpointProcessor for LoggingProcessor {
    fn should_checkpoint(&self) -> bool {
        self.pending >= self.checkpoint_every
            || (self.pending > 0 && self.last_checkpoint.elapsed() >= self.checkpoint_interval)
    }

    async fn checkpoint(&mut self) -> anyhow::Result<()> {
        if self.pending > 0 {
            info!(events = self.pending, "Checkpointed lifecycle events");
        }
        self.checkpointed += self.pending;
        self.pending = 0;
        self.last_checkpoint = Instant::now();
        Ok(())
    }
}
