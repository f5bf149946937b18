use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{
    CommandCompletedEvent, CommandDroppedEvent, CommandRawDataEvent, CommandSoftDeletedEvent,
    CommandStartedEvent, EventHeader,
};

/// Consumer-side handler with one method per lifecycle event variant
#[async_trait]
pub trait LifecycleEventProcessor: Send {
    async fn process_started(&mut self, event: &CommandStartedEvent) -> anyhow::Result<()>;
    async fn process_completed(&mut self, event: &CommandCompletedEvent) -> anyhow::Result<()>;
    async fn process_soft_deleted(&mut self, event: &CommandSoftDeletedEvent)
        -> anyhow::Result<()>;
    async fn process_sent_to_agent(&mut self, event: &EventHeader) -> anyhow::Result<()>;
    async fn process_pending(&mut self, event: &EventHeader) -> anyhow::Result<()>;
    async fn process_failed(&mut self, event: &EventHeader) -> anyhow::Result<()>;
    async fn process_unexpected(&mut self, event: &EventHeader) -> anyhow::Result<()>;
    async fn process_verification_failed(&mut self, event: &EventHeader) -> anyhow::Result<()>;
    async fn process_unexpected_verification_failure(
        &mut self,
        event: &EventHeader,
    ) -> anyhow::Result<()>;
    async fn process_raw_data(&mut self, event: &CommandRawDataEvent) -> anyhow::Result<()>;
    async fn process_dropped(&mut self, event: &CommandDroppedEvent) -> anyhow::Result<()>;
}

/// A processor that accumulates work and persists it on checkpoint
#[async_trait]
pub trait CheckpointProcessor: LifecycleEventProcessor {
    fn should_checkpoint(&self) -> bool;

    async fn checkpoint(&mut self) -> anyhow::Result<()>;
}

/// Creates a fresh processor, used on startup and after a failed checkpoint
pub type ProcessorFactory = Arc<dyn Fn() -> Box<dyn CheckpointProcessor> + Send + Sync>;
