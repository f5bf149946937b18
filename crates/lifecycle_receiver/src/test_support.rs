use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{
    CheckpointProcessor, CommandCompletedEvent, CommandDroppedEvent, CommandRawDataEvent,
    CommandSoftDeletedEvent, CommandStartedEvent, EventHeader, LifecycleEventProcessor,
    ProcessorFactory,
};

/// Processor that counts applies and checkpoints on demand
#[derive(Default)]
pub struct CountingProcessor {
    pub applied: Arc<AtomicUsize>,
    pub checkpoints: Arc<AtomicUsize>,
    pub checkpoint_ready: bool,
    pub fail_checkpoint: bool,
    pub hang_checkpoint: bool,
}

impl CountingProcessor {
    fn count(&self) -> anyhow::Result<()> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl LifecycleEventProcessor for CountingProcessor {
    async fn process_started(&mut self, _: &CommandStartedEvent) -> anyhow::Result<()> {
        self.count()
    }
    async fn process_completed(&mut self, _: &CommandCompletedEvent) -> anyhow::Result<()> {
        self.count()
    }
    async fn process_soft_deleted(&mut self, _: &CommandSoftDeletedEvent) -> anyhow::Result<()> {
        self.count()
    }
    async fn process_sent_to_agent(&mut self, _: &EventHeader) -> anyhow::Result<()> {
        self.count()
    }
    async fn process_pending(&mut self, _: &EventHeader) -> anyhow::Result<()> {
        self.count()
    }
    async fn process_failed(&mut self, _: &EventHeader) -> anyhow::Result<()> {
        self.count()
    }
    async fn process_unexpected(&mut self, _: &EventHeader) -> anyhow::Result<()> {
        self.count()
    }
    async fn process_verification_failed(&mut self, _: &EventHeader) -> anyhow::Result<()> {
        self.count()
    }
    async fn process_unexpected_verification_failure(
        &mut self,
        _: &EventHeader,
    ) -> anyhow::Result<()> {
        self.count()
    }
    async fn process_raw_data(&mut self, _: &CommandRawDataEvent) -> anyhow::Result<()> {
        self.count()
    }
    async fn process_dropped(&mut self, _: &CommandDroppedEvent) -> anyhow::Result<()> {
        self.count()
    }
}

#[async_trait]
impl CheckpointProcessor for CountingProcessor {
    fn should_checkpoint(&self) -> bool {
        self.checkpoint_ready
    }

    async fn checkpoint(&mut self) -> anyhow::Result<()> {
        if self.hang_checkpoint {
            std::future::pending::<()>().await;
        }
        if self.fail_checkpoint {
            anyhow::bail!("processor store unavailable");
        }
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn factory(make: impl Fn() -> CountingProcessor + Send + Sync + 'static) -> ProcessorFactory {
    Arc::new(move || Box::new(make()) as Box<dyn CheckpointProcessor>)
}
