use crate::domain::{CommandId, LifecycleError, LifecycleEvent, LifecycleResult};

/// Events that all belong to one command
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEventBatch {
    command_id: CommandId,
    events: Vec<LifecycleEvent>,
}

impl LifecycleEventBatch {
    pub fn new(command_id: CommandId) -> Self {
        Self {
            command_id,
            events: Vec::new(),
        }
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    pub fn add(&mut self, event: LifecycleEvent) -> LifecycleResult<()> {
        let actual = event.command_id();
        if actual != self.command_id {
            return Err(LifecycleError::CommandIdMismatch {
                expected: self.command_id,
                actual,
            });
        }
        self.events.push(event);
        Ok(())
    }

    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<LifecycleEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
