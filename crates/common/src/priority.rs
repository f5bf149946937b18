use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Priority {
    #[default]
    High,
    Background,
}

/// Admission control shared by every partition in the process.
///
/// All work draws from one pool. Background work must first win a slot in a
/// smaller pool, so it can never hold more than `background_permits` of the
/// shared permits at once.
#[derive(Clone)]
pub struct PrioritySemaphore {
    shared: Arc<Semaphore>,
    background: Arc<Semaphore>,
}

/// Held for the duration of one unit of work; dropping it releases the slot
#[derive(Debug)]
pub struct PriorityPermit {
    _shared: OwnedSemaphorePermit,
    _background: Option<OwnedSemaphorePermit>,
}

impl PrioritySemaphore {
    pub fn new(total_permits: usize, background_permits: usize) -> Self {
        Self {
            shared: Arc::new(Semaphore::new(total_permits)),
            background: Arc::new(Semaphore::new(background_permits.min(total_permits))),
        }
    }

    pub async fn acquire(&self, priority: Priority) -> Result<PriorityPermit> {
        let background = match priority {
            Priority::High => None,
            Priority::Background => Some(
                self.background
                    .clone()
                    .acquire_owned()
                    .await
                    .context("Background semaphore closed")?,
            ),
        };

        let shared = self
            .shared
            .clone()
            .acquire_owned()
            .await
            .context("Priority semaphore closed")?;

        Ok(PriorityPermit {
            _shared: shared,
            _background: background,
        })
    }

    pub fn available_permits(&self) -> usize {
        self.shared.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_background_is_capped_by_its_own_pool() {
        let semaphore = PrioritySemaphore::new(4, 1);

        let _first = semaphore.acquire(Priority::Background).await.unwrap();
        let second = tokio::time::timeout(
            Duration::from_millis(50),
            semaphore.acquire(Priority::Background),
        )
        .await;

        assert!(second.is_err(), "second background permit should wait");
        assert_eq!(semaphore.available_permits(), 3);
    }

    #[tokio::test]
    async fn test_high_priority_proceeds_while_background_is_saturated() {
        let semaphore = PrioritySemaphore::new(2, 1);
        let _background = semaphore.acquire(Priority::Background).await.unwrap();

        let high = tokio::time::timeout(
            Duration::from_millis(50),
            semaphore.acquire(Priority::High),
        )
        .await;

        assert!(high.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_permit_releases_slot() {
        let semaphore = PrioritySemaphore::new(1, 1);

        let permit = semaphore.acquire(Priority::High).await.unwrap();
        assert_eq!(semaphore.available_permits(), 0);
        drop(permit);

        assert_eq!(semaphore.available_permits(), 1);
    }
}
