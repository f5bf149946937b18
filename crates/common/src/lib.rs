pub mod backoff;
pub mod codec;
mod domain;
pub mod flags;
pub mod nats;
pub mod priority;
pub mod telemetry;

pub use domain::*;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockPartitionLease;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockPartitionSender;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockPartitionStream;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockRetryQueue;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockStreamEndpoint;
#[cfg(any(test, feature = "testing"))]
pub use flags::MockFeatureFlags;
