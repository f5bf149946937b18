mod config;
mod partition;
mod queue_worker;
mod receiver;
mod retry_queue_handler;
mod sink;

#[cfg(test)]
mod test_support;

pub use config::*;
pub use partition::*;
pub use queue_worker::*;
pub use receiver::*;
pub use retry_queue_handler::*;
pub use sink::*;
