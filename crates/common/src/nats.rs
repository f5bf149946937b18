mod client;
mod headers;
mod lease;
mod retry_queue;
mod stream;

pub use client::*;
pub use headers::*;
pub use lease::*;
pub use retry_queue::*;
pub use stream::*;
