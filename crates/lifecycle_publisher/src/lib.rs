mod config;
mod publisher;
mod raw_command;

pub use config::*;
pub use publisher::*;
pub use raw_command::*;
