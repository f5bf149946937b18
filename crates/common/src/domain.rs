mod batch;
mod command;
mod envelope;
mod events;
mod factory;
mod ids;
mod processor;
mod result;
mod transport;

pub use batch::*;
pub use command::*;
pub use envelope::*;
pub use events::*;
pub use factory::*;
pub use ids::*;
pub use processor::*;
pub use result::*;
pub use transport::*;
