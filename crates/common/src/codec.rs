mod bulk;
mod compression;
mod retry_package;
mod split;

pub use bulk::*;
pub use compression::*;
pub use retry_package::*;
pub use split::*;
