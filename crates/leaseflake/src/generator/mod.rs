mod interface;
mod lock;
mod status;

pub use interface::*;
pub use lock::*;
pub use status::*;
