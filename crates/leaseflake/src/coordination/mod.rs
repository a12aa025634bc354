//! The directory-service interface the lease protocol runs against.
//!
//! Any ZooKeeper/etcd-class service fits: it needs path existence checks with
//! creation time, payload reads and writes, child listing, persistent and
//! ephemeral nodes, an atomic multi-operation transaction, and change
//! subscriptions on a subtree.
//!
//! [`Retrying`] layers exponential backoff over any client, and
//! [`MemoryCoordinator`] is a complete in-process service used by tests and
//! single-process deployments.

mod error;
mod interface;
mod memory;
mod retry;

pub use error::*;
pub use interface::*;
pub use memory::*;
pub use retry::*;
