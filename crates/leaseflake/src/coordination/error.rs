/// Failures reported by a coordination service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoordinationError {
    /// The connection dropped before the operation completed.
    #[error("connection lost")]
    ConnectionLoss,

    /// The service did not answer in time.
    #[error("operation timed out")]
    Timeout,

    /// A conditional write lost against a concurrent writer.
    #[error("transaction conflict at {path}")]
    TransactionConflict { path: String },

    /// The path does not exist.
    #[error("no node at {path}")]
    NoNode { path: String },

    /// The path already exists.
    #[error("node already exists at {path}")]
    NodeExists { path: String },

    /// The node still has children.
    #[error("node at {path} is not empty")]
    NotEmpty { path: String },

    /// Ephemeral nodes cannot have children.
    #[error("ephemeral node at {path} cannot have children")]
    NoChildrenForEphemerals { path: String },

    /// The session is not authorized for the node.
    #[error("not authorized for {path}")]
    NoAuth { path: String },

    /// The session has ended; no further calls are possible.
    #[error("session closed")]
    SessionClosed,

    /// A transient failure persisted through every allowed retry.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last: Box<CoordinationError>,
    },
}

impl CoordinationError {
    /// Returns `true` for failures worth retrying with backoff.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLoss | Self::Timeout | Self::TransactionConflict { .. }
        )
    }
}
