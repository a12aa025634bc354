//! Error types for ID generation and slot leasing.
//!
//! [`Error`] is what callers of this crate see. Coordination-service failures
//! are carried as [`CoordinationError`], which distinguishes transient faults
//! (retried with backoff by [`Retrying`]) from permanent ones.
//!
//! ## Error Cases
//! - Configuration (`SlotOutOfRange`, `EpochOutOfRange`,
//!   `InvalidPollInterval`, `InvalidApplicationName`): fatal, raised at
//!   construction.
//! - `NotBuilt` / `AlreadyClosed`: accessor used outside a live build.
//! - `NamespaceExhausted`: every slot of the application is held.
//! - `CounterCorruption`: the persisted last-assigned slot is out of range.
//! - `Coordination`: the directory service failed and retries did not help.
//! - `ClockSync`: the optional OS clock adjustment failed. Only ever logged.
//!
//! [`Retrying`]: crate::coordination::Retrying

use crate::coordination::CoordinationError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for the crate.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The requested node slot does not fit in 10 bits.
    #[error("slot {slot} is out of range (0..={max})")]
    SlotOutOfRange { slot: u64, max: u16 },

    /// The epoch lies in the future, or so far in the past that the current
    /// time no longer fits in 41 bits.
    #[error("epoch {epoch_ms} is out of range for current time {now_ms}")]
    EpochOutOfRange { epoch_ms: u64, now_ms: u64 },

    /// The clock-rollback poll interval must be non-zero.
    #[error("clock rollback poll interval must be non-zero")]
    InvalidPollInterval,

    /// Application names become a single path segment.
    #[error("invalid application name {name:?}")]
    InvalidApplicationName { name: String },

    /// A factory accessor was used before `build` or after `close`.
    #[error("snowflake must be built first")]
    NotBuilt,

    /// The lease coordinator has been closed.
    #[error("lease coordinator already closed")]
    AlreadyClosed,

    /// All slots of the namespace are held by live processes.
    #[error("namespace {namespace} is full, the max node amount is {capacity}")]
    NamespaceExhausted { namespace: String, capacity: u16 },

    /// The last-assigned-slot counter holds a value outside the slot range.
    #[error("lease counter at {path} is corrupt: {payload:?}")]
    CounterCorruption { path: String, payload: String },

    /// The coordination service failed.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// The optional OS clock adjustment failed.
    #[error("clock sync error: {0}")]
    ClockSync(#[from] ClockSyncError),
}

impl Error {
    /// Returns `true` for the configuration family of errors.
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::SlotOutOfRange { .. }
                | Self::EpochOutOfRange { .. }
                | Self::InvalidPollInterval
                | Self::InvalidApplicationName { .. }
        )
    }

    /// Returns `true` if retrying the same operation cannot succeed without
    /// operator intervention.
    pub const fn is_fatal(&self) -> bool {
        self.is_configuration()
            || matches!(
                self,
                Self::NamespaceExhausted { .. } | Self::CounterCorruption { .. }
            )
    }
}

/// Failure to adjust the operating system clock.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClockSyncError {
    /// No clock adjustment is available on this platform.
    #[error("clock sync is not supported on this platform")]
    Unsupported,

    /// The adjustment command could not be started.
    #[error("failed to run {command}: {reason}")]
    Spawn { command: String, reason: String },

    /// The adjustment command ran but reported failure.
    #[error("{command} exited with {status}")]
    Failed { command: String, status: String },
}
