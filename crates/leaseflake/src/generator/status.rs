use crate::SnowflakeId;

/// What [`IdGenerator::poll_id`] saw, for callers that must not block.
///
/// [`IdGenerator::next_id`] parks the thread in two situations: all 4096
/// sequence numbers of the current millisecond are spent, or the wall clock
/// reads earlier than the last issued timestamp. `poll_id` reports either
/// situation as `Pending` and leaves the generator untouched, so the caller
/// chooses how to wait (yield to an executor, spin, shed load).
///
/// [`IdGenerator::poll_id`]: crate::IdGenerator::poll_id
/// [`IdGenerator::next_id`]: crate::IdGenerator::next_id
///
/// # Example
///
/// ```
/// use leaseflake::{IdGenerator, Poll, SpinSleep, TimeSource};
/// use core::time::Duration;
///
/// // A clock stuck at millisecond 1.
/// struct Frozen;
/// impl TimeSource for Frozen {
///     fn current_millis(&self) -> u64 {
///         1
///     }
/// }
///
/// // Millisecond 1 has already used its last sequence number.
/// let generator =
///     IdGenerator::from_components(1, 1, 4095, 0, Duration::from_millis(1), Frozen, SpinSleep)
///         .unwrap();
/// assert_eq!(generator.poll_id(), Poll::Pending { yield_until: 2 });
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// The state advanced and `id` is issued.
    Ready { id: SnowflakeId },
    /// Issuing now would repeat or go back in time.
    Pending {
        /// First wall-clock millisecond (Unix epoch based) at which a retry
        /// can succeed.
        yield_until: u64,
    },
}
