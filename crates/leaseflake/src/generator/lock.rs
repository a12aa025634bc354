use core::{cmp::Ordering, time::Duration};
use parking_lot::Mutex;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    DEFAULT_CLOCK_ROLLBACK_POLL_INTERVAL, Error, MAX_SEQUENCE, MAX_SLOT, Poll, Result, SleepProvider,
    SlotSwap, SnowflakeId, SystemClock, ThreadSleep, TimeSource,
};

/// Mutable generation state, owned by one [`IdGenerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorState {
    /// Node slot encoded into new IDs.
    pub slot: u16,
    /// Sequence of the last issued ID within `last_timestamp`.
    pub sequence: u16,
    /// Wall-clock millisecond (since the Unix epoch) of the last issued ID.
    pub last_timestamp: u64,
}

/// A lock-based Snowflake ID generator for one leased node slot.
///
/// All generation state lives behind a single [`Mutex`], so concurrent callers
/// are serialized and no two calls ever observe the same
/// `(last_timestamp, sequence)` pair. The slot can be swapped through
/// [`SlotSwap`] under the same lock while IDs keep flowing.
///
/// ## Features
/// - ✅ Thread-safe
/// - ✅ Never issues an ID from a timestamp at or before the last one, even
///   when the wall clock steps backward
/// - ✅ Injectable [`TimeSource`] and [`SleepProvider`] for deterministic tests
///
/// ## Blocking
/// [`IdGenerator::next_id`] blocks the calling thread while the current
/// millisecond's 4096 sequence values are exhausted (spinning until the clock
/// ticks) or while the clock reads behind the last issued timestamp (polling
/// every `poll_interval`). It performs no I/O.
pub struct IdGenerator<T = SystemClock, S = ThreadSleep>
where
    T: TimeSource,
    S: SleepProvider,
{
    state: Mutex<GeneratorState>,
    epoch_ms: u64,
    poll_interval: Duration,
    time: T,
    sleep: S,
}

impl IdGenerator {
    /// Creates a generator on the system wall clock with the default 1 ms
    /// rollback poll interval.
    ///
    /// # Errors
    ///
    /// - [`Error::SlotOutOfRange`] if `slot > 1023`
    /// - [`Error::EpochOutOfRange`] if `epoch_ms` is in the future or more than
    ///   41 bits of milliseconds in the past
    ///
    /// # Example
    /// ```
    /// use leaseflake::{IdGenerator, TWITTER_EPOCH_MS};
    ///
    /// let generator = IdGenerator::system(7, TWITTER_EPOCH_MS).unwrap();
    /// let a = generator.next_id();
    /// let b = generator.next_id();
    /// assert!(a < b);
    /// assert_eq!(b.slot(), 7);
    /// ```
    pub fn system(slot: u64, epoch_ms: u64) -> Result<Self> {
        Self::new(
            slot,
            epoch_ms,
            DEFAULT_CLOCK_ROLLBACK_POLL_INTERVAL,
            SystemClock,
            ThreadSleep,
        )
    }
}

impl<T, S> IdGenerator<T, S>
where
    T: TimeSource,
    S: SleepProvider,
{
    /// Creates a new [`IdGenerator`] with zeroed sequence and timestamp.
    ///
    /// # Parameters
    ///
    /// - `slot`: the node slot (0..=1023) encoded into every ID.
    /// - `epoch_ms`: reference instant subtracted from the clock before
    ///   packing, in milliseconds since the Unix epoch.
    /// - `poll_interval`: pause between clock reads while a rollback is
    ///   being waited out.
    /// - `time`: the clock.
    /// - `sleep`: how to pause between polls.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the slot, epoch or poll interval is
    /// out of range.
    pub fn new(
        slot: u64,
        epoch_ms: u64,
        poll_interval: Duration,
        time: T,
        sleep: S,
    ) -> Result<Self> {
        Self::from_components(0, slot, 0, epoch_ms, poll_interval, time, sleep)
    }

    /// Creates a generator preloaded with explicit state.
    ///
    /// Primarily useful for tests and for resuming from a known
    /// `last_timestamp`. Prefer [`Self::new`] otherwise.
    ///
    /// # Errors
    ///
    /// Same as [`Self::new`]; additionally the sequence is truncated to 12
    /// bits.
    pub fn from_components(
        last_timestamp: u64,
        slot: u64,
        sequence: u16,
        epoch_ms: u64,
        poll_interval: Duration,
        time: T,
        sleep: S,
    ) -> Result<Self> {
        let slot = validate_slot(slot)?;
        if poll_interval.is_zero() {
            return Err(Error::InvalidPollInterval);
        }
        let now_ms = time.current_millis();
        match now_ms.checked_sub(epoch_ms) {
            Some(delta) if delta <= SnowflakeId::TIMESTAMP_MASK => {}
            _ => return Err(Error::EpochOutOfRange { epoch_ms, now_ms }),
        }

        Ok(Self {
            state: Mutex::new(GeneratorState {
                slot,
                sequence: sequence & MAX_SEQUENCE,
                last_timestamp,
            }),
            epoch_ms,
            poll_interval,
            time,
            sleep,
        })
    }

    /// Generates the next ID, blocking until one can be issued.
    ///
    /// - Same millisecond as the last ID: the sequence is incremented. If it
    ///   wraps, the call spins until the clock moves to a later millisecond.
    /// - Later millisecond: the sequence resets to zero.
    /// - Earlier millisecond (clock rollback): nothing is issued until the
    ///   clock reads past the last issued timestamp; the sequence then resets
    ///   to zero.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub fn next_id(&self) -> SnowflakeId {
        let mut state = self.state.lock();
        let mut now = self.time.current_millis();

        match now.cmp(&state.last_timestamp) {
            Ordering::Equal => {
                state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
                if state.sequence == 0 {
                    now = self.wait_for_next_millis(state.last_timestamp);
                }
            }
            Ordering::Greater => state.sequence = 0,
            Ordering::Less => {
                now = self.cold_clock_behind(now, state.last_timestamp);
                state.sequence = 0;
            }
        }

        state.last_timestamp = now;
        self.pack(&state)
    }

    /// Attempts to generate the next ID without waiting.
    ///
    /// Returns [`Poll::Pending`] (leaving the state untouched) in exactly the
    /// situations where [`Self::next_id`] would block.
    ///
    /// # Example
    /// ```
    /// use leaseflake::{IdGenerator, Poll};
    ///
    /// let generator = IdGenerator::system(0, 0).unwrap();
    /// let id = loop {
    ///     match generator.poll_id() {
    ///         Poll::Ready { id } => break id,
    ///         Poll::Pending { .. } => std::thread::yield_now(),
    ///     }
    /// };
    /// assert_eq!(id.slot(), 0);
    /// ```
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub fn poll_id(&self) -> Poll {
        let mut state = self.state.lock();
        let now = self.time.current_millis();

        match now.cmp(&state.last_timestamp) {
            Ordering::Equal if state.sequence < MAX_SEQUENCE => {
                state.sequence += 1;
                Poll::Ready {
                    id: self.pack(&state),
                }
            }
            Ordering::Greater => {
                state.sequence = 0;
                state.last_timestamp = now;
                Poll::Ready {
                    id: self.pack(&state),
                }
            }
            Ordering::Equal | Ordering::Less => Poll::Pending {
                yield_until: state.last_timestamp + 1,
            },
        }
    }

    /// Returns the configured epoch in milliseconds since the Unix epoch.
    pub const fn epoch_ms(&self) -> u64 {
        self.epoch_ms
    }

    /// Returns the pause between clock reads during rollback recovery.
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Returns the slot currently encoded into new IDs.
    pub fn slot(&self) -> u16 {
        self.state.lock().slot
    }

    /// Returns the wall-clock millisecond of the last issued ID, or `0` if
    /// none has been issued.
    pub fn last_timestamp(&self) -> u64 {
        self.state.lock().last_timestamp
    }

    /// Returns a consistent snapshot of the generation state.
    pub fn state(&self) -> GeneratorState {
        *self.state.lock()
    }

    /// Replaces the node slot. Takes effect for the next ID; sequence and
    /// timestamp are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotOutOfRange`] if `slot > 1023`.
    pub fn set_slot(&self, slot: u16) -> Result<()> {
        let slot = validate_slot(u64::from(slot))?;
        self.state.lock().slot = slot;
        Ok(())
    }

    fn pack(&self, state: &GeneratorState) -> SnowflakeId {
        SnowflakeId::from_parts(
            state.last_timestamp.saturating_sub(self.epoch_ms),
            u64::from(state.slot),
            u64::from(state.sequence),
        )
    }

    /// Spins until the clock leaves `last`. A reading behind `last` is
    /// handed to the rollback path.
    fn wait_for_next_millis(&self, last: u64) -> u64 {
        loop {
            let now = self.time.current_millis();
            match now.cmp(&last) {
                Ordering::Greater => return now,
                Ordering::Equal => core::hint::spin_loop(),
                Ordering::Less => return self.cold_clock_behind(now, last),
            }
        }
    }

    #[cold]
    #[inline(never)]
    fn cold_clock_behind(&self, _now: u64, last: u64) -> u64 {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            behind_ms = last - _now,
            "Clock moved backwards, waiting until it passes {last}"
        );

        loop {
            self.sleep.sleep_for(self.poll_interval);
            let now = self.time.current_millis();
            if now > last {
                return now;
            }
        }
    }
}

impl<T, S> SlotSwap for IdGenerator<T, S>
where
    T: TimeSource + Send + Sync,
    S: SleepProvider + Send + Sync,
{
    fn set_slot(&self, slot: u16) -> Result<()> {
        self.set_slot(slot)
    }

    fn slot(&self) -> u16 {
        self.slot()
    }
}

fn validate_slot(slot: u64) -> Result<u16> {
    if slot > u64::from(MAX_SLOT) {
        return Err(Error::SlotOutOfRange { slot, max: MAX_SLOT });
    }
    Ok(slot as u16)
}
