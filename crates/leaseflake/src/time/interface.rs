use core::time::Duration;

/// Unix epoch: Thursday, January 1, 1970 00:00:00 UTC. The default.
pub const UNIX_EPOCH_MS: u64 = 0;

/// Twitter epoch: Thursday, November 4, 2010 1:42:54.657 UTC
pub const TWITTER_EPOCH_MS: u64 = 1_288_834_974_657;

/// Discord epoch: Thursday, January 1, 2015 00:00:00 UTC
pub const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Custom epoch: Wednesday, January 1, 2025 00:00:00 UTC
pub const CUSTOM_EPOCH_MS: u64 = 1_735_689_600_000;

/// A source of wall-clock time in milliseconds since the Unix epoch.
///
/// Unlike a monotonic timer, implementations are allowed to go backward; the
/// generator detects that and waits it out. Tests plug in scripted clocks to
/// simulate rollbacks deterministically.
///
/// # Example
///
/// ```
/// use leaseflake::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn current_millis(&self) -> u64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.current_millis(), 1234);
/// ```
pub trait TimeSource {
    /// Returns the current time in milliseconds since 1970-01-01 UTC.
    fn current_millis(&self) -> u64;
}

impl<T: TimeSource + ?Sized> TimeSource for &T {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}

/// Abstracts how the generator pauses between clock polls while it waits out
/// a clock rollback.
pub trait SleepProvider {
    /// Pauses the calling thread for roughly `dur`. Returning early is
    /// allowed; the caller re-reads the clock either way.
    fn sleep_for(&self, dur: Duration);
}

/// Blocks the calling thread with [`std::thread::sleep`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleep;

impl SleepProvider for ThreadSleep {
    fn sleep_for(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// Spins instead of sleeping.
///
/// Useful with a scripted [`TimeSource`] where real delays would only slow a
/// test down.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpinSleep;

impl SleepProvider for SpinSleep {
    fn sleep_for(&self, _dur: Duration) {
        core::hint::spin_loop();
    }
}
