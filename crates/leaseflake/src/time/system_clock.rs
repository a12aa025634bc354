use crate::TimeSource;
use std::time::{SystemTime, UNIX_EPOCH};

/// The operating system's wall clock.
///
/// This clock follows NTP corrections, including backward steps. The
/// generator is responsible for never issuing an ID from a timestamp it has
/// already moved past.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn current_millis(&self) -> u64 {
        // A clock set before 1970 reads as 0 and is waited out like any other
        // rollback.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}
