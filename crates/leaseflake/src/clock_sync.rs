use crate::ClockSyncError;
use std::sync::Arc;

/// Sets the operating system clock.
///
/// The lease coordinator may call this once, right after its first claim,
/// with the coordination service's creation time of the lease node. Failures
/// are logged and otherwise ignored.
pub trait ClockSync: Send + Sync + 'static {
    fn sync_to(&self, unix_millis: u64) -> Result<(), ClockSyncError>;
}

/// Leaves the clock alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopClockSync;

impl ClockSync for NoopClockSync {
    fn sync_to(&self, _unix_millis: u64) -> Result<(), ClockSyncError> {
        Ok(())
    }
}

/// Runs `sudo date -s @<seconds>`.
///
/// Requires GNU `date` and a sudoers entry that allows it without a password.
#[cfg(unix)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDateClockSync;

#[cfg(unix)]
impl ClockSync for SystemDateClockSync {
    fn sync_to(&self, unix_millis: u64) -> Result<(), ClockSyncError> {
        let target = format!("@{}.{:03}", unix_millis / 1000, unix_millis % 1000);
        let command = format!("sudo date -s {target}");
        let status = std::process::Command::new("sudo")
            .args(["date", "-s", &target])
            .stdout(std::process::Stdio::null())
            .status()
            .map_err(|e| ClockSyncError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(ClockSyncError::Failed {
                command,
                status: status.to_string(),
            })
        }
    }
}

#[cfg(not(unix))]
#[derive(Clone, Copy, Debug, Default)]
struct UnsupportedClockSync;

#[cfg(not(unix))]
impl ClockSync for UnsupportedClockSync {
    fn sync_to(&self, _unix_millis: u64) -> Result<(), ClockSyncError> {
        Err(ClockSyncError::Unsupported)
    }
}

/// The clock adjustment used when clock sync is enabled and nothing else was
/// configured.
pub fn platform_clock_sync() -> Arc<dyn ClockSync> {
    #[cfg(unix)]
    {
        Arc::new(SystemDateClockSync)
    }
    #[cfg(not(unix))]
    {
        Arc::new(UnsupportedClockSync)
    }
}
