//! Configuration constants and options for building a leased generator.
//!
//! ## Key Concepts
//! - **Namespace**: every application gets `<root>/<app>` under the
//!   coordination root. Its payload is the last slot handed out.
//! - **Lease**: `<root>/<app>/<slot>` is an ephemeral node that exists for as
//!   long as the owning session is alive.
//! - **Credential**: when configured, the session authenticates with it and
//!   every node it creates is restricted to it.

use crate::{Error, Result, coordination::Credential};
use core::time::Duration;

/// Root path under which all application namespaces live.
pub const DEFAULT_ROOT: &str = "/snowflake";

/// Pause between clock reads while a clock rollback is waited out.
pub const DEFAULT_CLOCK_ROLLBACK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Session timeout requested from the coordination service.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection timeout requested from the coordination service.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Backoff before the first retry of a transient coordination failure.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

/// Upper bound on a single retry backoff.
pub const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(30);

/// Retry schedule for transient coordination failures.
///
/// Backoff doubles from `base` up to `cap`. `max_retries = None` retries
/// forever, which blocks startup until the service is reachable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backoff before the first retry.
    pub base: Duration,
    /// Upper bound on any single backoff.
    pub cap: Duration,
    /// Retries after the first attempt; `None` is unbounded.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RETRY_BASE,
            cap: DEFAULT_RETRY_CAP,
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Gives up after `max_retries` retries.
    pub const fn bounded(base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            base,
            cap,
            max_retries: Some(max_retries),
        }
    }

    /// Never retries.
    pub const fn none() -> Self {
        Self {
            base: Duration::ZERO,
            cap: Duration::ZERO,
            max_retries: Some(0),
        }
    }

    /// Backoff before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Returns `true` if another retry is allowed after `attempts` retries.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_retries.is_none_or(|max| attempts < max)
    }
}

/// Options recognized by [`SnowflakeFactory::build`].
///
/// [`SnowflakeFactory::build`]: crate::SnowflakeFactory::build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Authenticate the session and lock created nodes to this credential.
    pub credential: Option<Credential>,
    /// Reference instant subtracted from every timestamp, in milliseconds
    /// since the Unix epoch.
    pub epoch_ms: u64,
    /// Pause between clock reads while waiting out a clock rollback.
    pub clock_rollback_poll_interval: Duration,
    /// Set the OS clock to the first lease's creation time. Needs
    /// privileges; off by default.
    pub enable_clock_sync: bool,
    /// Parent path shared by every application.
    pub root: String,
    /// Backoff for coordination calls, and for re-claims after a lost lease.
    /// Re-claims ignore `max_retries`.
    pub retry: RetryPolicy,
    pub session_timeout: Duration,
    pub connection_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            credential: None,
            epoch_ms: 0,
            clock_rollback_poll_interval: DEFAULT_CLOCK_ROLLBACK_POLL_INTERVAL,
            enable_clock_sync: false,
            root: DEFAULT_ROOT.to_owned(),
            retry: RetryPolicy::default(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }
}

impl Options {
    /// Authenticate with `credential`.
    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    #[must_use]
    pub const fn with_epoch_ms(mut self, epoch_ms: u64) -> Self {
        self.epoch_ms = epoch_ms;
        self
    }

    #[must_use]
    pub const fn with_clock_rollback_poll_interval(mut self, interval: Duration) -> Self {
        self.clock_rollback_poll_interval = interval;
        self
    }

    /// Opt in to setting the OS clock from the first lease.
    #[must_use]
    pub const fn with_clock_sync(mut self, enable: bool) -> Self {
        self.enable_clock_sync = enable;
        self
    }

    #[must_use]
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Replace the backoff schedule for coordination calls and re-claims.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

/// Coordination paths for one application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    root: String,
    app: String,
}

impl Namespace {
    /// Builds the namespace for `app` under `root`.
    ///
    /// The application name may carry one leading `/`; anything else that
    /// would not form a single path segment is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidApplicationName`] for empty names, names with
    /// inner `/`, and `.`/`..`.
    ///
    /// # Example
    /// ```
    /// use leaseflake::Namespace;
    ///
    /// let ns = Namespace::new("/snowflake", "/orders").unwrap();
    /// assert_eq!(ns.app_path(), "/snowflake/orders");
    /// assert_eq!(ns.slot_path(7), "/snowflake/orders/7");
    /// ```
    pub fn new(root: &str, app: &str) -> Result<Self> {
        let name = app.strip_prefix('/').unwrap_or(app);
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(Error::InvalidApplicationName {
                name: app.to_owned(),
            });
        }
        let root = root.trim_end_matches('/');
        let root = if root.is_empty() || root.starts_with('/') {
            root.to_owned()
        } else {
            format!("/{root}")
        };
        Ok(Self {
            root,
            app: name.to_owned(),
        })
    }

    /// The persistent root shared by all applications. Empty when the
    /// namespace sits directly under `/`.
    pub fn root_path(&self) -> &str {
        &self.root
    }

    /// The application's persistent namespace, which also holds the lease
    /// counter.
    pub fn app_path(&self) -> String {
        format!("{}/{}", self.root, self.app)
    }

    /// The ephemeral lease node for `slot`.
    pub fn slot_path(&self, slot: u16) -> String {
        format!("{}/{}/{slot}", self.root, self.app)
    }

    /// The application name without the leading `/`.
    pub fn app(&self) -> &str {
        &self.app
    }
}
