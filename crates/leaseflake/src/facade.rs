use crate::{
    ClockSync, Error, IdGenerator, LeaseState, Namespace, Options, Result, SlotLeaseCoordinator,
    SnowflakeId, SystemClock, ThreadSleep,
    coordination::{ConnectSettings, Connector, CoordinationClient, Retrying},
    platform_clock_sync,
};
use core::fmt;
use parking_lot::Mutex;
use std::sync::Arc;

/// Builds one leased generator and hands out handles to it.
///
/// A factory is an ordinary value: any number of them can live in one
/// process, each owning at most one lease at a time.
///
/// # Example
/// ```
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// use leaseflake::{Options, SnowflakeFactory, coordination::MemoryCoordinator};
///
/// let factory = SnowflakeFactory::new(MemoryCoordinator::new());
/// let handle = factory
///     .build("127.0.0.1:2181", "orders", Options::default())
///     .await
///     .unwrap();
///
/// let id = handle.next_id();
/// assert_eq!(id.slot(), 0);
/// assert_eq!(handle.current_slot().unwrap(), 0);
///
/// factory.close().await;
/// assert!(factory.get().is_err());
/// # });
/// ```
pub struct SnowflakeFactory<K: Connector> {
    connector: K,
    clock_sync: Option<Arc<dyn ClockSync>>,
    building: tokio::sync::Mutex<()>,
    built: Mutex<Option<SnowflakeHandle<K::Client>>>,
}

impl<K: Connector> SnowflakeFactory<K> {
    /// A factory that opens sessions through `connector`.
    pub fn new(connector: K) -> Self {
        Self {
            connector,
            clock_sync: None,
            building: tokio::sync::Mutex::new(()),
            built: Mutex::new(None),
        }
    }

    /// Replaces the platform clock adjustment used when
    /// [`Options::enable_clock_sync`] is set.
    #[must_use]
    pub fn with_clock_sync(mut self, clock_sync: Arc<dyn ClockSync>) -> Self {
        self.clock_sync = Some(clock_sync);
        self
    }

    /// The connector sessions are opened through.
    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Connects, claims a slot for `app` and starts a generator on it.
    ///
    /// While a handle from an earlier build is live, that handle is returned
    /// and nothing else happens.
    ///
    /// # Errors
    ///
    /// - Configuration errors for a bad application name, epoch or poll
    ///   interval
    /// - [`Error::NamespaceExhausted`] / [`Error::CounterCorruption`] from the
    ///   claim
    /// - [`Error::Coordination`] if connecting fails or retries run out
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "info", skip(self, options), fields(root = %options.root))
    )]
    pub async fn build(
        &self,
        address: &str,
        app: &str,
        options: Options,
    ) -> Result<SnowflakeHandle<K::Client>> {
        let _building = self.building.lock().await;
        let existing = self.built.lock().clone();
        if let Some(handle) = existing {
            return Ok(handle);
        }

        let namespace = Namespace::new(&options.root, app)?;

        let settings = ConnectSettings {
            credential: options.credential.clone(),
            session_timeout: options.session_timeout,
            connection_timeout: options.connection_timeout,
        };
        let client = self.connector.connect(address, &settings).await?;
        let mut coordinator =
            SlotLeaseCoordinator::new(Retrying::new(client, options.retry), namespace)
                .with_retry_policy(options.retry);
        if options.enable_clock_sync {
            let clock_sync = self
                .clock_sync
                .clone()
                .unwrap_or_else(platform_clock_sync);
            coordinator = coordinator.with_clock_sync(clock_sync);
        }

        let handle = match Self::launch(coordinator, &options).await {
            Ok(handle) => handle,
            Err((coordinator, err)) => {
                coordinator.close().await;
                return Err(err);
            }
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            namespace = %handle.namespace().app_path(),
            slot = handle.generator().slot(),
            "Snowflake generator built"
        );

        *self.built.lock() = Some(handle.clone());
        Ok(handle)
    }

    /// Claims, then starts a generator on the claimed slot. On failure the
    /// coordinator is handed back for closing.
    async fn launch(
        coordinator: SlotLeaseCoordinator<Retrying<K::Client>>,
        options: &Options,
    ) -> core::result::Result<
        SnowflakeHandle<K::Client>,
        (SlotLeaseCoordinator<Retrying<K::Client>>, Error),
    > {
        let slot = match coordinator.claim().await {
            Ok(slot) => slot,
            Err(err) => return Err((coordinator, err)),
        };
        let generator = match IdGenerator::new(
            u64::from(slot),
            options.epoch_ms,
            options.clock_rollback_poll_interval,
            SystemClock,
            ThreadSleep,
        ) {
            Ok(generator) => Arc::new(generator),
            Err(err) => return Err((coordinator, err)),
        };
        if let Err(err) = coordinator.start(Arc::clone(&generator)) {
            return Err((coordinator, err));
        }
        Ok(SnowflakeHandle {
            inner: Arc::new(HandleInner {
                generator,
                coordinator,
            }),
        })
    }

    /// The handle of the live build.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotBuilt`] before a successful build or after
    /// [`close`](Self::close).
    pub fn get(&self) -> Result<SnowflakeHandle<K::Client>> {
        self.built.lock().clone().ok_or(Error::NotBuilt)
    }

    /// Tears down the live build, if any. Handles obtained earlier keep
    /// issuing IDs on their last slot, but report [`Error::AlreadyClosed`]
    /// for slot queries.
    pub async fn close(&self) {
        let _building = self.building.lock().await;
        let handle = self.built.lock().take();
        if let Some(handle) = handle {
            handle.close().await;
        }
    }
}

struct HandleInner<C: CoordinationClient> {
    generator: Arc<IdGenerator>,
    coordinator: SlotLeaseCoordinator<Retrying<C>>,
}

/// A built generator together with the lease that backs it.
///
/// Cloning is cheap; clones share the generator and the lease.
pub struct SnowflakeHandle<C: CoordinationClient> {
    inner: Arc<HandleInner<C>>,
}

impl<C: CoordinationClient> Clone for SnowflakeHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: CoordinationClient> fmt::Debug for SnowflakeHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnowflakeHandle")
            .field("namespace", &self.namespace().app_path())
            .field("slot", &self.inner.generator.slot())
            .field("state", &self.lease_state())
            .finish_non_exhaustive()
    }
}

impl<C: CoordinationClient> SnowflakeHandle<C> {
    /// Issues the next ID. Never fails; may block briefly.
    pub fn next_id(&self) -> SnowflakeId {
        self.inner.generator.next_id()
    }

    /// The slot held by the lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyClosed`] once the handle has been closed.
    pub fn current_slot(&self) -> Result<u16> {
        self.inner.coordinator.current_slot()
    }

    /// Wall-clock millisecond of the last issued ID.
    pub fn last_timestamp(&self) -> u64 {
        self.inner.generator.last_timestamp()
    }

    /// Epoch subtracted from every timestamp.
    pub fn epoch_ms(&self) -> u64 {
        self.inner.generator.epoch_ms()
    }

    /// Where the backing lease is in its lifecycle. `Lost` means the
    /// generator is running on a slot it no longer holds.
    pub fn lease_state(&self) -> LeaseState {
        self.inner.coordinator.state()
    }

    /// Coordination paths of the application.
    pub fn namespace(&self) -> &Namespace {
        self.inner.coordinator.namespace()
    }

    /// The shared generator behind this handle.
    pub fn generator(&self) -> &Arc<IdGenerator> {
        &self.inner.generator
    }

    /// Returns `true` if both handles drive the same generator.
    pub fn same_generator(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.generator, &other.inner.generator)
    }

    async fn close(&self) {
        self.inner.coordinator.close().await;
    }
}
