use crate::{
    ClockSync, Error, Namespace, Result, RetryPolicy, SLOT_CAPACITY, SlotSwap,
    coordination::{CoordinationClient, CoordinationError, CreateMode, Op, Watch, WatchId},
    lease::{find_free_slot, occupied_slots, parse_counter},
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a slot lease.
///
/// `Unclaimed → Claiming → Held → (Lost → Claiming)* → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseState {
    Unclaimed,
    Claiming,
    Held,
    /// The lease node expired or was replaced. The generator keeps its last
    /// slot until a re-claim succeeds.
    Lost,
    Closed,
}

#[derive(Debug)]
struct Lease {
    state: LeaseState,
    slot: Option<u16>,
    ctime: u64,
    watch_id: Option<WatchId>,
    /// Subscription installed by the first claim, waiting for [`start`].
    ///
    /// [`start`]: SlotLeaseCoordinator::start
    pending: Option<Watch>,
    clock_synced: bool,
}

/// A freshly committed lease.
struct Acquired {
    slot: u16,
    ctime: u64,
    watch: Watch,
}

struct Inner<C> {
    client: C,
    namespace: Namespace,
    lease: Mutex<Lease>,
}

/// Leases one node slot of an application namespace and keeps it leased.
///
/// [`claim`](Self::claim) picks a free slot and commits it in one
/// transaction: the namespace's counter is set to the slot and an ephemeral
/// lease node is created for it. [`start`](Self::start) then hands the
/// lease's change notifications to a background task. When the lease node's
/// creation time no longer matches the one recorded at claim time, the task
/// claims a fresh slot and swaps it into the generator.
///
/// The end of the subscription means the session expired and took the lease
/// node with it. The task then reconnects through the client and claims
/// again. Failed re-claims are retried with backoff until one succeeds, the
/// coordinator closes, or the failure is fatal (a full namespace or a corrupt
/// counter). Until then the generator keeps its last slot.
///
/// Two processes that scan the same free slot concurrently both try to create
/// the same lease node. The service rejects the second create, and the loser
/// rescans. A slot is therefore never held twice, but the counter may briefly
/// point at a slot the writer did not end up holding.
pub struct SlotLeaseCoordinator<C: CoordinationClient> {
    inner: Arc<Inner<C>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    clock_sync: Option<Arc<dyn ClockSync>>,
    retry: RetryPolicy,
}

impl<C: CoordinationClient> SlotLeaseCoordinator<C> {
    /// A coordinator for `namespace` that talks through `client`. Nothing is
    /// sent until [`claim`](Self::claim).
    pub fn new(client: C, namespace: Namespace) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                namespace,
                lease: Mutex::new(Lease {
                    state: LeaseState::Unclaimed,
                    slot: None,
                    ctime: 0,
                    watch_id: None,
                    pending: None,
                    clock_synced: false,
                }),
            }),
            task: Mutex::new(None),
            shutdown: CancellationToken::new(),
            clock_sync: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Backoff between failed re-claims. Only the delays are used: re-claims
    /// go on until one succeeds or fails fatally, whatever `max_retries`
    /// says.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the OS clock to the lease node's creation time after the first
    /// successful claim. Attempted once; failures are only logged.
    #[must_use]
    pub fn with_clock_sync(mut self, clock_sync: Arc<dyn ClockSync>) -> Self {
        self.clock_sync = Some(clock_sync);
        self
    }

    /// Where the leases live.
    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    /// The coordination client, shared with the background task.
    pub fn client(&self) -> &C {
        &self.inner.client
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LeaseState {
        self.inner.lease.lock().state
    }

    /// The held slot.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyClosed`] after [`close`](Self::close)
    /// - [`Error::NotBuilt`] before the first successful claim
    pub fn current_slot(&self) -> Result<u16> {
        let lease = self.inner.lease.lock();
        if lease.state == LeaseState::Closed {
            return Err(Error::AlreadyClosed);
        }
        lease.slot.ok_or(Error::NotBuilt)
    }

    /// Creation time of the current lease node, as reported by the service.
    pub fn lease_ctime(&self) -> u64 {
        self.inner.lease.lock().ctime
    }

    /// Creates the namespace if needed and claims a slot.
    ///
    /// Transient coordination failures are the client's to retry; this call
    /// blocks for as long as the client does.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyClosed`] after [`close`](Self::close)
    /// - [`Error::NamespaceExhausted`] if all 1024 slots are held
    /// - [`Error::CounterCorruption`] if the counter is out of range
    /// - [`Error::Coordination`] for service failures
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self), fields(namespace = %self.inner.namespace.app_path()))
    )]
    pub async fn claim(&self) -> Result<u16> {
        {
            let mut lease = self.inner.lease.lock();
            match lease.state {
                LeaseState::Closed => return Err(Error::AlreadyClosed),
                LeaseState::Held => {
                    if let Some(slot) = lease.slot {
                        return Ok(slot);
                    }
                }
                _ => {}
            }
            lease.state = LeaseState::Claiming;
        }

        let acquired = match self.inner.establish().await {
            Ok(acquired) => acquired,
            Err(err) => {
                let mut lease = self.inner.lease.lock();
                if lease.state == LeaseState::Claiming {
                    lease.state = LeaseState::Unclaimed;
                }
                return Err(err);
            }
        };

        let Acquired { slot, ctime, watch } = acquired;
        let sync_clock = {
            let mut lease = self.inner.lease.lock();
            if lease.state == LeaseState::Closed {
                return Err(Error::AlreadyClosed);
            }
            lease.state = LeaseState::Held;
            lease.slot = Some(slot);
            lease.ctime = ctime;
            lease.watch_id = Some(watch.id());
            lease.pending = Some(watch);
            !core::mem::replace(&mut lease.clock_synced, true)
        };

        #[cfg(feature = "tracing")]
        tracing::info!(slot, ctime, "Claimed slot {slot}");

        if sync_clock {
            self.sync_clock(ctime);
        }
        Ok(slot)
    }

    /// Spawns the task that watches the lease and re-claims on loss, swapping
    /// the new slot into `generator`. Must be called from a tokio runtime
    /// after a successful [`claim`](Self::claim).
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyClosed`] after [`close`](Self::close)
    /// - [`Error::NotBuilt`] without a held lease, or if already started
    pub fn start<G>(&self, generator: G) -> Result<()>
    where
        G: SlotSwap + 'static,
    {
        let watch = {
            let mut lease = self.inner.lease.lock();
            if lease.state == LeaseState::Closed {
                return Err(Error::AlreadyClosed);
            }
            lease.pending.take().ok_or(Error::NotBuilt)?
        };

        let task = tokio::spawn(watch_lease(
            Arc::clone(&self.inner),
            watch,
            generator,
            self.retry,
            self.shutdown.clone(),
        ));
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Stops the background task, cancels the watch and closes the
    /// coordination session. Idempotent.
    pub async fn close(&self) {
        let watch_id = {
            let mut lease = self.inner.lease.lock();
            if lease.state == LeaseState::Closed {
                return;
            }
            lease.state = LeaseState::Closed;
            lease.pending = None;
            lease.watch_id.take()
        };

        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        if let Some(id) = watch_id {
            if let Err(_e) = self.inner.client.unwatch(id).await {
                #[cfg(feature = "tracing")]
                tracing::debug!("Failed to cancel lease watch: {_e}");
            }
        }
        self.inner.client.close().await;

        #[cfg(feature = "tracing")]
        tracing::info!(namespace = %self.inner.namespace.app_path(), "Lease coordinator closed");
    }

    fn sync_clock(&self, ctime: u64) {
        let Some(clock_sync) = &self.clock_sync else {
            return;
        };
        match clock_sync.sync_to(ctime) {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::info!(ctime, "Synchronized system clock to lease creation time");
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Clock sync failed: {_e}");
            }
        }
    }
}

impl<C: CoordinationClient> Drop for SlotLeaseCoordinator<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<C: CoordinationClient> Inner<C> {
    /// Reconnects if the session expired, then bootstraps the namespace and
    /// claims a slot.
    async fn establish(&self) -> Result<Acquired> {
        self.client.reconnect().await?;
        self.ensure_namespace().await?;
        self.acquire().await
    }

    async fn ensure_namespace(&self) -> Result<()> {
        let root = self.namespace.root_path();
        if !root.is_empty() {
            self.ensure_persistent(root).await?;
        }
        self.ensure_persistent(&self.namespace.app_path()).await
    }

    async fn ensure_persistent(&self, path: &str) -> Result<()> {
        if self.client.exists(path).await?.is_some() {
            return Ok(());
        }
        match self.client.create(path, b"", CreateMode::Persistent).await {
            Ok(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Created {path}");
                Ok(())
            }
            Err(CoordinationError::NodeExists { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Scans for a free slot and commits it. A lost race on the lease node
    /// triggers a rescan.
    async fn acquire(&self) -> Result<Acquired> {
        let app_path = self.namespace.app_path();
        for _ in 0..=SLOT_CAPACITY {
            let payload = self.client.get_data(&app_path).await?;
            let counter = parse_counter(&app_path, &payload)?;
            let children = self.client.get_children(&app_path).await?;
            let occupied = occupied_slots(&children);
            let slot = find_free_slot(counter, &occupied).ok_or_else(|| self.exhausted())?;

            let slot_path = self.namespace.slot_path(slot);
            let ops = [
                Op::SetData {
                    path: app_path.clone(),
                    data: slot.to_string().into_bytes(),
                },
                Op::Create {
                    path: slot_path.clone(),
                    data: Vec::new(),
                    mode: CreateMode::Ephemeral,
                },
            ];
            let ctime = match self.client.multi(&ops).await {
                Ok(stats) => match stats.last() {
                    Some(created) => created.ctime,
                    None => return Err(CoordinationError::NoNode { path: slot_path }.into()),
                },
                Err(CoordinationError::NodeExists { .. }) => {
                    match self.owned_ctime(&slot_path).await? {
                        // An earlier attempt whose reply was lost did commit.
                        Some(ctime) => ctime,
                        None => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(slot, "Slot taken concurrently, rescanning");
                            continue;
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            };

            let watch = self.client.watch(&slot_path).await?;
            match self.client.exists(&slot_path).await? {
                Some(stat) if stat.ctime == ctime => {
                    return Ok(Acquired { slot, ctime, watch });
                }
                _ => {
                    // Removed or replaced before the watch was in place.
                    self.client.unwatch(watch.id()).await?;
                }
            }
        }
        Err(self.exhausted())
    }

    /// Creation time of the node at `path` if the current session owns it.
    async fn owned_ctime(&self, path: &str) -> Result<Option<u64>> {
        let session = self.client.session_id();
        let stat = self.client.exists(path).await?;
        Ok(stat
            .filter(|stat| stat.ephemeral_owner == Some(session))
            .map(|stat| stat.ctime))
    }

    fn exhausted(&self) -> Error {
        Error::NamespaceExhausted {
            namespace: self.namespace.app_path(),
            capacity: SLOT_CAPACITY,
        }
    }

    /// Returns `true` if the lease node at `path` is still the one recorded
    /// at claim time. A missing node, or one that cannot be read, is not.
    async fn still_held(&self, path: &str) -> bool {
        let ctime = match self.client.exists(path).await {
            Ok(stat) => stat.map_or(0, |stat| stat.ctime),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to read lease {path}: {_e}");
                0
            }
        };
        ctime == self.lease.lock().ctime
    }

    /// Marks the lease lost and claims until a new slot is held. Returns
    /// `None` if the coordinator closed meanwhile or the failure is fatal.
    async fn reclaim<G: SlotSwap>(
        &self,
        old: &Watch,
        generator: &G,
        retry: &RetryPolicy,
    ) -> Option<Watch> {
        {
            let mut lease = self.lease.lock();
            if lease.state == LeaseState::Closed {
                return None;
            }
            lease.state = LeaseState::Lost;
            lease.watch_id = None;
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(path = old.path(), "Lease lost, claiming a new slot");

        if let Err(_e) = self.client.unwatch(old.id()).await {
            #[cfg(feature = "tracing")]
            tracing::debug!("Failed to cancel old lease watch: {_e}");
        }

        let mut attempt = 0u32;
        let acquired = loop {
            if !self.transition(LeaseState::Claiming) {
                return None;
            }
            match self.establish().await {
                Ok(acquired) => break acquired,
                Err(_err) if _err.is_fatal() => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        slot = generator.slot(),
                        "Re-claim failed, continuing on the last slot without a lease: {_err}"
                    );
                    self.transition(LeaseState::Lost);
                    return None;
                }
                Err(_err) => {
                    let backoff = retry.backoff(attempt);
                    #[cfg(feature = "tracing")]
                    tracing::warn!(attempt, ?backoff, "Re-claim failed, retrying: {_err}");
                    if !self.transition(LeaseState::Lost) {
                        return None;
                    }
                    tokio::time::sleep(backoff).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        };

        if let Err(_e) = generator.set_slot(acquired.slot) {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to swap slot into generator: {_e}");
            self.transition(LeaseState::Lost);
            return None;
        }

        let mut lease = self.lease.lock();
        if lease.state == LeaseState::Closed {
            return None;
        }
        lease.state = LeaseState::Held;
        lease.slot = Some(acquired.slot);
        lease.ctime = acquired.ctime;
        lease.watch_id = Some(acquired.watch.id());

        #[cfg(feature = "tracing")]
        tracing::info!(slot = acquired.slot, "Re-claimed slot {}", acquired.slot);

        Some(acquired.watch)
    }

    /// Moves to `state` unless closed; returns `false` once closed.
    fn transition(&self, state: LeaseState) -> bool {
        let mut lease = self.lease.lock();
        if lease.state == LeaseState::Closed {
            return false;
        }
        lease.state = state;
        true
    }
}

/// Drains lease notifications until shutdown or a fatal re-claim failure.
///
/// The subscription ends only when the session does, so its end counts as
/// losing the lease.
async fn watch_lease<C, G>(
    inner: Arc<Inner<C>>,
    mut watch: Watch,
    generator: G,
    retry: RetryPolicy,
    shutdown: CancellationToken,
) where
    C: CoordinationClient,
    G: SlotSwap + 'static,
{
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            event = watch.recv() => event,
        };
        match event {
            Some(_event) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(kind = ?_event.kind, path = %_event.path, "Lease watch fired");

                if inner.still_held(watch.path()).await {
                    continue;
                }
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::error!(path = watch.path(), "Lease watch ended, the session was lost");
            }
        }

        let reclaimed = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            reclaimed = inner.reclaim(&watch, &generator, &retry) => reclaimed,
        };
        match reclaimed {
            Some(next) => watch = next,
            None => return,
        }
    }
}
