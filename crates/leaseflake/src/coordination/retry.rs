use crate::{
    RetryPolicy,
    coordination::{
        CoordinationClient, CoordinationError, CoordinationResult, CreateMode, Op, Stat, Watch,
        WatchId,
    },
};

/// Retries transient failures of the wrapped client with exponential
/// backoff.
///
/// Permanent failures pass through untouched. With an unbounded
/// [`RetryPolicy`] a call blocks until the service answers; with a bounded
/// one it ends in [`CoordinationError::RetriesExhausted`].
#[derive(Debug)]
pub struct Retrying<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: CoordinationClient> Retrying<C> {
    /// Wraps `inner`, retrying its transient failures per `policy`.
    pub const fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The wrapped client.
    pub const fn inner(&self) -> &C {
        &self.inner
    }

    /// The schedule applied to transient failures.
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> CoordinationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoordinationResult<T>>,
    {
        let mut retries = 0;
        loop {
            match call().await {
                Err(err) if err.is_transient() => {
                    if !self.policy.allows(retries) {
                        #[cfg(feature = "tracing")]
                        tracing::error!(operation, retries, "Giving up on coordination call: {err}");
                        return Err(CoordinationError::RetriesExhausted {
                            operation,
                            attempts: retries + 1,
                            last: Box::new(err),
                        });
                    }
                    let backoff = self.policy.backoff(retries);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(operation, retries, ?backoff, "Retrying coordination call: {err}");
                    tokio::time::sleep(backoff).await;
                    retries += 1;
                }
                result => return result,
            }
        }
    }
}

impl<C: CoordinationClient> CoordinationClient for Retrying<C> {
    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    async fn exists(&self, path: &str) -> CoordinationResult<Option<Stat>> {
        self.run("exists", move || self.inner.exists(path)).await
    }

    async fn get_data(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.run("get_data", move || self.inner.get_data(path)).await
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> CoordinationResult<Stat> {
        self.run("set_data", move || self.inner.set_data(path, data)).await
    }

    async fn get_children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.run("get_children", move || self.inner.get_children(path))
            .await
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<String> {
        self.run("create", move || self.inner.create(path, data, mode))
            .await
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.run("delete", move || self.inner.delete(path)).await
    }

    /// A retry after a lost reply may find the first attempt already
    /// committed; the caller sees whatever the repeated transaction reports.
    async fn multi(&self, ops: &[Op]) -> CoordinationResult<Vec<Stat>> {
        self.run("multi", move || self.inner.multi(ops)).await
    }

    async fn watch(&self, path: &str) -> CoordinationResult<Watch> {
        self.run("watch", move || self.inner.watch(path)).await
    }

    async fn unwatch(&self, id: WatchId) -> CoordinationResult<()> {
        self.run("unwatch", move || self.inner.unwatch(id)).await
    }

    async fn reconnect(&self) -> CoordinationResult<()> {
        self.run("reconnect", move || self.inner.reconnect()).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
