use crate::coordination::CoordinationError;
use core::{fmt, time::Duration};
use tokio::sync::mpsc;

pub type CoordinationResult<T> = core::result::Result<T, CoordinationError>;

/// Whether a node outlives the session that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Stays until deleted.
    Persistent,
    /// Removed automatically when the creating session ends.
    Ephemeral,
}

/// Node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Creation time, milliseconds since the Unix epoch. Distinguishes two
    /// generations of a node with the same path.
    pub ctime: u64,
    /// Last payload modification time, milliseconds since the Unix epoch.
    pub mtime: u64,
    /// Number of payload writes since creation.
    pub version: u32,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<u64>,
    /// Number of direct children.
    pub num_children: u32,
}

/// One step of an atomic [`CoordinationClient::multi`] transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Overwrites the payload of an existing node.
    SetData { path: String, data: Vec<u8> },
    /// Creates a node whose parent exists.
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
}

/// An authentication credential, e.g. `digest` + `user:password`.
///
/// When a session connects with a credential, every node it creates is
/// restricted to that credential.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    /// Authentication scheme understood by the service, e.g. `digest`.
    pub scheme: String,
    /// Scheme-specific secret. Never printed by `Debug`.
    pub secret: String,
}

impl Credential {
    /// A credential for an arbitrary scheme.
    pub fn new(scheme: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            secret: secret.into(),
        }
    }

    /// A `digest` credential, `user:password`.
    pub fn digest(secret: impl Into<String>) -> Self {
        Self::new("digest", secret)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("scheme", &self.scheme)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// What changed under a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    NodeAdded,
    NodeRemoved,
    NodeUpdated,
}

/// A change notification for a node at or below a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: String,
}

pub type WatchId = u64;

/// A live subscription to changes at and below one path.
///
/// Events are delivered over a channel so that whoever consumes them never
/// runs inside the client's own notification context. The stream ends when
/// the subscription is cancelled or the session closes.
#[derive(Debug)]
pub struct Watch {
    id: WatchId,
    path: String,
    events: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Watch {
    /// Wraps the receiving end of a subscription. Clients call this; the
    /// sender side stays with the client and is dropped when the
    /// subscription ends.
    pub const fn new(
        id: WatchId,
        path: String,
        events: mpsc::UnboundedReceiver<WatchEvent>,
    ) -> Self {
        Self { id, path, events }
    }

    /// Identifier to pass to [`CoordinationClient::unwatch`].
    pub const fn id(&self) -> WatchId {
        self.id
    }

    /// The watched path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Waits for the next event; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// Returns a pending event without waiting.
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.events.try_recv().ok()
    }
}

/// A session with a ZooKeeper/etcd-class directory service.
///
/// All operations are network calls. Implementations report transient
/// failures as such (see [`CoordinationError::is_transient`]) and leave
/// retrying to [`Retrying`].
///
/// A client outlives the sessions it opens. Once the service expires a
/// session, calls fail with [`CoordinationError::SessionClosed`] until
/// [`reconnect`](Self::reconnect) opens a new one.
///
/// [`Retrying`]: crate::coordination::Retrying
pub trait CoordinationClient: Send + Sync + 'static {
    /// Identifier of the current session. Ephemeral nodes it creates carry
    /// it as [`Stat::ephemeral_owner`].
    fn session_id(&self) -> u64;

    /// Returns the node's metadata, or `None` if it does not exist.
    fn exists(&self, path: &str) -> impl Future<Output = CoordinationResult<Option<Stat>>> + Send;

    /// Reads a node's payload.
    fn get_data(&self, path: &str) -> impl Future<Output = CoordinationResult<Vec<u8>>> + Send;

    /// Overwrites a node's payload.
    fn set_data(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl Future<Output = CoordinationResult<Stat>> + Send;

    /// Lists the names (not full paths) of a node's direct children.
    fn get_children(
        &self,
        path: &str,
    ) -> impl Future<Output = CoordinationResult<Vec<String>>> + Send;

    /// Creates a node; the parent must exist. Returns the created path.
    fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> impl Future<Output = CoordinationResult<String>> + Send;

    /// Deletes a childless node.
    fn delete(&self, path: &str) -> impl Future<Output = CoordinationResult<()>> + Send;

    /// Applies every operation or none of them. On success returns the
    /// resulting metadata of each touched node, in operation order.
    fn multi(&self, ops: &[Op]) -> impl Future<Output = CoordinationResult<Vec<Stat>>> + Send;

    /// Subscribes to additions, removals and payload changes of `path` and
    /// everything below it. The path need not exist yet.
    fn watch(&self, path: &str) -> impl Future<Output = CoordinationResult<Watch>> + Send;

    /// Cancels a subscription. Unknown ids are ignored.
    fn unwatch(&self, id: WatchId) -> impl Future<Output = CoordinationResult<()>> + Send;

    /// Opens a new session, with the same credential, if the current one has
    /// expired. Nothing happens while the session is live.
    ///
    /// Fails with [`CoordinationError::SessionClosed`] after
    /// [`close`](Self::close).
    fn reconnect(&self) -> impl Future<Output = CoordinationResult<()>> + Send;

    /// Ends the session for good. Its ephemeral nodes disappear and its
    /// watches end. Closing twice is a no-op.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Session parameters passed to a [`Connector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSettings {
    /// Authenticate the session and restrict created nodes to this
    /// credential.
    pub credential: Option<Credential>,
    /// How long the service keeps a silent session alive.
    pub session_timeout: Duration,
    /// How long to wait for the initial connection.
    pub connection_timeout: Duration,
}

/// Opens sessions against a coordination service address.
pub trait Connector: Send + Sync + 'static {
    type Client: CoordinationClient;

    /// Opens a session against `address`, e.g. `host1:2181,host2:2181`.
    fn connect(
        &self,
        address: &str,
        settings: &ConnectSettings,
    ) -> impl Future<Output = CoordinationResult<Self::Client>> + Send;
}
