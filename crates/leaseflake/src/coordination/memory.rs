//! An in-process coordination service.
//!
//! [`MemoryCoordinator`] holds one shared node tree. Each [`MemorySession`]
//! obtained from it behaves like a client session against a real directory
//! service: ephemeral nodes are tied to the session, watches deliver events
//! for a whole subtree, transactions are all-or-nothing, and nodes created by
//! an authenticated session are restricted to its credential.
//!
//! Creation times are strictly increasing across the whole tree, so two
//! generations of a node never share a `ctime`, even within one millisecond.

use crate::{
    SystemClock, TimeSource,
    coordination::{
        ConnectSettings, Connector, CoordinationClient, CoordinationError, CoordinationResult,
        CreateMode, Credential, Op, Stat, Watch, WatchEvent, WatchEventKind, WatchId,
    },
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

const ROOT: &str = "/";

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    stat: Stat,
    acl: Option<Credential>,
}

#[derive(Debug)]
struct Subscriber {
    id: WatchId,
    session: u64,
    path: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    subscribers: Vec<Subscriber>,
    live_sessions: HashSet<u64>,
    next_session: u64,
    next_watch: WatchId,
    last_ctime: u64,
    pending_faults: Vec<CoordinationError>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT.to_owned(),
            Node {
                data: Vec::new(),
                stat: Stat {
                    ctime: 0,
                    mtime: 0,
                    version: 0,
                    ephemeral_owner: None,
                    num_children: 0,
                },
                acl: None,
            },
        );
        Self {
            nodes,
            subscribers: Vec::new(),
            live_sessions: HashSet::new(),
            next_session: 1,
            next_watch: 1,
            last_ctime: 0,
            pending_faults: Vec::new(),
        }
    }

    fn next_ctime(&mut self) -> u64 {
        self.last_ctime = SystemClock.current_millis().max(self.last_ctime + 1);
        self.last_ctime
    }

    fn open_session(&mut self) -> u64 {
        let id = self.next_session;
        self.next_session += 1;
        self.live_sessions.insert(id);
        id
    }

    /// Checks liveness and consumes one injected fault, if any.
    fn enter(&mut self, session: u64) -> CoordinationResult<()> {
        if !self.live_sessions.contains(&session) {
            return Err(CoordinationError::SessionClosed);
        }
        self.take_fault()
    }

    fn take_fault(&mut self) -> CoordinationResult<()> {
        if self.pending_faults.is_empty() {
            Ok(())
        } else {
            Err(self.pending_faults.remove(0))
        }
    }

    fn publish(&mut self, events: Vec<WatchEvent>) {
        for event in events {
            self.subscribers.retain(|sub| {
                if !covers(&sub.path, &event.path) {
                    return true;
                }
                sub.tx.send(event.clone()).is_ok()
            });
        }
    }

    fn end_session(&mut self, session: u64) {
        if !self.live_sessions.remove(&session) {
            return;
        }
        self.subscribers.retain(|sub| sub.session != session);

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        let mut events = Vec::with_capacity(owned.len());
        for path in owned {
            self.nodes.remove(&path);
            adjust_children(&mut self.nodes, &path, -1);
            events.push(WatchEvent {
                kind: WatchEventKind::NodeRemoved,
                path,
            });
        }
        self.publish(events);
    }
}

/// Returns `true` if a watch on `watched` sees changes to `path`.
fn covers(watched: &str, path: &str) -> bool {
    path == watched
        || watched == ROOT
        || path
            .strip_prefix(watched)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some(ROOT),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

fn validate_path(path: &str) -> CoordinationResult<()> {
    let valid = path.starts_with('/')
        && (path == ROOT || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(CoordinationError::NoNode {
            path: path.to_owned(),
        })
    }
}

fn adjust_children(nodes: &mut BTreeMap<String, Node>, path: &str, delta: i32) {
    if let Some(parent) = parent_of(path).and_then(|p| nodes.get_mut(p)) {
        parent.stat.num_children = parent.stat.num_children.saturating_add_signed(delta);
    }
}

/// Working view of the tree for one operation or transaction.
struct Apply<'a> {
    nodes: &'a mut BTreeMap<String, Node>,
    session: u64,
    auth: Option<&'a Credential>,
    events: Vec<WatchEvent>,
}

impl Apply<'_> {
    fn authorize(&self, path: &str) -> CoordinationResult<()> {
        match self.nodes.get(path).and_then(|node| node.acl.as_ref()) {
            Some(acl) if Some(acl) != self.auth => Err(CoordinationError::NoAuth {
                path: path.to_owned(),
            }),
            _ => Ok(()),
        }
    }

    fn node(&self, path: &str) -> CoordinationResult<&Node> {
        validate_path(path)?;
        self.authorize(path)?;
        self.nodes.get(path).ok_or_else(|| CoordinationError::NoNode {
            path: path.to_owned(),
        })
    }

    fn create(
        &mut self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        ctime: u64,
    ) -> CoordinationResult<Stat> {
        validate_path(path)?;
        if self.nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists {
                path: path.to_owned(),
            });
        }
        let parent = parent_of(path).ok_or_else(|| CoordinationError::NodeExists {
            path: path.to_owned(),
        })?;
        let parent_node = self.node(parent)?;
        if parent_node.stat.ephemeral_owner.is_some() {
            return Err(CoordinationError::NoChildrenForEphemerals {
                path: parent.to_owned(),
            });
        }

        let ephemeral_owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.session),
        };
        let stat = Stat {
            ctime,
            mtime: ctime,
            version: 0,
            ephemeral_owner,
            num_children: 0,
        };
        self.nodes.insert(
            path.to_owned(),
            Node {
                data: data.to_vec(),
                stat,
                acl: self.auth.cloned(),
            },
        );
        adjust_children(self.nodes, path, 1);
        self.events.push(WatchEvent {
            kind: WatchEventKind::NodeAdded,
            path: path.to_owned(),
        });
        Ok(stat)
    }

    fn set_data(&mut self, path: &str, data: &[u8], mtime: u64) -> CoordinationResult<Stat> {
        self.node(path)?;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode {
                path: path.to_owned(),
            })?;
        node.data = data.to_vec();
        node.stat.mtime = mtime;
        node.stat.version += 1;
        let stat = node.stat;
        self.events.push(WatchEvent {
            kind: WatchEventKind::NodeUpdated,
            path: path.to_owned(),
        });
        Ok(stat)
    }

    fn delete(&mut self, path: &str) -> CoordinationResult<()> {
        let node = self.node(path)?;
        if path == ROOT {
            return Err(CoordinationError::NotEmpty {
                path: path.to_owned(),
            });
        }
        if node.stat.num_children > 0 {
            return Err(CoordinationError::NotEmpty {
                path: path.to_owned(),
            });
        }
        self.nodes.remove(path);
        adjust_children(self.nodes, path, -1);
        self.events.push(WatchEvent {
            kind: WatchEventKind::NodeRemoved,
            path: path.to_owned(),
        });
        Ok(())
    }
}

/// An in-process coordination service shared by any number of sessions.
///
/// Cloning is cheap; clones share the same tree.
///
/// # Example
/// ```
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// use leaseflake::coordination::{CoordinationClient, CreateMode, MemoryCoordinator};
///
/// let service = MemoryCoordinator::new();
/// let session = service.session();
/// session.create("/app", b"", CreateMode::Persistent).await.unwrap();
/// session.create("/app/0", b"", CreateMode::Ephemeral).await.unwrap();
/// assert_eq!(session.get_children("/app").await.unwrap(), vec!["0"]);
///
/// session.close().await;
/// assert!(service.session().exists("/app/0").await.unwrap().is_none());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    /// An empty tree holding only `/`.
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// Opens an unauthenticated session.
    pub fn session(&self) -> MemorySession {
        self.open(None)
    }

    /// Opens a session authenticated with `credential`.
    pub fn session_with(&self, credential: Credential) -> MemorySession {
        self.open(Some(credential))
    }

    fn open(&self, auth: Option<Credential>) -> MemorySession {
        let id = self.tree.lock().open_session();
        MemorySession {
            tree: Arc::clone(&self.tree),
            id: AtomicU64::new(id),
            closed: AtomicBool::new(false),
            auth,
        }
    }

    /// Ends a session from the service side, as a session timeout would.
    pub fn expire_session(&self, session: u64) {
        self.tree.lock().end_session(session);
    }

    /// Makes the next `count` operations, from any session, fail with
    /// `error` before they touch the tree.
    pub fn inject_faults(&self, error: CoordinationError, count: usize) {
        let mut tree = self.tree.lock();
        tree.pending_faults
            .extend(core::iter::repeat_n(error, count));
    }

    /// Restricts an existing node to `credential`, bypassing authorization.
    pub fn set_acl(&self, path: &str, credential: Option<Credential>) -> CoordinationResult<()> {
        let mut tree = self.tree.lock();
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode {
                path: path.to_owned(),
            })?;
        node.acl = credential;
        Ok(())
    }

    /// Number of live subscriptions across all sessions.
    pub fn watch_count(&self) -> usize {
        let mut tree = self.tree.lock();
        tree.subscribers.retain(|sub| !sub.tx.is_closed());
        tree.subscribers.len()
    }

    /// Number of sessions that have not been closed or expired.
    pub fn live_session_count(&self) -> usize {
        self.tree.lock().live_sessions.len()
    }
}

impl Connector for MemoryCoordinator {
    type Client = MemorySession;

    /// The address is ignored: every session joins this in-process tree.
    async fn connect(
        &self,
        _address: &str,
        settings: &ConnectSettings,
    ) -> CoordinationResult<MemorySession> {
        Ok(self.open(settings.credential.clone()))
    }
}

/// A client of a [`MemoryCoordinator`].
///
/// Starts with one live session. If the service expires it,
/// [`reconnect`](CoordinationClient::reconnect) opens a fresh one with the
/// same credential; [`close`](CoordinationClient::close) ends it for good.
#[derive(Debug)]
pub struct MemorySession {
    tree: Arc<Mutex<Tree>>,
    id: AtomicU64,
    closed: AtomicBool,
    auth: Option<Credential>,
}

impl MemorySession {
    /// The current session id, as passed to
    /// [`MemoryCoordinator::expire_session`].
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut Apply<'_>, u64) -> CoordinationResult<T>,
    ) -> CoordinationResult<T> {
        let mut tree = self.tree.lock();
        let session = self.id();
        tree.enter(session)?;
        let now = tree.next_ctime();
        let mut scratch = tree.nodes.clone();
        let mut view = Apply {
            nodes: &mut scratch,
            session,
            auth: self.auth.as_ref(),
            events: Vec::new(),
        };
        let value = apply(&mut view, now)?;
        let events = view.events;
        tree.nodes = scratch;
        tree.publish(events);
        Ok(value)
    }

    fn read<T>(&self, read: impl FnOnce(&Apply<'_>) -> CoordinationResult<T>) -> CoordinationResult<T> {
        let mut tree = self.tree.lock();
        let session = self.id();
        tree.enter(session)?;
        let view = Apply {
            nodes: &mut tree.nodes,
            session,
            auth: self.auth.as_ref(),
            events: Vec::new(),
        };
        read(&view)
    }
}

impl CoordinationClient for MemorySession {
    fn session_id(&self) -> u64 {
        self.id()
    }

    async fn exists(&self, path: &str) -> CoordinationResult<Option<Stat>> {
        // Existence checks are not subject to ACLs.
        self.read(|view| {
            validate_path(path)?;
            Ok(view.nodes.get(path).map(|node| node.stat))
        })
    }

    async fn get_data(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.read(|view| view.node(path).map(|node| node.data.clone()))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> CoordinationResult<Stat> {
        self.mutate(|view, now| view.set_data(path, data, now))
    }

    async fn get_children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.read(|view| {
            view.node(path)?;
            let prefix = if path == ROOT {
                ROOT.to_owned()
            } else {
                format!("{path}/")
            };
            Ok(view
                .nodes
                .range::<str, _>((
                    core::ops::Bound::Excluded(prefix.as_str()),
                    core::ops::Bound::Unbounded,
                ))
                .take_while(|(child, _)| child.starts_with(&prefix))
                .filter_map(|(child, _)| {
                    let name = &child[prefix.len()..];
                    (!name.contains('/')).then(|| name.to_owned())
                })
                .collect())
        })
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<String> {
        self.mutate(|view, now| view.create(path, data, mode, now).map(|_| path.to_owned()))
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.mutate(|view, _| view.delete(path))
    }

    async fn multi(&self, ops: &[Op]) -> CoordinationResult<Vec<Stat>> {
        self.mutate(|view, now| {
            ops.iter()
                .map(|op| match op {
                    Op::SetData { path, data } => view.set_data(path, data, now),
                    Op::Create { path, data, mode } => view.create(path, data, *mode, now),
                })
                .collect()
        })
    }

    async fn watch(&self, path: &str) -> CoordinationResult<Watch> {
        validate_path(path)?;
        let mut tree = self.tree.lock();
        let session = self.id();
        tree.enter(session)?;
        let id = tree.next_watch;
        tree.next_watch += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        tree.subscribers.push(Subscriber {
            id,
            session,
            path: path.to_owned(),
            tx,
        });
        Ok(Watch::new(id, path.to_owned(), rx))
    }

    async fn unwatch(&self, id: WatchId) -> CoordinationResult<()> {
        let mut tree = self.tree.lock();
        if !tree.live_sessions.contains(&self.id()) {
            return Err(CoordinationError::SessionClosed);
        }
        tree.subscribers.retain(|sub| sub.id != id);
        Ok(())
    }

    async fn reconnect(&self) -> CoordinationResult<()> {
        let mut tree = self.tree.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(CoordinationError::SessionClosed);
        }
        if tree.live_sessions.contains(&self.id()) {
            return Ok(());
        }
        tree.take_fault()?;
        let id = tree.open_session();
        self.id.store(id, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        // Flag and end under the tree lock so a concurrent reconnect cannot
        // slip a new session in between.
        let mut tree = self.tree.lock();
        self.closed.store(true, Ordering::Release);
        tree.end_session(self.id());
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let id = self.id();
        self.tree.lock().end_session(id);
    }
}
