use crate::{
    ClockSync, ClockSyncError, Error, IdGenerator, LeaseState, Namespace, RetryPolicy,
    SlotLeaseCoordinator,
    coordination::{
        CoordinationClient, CoordinationError, CoordinationResult, CreateMode, Credential,
        MemoryCoordinator, MemorySession, Op, Retrying, Stat, Watch, WatchId,
    },
    find_free_slot, occupied_slots, parse_counter,
};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

const APP: &str = "/snowflake/orders";

fn namespace() -> Namespace {
    Namespace::new("/snowflake", "orders").unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Prepares the namespace and holds `slots` from a separate session.
async fn occupy(
    service: &MemoryCoordinator,
    counter: &[u8],
    slots: impl IntoIterator<Item = u16>,
) -> MemorySession {
    let session = service.session();
    session.create("/snowflake", b"", CreateMode::Persistent).await.unwrap();
    session.create(APP, counter, CreateMode::Persistent).await.unwrap();
    for slot in slots {
        session
            .create(&format!("{APP}/{slot}"), b"", CreateMode::Ephemeral)
            .await
            .unwrap();
    }
    session
}

async fn counter(service: &MemoryCoordinator) -> String {
    let data = service.session().get_data(APP).await.unwrap();
    String::from_utf8(data).unwrap()
}

#[test]
fn counter_parsing() {
    assert_eq!(parse_counter(APP, b""), Ok(None));
    assert_eq!(parse_counter(APP, b"not a number"), Ok(None));
    assert_eq!(parse_counter(APP, b"99999999999999999999999"), Ok(None));
    assert_eq!(parse_counter(APP, &[0xff, 0xfe]), Ok(None));
    assert_eq!(parse_counter(APP, b"0"), Ok(Some(0)));
    assert_eq!(parse_counter(APP, b"1023"), Ok(Some(1023)));
    assert_eq!(
        parse_counter(APP, b"1024"),
        Err(Error::CounterCorruption {
            path: APP.to_owned(),
            payload: "1024".to_owned(),
        })
    );
    assert!(matches!(
        parse_counter(APP, b"-1"),
        Err(Error::CounterCorruption { .. })
    ));
}

#[test]
fn occupied_set_ignores_foreign_children() {
    let children = ["0", "17", "1023", "1024", "lock", "-3", ""];
    let occupied = occupied_slots(&children);
    assert_eq!(occupied, HashSet::from([0, 17, 1023]));
}

#[test]
fn scan_starts_after_counter_and_wraps() {
    let empty = HashSet::new();
    assert_eq!(find_free_slot(None, &empty), Some(0));
    assert_eq!(find_free_slot(Some(0), &empty), Some(1));
    assert_eq!(find_free_slot(Some(1023), &empty), Some(0));

    let occupied: HashSet<u16> = (0..50).chain(1000..1024).collect();
    assert_eq!(find_free_slot(Some(1000), &occupied), Some(50));

    let occupied: HashSet<u16> = (0..1024).filter(|s| *s != 7).collect();
    assert_eq!(find_free_slot(Some(7), &occupied), Some(7));
    assert_eq!(find_free_slot(None, &occupied), Some(7));

    let full: HashSet<u16> = (0..1024).collect();
    assert_eq!(find_free_slot(Some(3), &full), None);
    assert_eq!(find_free_slot(None, &full), None);
}

#[tokio::test]
async fn claims_are_sequenced_through_the_counter() {
    let service = MemoryCoordinator::new();
    let first = SlotLeaseCoordinator::new(service.session(), namespace());
    assert_eq!(first.state(), LeaseState::Unclaimed);
    assert_eq!(first.current_slot(), Err(Error::NotBuilt));

    assert_eq!(first.claim().await, Ok(0));
    assert_eq!(first.state(), LeaseState::Held);
    assert_eq!(counter(&service).await, "0");

    let second = SlotLeaseCoordinator::new(service.session(), namespace());
    assert_eq!(second.claim().await, Ok(1));
    assert_eq!(counter(&service).await, "1");

    // Claiming again while held is a no-op.
    assert_eq!(second.claim().await, Ok(1));
    let children = service.session().get_children(APP).await.unwrap();
    assert_eq!(children.len(), 2);

    let stat = service.session().exists(&format!("{APP}/1")).await.unwrap().unwrap();
    assert_eq!(second.lease_ctime(), stat.ctime);
    assert_eq!(stat.ephemeral_owner, Some(second.client().id()));
}

#[tokio::test]
async fn claim_wraps_around_occupied_slots() {
    let service = MemoryCoordinator::new();
    let _holder = occupy(&service, b"1000", (0..50).chain(1000..1024)).await;

    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace());
    assert_eq!(coordinator.claim().await, Ok(50));
    assert_eq!(counter(&service).await, "50");
}

#[tokio::test]
async fn full_namespace_is_fatal_and_creates_nothing() {
    let service = MemoryCoordinator::new();
    let _holder = occupy(&service, b"5", 0..1024).await;

    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace());
    let err = coordinator.claim().await.unwrap_err();
    assert_eq!(
        err,
        Error::NamespaceExhausted {
            namespace: APP.to_owned(),
            capacity: 1024,
        }
    );
    assert!(err.is_fatal());
    assert_eq!(err.to_string(), "namespace /snowflake/orders is full, the max node amount is 1024");
    assert_eq!(coordinator.state(), LeaseState::Unclaimed);
    assert_eq!(counter(&service).await, "5");
    assert_eq!(service.session().get_children(APP).await.unwrap().len(), 1024);
}

#[tokio::test]
async fn corrupt_counter_is_surfaced() {
    let service = MemoryCoordinator::new();
    let _holder = occupy(&service, b"4096", []).await;

    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace());
    assert!(matches!(
        coordinator.claim().await,
        Err(Error::CounterCorruption { .. })
    ));
    assert!(service.session().get_children(APP).await.unwrap().is_empty());
}

#[tokio::test]
async fn unreadable_counter_starts_from_zero() {
    let service = MemoryCoordinator::new();
    let _holder = occupy(&service, b"garbage", [0, 1]).await;

    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace());
    assert_eq!(coordinator.claim().await, Ok(2));
}

#[tokio::test]
async fn namespace_directly_under_root() {
    let service = MemoryCoordinator::new();
    let ns = Namespace::new("/", "orders").unwrap();
    let coordinator = SlotLeaseCoordinator::new(service.session(), ns);
    assert_eq!(coordinator.claim().await, Ok(0));
    assert!(service.session().exists("/orders/0").await.unwrap().is_some());
}

#[tokio::test]
async fn reclaims_after_lease_is_deleted() {
    let service = MemoryCoordinator::new();
    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace());
    let slot = coordinator.claim().await.unwrap();
    let generator = Arc::new(IdGenerator::system(u64::from(slot), 0).unwrap());
    coordinator.start(Arc::clone(&generator)).unwrap();
    assert_eq!(generator.next_id().slot(), 0);

    service.session().delete(&format!("{APP}/0")).await.unwrap();

    assert!(eventually(|| generator.slot() == 1).await);
    assert_eq!(generator.next_id().slot(), 1);
    assert_eq!(coordinator.current_slot(), Ok(1));
    assert!(eventually(|| coordinator.state() == LeaseState::Held).await);
    assert_eq!(counter(&service).await, "1");
    let stat = service.session().exists(&format!("{APP}/1")).await.unwrap().unwrap();
    assert_eq!(coordinator.lease_ctime(), stat.ctime);

    // The new lease is watched too.
    service.session().delete(&format!("{APP}/1")).await.unwrap();
    assert!(eventually(|| generator.slot() == 2).await);
}

#[tokio::test]
async fn reclaims_when_lease_is_recreated_by_someone_else() {
    let service = MemoryCoordinator::new();
    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace());
    coordinator.claim().await.unwrap();
    let generator = Arc::new(IdGenerator::system(0, 0).unwrap());
    coordinator.start(Arc::clone(&generator)).unwrap();

    // Delete and recreate without yielding, so the task only ever sees a
    // node with a different creation time.
    let rival = service.session();
    rival.delete(&format!("{APP}/0")).await.unwrap();
    rival.create(&format!("{APP}/0"), b"", CreateMode::Ephemeral).await.unwrap();

    assert!(eventually(|| generator.slot() == 1).await);
    assert_eq!(coordinator.current_slot(), Ok(1));
}

#[tokio::test]
async fn unrelated_changes_keep_the_lease() {
    let service = MemoryCoordinator::new();
    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace());
    coordinator.claim().await.unwrap();
    let generator = Arc::new(IdGenerator::system(0, 0).unwrap());
    coordinator.start(Arc::clone(&generator)).unwrap();

    service.session().set_data(&format!("{APP}/0"), b"touched").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(generator.slot(), 0);
    assert_eq!(coordinator.state(), LeaseState::Held);
    assert_eq!(counter(&service).await, "0");
}

async fn owner(service: &MemoryCoordinator, slot: u16) -> Option<u64> {
    service
        .session()
        .exists(&format!("{APP}/{slot}"))
        .await
        .unwrap()
        .and_then(|stat| stat.ephemeral_owner)
}

#[tokio::test]
async fn reclaims_after_session_expiry() {
    let service = MemoryCoordinator::new();
    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace());
    coordinator.claim().await.unwrap();
    let generator = Arc::new(IdGenerator::system(0, 0).unwrap());
    coordinator.start(Arc::clone(&generator)).unwrap();

    let expired = coordinator.client().id();
    service.expire_session(expired);

    assert!(eventually(|| generator.slot() == 1).await);
    assert!(eventually(|| coordinator.state() == LeaseState::Held).await);
    assert_eq!(coordinator.current_slot(), Ok(1));
    assert_ne!(coordinator.client().id(), expired);
    assert_eq!(owner(&service, 1).await, Some(coordinator.client().id()));
    assert_eq!(service.watch_count(), 1);

    // A newcomer pointed at the abandoned slot gets it without a clash.
    let newcomer = service.session();
    newcomer.set_data(APP, b"1023").await.unwrap();
    let peer = SlotLeaseCoordinator::new(newcomer, namespace());
    assert_eq!(peer.claim().await, Ok(0));
    assert_eq!(owner(&service, 0).await, Some(peer.client().id()));
    assert_eq!(generator.next_id().slot(), 1);
    assert_eq!(coordinator.state(), LeaseState::Held);
}

#[tokio::test]
async fn reclaim_outlasts_bounded_client_retries() {
    let service = MemoryCoordinator::new();
    let policy = RetryPolicy::bounded(Duration::from_millis(1), Duration::from_millis(4), 2);
    let coordinator =
        SlotLeaseCoordinator::new(Retrying::new(service.session(), policy), namespace())
            .with_retry_policy(policy);
    coordinator.claim().await.unwrap();
    let generator = Arc::new(IdGenerator::system(0, 0).unwrap());
    coordinator.start(Arc::clone(&generator)).unwrap();

    // Far more consecutive failures than a single call is allowed to absorb.
    service.session().delete(&format!("{APP}/0")).await.unwrap();
    service.inject_faults(CoordinationError::ConnectionLoss, 20);

    assert!(
        eventually(|| generator.slot() == 1 && coordinator.state() == LeaseState::Held).await
    );
    assert_eq!(coordinator.current_slot(), Ok(1));
    assert_eq!(service.session().get_children(APP).await.unwrap(), vec!["1"]);
    assert_eq!(counter(&service).await, "1");
}

#[tokio::test]
async fn failed_reclaim_freezes_on_last_slot() {
    let service = MemoryCoordinator::new();
    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace());
    coordinator.claim().await.unwrap();
    let generator = Arc::new(IdGenerator::system(0, 0).unwrap());
    coordinator.start(Arc::clone(&generator)).unwrap();

    let rival = service.session();
    rival.set_data(APP, b"5000").await.unwrap();
    rival.delete(&format!("{APP}/0")).await.unwrap();

    assert!(eventually(|| coordinator.state() == LeaseState::Lost).await);
    assert_eq!(generator.slot(), 0);
    assert_eq!(generator.next_id().slot(), 0);
    assert_eq!(coordinator.current_slot(), Ok(0));
}

#[tokio::test]
async fn close_releases_everything() {
    let service = MemoryCoordinator::new();
    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace());
    coordinator.claim().await.unwrap();
    coordinator.start(Arc::new(IdGenerator::system(0, 0).unwrap())).unwrap();
    assert_eq!(service.watch_count(), 1);

    coordinator.close().await;
    coordinator.close().await;

    assert_eq!(coordinator.state(), LeaseState::Closed);
    assert_eq!(coordinator.current_slot(), Err(Error::AlreadyClosed));
    assert_eq!(coordinator.claim().await, Err(Error::AlreadyClosed));
    assert_eq!(service.watch_count(), 0);
    assert_eq!(service.live_session_count(), 0);
    assert!(service.session().exists(&format!("{APP}/0")).await.unwrap().is_none());
}

#[tokio::test]
async fn start_requires_a_claim() {
    let service = MemoryCoordinator::new();
    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace());
    let generator = Arc::new(IdGenerator::system(0, 0).unwrap());
    assert_eq!(coordinator.start(Arc::clone(&generator)), Err(Error::NotBuilt));

    coordinator.claim().await.unwrap();
    coordinator.start(Arc::clone(&generator)).unwrap();
    assert_eq!(coordinator.start(generator), Err(Error::NotBuilt));
}

#[tokio::test]
async fn authenticated_claim_locks_its_nodes() {
    let service = MemoryCoordinator::new();
    let credential = Credential::digest("orders:secret");
    let coordinator =
        SlotLeaseCoordinator::new(service.session_with(credential.clone()), namespace());
    assert_eq!(coordinator.claim().await, Ok(0));

    let anonymous = service.session();
    assert!(matches!(
        anonymous.get_data(APP).await,
        Err(CoordinationError::NoAuth { .. })
    ));
    assert!(matches!(
        anonymous.get_children(APP).await,
        Err(CoordinationError::NoAuth { .. })
    ));

    let peer = SlotLeaseCoordinator::new(service.session_with(credential), namespace());
    assert_eq!(peer.claim().await, Ok(1));

    let stranger = SlotLeaseCoordinator::new(
        service.session_with(Credential::digest("orders:wrong")),
        namespace(),
    );
    assert!(matches!(
        stranger.claim().await,
        Err(Error::Coordination(CoordinationError::NoAuth { .. }))
    ));
}

#[derive(Default)]
struct RecordingClockSync {
    calls: Mutex<Vec<u64>>,
    fail: bool,
}

impl ClockSync for RecordingClockSync {
    fn sync_to(&self, unix_millis: u64) -> Result<(), ClockSyncError> {
        self.calls.lock().push(unix_millis);
        if self.fail {
            Err(ClockSyncError::Unsupported)
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn clock_sync_runs_once_with_lease_ctime() {
    let service = MemoryCoordinator::new();
    let sync = Arc::new(RecordingClockSync::default());
    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace())
        .with_clock_sync(Arc::clone(&sync) as Arc<dyn ClockSync>);
    coordinator.claim().await.unwrap();
    coordinator.start(Arc::new(IdGenerator::system(0, 0).unwrap())).unwrap();

    service.session().delete(&format!("{APP}/0")).await.unwrap();
    assert!(eventually(|| coordinator.current_slot() == Ok(1)).await);

    let calls = sync.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert!(calls[0] > 0);
    assert_ne!(calls[0], coordinator.lease_ctime());
}

#[tokio::test]
async fn clock_sync_failure_is_not_fatal() {
    let service = MemoryCoordinator::new();
    let sync = Arc::new(RecordingClockSync {
        calls: Mutex::default(),
        fail: true,
    });
    let coordinator = SlotLeaseCoordinator::new(service.session(), namespace())
        .with_clock_sync(Arc::clone(&sync) as Arc<dyn ClockSync>);
    assert_eq!(coordinator.claim().await, Ok(0));
    assert_eq!(sync.calls.lock().as_slice(), [coordinator.lease_ctime()]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interference {
    /// A rival creates the lease node just before the commit.
    TakeSlotFirst,
    /// A rival deletes and recreates the lease node right after the commit.
    ReplaceAfterCommit,
    /// The commit lands but its reply is lost.
    DropReply,
}

/// A session whose next claim transaction is disturbed once.
struct ScriptedClient {
    inner: MemorySession,
    rival: MemorySession,
    script: Mutex<Option<Interference>>,
}

impl ScriptedClient {
    fn new(service: &MemoryCoordinator, interference: Interference) -> Self {
        Self {
            inner: service.session(),
            rival: service.session(),
            script: Mutex::new(Some(interference)),
        }
    }
}

impl CoordinationClient for ScriptedClient {
    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    async fn exists(&self, path: &str) -> CoordinationResult<Option<Stat>> {
        self.inner.exists(path).await
    }

    async fn get_data(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.inner.get_data(path).await
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> CoordinationResult<Stat> {
        self.inner.set_data(path, data).await
    }

    async fn get_children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.inner.get_children(path).await
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<String> {
        self.inner.create(path, data, mode).await
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.inner.delete(path).await
    }

    async fn multi(&self, ops: &[Op]) -> CoordinationResult<Vec<Stat>> {
        let interference = self.script.lock().take();
        let lease = ops.iter().find_map(|op| match op {
            Op::Create { path, .. } => Some(path.as_str()),
            Op::SetData { .. } => None,
        });
        let (Some(interference), Some(lease)) = (interference, lease) else {
            return self.inner.multi(ops).await;
        };

        if interference == Interference::TakeSlotFirst {
            self.rival.create(lease, b"", CreateMode::Ephemeral).await?;
        }
        let stats = self.inner.multi(ops).await?;
        match interference {
            Interference::TakeSlotFirst => Ok(stats),
            Interference::ReplaceAfterCommit => {
                self.rival.delete(lease).await?;
                self.rival.create(lease, b"", CreateMode::Ephemeral).await?;
                Ok(stats)
            }
            Interference::DropReply => Err(CoordinationError::ConnectionLoss),
        }
    }

    async fn watch(&self, path: &str) -> CoordinationResult<Watch> {
        self.inner.watch(path).await
    }

    async fn unwatch(&self, id: WatchId) -> CoordinationResult<()> {
        self.inner.unwatch(id).await
    }

    async fn reconnect(&self) -> CoordinationResult<()> {
        self.inner.reconnect().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[tokio::test]
async fn lost_race_rescans() {
    let service = MemoryCoordinator::new();
    let client = ScriptedClient::new(&service, Interference::TakeSlotFirst);
    let coordinator = SlotLeaseCoordinator::new(client, namespace());

    assert_eq!(coordinator.claim().await, Ok(1));
    let mut children = service.session().get_children(APP).await.unwrap();
    children.sort();
    assert_eq!(children, vec!["0", "1"]);
    assert_eq!(owner(&service, 0).await, Some(coordinator.client().rival.id()));
    assert_eq!(owner(&service, 1).await, Some(coordinator.client().inner.id()));
}

#[tokio::test]
async fn lease_replaced_before_watch_is_not_adopted() {
    let service = MemoryCoordinator::new();
    let client = ScriptedClient::new(&service, Interference::ReplaceAfterCommit);
    let coordinator = SlotLeaseCoordinator::new(client, namespace());

    assert_eq!(coordinator.claim().await, Ok(1));
    assert_eq!(owner(&service, 0).await, Some(coordinator.client().rival.id()));
    assert_eq!(owner(&service, 1).await, Some(coordinator.client().inner.id()));
    let stat = service.session().exists(&format!("{APP}/1")).await.unwrap().unwrap();
    assert_eq!(coordinator.lease_ctime(), stat.ctime);
}

#[tokio::test]
async fn commit_with_lost_reply_is_adopted() {
    let service = MemoryCoordinator::new();
    let client = Retrying::new(
        ScriptedClient::new(&service, Interference::DropReply),
        RetryPolicy::bounded(Duration::from_millis(1), Duration::from_millis(1), 3),
    );
    let coordinator = SlotLeaseCoordinator::new(client, namespace());

    assert_eq!(coordinator.claim().await, Ok(0));
    // One lease, not a second one picked up by a rescan.
    assert_eq!(service.session().get_children(APP).await.unwrap(), vec!["0"]);
    assert_eq!(counter(&service).await, "0");
    let session = coordinator.client().inner().inner.id();
    assert_eq!(owner(&service, 0).await, Some(session));
    let stat = service.session().exists(&format!("{APP}/0")).await.unwrap().unwrap();
    assert_eq!(coordinator.lease_ctime(), stat.ctime);
}
