//! Multi-client scenario tests: convergence, dedup, cascades, late join,
//! piggyback and crash recovery against a shared in-process hub.

use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

use crate::domain::AppState;
use crate::errors::Result;
use crate::sync::adapter::{ProviderKind, RemoteBatch, SyncAdapter, UploadBatch, UploadOutcome};
use crate::sync::apply::MergeResolver;
use crate::sync::engine::{SyncEngine, SyncStatus, TriggerResult};
use crate::sync::factory::OpFactory;
use crate::sync::memory::InMemoryOpLog;
use crate::sync::op::{EntityKind, SyncOp};
use crate::sync::store::{CursorKind, OpLogStore, SyncCursor};
use crate::sync::vector_clock::VectorClock;

#[derive(Default)]
struct HubInner {
    ops: Vec<SyncOp>,
    snapshot: Option<SyncOp>,
    /// Op count at snapshot time; bootstrap pulls skip everything below.
    snapshot_floor: usize,
    /// Ops injected right before the next upload, simulating a concurrent
    /// writer racing the uploader.
    inject_on_upload: Vec<SyncOp>,
    clock: VectorClock,
}

/// Shared sequence-numbered op feed standing in for the sync server.
#[derive(Default)]
struct Hub {
    inner: StdMutex<HubInner>,
}

impl Hub {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push_direct(&self, op: SyncOp) {
        let mut inner = self.inner.lock().expect("hub lock");
        inner.clock.merge(&op.vector_clock);
        inner.ops.push(op);
    }

    fn set_snapshot(&self, snapshot: SyncOp) {
        let mut inner = self.inner.lock().expect("hub lock");
        inner.clock.merge(&snapshot.vector_clock);
        inner.snapshot_floor = inner.ops.len();
        inner.snapshot = Some(snapshot);
    }

    fn inject_on_next_upload(&self, op: SyncOp) {
        self.inner
            .lock()
            .expect("hub lock")
            .inject_on_upload
            .push(op);
    }

    /// Raise the summary clock past what the op feed can explain,
    /// emulating history lost to a divergent peer.
    fn bump_clock(&self, client_id: &str, value: u64) {
        let mut inner = self.inner.lock().expect("hub lock");
        inner.clock.set(client_id, value);
    }

    fn op_count(&self) -> usize {
        self.inner.lock().expect("hub lock").ops.len()
    }
}

struct HubAdapter {
    hub: Arc<Hub>,
}

#[async_trait]
impl SyncAdapter for HubAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SuperSync
    }

    fn cursor_kind(&self) -> CursorKind {
        CursorKind::ServerSeq
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn download_since(&self, cursor: &SyncCursor) -> Result<RemoteBatch> {
        let inner = self.hub.inner.lock().expect("hub lock");
        let since = match cursor {
            SyncCursor::ServerSeq { last_server_seq } => *last_server_seq as usize,
            _ => 0,
        };
        let bootstrap = since == 0 && inner.snapshot.is_some();
        let start = if bootstrap {
            inner.snapshot_floor
        } else {
            since.min(inner.ops.len())
        };
        Ok(RemoteBatch {
            ops: inner.ops[start..].to_vec(),
            cursor: SyncCursor::ServerSeq {
                last_server_seq: inner.ops.len() as i64,
            },
            remote_clock: Some(inner.clock.clone()),
            snapshot: if bootstrap { inner.snapshot.clone() } else { None },
        })
    }

    async fn upload(&self, batch: &UploadBatch, cursor: &SyncCursor) -> Result<UploadOutcome> {
        let mut inner = self.hub.inner.lock().expect("hub lock");
        let since = match cursor {
            SyncCursor::ServerSeq { last_server_seq } => *last_server_seq as usize,
            _ => 0,
        };

        let injected: Vec<SyncOp> = inner.inject_on_upload.drain(..).collect();
        for op in injected {
            inner.clock.merge(&op.vector_clock);
            inner.ops.push(op);
        }

        let start = since.min(inner.ops.len());
        let piggybacked: Vec<SyncOp> = inner.ops[start..]
            .iter()
            .filter(|op| !batch.ops.iter().any(|local| local.id == op.id))
            .cloned()
            .collect();

        let mut accepted = Vec::new();
        for op in &batch.ops {
            if !inner.ops.iter().any(|existing| existing.id == op.id) {
                inner.clock.merge(&op.vector_clock);
                inner.ops.push(op.clone());
            }
            accepted.push(op.id.clone());
        }

        Ok(UploadOutcome {
            accepted,
            rejected: Vec::new(),
            piggybacked,
            cursor: SyncCursor::ServerSeq {
                last_server_seq: inner.ops.len() as i64,
            },
        })
    }

    async fn upload_full_state(
        &self,
        snapshot: &SyncOp,
        clean_slate: bool,
    ) -> Result<SyncCursor> {
        let mut inner = self.hub.inner.lock().expect("hub lock");
        if clean_slate {
            inner.ops.clear();
            inner.clock = VectorClock::new();
        }
        inner.clock.merge(&snapshot.vector_clock);
        inner.snapshot_floor = inner.ops.len();
        inner.snapshot = Some(snapshot.clone());
        Ok(SyncCursor::ServerSeq {
            last_server_seq: inner.ops.len() as i64,
        })
    }
}

struct TestClient {
    engine: Arc<SyncEngine>,
    store: Arc<InMemoryOpLog>,
    state: Arc<Mutex<AppState>>,
}

impl TestClient {
    fn new(hub: &Arc<Hub>, client_id: &str) -> Self {
        let store = Arc::new(InMemoryOpLog::new());
        store.set_client_id(client_id).expect("set client id");
        let state = Arc::new(Mutex::new(AppState::default()));
        let adapter = Arc::new(HubAdapter {
            hub: Arc::clone(hub),
        });
        let engine = Arc::new(
            SyncEngine::new(
                Arc::clone(&store) as Arc<dyn OpLogStore>,
                adapter,
                Arc::clone(&state),
            )
            .expect("engine"),
        );
        Self {
            engine,
            store,
            state,
        }
    }

    async fn edit(&self, entity: EntityKind, id: &str, payload: serde_json::Value) -> SyncOp {
        self.engine
            .record_local_edit(entity, id, payload)
            .await
            .expect("record edit")
    }

    /// Edit with an explicit wall-clock timestamp, for tiebreak scenarios.
    async fn edit_at(
        &self,
        entity: EntityKind,
        id: &str,
        payload: serde_json::Value,
        timestamp: i64,
    ) -> SyncOp {
        let factory = OpFactory::new(self.engine.client_id());
        let mut op = factory
            .lww_update(self.store.as_ref(), entity, id, payload)
            .expect("build op");
        op.timestamp = timestamp;
        self.store.append(&op).expect("append");
        let mut state = self.state.lock().await;
        MergeResolver::new(&factory, self.store.as_ref())
            .apply_batch(&mut state, std::slice::from_ref(&op))
            .expect("apply local op");
        op
    }

    async fn sync(&self) -> crate::sync::engine::CycleResult {
        match self.engine.trigger_sync().await.expect("trigger") {
            TriggerResult::Completed(result) => result,
            other => panic!("expected completed cycle, got {:?}", other),
        }
    }

    async fn snapshot(&self) -> AppState {
        self.state.lock().await.clone()
    }
}

fn task_payload(id: &str, title: &str) -> serde_json::Value {
    serde_json::json!({ "id": id, "title": title })
}

#[tokio::test]
async fn s1_two_client_lww_update_flows_through() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "client-a");
    let b = TestClient::new(&hub, "client-b");

    a.edit(EntityKind::Task, "t1", task_payload("t1", "x")).await;
    a.sync().await;

    b.sync().await;
    assert_eq!(b.snapshot().await.tasks["t1"].title, "x");

    b.edit(EntityKind::Task, "t1", task_payload("t1", "y")).await;
    b.sync().await;

    a.sync().await;
    assert_eq!(a.snapshot().await.tasks["t1"].title, "y");
    assert_eq!(a.snapshot().await, b.snapshot().await);
}

#[tokio::test]
async fn s2_concurrent_rename_converges_on_timestamp_then_client_id() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "client-a");
    let b = TestClient::new(&hub, "client-b");

    a.edit(EntityKind::Task, "t1", task_payload("t1", "x")).await;
    a.sync().await;
    b.sync().await;

    // Offline concurrent edits with controlled timestamps.
    a.edit_at(EntityKind::Task, "t1", task_payload("t1", "a"), 2_000)
        .await;
    b.edit_at(EntityKind::Task, "t1", task_payload("t1", "b"), 1_000)
        .await;

    a.sync().await;
    b.sync().await;
    a.sync().await;

    // A's edit has the larger timestamp and wins everywhere.
    assert_eq!(a.snapshot().await.tasks["t1"].title, "a");
    assert_eq!(b.snapshot().await.tasks["t1"].title, "a");
    assert_eq!(a.snapshot().await, b.snapshot().await);
}

#[tokio::test]
async fn s2b_equal_timestamps_tiebreak_lexicographically() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "client-a");
    let b = TestClient::new(&hub, "client-b");

    a.edit(EntityKind::Task, "t1", task_payload("t1", "x")).await;
    a.sync().await;
    b.sync().await;

    a.edit_at(EntityKind::Task, "t1", task_payload("t1", "a"), 5_000)
        .await;
    b.edit_at(EntityKind::Task, "t1", task_payload("t1", "b"), 5_000)
        .await;

    a.sync().await;
    b.sync().await;
    a.sync().await;

    // "client-b" > "client-a": B's edit wins on both.
    assert_eq!(a.snapshot().await.tasks["t1"].title, "b");
    assert_eq!(b.snapshot().await.tasks["t1"].title, "b");
}

#[tokio::test]
async fn s3_late_joiner_snapshot_keeps_concurrent_peer_op() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "A");
    let c = TestClient::new(&hub, "C");

    // Snapshot of an established A/B universe at {A:5, B:3}.
    let snapshot_state = {
        let mut state = AppState::default();
        state.tasks.insert(
            "t-base".to_string(),
            crate::domain::Task {
                id: "t-base".to_string(),
                title: "base".to_string(),
                ..Default::default()
            },
        );
        serde_json::to_value(&state).expect("serialize snapshot state")
    };
    let snapshot_clock: VectorClock = [("A".to_string(), 5_u64), ("B".to_string(), 3_u64)]
        .into_iter()
        .collect();
    let snapshot = OpFactory::new("B").sync_import(snapshot_clock, snapshot_state);
    hub.set_snapshot(snapshot);

    // A worked offline past the snapshot: local clock {A:6}.
    let factory = OpFactory::new("A");
    let mut offline_op = factory
        .lww_update(
            a.store.as_ref(),
            EntityKind::Task,
            "t-a",
            task_payload("t-a", "from A"),
        )
        .expect("offline op");
    offline_op.vector_clock = {
        let mut clock = VectorClock::new();
        clock.set("A", 6);
        clock
    };
    a.store.append(&offline_op).expect("append offline op");
    {
        let mut state = a.state.lock().await;
        MergeResolver::new(&factory, a.store.as_ref())
            .apply_batch(&mut state, std::slice::from_ref(&offline_op))
            .expect("apply offline op");
    }

    // C joins fresh, bootstraps from the snapshot, then edits.
    c.sync().await;
    assert!(c.snapshot().await.tasks.contains_key("t-base"));
    let c_op = c
        .edit(EntityKind::Task, "t-c", task_payload("t-c", "from C"))
        .await;
    assert_eq!(c_op.vector_clock.get("A"), 5);
    assert_eq!(c_op.vector_clock.get("B"), 3);
    assert_eq!(c_op.vector_clock.get(&c.engine.client_id()), 1);
    c.sync().await;

    // A syncs: the snapshot must not erase A's concurrent offline op.
    a.sync().await;
    c.sync().await;

    let a_state = a.snapshot().await;
    let c_state = c.snapshot().await;
    assert!(a_state.tasks.contains_key("t-a"), "A's offline op survived");
    assert!(a_state.tasks.contains_key("t-c"));
    assert!(c_state.tasks.contains_key("t-a"));
    assert!(c_state.tasks.contains_key("t-c"));
}

#[tokio::test]
async fn s4_tag_delete_cascades_on_both_clients() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "client-a");
    let b = TestClient::new(&hub, "client-b");

    a.edit(
        EntityKind::Tag,
        "tag1",
        serde_json::json!({ "id": "tag1", "title": "urgent", "taskIds": ["task-1"] }),
    )
    .await;
    a.edit(
        EntityKind::Task,
        "task-1",
        serde_json::json!({ "id": "task-1", "title": "x", "tagIds": ["tag1"] }),
    )
    .await;
    a.sync().await;
    b.sync().await;
    assert_eq!(b.snapshot().await.tasks["task-1"].tag_ids, vec!["tag1"]);

    a.engine
        .record_local_delete(EntityKind::Tag, "tag1")
        .await
        .expect("delete tag");
    a.sync().await;
    b.sync().await;

    for state in [a.snapshot().await, b.snapshot().await] {
        assert!(!state.tags.contains_key("tag1"));
        assert!(state.tasks["task-1"].tag_ids.is_empty());
    }
}

#[tokio::test]
async fn s6_fresh_client_dedups_snapshot_ops() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "client-a");

    for i in 1..=3 {
        a.edit(
            EntityKind::Task,
            &format!("t{}", i),
            task_payload(&format!("t{}", i), "task"),
        )
        .await;
    }
    a.sync().await;

    let b = TestClient::new(&hub, "client-b");
    let first = b.sync().await;
    assert_eq!(first.pulled_count, 3);

    let second = b.sync().await;
    assert_eq!(second.pulled_count, 0, "second sync must not re-apply");

    b.edit(EntityKind::Task, "t4", task_payload("t4", "new")).await;
    b.sync().await;
    a.sync().await;

    let a_state = a.snapshot().await;
    assert_eq!(a_state.tasks.len(), 4);
    assert_eq!(a_state, b.snapshot().await);
    assert_eq!(hub.op_count(), 4);
}

#[tokio::test]
async fn piggybacked_ops_are_applied_and_recorded() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "client-a");

    // A concurrent writer lands an op between A's download and upload.
    let racer = OpFactory::new("client-x");
    let racer_store = InMemoryOpLog::new();
    let racer_op = racer
        .lww_update(
            &racer_store,
            EntityKind::Task,
            "t-race",
            task_payload("t-race", "raced in"),
        )
        .expect("racer op");
    hub.inject_on_next_upload(racer_op.clone());

    a.edit(EntityKind::Task, "t1", task_payload("t1", "mine")).await;
    let result = a.sync().await;

    assert_eq!(result.piggybacked_count, 1);
    assert!(a.snapshot().await.tasks.contains_key("t-race"));
    // Piggybacked ops count as applied-remote so the next download skips
    // them.
    assert!(a.store.has_applied(&racer_op.id).expect("has applied"));
    // Piggyback means state may have moved: not advertised as in-sync.
    assert_eq!(a.engine.status(), SyncStatus::Unknown);

    let next = a.sync().await;
    assert_eq!(next.pulled_count, 0);
    assert_eq!(a.engine.status(), SyncStatus::InSync);
}

#[tokio::test]
async fn cursor_regression_does_not_double_apply() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "client-a");
    let b = TestClient::new(&hub, "client-b");

    a.edit(EntityKind::Task, "t1", task_payload("t1", "x")).await;
    a.edit(EntityKind::Task, "t2", task_payload("t2", "y")).await;
    a.sync().await;
    b.sync().await;
    let before = b.snapshot().await;

    // Crash between apply and cursor flush: cursor regresses, ops do not.
    b.store
        .set_cursor(&SyncCursor::initial(CursorKind::ServerSeq))
        .expect("reset cursor");
    let redo = b.sync().await;
    assert_eq!(redo.pulled_count, 0);
    assert_eq!(b.snapshot().await, before);
}

#[tokio::test]
async fn convergence_under_permutation_and_duplicates() {
    let factory_a = OpFactory::new("client-a");
    let factory_b = OpFactory::new("client-b");
    let scratch = InMemoryOpLog::new();

    let mut ops = Vec::new();
    let mut op = factory_a
        .lww_update(&scratch, EntityKind::Task, "t1", task_payload("t1", "v1"))
        .expect("op1");
    op.timestamp = 100;
    scratch.append(&op).expect("append");
    ops.push(op);

    let mut op = factory_b
        .lww_update(&scratch, EntityKind::Task, "t1", task_payload("t1", "v2"))
        .expect("op2");
    op.timestamp = 200;
    scratch.append(&op).expect("append");
    ops.push(op);

    let mut op = factory_a
        .lww_update(&scratch, EntityKind::Project, "p1", serde_json::json!({ "id": "p1", "title": "proj" }))
        .expect("op3");
    op.timestamp = 150;
    scratch.append(&op).expect("append");
    ops.push(op);

    let apply_all = |sequence: Vec<SyncOp>| {
        let store = InMemoryOpLog::new();
        let factory = OpFactory::new("observer");
        let resolver = MergeResolver::new(&factory, &store);
        let mut state = AppState::default();
        resolver.apply_batch(&mut state, &sequence).expect("apply");
        state
    };

    let forward = apply_all(ops.clone());
    let mut shuffled = ops.clone();
    shuffled.reverse();
    shuffled.extend(ops.clone()); // duplicates on top
    let backward = apply_all(shuffled);

    assert_eq!(forward, backward);
    assert_eq!(forward.tasks["t1"].title, "v2");
}

#[tokio::test]
async fn unexplained_remote_divergence_raises_conflict() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "client-a");

    a.edit(EntityKind::Task, "t1", task_payload("t1", "mine")).await;
    hub.bump_clock("client-ghost", 5);

    let err = a
        .engine
        .trigger_sync()
        .await
        .expect_err("divergence must surface");
    match err {
        crate::errors::SyncError::LocalDataConflict {
            remote_clock,
            unsynced_count,
            ..
        } => {
            assert_eq!(remote_clock.get("client-ghost"), 5);
            assert_eq!(unsynced_count, 1);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(a.engine.status(), SyncStatus::Error);
    // Nothing was uploaded or marked synced.
    assert_eq!(a.store.get_unsynced().expect("unsynced").len(), 1);
}

#[tokio::test]
async fn use_local_resolution_dominates_remote_clock() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "client-a");

    a.edit(EntityKind::Task, "t1", task_payload("t1", "mine")).await;
    hub.bump_clock("client-ghost", 5);

    let remote_clock = match a.engine.trigger_sync().await {
        Err(crate::errors::SyncError::LocalDataConflict { remote_clock, .. }) => remote_clock,
        other => panic!("expected conflict, got {:?}", other),
    };

    a.engine
        .resolve_conflict(
            crate::sync::engine::ConflictChoice::UseLocal,
            Some(&remote_clock),
        )
        .await
        .expect("resolve");

    // The uploaded import overrules the diverged remote history.
    let snapshot = hub
        .inner
        .lock()
        .expect("hub lock")
        .snapshot
        .clone()
        .expect("snapshot uploaded");
    assert_eq!(snapshot.vector_clock.get("client-ghost"), 5);
    assert!(snapshot.vector_clock.get("client-a") >= 2);
    assert!(a.store.get_unsynced().expect("unsynced").is_empty());
}

#[tokio::test]
async fn use_remote_resolution_discards_local_and_rebootstraps() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "client-a");
    let b = TestClient::new(&hub, "client-b");

    a.edit(EntityKind::Task, "t-a", task_payload("t-a", "from A")).await;
    a.sync().await;

    b.edit(EntityKind::Task, "t-b", task_payload("t-b", "from B")).await;
    b.engine
        .resolve_conflict(crate::sync::engine::ConflictChoice::UseRemote, None)
        .await
        .expect("resolve");

    assert!(b.store.get_unsynced().expect("unsynced").is_empty());
    b.sync().await;
    let state = b.snapshot().await;
    assert!(state.tasks.contains_key("t-a"));
    assert!(!state.tasks.contains_key("t-b"));
}

#[tokio::test]
async fn clean_slate_replaces_client_id_and_remote_state() {
    let hub = Hub::new();
    let a = TestClient::new(&hub, "client-a");
    a.edit(EntityKind::Task, "t1", task_payload("t1", "x")).await;
    a.sync().await;
    assert_eq!(hub.op_count(), 1);

    let old_id = a.engine.client_id();
    a.engine.clean_slate().await.expect("clean slate");
    let new_id = a.engine.client_id();
    assert_ne!(old_id, new_id);
    assert_eq!(hub.op_count(), 0, "server-side wipe");

    // A fresh client bootstraps from the uploaded snapshot.
    let b = TestClient::new(&hub, "client-b");
    b.sync().await;
    assert_eq!(b.snapshot().await.tasks["t1"].title, "x");
}
