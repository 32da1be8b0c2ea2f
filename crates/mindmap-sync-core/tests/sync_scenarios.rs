//! End-to-end sync scenarios against the in-memory remote.
//!
//! Timestamps come from a shared ManualClock; tests that depend on backoff,
//! latency or rate-limit windows run on tokio's paused clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mindmap_sync_core::mutators::find_node;
use mindmap_sync_core::remote::RemoteCall;
use mindmap_sync_core::{
    CurrentUser, Document, InMemoryRemote, ManualClock, MemoryBackend, Node, NodePatch,
    OperationKind, OperationPayload, OperationStatus, RemoteError, StaticTokenAuth, SyncConfig,
    SyncEngine, SyncEvent, SyncOutcome, SyncReport, SyncStatus,
};
use mindmap_sync_core::{Collection, StorageBackend, StoreError};
use tokio::time::Instant;

type Engine = SyncEngine<Arc<MemoryBackend>, Arc<InMemoryRemote>>;

struct Harness {
    clock: Arc<ManualClock>,
    remote: Arc<InMemoryRemote>,
    engine: Engine,
}

async fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(1_000));
    let remote = Arc::new(InMemoryRemote::new(clock.clone()));
    let auth = Arc::new(StaticTokenAuth::new(
        Some("token".into()),
        Some(CurrentUser {
            id: "u1".into(),
            email: "u1@example.com".into(),
        }),
    ));
    let engine = SyncEngine::open(
        Arc::new(MemoryBackend::new()),
        Arc::clone(&remote),
        auth,
        clock.clone(),
        SyncConfig::default(),
    )
    .await
    .unwrap();
    Harness {
        clock,
        remote,
        engine,
    }
}

fn sample(id: &str, title: &str, last_modified: u64) -> Document {
    let mut document = Document::new(id, title, "u1").with_root(
        Node::new("r", title)
            .with_child(Node::new("n1", "one"))
            .with_child(Node::new("n2", "two")),
    );
    document.last_modified = last_modified;
    document
}

/// Place a document on the remote and an identical synced copy locally.
async fn seed_synced(h: &Harness, document: Document) {
    h.remote.seed(document.clone(), Some("other-client"));
    h.engine.store().put_synced(document).await.unwrap();
}

fn text_of(document: &Document, node_id: &str) -> Option<String> {
    find_node(&document.root_node, node_id).map(|n| n.text.clone())
}

fn completed(outcome: SyncOutcome) -> SyncReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected a completed cycle, got {:?}", other),
    }
}

fn applied_kinds(remote: &InMemoryRemote) -> Vec<(OperationKind, Option<String>)> {
    remote
        .applied()
        .into_iter()
        .filter_map(|call| match call {
            RemoteCall::Apply { kind, node_id, .. } => Some((kind, node_id)),
            _ => None,
        })
        .collect()
}

fn record_events(engine: &Engine) -> (Arc<Mutex<Vec<SyncEvent>>>, mindmap_sync_core::Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let subscription = engine.subscribe(move |event| sink.lock().unwrap().push(event));
    (events, subscription)
}

#[tokio::test]
async fn offline_edit_is_kept_and_pushed_once_after_reconnect() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;

    h.remote.set_offline(true);
    h.engine.start_edit("d1", "n1").await.unwrap();
    h.clock.advance(100);
    h.engine.finish_edit("n1", "hello").await.unwrap();

    let local = h.engine.store().get("d1").await.unwrap();
    assert_eq!(text_of(&local, "n1").as_deref(), Some("hello"));
    let ops = h.engine.queue().all().await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind(), OperationKind::UpdateNode);
    assert_eq!(ops[0].node_id(), Some("n1"));
    assert!(h.remote.applied().is_empty());

    h.remote.set_offline(false);
    h.clock.advance(100);
    let report = completed(h.engine.sync().await.unwrap());

    assert_eq!(report.pushed, 1);
    assert!(h.engine.queue().all().await.unwrap().is_empty());
    assert_eq!(
        applied_kinds(&h.remote),
        vec![(OperationKind::UpdateNode, Some("n1".to_string()))]
    );
    assert_eq!(text_of(&h.remote.document("d1").unwrap(), "n1").as_deref(), Some("hello"));

    let local = h.engine.store().get("d1").await.unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(text_of(&local, "n1").as_deref(), Some("hello"));
    assert!(h.engine.last_sync_at().await.unwrap().is_some());
}

#[tokio::test]
async fn pull_is_deferred_while_a_node_is_edited() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;

    h.engine.start_edit("d1", "n1").await.unwrap();
    h.engine.update_edit("n1", "min");

    h.clock.set(2_000);
    let mut theirs = sample("d1", "Theirs", 2_000);
    theirs.root_node.children[0].text = "theirs".into();
    h.remote.seed(theirs, Some("other-client"));

    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.deferred, 1);
    assert_eq!(report.pulled, 0);
    let local = h.engine.store().get("d1").await.unwrap();
    assert_eq!(text_of(&local, "n1").as_deref(), Some("one"));
    assert_eq!(local.title, "Doc");
    assert_eq!(local.sync_status, SyncStatus::Conflict);

    h.engine.finish_edit("n1", "mine").await.unwrap();
    h.clock.advance(10);
    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.pushed, 1);
    assert_eq!(report.pulled, 1);

    let local = h.engine.store().get("d1").await.unwrap();
    assert_eq!(text_of(&local, "n1").as_deref(), Some("mine"));
    assert_eq!(local.title, "Theirs");
    assert_eq!(local.sync_status, SyncStatus::Synced);
}

#[tokio::test(start_paused = true)]
async fn edit_started_during_fetch_still_blocks_the_write() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;
    let mut theirs = sample("d1", "Theirs", 2_000);
    theirs.root_node.children[0].text = "theirs".into();
    h.remote.seed(theirs, Some("other-client"));
    h.remote.set_latency(Some(Duration::from_millis(100)));

    let edit = async {
        // Lands after the list call, while the document fetch is in flight.
        tokio::time::sleep(Duration::from_millis(150)).await;
        h.engine.start_edit("d1", "n1").await.unwrap()
    };
    let (outcome, _) = tokio::join!(h.engine.sync(), edit);

    let report = completed(outcome.unwrap());
    assert_eq!(report.deferred, 1);
    let local = h.engine.store().get("d1").await.unwrap();
    assert_eq!(text_of(&local, "n1").as_deref(), Some("one"));
    assert!(h.remote.calls().contains(&RemoteCall::Get("d1".into())));
}

/// Memory backend whose reads and writes take a while, so sync and UI calls
/// interleave at every store access.
struct SlowBackend {
    inner: MemoryBackend,
    delay: Duration,
}

#[async_trait]
impl StorageBackend for SlowBackend {
    async fn read(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.read(collection, key).await
    }

    async fn write(&self, collection: Collection, key: &str, value: &[u8]) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.write(collection, key, value).await
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(collection, key).await
    }

    async fn keys(&self, collection: Collection) -> Result<Vec<String>, StoreError> {
        self.inner.keys(collection).await
    }
}

#[tokio::test(start_paused = true)]
async fn edit_started_while_a_pull_is_applied_keeps_its_text() {
    let clock = Arc::new(ManualClock::new(1_000));
    let remote = Arc::new(InMemoryRemote::new(clock.clone()));
    let auth = Arc::new(StaticTokenAuth::new(Some("token".into()), None));
    let backend = SlowBackend {
        inner: MemoryBackend::new(),
        delay: Duration::from_millis(50),
    };
    let engine = SyncEngine::open(backend, Arc::clone(&remote), auth, clock.clone(), SyncConfig::default())
        .await
        .unwrap();

    let ours = sample("d1", "Doc", 1_000);
    engine.store().put_synced(ours).await.unwrap();
    let mut theirs = sample("d1", "Theirs", 2_000);
    theirs.root_node.children[0].text = "theirs".into();
    remote.seed(theirs, Some("other-client"));
    remote.set_latency(Some(Duration::from_millis(100)));

    for start_after in [210, 260, 310, 360] {
        let edit = async {
            tokio::time::sleep(Duration::from_millis(start_after)).await;
            engine.start_edit("d1", "n1").await.unwrap()
        };
        let (outcome, session) = tokio::join!(engine.sync(), edit);
        completed(outcome.unwrap());

        // Whatever the interleaving, the session starts from the text the
        // store holds and no pulled copy replaces it afterwards.
        let local = engine.store().get("d1").await.unwrap();
        assert!(engine.is_editing(Some("n1")));
        assert_eq!(text_of(&local, "n1"), Some(session.original_value.clone()));
        assert_eq!(engine.cancel_edit("n1"), Some(session.original_value));

        // Reset for the next interleaving.
        engine.store().put_synced(sample("d1", "Doc", 1_000)).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_sync_requests_run_one_cycle() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;
    h.engine
        .update_node("d1", "n1", NodePatch::text("x"))
        .await
        .unwrap();
    h.remote.set_latency(Some(Duration::from_millis(100)));

    let (a, b) = tokio::join!(h.engine.sync(), h.engine.sync());
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == SyncOutcome::AlreadyRunning)
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, SyncOutcome::Completed(_)))
            .count(),
        1
    );
    assert_eq!(h.remote.applied().len(), 1);
    assert!(!h.engine.is_syncing());
}

#[tokio::test]
async fn operations_on_one_document_are_pushed_in_enqueue_order() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;

    h.engine.update_node("d1", "n1", NodePatch::text("a")).await.unwrap();
    h.engine.update_node("d1", "n2", NodePatch::text("b")).await.unwrap();
    h.engine.update_node("d1", "n1", NodePatch::text("c")).await.unwrap();
    assert_eq!(h.engine.queue().all().await.unwrap().len(), 3);

    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.pushed, 3);
    assert!(h.engine.queue().all().await.unwrap().is_empty());
    assert_eq!(
        applied_kinds(&h.remote),
        vec![
            (OperationKind::UpdateNode, Some("n1".to_string())),
            (OperationKind::UpdateNode, Some("n2".to_string())),
            (OperationKind::UpdateNode, Some("n1".to_string())),
        ]
    );
    assert_eq!(text_of(&h.remote.document("d1").unwrap(), "n1").as_deref(), Some("c"));
}

#[tokio::test(start_paused = true)]
async fn documents_are_pushed_concurrently() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "One", 1_000)).await;
    seed_synced(&h, sample("d2", "Two", 1_000)).await;
    h.engine.update_node("d1", "n1", NodePatch::text("a")).await.unwrap();
    h.engine.update_node("d2", "n1", NodePatch::text("b")).await.unwrap();
    h.remote.set_latency(Some(Duration::from_millis(100)));

    let start = Instant::now();
    let report = completed(h.engine.sync().await.unwrap());

    assert_eq!(report.pushed, 2);
    // One round of pushes plus the list call.
    assert!(start.elapsed() < Duration::from_millis(300));
}

#[tokio::test]
async fn id_collision_is_resolved_with_a_fresh_id() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;
    let node = h
        .engine
        .insert_node("d1", "root", Node::new("dup", "new idea"))
        .await
        .unwrap();
    assert_eq!(node.id, "dup");

    for _ in 0..2 {
        h.remote.fail_next_kind(
            OperationKind::CreateNode,
            RemoteError::IdCollision("UNIQUE constraint failed: nodes.id".into()),
        );
    }

    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.pushed, 1);
    assert_eq!(report.failed, 0);

    let attempts: Vec<String> = applied_kinds(&h.remote)
        .into_iter()
        .map(|(kind, node_id)| {
            assert_eq!(kind, OperationKind::CreateNode);
            node_id.unwrap()
        })
        .collect();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0], "dup");
    assert_ne!(attempts[1], attempts[0]);
    assert_ne!(attempts[2], attempts[1]);

    let final_id = &attempts[2];
    let local = h.engine.store().get("d1").await.unwrap();
    assert_eq!(text_of(&local, final_id).as_deref(), Some("new idea"));
    assert!(find_node(&local.root_node, "dup").is_none());
    assert!(find_node(&h.remote.document("d1").unwrap().root_node, final_id).is_some());
    assert!(h.engine.queue().all().await.unwrap().is_empty());
}

#[tokio::test]
async fn newer_remote_document_wins() {
    let h = harness().await;
    h.engine
        .store()
        .put_raw(&sample("d1", "Local title", 100))
        .await
        .unwrap();
    h.engine
        .queue()
        .enqueue(
            "d1",
            OperationPayload::UpdateNode {
                node_id: "n1".into(),
                patch: NodePatch::text("superseded"),
            },
        )
        .await
        .unwrap();
    h.remote.seed(sample("d1", "Remote title", 200), Some("other-client"));

    let report = completed(h.engine.pull().await.unwrap());

    assert_eq!(report.pulled, 1);
    let local = h.engine.store().get("d1").await.unwrap();
    assert_eq!(local.title, "Remote title");
    assert_eq!(local.last_modified, 200);
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert!(h.engine.queue().all().await.unwrap().is_empty());
}

#[tokio::test]
async fn newer_local_document_is_kept() {
    let h = harness().await;
    h.engine
        .store()
        .put_raw(&sample("d1", "Local title", 200))
        .await
        .unwrap();
    h.remote.seed(sample("d1", "Remote title", 100), Some("other-client"));

    let report = completed(h.engine.pull().await.unwrap());

    assert_eq!(report.pulled, 0);
    let local = h.engine.store().get("d1").await.unwrap();
    assert_eq!(local.title, "Local title");
    assert_eq!(local.last_modified, 200);
    assert!(!h.remote.calls().contains(&RemoteCall::Get("d1".into())));
}

#[tokio::test(start_paused = true)]
async fn rate_limit_suspends_pushes_without_spending_retries() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;
    h.engine.update_node("d1", "n1", NodePatch::text("a")).await.unwrap();
    h.engine.update_node("d1", "n2", NodePatch::text("b")).await.unwrap();
    let (events, _subscription) = record_events(&h.engine);

    h.remote.fail_next(RemoteError::RateLimited(Duration::from_secs(5)));
    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.pushed, 0);
    assert!(report.rate_limited);
    assert_eq!(h.remote.applied().len(), 1);
    for op in h.engine.queue().all().await.unwrap() {
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
    }

    let report = completed(h.engine.sync().await.unwrap());
    assert!(report.rate_limited);
    assert_eq!(h.remote.applied().len(), 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.pushed, 2);
    assert!(!report.rate_limited);
    assert_eq!(h.remote.applied().len(), 3);

    assert!(events
        .lock()
        .unwrap()
        .contains(&SyncEvent::RateLimited { retry_after_ms: 5_000 }));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_then_succeed() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;
    h.engine.update_node("d1", "n1", NodePatch::text("a")).await.unwrap();

    h.remote.fail_next(RemoteError::Server {
        status: 503,
        message: "unavailable".into(),
    });
    h.remote.fail_next(RemoteError::Timeout);

    let start = Instant::now();
    let report = completed(h.engine.sync().await.unwrap());

    assert_eq!(report.pushed, 1);
    assert_eq!(h.remote.applied().len(), 3);
    // 1s after the first failure, 2s after the second.
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert!(h.engine.queue().all().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_park_the_operation_until_manual_retry() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;
    h.engine.update_node("d1", "n1", NodePatch::text("a")).await.unwrap();
    h.engine.update_node("d1", "n2", NodePatch::text("b")).await.unwrap();
    for _ in 0..3 {
        h.remote.fail_next(RemoteError::Network("connection reset".into()));
    }

    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.failed, 1);
    assert_eq!(report.pushed, 0);

    let ops = h.engine.queue().all().await.unwrap();
    assert_eq!(ops[0].status, OperationStatus::Failed);
    assert_eq!(ops[0].retry_count, 3);
    assert_eq!(ops[1].status, OperationStatus::Pending);
    assert_eq!(
        h.engine.store().get("d1").await.unwrap().sync_status,
        SyncStatus::Error
    );

    assert_eq!(h.engine.retry_failed().await.unwrap(), 1);
    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.pushed, 2);
    assert!(h.engine.queue().all().await.unwrap().is_empty());
}

#[tokio::test]
async fn validation_errors_are_parked_without_retry() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;
    h.engine.update_node("d1", "n1", NodePatch::text("a")).await.unwrap();
    h.engine.update_node("d1", "n2", NodePatch::text("b")).await.unwrap();
    let (events, _subscription) = record_events(&h.engine);

    h.remote.fail_next(RemoteError::Rejected {
        status: 422,
        message: "text too long".into(),
    });
    let report = completed(h.engine.sync().await.unwrap());

    assert_eq!(report.failed, 1);
    assert_eq!(report.pushed, 1);
    assert_eq!(h.remote.applied().len(), 2);

    let ops = h.engine.queue().all().await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, OperationStatus::Failed);
    assert_eq!(ops[0].retry_count, 0);
    assert!(ops[0].last_error.as_deref().unwrap().contains("text too long"));
    assert_eq!(
        h.engine.store().get("d1").await.unwrap().sync_status,
        SyncStatus::Error
    );

    let failed = events.lock().unwrap().iter().any(|e| {
        matches!(e, SyncEvent::OperationFailed { node_id: Some(n), kind, .. } if n == "n1" && kind == "update_node")
    });
    assert!(failed);
}

#[tokio::test]
async fn missing_parent_triggers_document_resync() {
    let h = harness().await;
    h.engine
        .store()
        .put_synced(sample("d1", "Doc", 1_000))
        .await
        .unwrap();
    h.engine
        .insert_node("d1", "n1", Node::new("c1", "child"))
        .await
        .unwrap();

    let report = completed(h.engine.sync().await.unwrap());

    assert_eq!(report.pushed, 1);
    assert_eq!(
        applied_kinds(&h.remote)
            .into_iter()
            .map(|(kind, _)| kind)
            .collect::<Vec<_>>(),
        vec![
            OperationKind::CreateNode,
            OperationKind::UpdateDoc,
            OperationKind::CreateDoc
        ]
    );
    let remote = h.remote.document("d1").unwrap();
    assert_eq!(text_of(&remote, "c1").as_deref(), Some("child"));
    assert!(h.engine.queue().all().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_parent_node_is_recovered_by_pushing_the_document() {
    let h = harness().await;
    h.engine
        .store()
        .put_synced(sample("d1", "Doc", 1_000))
        .await
        .unwrap();
    // The remote never received n2.
    let mut behind = sample("d1", "Doc", 1_000);
    behind.root_node.children.pop();
    h.remote.seed(behind, Some("other-client"));

    h.engine
        .insert_node("d1", "n2", Node::new("c1", "child"))
        .await
        .unwrap();
    let report = completed(h.engine.sync().await.unwrap());

    assert_eq!(report.pushed, 1);
    assert_eq!(
        applied_kinds(&h.remote)
            .into_iter()
            .map(|(kind, _)| kind)
            .collect::<Vec<_>>(),
        vec![OperationKind::CreateNode, OperationKind::UpdateDoc]
    );
    let remote = h.remote.document("d1").unwrap();
    assert_eq!(text_of(&remote, "n2").as_deref(), Some("two"));
    assert_eq!(text_of(&remote, "c1").as_deref(), Some("child"));
}

#[tokio::test]
async fn remotely_deleted_synced_documents_are_removed_locally() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Gone", 1_000)).await;
    seed_synced(&h, sample("d2", "Kept", 1_000)).await;
    // Synced once, deleted remotely, but edited locally since.
    seed_synced(&h, sample("d3", "Edited", 1_000)).await;
    h.engine.update_node("d3", "n1", NodePatch::text("local")).await.unwrap();
    let draft = h.engine.create_document("Draft", "u1").await.unwrap();

    h.remote.remove("d1");
    h.remote.remove("d3");
    let report = completed(h.engine.pull().await.unwrap());

    assert_eq!(report.removed, 1);
    assert!(h.engine.store().find("d1").await.unwrap().is_none());
    assert!(h.engine.store().find("d2").await.unwrap().is_some());
    assert!(h.engine.store().find("d3").await.unwrap().is_some());
    assert!(h.engine.store().find(&draft.id).await.unwrap().is_some());
}

#[tokio::test]
async fn own_writes_are_not_fetched_back() {
    let h = harness().await;
    let (events, _subscription) = record_events(&h.engine);
    let document = h.engine.create_document("Mine", "u1").await.unwrap();

    h.clock.advance(50);
    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.pushed, 1);
    assert_eq!(report.pulled, 0);
    assert!(!h.remote.calls().contains(&RemoteCall::Get(document.id.clone())));

    let mut edited = h.remote.document(&document.id).unwrap();
    edited.title = "Renamed elsewhere".into();
    edited.last_modified = 5_000;
    h.remote.seed(edited, Some("other-client"));

    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.pulled, 1);
    assert_eq!(
        h.engine.store().get(&document.id).await.unwrap().title,
        "Renamed elsewhere"
    );

    let events = events.lock().unwrap();
    assert!(matches!(events.first(), Some(SyncEvent::Started { .. })));
    assert!(matches!(events.last(), Some(SyncEvent::Completed { pulled: 1, .. })));
}

#[tokio::test]
async fn deletes_of_missing_targets_succeed() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;

    h.engine.delete_node("d1", "n2").await.unwrap();
    h.remote
        .fail_next_kind(OperationKind::DeleteNode, RemoteError::NotFound("n2".into()));
    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.pushed, 1);
    assert_eq!(report.failed, 0);

    h.engine.delete_document("d1").await.unwrap();
    h.remote.remove("d1");
    let report = completed(h.engine.sync().await.unwrap());
    assert_eq!(report.pushed, 1);
    assert!(h.engine.queue().all().await.unwrap().is_empty());
    assert!(h.engine.store().find("d1").await.unwrap().is_none());
}

#[tokio::test]
async fn stale_operations_expire_instead_of_pushing() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;
    h.engine.update_node("d1", "n1", NodePatch::text("old")).await.unwrap();

    h.clock.advance(6 * 60 * 1000);
    let report = completed(h.engine.sync().await.unwrap());

    assert_eq!(report.expired, 1);
    assert_eq!(report.pushed, 0);
    assert!(h.remote.applied().is_empty());
}

#[tokio::test(start_paused = true)]
async fn debounced_snapshots_wait_for_quiet_and_for_edits_to_end() {
    let h = harness().await;
    seed_synced(&h, sample("d1", "Doc", 1_000)).await;
    let mut snapshot = h.engine.store().get("d1").await.unwrap();

    snapshot.title = "T".into();
    h.engine.request_save(snapshot.clone());
    tokio::time::advance(Duration::from_secs(1)).await;
    snapshot.title = "Title".into();
    h.engine.request_save(snapshot.clone());
    tokio::time::advance(Duration::from_millis(1500)).await;
    assert_eq!(h.engine.flush_saves().await.unwrap(), 0);

    h.engine.start_edit("d1", "n1").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(h.engine.flush_saves().await.unwrap(), 0);

    h.engine.cancel_edit("n1");
    assert_eq!(h.engine.flush_saves().await.unwrap(), 1);
    assert_eq!(h.engine.store().get("d1").await.unwrap().title, "Title");

    let ops = h.engine.queue().all().await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind(), OperationKind::UpdateDoc);
}

#[tokio::test]
async fn interrupted_operations_are_recovered_on_open() {
    let clock = Arc::new(ManualClock::new(1_000));
    let backend = Arc::new(MemoryBackend::new());
    let remote = Arc::new(InMemoryRemote::new(clock.clone()));
    let auth = Arc::new(StaticTokenAuth::new(Some("token".into()), None));

    let first = SyncEngine::open(
        Arc::clone(&backend),
        Arc::clone(&remote),
        auth.clone(),
        clock.clone(),
        SyncConfig::default(),
    )
    .await
    .unwrap();
    let document = first.create_document("Doc", "u1").await.unwrap();
    let op = first.queue().all().await.unwrap().remove(0);
    first.queue().mark_in_flight(&op.id).await.unwrap();
    drop(first);

    let second = SyncEngine::open(backend, remote, auth, clock, SyncConfig::default())
        .await
        .unwrap();
    let ops = second.queue().drain(10).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].document_id, document.id);
}
