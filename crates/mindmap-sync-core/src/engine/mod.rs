//! SyncEngine: the one service object the UI and the daemon talk to.
//!
//! Local mutations land in the Local Store immediately and are recorded as
//! queued intents. A sync cycle then works in two phases:
//!
//! 1. Push: drain the queue and submit each intent to the remote. Documents
//!    are pushed concurrently, operations of one document strictly in order.
//! 2. Pull: list remote documents, fetch the ones newer than the local copy
//!    and replace the local copy (last writer wins per document), unless one
//!    of its nodes is being edited.
//!
//! At most one cycle runs at a time; a second request while a cycle is in
//! flight returns `SyncOutcome::AlreadyRunning` without touching anything.

mod pull;
mod push;

use crate::auth::AuthProvider;
use crate::autosave::SaveDebouncer;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::edit_guard::{EditGuard, EditSession};
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::ids;
use crate::model::{Document, Node, NodePatch, ROOT_ALIAS};
use crate::mutators::{self, TreeError};
use crate::queue::{OperationPayload, OperationQueue};
use crate::remote::{self, RemoteError, RemoteStore};
use crate::store::{LocalStore, META_LAST_SYNC, StorageBackend, StoreError};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Node {node_id} not found in document {document_id}")]
    NodeNotFound {
        document_id: String,
        node_id: String,
    },

    #[error("Node {0} is not being edited")]
    NotEditing(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// What one sync cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Operations the remote acknowledged
    pub pushed: usize,
    /// Operations parked as failed this cycle
    pub failed: usize,
    /// Stale operations dropped before pushing
    pub expired: usize,
    /// Documents replaced by a newer remote copy
    pub pulled: usize,
    /// Newer remote copies held back by an active edit
    pub deferred: usize,
    /// Local documents removed because the remote deleted them
    pub removed: usize,
    /// Remote calls are suspended by a 429
    pub rate_limited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another cycle was in flight; nothing was done.
    AlreadyRunning,
    /// No credentials; nothing was done.
    Unauthenticated,
}

/// Holds the single-flight flag for the lifetime of a cycle.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine<B: StorageBackend, R: RemoteStore> {
    store: Arc<LocalStore<B>>,
    queue: OperationQueue<B>,
    guard: Arc<EditGuard>,
    remote: R,
    auth: Arc<dyn AuthProvider>,
    events: Arc<EventBus>,
    saves: SaveDebouncer,
    config: SyncConfig,
    origin: String,
    /// Documents whose remote copy equals the local one because our last
    /// acknowledged write replaced it whole
    mirrored: Mutex<HashSet<String>>,
    syncing: AtomicBool,
    /// Remote calls are suspended until this instant after a 429
    suspended_until: Mutex<Option<Instant>>,
    /// Serializes read-modify-write cycles on documents between local
    /// mutations and remote-sourced writes
    write_lock: tokio::sync::Mutex<()>,
}

impl<B: StorageBackend, R: RemoteStore> SyncEngine<B, R> {
    /// Build the engine over `backend` and return operations a previous
    /// process left in flight to the queue.
    pub async fn open(
        backend: B,
        remote: R,
        auth: Arc<dyn AuthProvider>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Result<Self> {
        let store = Arc::new(LocalStore::new(backend, Arc::clone(&clock)));
        let queue = OperationQueue::new(Arc::clone(&store), config.retry.max_retries);
        let guard = Arc::new(EditGuard::new(clock));
        let saves = SaveDebouncer::new(config.debounce, Arc::clone(&guard));

        let engine = Self {
            store,
            queue,
            guard,
            remote,
            auth,
            events: Arc::new(EventBus::new()),
            saves,
            origin: config.client_id.to_string(),
            config,
            mirrored: Mutex::new(HashSet::new()),
            syncing: AtomicBool::new(false),
            suspended_until: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        };

        let recovered = engine.queue.recover_in_flight().await?;
        if recovered > 0 {
            info!("Returned {} interrupted operations to the queue", recovered);
        }
        info!("Sync engine ready (client {})", engine.origin);
        Ok(engine)
    }

    pub fn store(&self) -> &LocalStore<B> {
        &self.store
    }

    pub fn queue(&self) -> &OperationQueue<B> {
        &self.queue
    }

    pub fn guard(&self) -> &EditGuard {
        &self.guard
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Subscribe to sync events. Dropping the handle unsubscribes.
    pub fn subscribe(&self, callback: impl Fn(SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    async fn load(&self, document_id: &str) -> Result<Document> {
        self.store
            .find(document_id)
            .await?
            .ok_or_else(|| EngineError::DocumentNotFound(document_id.to_string()))
    }

    /// Run a remote call under the request timeout.
    async fn remote_call<T>(&self, call: impl Future<Output = remote::Result<T>>) -> remote::Result<T> {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    // Local mutations. Each one persists the document, then enqueues a value
    // copy of the intent.

    pub async fn create_document(&self, title: &str, owner_id: &str) -> Result<Document> {
        let _lock = self.write_lock.lock().await;
        let document = Document::new(ids::generate_document_id(), title, owner_id);
        let stored = self.store.put(document).await?;
        self.queue
            .enqueue(
                &stored.id,
                OperationPayload::CreateDoc {
                    document: stored.clone(),
                },
            )
            .await?;
        info!("Created document {} ({})", stored.id, stored.title);
        Ok(stored)
    }

    /// Replace a document's title, settings and tree.
    pub async fn update_document(&self, mut document: Document) -> Result<Document> {
        let _lock = self.write_lock.lock().await;
        let existing = self.load(&document.id).await?;
        mutators::validate(&document.root_node)?;
        document.cloud_version = existing.cloud_version;

        let stored = self.store.put(document).await?;
        self.queue
            .enqueue(
                &stored.id,
                OperationPayload::UpdateDoc {
                    document: stored.clone(),
                },
            )
            .await?;
        Ok(stored)
    }

    /// Delete a document locally and remotely. Unknown ids succeed.
    pub async fn delete_document(&self, document_id: &str) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        if self.store.find(document_id).await?.is_none() {
            debug!("Document {} already deleted", document_id);
            return Ok(());
        }
        self.store.delete(document_id).await?;
        let superseded = self.queue.discard_for_document(document_id).await?;
        self.queue.enqueue(document_id, OperationPayload::DeleteDoc).await?;
        info!(
            "Deleted document {} ({} queued operations superseded)",
            document_id, superseded
        );
        Ok(())
    }

    /// Append `node` under `parent_id` (`"root"` targets the root).
    ///
    /// A missing, reserved or already used node id is replaced with a fresh
    /// one; the inserted node is returned.
    pub async fn insert_node(&self, document_id: &str, parent_id: &str, mut node: Node) -> Result<Node> {
        let _lock = self.write_lock.lock().await;
        let mut document = self.load(document_id).await?;

        if node.id.is_empty()
            || node.id == ROOT_ALIAS
            || mutators::find_node(&document.root_node, &node.id).is_some()
        {
            node.id = ids::generate_unique_node_id(&document.root_node);
        }
        let parent_id = if parent_id == ROOT_ALIAS {
            document.root_id().to_string()
        } else {
            parent_id.to_string()
        };

        if !mutators::insert_node(&mut document.root_node, &parent_id, node.clone())? {
            return Err(EngineError::NodeNotFound {
                document_id: document_id.to_string(),
                node_id: parent_id,
            });
        }
        self.store.put(document).await?;
        self.queue
            .enqueue(
                document_id,
                OperationPayload::CreateNode {
                    parent_id,
                    node: node.clone(),
                },
            )
            .await?;
        Ok(node)
    }

    pub async fn update_node(&self, document_id: &str, node_id: &str, patch: NodePatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let _lock = self.write_lock.lock().await;
        let mut document = self.load(document_id).await?;
        if !mutators::update_node(&mut document.root_node, node_id, &patch) {
            return Err(EngineError::NodeNotFound {
                document_id: document_id.to_string(),
                node_id: node_id.to_string(),
            });
        }
        self.store.put(document).await?;
        self.queue
            .enqueue(
                document_id,
                OperationPayload::UpdateNode {
                    node_id: node_id.to_string(),
                    patch,
                },
            )
            .await?;
        Ok(())
    }

    /// Remove a node and its subtree. Unknown documents and nodes succeed;
    /// the root is an error.
    pub async fn delete_node(&self, document_id: &str, node_id: &str) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let Some(mut document) = self.store.find(document_id).await? else {
            return Ok(());
        };
        let Some(removed) = mutators::delete_node(&mut document.root_node, node_id)? else {
            debug!("Node {} already absent from {}", node_id, document_id);
            return Ok(());
        };
        for id in mutators::node_ids(&removed) {
            self.guard.cancel_edit(&id);
        }
        self.store.put(document).await?;
        self.queue
            .enqueue(
                document_id,
                OperationPayload::DeleteNode {
                    node_id: node_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn move_node(&self, document_id: &str, node_id: &str, new_parent_id: &str) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let mut document = self.load(document_id).await?;
        let new_parent_id = if new_parent_id == ROOT_ALIAS {
            document.root_id().to_string()
        } else {
            new_parent_id.to_string()
        };
        if !mutators::move_node(&mut document.root_node, node_id, &new_parent_id)? {
            return Err(EngineError::NodeNotFound {
                document_id: document_id.to_string(),
                node_id: node_id.to_string(),
            });
        }
        self.store.put(document).await?;
        self.queue
            .enqueue(
                document_id,
                OperationPayload::MoveNode {
                    node_id: node_id.to_string(),
                    new_parent_id,
                },
            )
            .await?;
        Ok(())
    }

    // Edit sessions

    /// Begin protecting a node's text. Starting an edit that is already
    /// active returns the existing session.
    ///
    /// Registration waits for any remote write in progress, so a session
    /// never starts between a pull's protection check and its store write.
    pub async fn start_edit(&self, document_id: &str, node_id: &str) -> Result<EditSession> {
        if let Some(existing) = self.guard.session(node_id) {
            return Ok(existing);
        }
        let _lock = self.write_lock.lock().await;
        let document = self.load(document_id).await?;
        let node = mutators::find_node(&document.root_node, node_id).ok_or_else(|| {
            EngineError::NodeNotFound {
                document_id: document_id.to_string(),
                node_id: node_id.to_string(),
            }
        })?;
        Ok(self.guard.start_edit(document_id, node_id, &node.text))
    }

    pub fn update_edit(&self, node_id: &str, current_value: &str) -> bool {
        self.guard.update_edit(node_id, current_value)
    }

    /// Commit an edit: the text is written locally and queued for the remote.
    ///
    /// This never waits on the network. If persisting fails the session stays
    /// open so the commit can be repeated.
    pub async fn finish_edit(&self, node_id: &str, final_value: &str) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let session = self
            .guard
            .session(node_id)
            .ok_or_else(|| EngineError::NotEditing(node_id.to_string()))?;
        let document_id = session.document_id;

        let Some(mut document) = self.store.find(&document_id).await? else {
            self.guard.cancel_edit(node_id);
            return Err(EngineError::DocumentNotFound(document_id));
        };
        let unchanged = match mutators::find_node(&document.root_node, node_id) {
            Some(node) => node.text == final_value,
            None => {
                self.guard.cancel_edit(node_id);
                return Err(EngineError::NodeNotFound {
                    document_id,
                    node_id: node_id.to_string(),
                });
            }
        };
        if unchanged {
            self.guard.finish_edit(node_id, final_value);
            return Ok(());
        }

        let patch = NodePatch::text(final_value);
        mutators::update_node(&mut document.root_node, node_id, &patch);
        self.store.put(document).await?;
        self.queue
            .enqueue(
                &document_id,
                OperationPayload::UpdateNode {
                    node_id: node_id.to_string(),
                    patch,
                },
            )
            .await?;
        self.guard.finish_edit(node_id, final_value);
        debug!("Committed edit of {} in {}", node_id, document_id);
        Ok(())
    }

    /// Drop an edit. Returns the original text for the UI to restore.
    pub fn cancel_edit(&self, node_id: &str) -> Option<String> {
        self.guard.cancel_edit(node_id)
    }

    pub fn is_editing(&self, node_id: Option<&str>) -> bool {
        self.guard.is_editing(node_id)
    }

    // Snapshot autosave

    /// Hand a UI snapshot to the debouncer.
    pub fn request_save(&self, document: Document) {
        self.saves.request(document);
    }

    pub fn next_save_due(&self) -> Option<Duration> {
        self.saves.next_due_in()
    }

    /// Save every snapshot whose debounce window has passed.
    pub async fn flush_saves(&self) -> Result<usize> {
        let mut saved = 0;
        for document in self.saves.take_due() {
            if self.save_snapshot(document).await?.is_some() {
                saved += 1;
            }
        }
        Ok(saved)
    }

    /// Persist a whole-document snapshot from the UI.
    ///
    /// Text of nodes under edit is taken from the stored copy, never from the
    /// snapshot. Returns `None` when nothing changed or the document no longer
    /// exists locally.
    pub async fn save_snapshot(&self, mut snapshot: Document) -> Result<Option<Document>> {
        let _lock = self.write_lock.lock().await;
        let Some(stored) = self.store.find(&snapshot.id).await? else {
            debug!("Dropping snapshot of unknown document {}", snapshot.id);
            return Ok(None);
        };

        for node_id in self.guard.protected_nodes(&snapshot.id) {
            let current = mutators::find_node(&stored.root_node, &node_id);
            let target = mutators::find_node_mut(&mut snapshot.root_node, &node_id);
            if let (Some(current), Some(target)) = (current, target) {
                target.text = current.text.clone();
            }
        }

        if stored.title == snapshot.title
            && stored.root_node == snapshot.root_node
            && stored.settings == snapshot.settings
        {
            return Ok(None);
        }
        mutators::validate(&snapshot.root_node)?;
        snapshot.cloud_version = stored.cloud_version;

        let saved = self.store.put(snapshot).await?;
        self.queue
            .enqueue(
                &saved.id,
                OperationPayload::UpdateDoc {
                    document: saved.clone(),
                },
            )
            .await?;
        Ok(Some(saved))
    }

    // Sync

    /// Run a full push + pull cycle.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        self.run_cycle(true).await
    }

    /// Run only the pull phase.
    pub async fn pull(&self) -> Result<SyncOutcome> {
        self.run_cycle(false).await
    }

    /// Re-arm parked operations. Returns how many.
    pub async fn retry_failed(&self) -> Result<usize> {
        let rearmed = self.queue.retry_failed().await?;
        if rearmed > 0 {
            info!("Re-armed {} failed operations", rearmed);
        }
        Ok(rearmed)
    }

    /// Time of the last completed cycle, milliseconds since Unix epoch.
    pub async fn last_sync_at(&self) -> Result<Option<u64>> {
        Ok(self
            .store
            .get_meta(META_LAST_SYNC)
            .await?
            .and_then(|v| v.parse().ok()))
    }

    async fn run_cycle(&self, push: bool) -> Result<SyncOutcome> {
        if !self.auth.is_authenticated() {
            debug!("Not authenticated, skipping sync");
            return Ok(SyncOutcome::Unauthenticated);
        }
        let Some(_flight) = FlightGuard::acquire(&self.syncing) else {
            debug!("Sync already in progress");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        self.events.emit(SyncEvent::Started {
            timestamp: self.store.now_ms(),
        });

        let mut report = SyncReport::default();
        let result = async {
            if push {
                self.push_phase(&mut report).await?;
            }
            self.pull_phase(&mut report).await?;
            self.store
                .set_meta(META_LAST_SYNC, &self.store.now_ms().to_string())
                .await?;
            Ok::<_, EngineError>(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(
                    "Sync completed: {} pushed, {} failed, {} expired, {} pulled, {} deferred, {} removed",
                    report.pushed,
                    report.failed,
                    report.expired,
                    report.pulled,
                    report.deferred,
                    report.removed
                );
                self.events.emit(SyncEvent::Completed {
                    pushed: report.pushed,
                    failed: report.failed,
                    pulled: report.pulled,
                    removed: report.removed,
                    timestamp: self.store.now_ms(),
                });
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                error!("Sync failed: {}", e);
                self.events.emit(SyncEvent::Error {
                    message: e.to_string(),
                    timestamp: self.store.now_ms(),
                });
                Err(e)
            }
        }
    }

    fn set_mirrored(&self, document_id: &str, mirrored: bool) {
        let mut set = self.mirrored.lock().unwrap_or_else(|e| e.into_inner());
        if mirrored {
            set.insert(document_id.to_string());
        } else {
            set.remove(document_id);
        }
    }

    fn is_mirrored(&self, document_id: &str) -> bool {
        self.mirrored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(document_id)
    }

    /// Suspend remote calls for `wait`, extending any current suspension.
    fn suspend_for(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut suspended = self.suspended_until.lock().unwrap_or_else(|e| e.into_inner());
        if suspended.is_none_or(|current| current < until) {
            *suspended = Some(until);
        }
    }

    fn suspension_remaining(&self) -> Option<Duration> {
        let suspended = self.suspended_until.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        suspended.and_then(|until| (until > now).then(|| until - now))
    }
}
