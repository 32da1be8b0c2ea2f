//! Operation queue: local intents the remote has not acknowledged yet.
//!
//! Operations are persisted in the local store's operations collection so a
//! restart does not lose them. Payloads are value copies taken at enqueue
//! time; later edits to the document never reach a queued payload.

use crate::model::{Document, Node, NodePatch};
use crate::mutators;
use crate::store::{LocalStore, Result, StorageBackend};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Kind of intent, as the remote API names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateDoc,
    UpdateDoc,
    DeleteDoc,
    CreateNode,
    UpdateNode,
    DeleteNode,
    MoveNode,
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::CreateDoc => "create_doc",
            OperationKind::UpdateDoc => "update_doc",
            OperationKind::DeleteDoc => "delete_doc",
            OperationKind::CreateNode => "create_node",
            OperationKind::UpdateNode => "update_node",
            OperationKind::DeleteNode => "delete_node",
            OperationKind::MoveNode => "move_node",
        };
        f.write_str(name)
    }
}

/// What to tell the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OperationPayload {
    CreateDoc { document: Document },
    UpdateDoc { document: Document },
    DeleteDoc,
    CreateNode { parent_id: String, node: Node },
    UpdateNode { node_id: String, patch: NodePatch },
    DeleteNode { node_id: String },
    MoveNode { node_id: String, new_parent_id: String },
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::CreateDoc { .. } => OperationKind::CreateDoc,
            OperationPayload::UpdateDoc { .. } => OperationKind::UpdateDoc,
            OperationPayload::DeleteDoc => OperationKind::DeleteDoc,
            OperationPayload::CreateNode { .. } => OperationKind::CreateNode,
            OperationPayload::UpdateNode { .. } => OperationKind::UpdateNode,
            OperationPayload::DeleteNode { .. } => OperationKind::DeleteNode,
            OperationPayload::MoveNode { .. } => OperationKind::MoveNode,
        }
    }

    /// Node the operation targets, if it is a node operation.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            OperationPayload::CreateNode { node, .. } => Some(&node.id),
            OperationPayload::UpdateNode { node_id, .. }
            | OperationPayload::DeleteNode { node_id }
            | OperationPayload::MoveNode { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Fold a later payload with the same correlation key into this one.
    /// Returns false when the two cannot be collapsed.
    fn absorb(&mut self, later: &OperationPayload) -> bool {
        match (self, later) {
            (
                OperationPayload::UpdateNode { patch, .. },
                OperationPayload::UpdateNode { patch: newer, .. },
            ) => {
                patch.merge(newer.clone());
                true
            }
            (
                OperationPayload::UpdateDoc { document },
                OperationPayload::UpdateDoc { document: newer },
            ) => {
                *document = newer.clone();
                true
            }
            _ => false,
        }
    }

    fn rewrite_node_id(&mut self, old_id: &str, new_id: &str) {
        let swap = |id: &mut String| {
            if id == old_id {
                *id = new_id.to_string();
            }
        };
        match self {
            OperationPayload::CreateDoc { document } | OperationPayload::UpdateDoc { document } => {
                let _ = mutators::replace_node_id(&mut document.root_node, old_id, new_id);
            }
            OperationPayload::CreateNode { parent_id, node } => {
                swap(parent_id);
                let _ = mutators::replace_node_id(node, old_id, new_id);
            }
            OperationPayload::UpdateNode { node_id, .. } | OperationPayload::DeleteNode { node_id } => {
                swap(node_id);
            }
            OperationPayload::MoveNode {
                node_id,
                new_parent_id,
            } => {
                swap(node_id);
                swap(new_parent_id);
            }
            OperationPayload::DeleteDoc => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// Identifies operations that may be collapsed into one another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub document_id: String,
    pub node_id: Option<String>,
    pub kind: OperationKind,
}

/// A queued intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    pub document_id: String,
    pub payload: OperationPayload,
    /// Milliseconds since Unix epoch
    pub enqueued_at: u64,
    /// Tie-breaker for operations enqueued in the same millisecond
    pub seq: u64,
    pub retry_count: u32,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncOperation {
    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    pub fn node_id(&self) -> Option<&str> {
        self.payload.node_id()
    }

    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey {
            document_id: self.document_id.clone(),
            node_id: self.node_id().map(str::to_string),
            kind: self.kind(),
        }
    }
}

fn fifo(ops: &mut [SyncOperation]) {
    ops.sort_by(|a, b| (a.enqueued_at, a.seq).cmp(&(b.enqueued_at, b.seq)));
}

/// Default number of failed attempts before an operation is parked.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Persistent FIFO of `SyncOperation`s.
pub struct OperationQueue<B: StorageBackend> {
    store: Arc<LocalStore<B>>,
    max_retries: u32,
    /// Serializes read-modify-write cycles on the operations collection
    lock: Mutex<()>,
}

impl<B: StorageBackend> OperationQueue<B> {
    pub fn new(store: Arc<LocalStore<B>>, max_retries: u32) -> Self {
        Self {
            store,
            max_retries,
            lock: Mutex::new(()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Every queued operation, oldest first.
    pub async fn all(&self) -> Result<Vec<SyncOperation>> {
        let mut ops = self.store.operations().await?;
        fifo(&mut ops);
        Ok(ops)
    }

    pub async fn for_document(&self, document_id: &str) -> Result<Vec<SyncOperation>> {
        let mut ops = self.all().await?;
        ops.retain(|op| op.document_id == document_id);
        Ok(ops)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self
            .store
            .operations()
            .await?
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .count())
    }

    /// Append an intent as `pending` with no retries.
    ///
    /// An update to the same node (or document) as the document's most recent
    /// still-pending operation is folded into it instead of appended.
    pub async fn enqueue(&self, document_id: &str, payload: OperationPayload) -> Result<SyncOperation> {
        let _guard = self.lock.lock().await;
        let ops = self.all().await?;

        let latest_for_doc = ops.iter().rev().find(|op| op.document_id == document_id);
        if let Some(latest) = latest_for_doc {
            let same_target = latest.kind() == payload.kind() && latest.node_id() == payload.node_id();
            if latest.status == OperationStatus::Pending && same_target {
                let mut merged = latest.clone();
                if merged.payload.absorb(&payload) {
                    self.store.save_operation(&merged).await?;
                    debug!("Collapsed {} for {} into {}", payload.kind(), document_id, merged.id);
                    return Ok(merged);
                }
            }
        }

        let operation = SyncOperation {
            id: crate::ids::generate_operation_id(),
            document_id: document_id.to_string(),
            payload,
            enqueued_at: self.store.now_ms(),
            seq: ops.iter().map(|op| op.seq).max().map_or(0, |s| s + 1),
            retry_count: 0,
            status: OperationStatus::Pending,
            last_error: None,
        };
        self.store.save_operation(&operation).await?;
        debug!("Enqueued {} {} for {}", operation.kind(), operation.id, document_id);
        Ok(operation)
    }

    /// Up to `batch_size` pending operations, oldest first.
    pub async fn drain(&self, batch_size: usize) -> Result<Vec<SyncOperation>> {
        let mut ops = self.all().await?;
        ops.retain(|op| op.status == OperationStatus::Pending);
        ops.truncate(batch_size);
        Ok(ops)
    }

    async fn update<F>(&self, id: &str, f: F) -> Result<Option<SyncOperation>>
    where
        F: FnOnce(&mut SyncOperation),
    {
        let _guard = self.lock.lock().await;
        match self.store.find_operation(id).await? {
            Some(mut op) => {
                f(&mut op);
                self.store.save_operation(&op).await?;
                Ok(Some(op))
            }
            None => Ok(None),
        }
    }

    pub async fn mark_in_flight(&self, id: &str) -> Result<Option<SyncOperation>> {
        self.update(id, |op| op.status = OperationStatus::InFlight).await
    }

    /// Put an in-flight operation back without counting an attempt.
    pub async fn release(&self, id: &str) -> Result<Option<SyncOperation>> {
        self.update(id, |op| op.status = OperationStatus::Pending).await
    }

    /// The remote acknowledged the operation; forget it.
    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.store.delete_operation(id).await
    }

    /// Count a retryable failure. The operation is parked as `failed` once
    /// `retry_count` reaches the retry limit, otherwise it is pending again.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<Option<SyncOperation>> {
        let max_retries = self.max_retries;
        self.update(id, |op| {
            op.retry_count += 1;
            op.last_error = Some(error.to_string());
            op.status = if op.retry_count >= max_retries {
                OperationStatus::Failed
            } else {
                OperationStatus::Pending
            };
        })
        .await
    }

    /// Park an operation the remote will never accept.
    pub async fn mark_rejected(&self, id: &str, error: &str) -> Result<Option<SyncOperation>> {
        self.update(id, |op| {
            op.last_error = Some(error.to_string());
            op.status = OperationStatus::Failed;
        })
        .await
    }

    /// Replace an operation's payload, e.g. after regenerating an id.
    pub async fn replace_payload(&self, id: &str, payload: OperationPayload) -> Result<Option<SyncOperation>> {
        self.update(id, |op| op.payload = payload).await
    }

    /// Drop operations enqueued more than `max_age` ago, whatever their
    /// status. Returns the dropped operations.
    pub async fn expire_stale(&self, max_age: Duration) -> Result<Vec<SyncOperation>> {
        let _guard = self.lock.lock().await;
        let now = self.store.now_ms();
        let max_age_ms = max_age.as_millis() as u64;

        let mut expired = Vec::new();
        for op in self.all().await? {
            if now.saturating_sub(op.enqueued_at) > max_age_ms {
                self.store.delete_operation(&op.id).await?;
                info!(
                    "Expired stale {} {} for document {} (node {:?})",
                    op.kind(),
                    op.id,
                    op.document_id,
                    op.node_id()
                );
                expired.push(op);
            }
        }
        Ok(expired)
    }

    /// Return operations left in flight by an interrupted process to pending.
    pub async fn recover_in_flight(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut recovered = 0;
        for mut op in self.all().await? {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
                self.store.save_operation(&op).await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Re-arm parked operations for another round of attempts.
    pub async fn retry_failed(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut rearmed = 0;
        for mut op in self.all().await? {
            if op.status == OperationStatus::Failed {
                op.status = OperationStatus::Pending;
                op.retry_count = 0;
                op.last_error = None;
                self.store.save_operation(&op).await?;
                rearmed += 1;
            }
        }
        Ok(rearmed)
    }

    /// Drop every queued operation for a document. Returns how many.
    pub async fn discard_for_document(&self, document_id: &str) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut discarded = 0;
        for op in self.all().await? {
            if op.document_id == document_id {
                self.store.delete_operation(&op.id).await?;
                discarded += 1;
            }
        }
        Ok(discarded)
    }

    /// Point queued intents at a node's replacement id.
    pub async fn rewrite_node_id(&self, document_id: &str, old_id: &str, new_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        for mut op in self.all().await? {
            if op.document_id == document_id {
                let before = op.payload.clone();
                op.payload.rewrite_node_id(old_id, new_id);
                if op.payload != before {
                    self.store.save_operation(&op).await?;
                }
            }
        }
        Ok(())
    }

    /// Point queued intents at a document's replacement id.
    pub async fn rewrite_document_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        for mut op in self.all().await? {
            if op.document_id == old_id {
                op.document_id = new_id.to_string();
                if let OperationPayload::CreateDoc { document } | OperationPayload::UpdateDoc { document } =
                    &mut op.payload
                {
                    document.id = new_id.to_string();
                }
                self.store.save_operation(&op).await?;
            }
        }
        Ok(())
    }
}
