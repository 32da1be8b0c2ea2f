//! Push phase: submit queued operations to the remote.

use super::{Result, SyncEngine, SyncReport};
use crate::events::SyncEvent;
use crate::ids;
use crate::model::{Document, SyncStatus};
use crate::mutators;
use crate::queue::{OperationKind, OperationPayload, OperationStatus, SyncOperation};
use crate::remote::{FailureClass, RemoteError, RemoteStore};
use crate::retry::calculate_backoff;
use crate::store::StorageBackend;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

/// How one operation's push ended.
enum PushResult {
    Acknowledged,
    /// Permanently rejected and parked
    Rejected,
    /// Retries exhausted on transient failures and parked
    GaveUp,
    /// A 429 suspended remote calls; the operation is pending again
    Suspended,
    /// Removed from the queue by someone else while we worked on it
    Vanished,
}

#[derive(Default)]
struct Tally {
    pushed: usize,
    failed: usize,
}

/// Whether a full-document push already carried the operation's effect.
fn already_applied(payload: &OperationPayload, document: &Document) -> bool {
    match payload {
        OperationPayload::CreateNode { node, .. } => {
            mutators::find_node(&document.root_node, &node.id).is_some()
        }
        OperationPayload::MoveNode {
            node_id,
            new_parent_id,
        } => mutators::find_parent(&document.root_node, node_id).is_some_and(|p| p.id == *new_parent_id),
        _ => false,
    }
}

impl<B: StorageBackend, R: RemoteStore> SyncEngine<B, R> {
    pub(super) async fn push_phase(&self, report: &mut SyncReport) -> Result<()> {
        report.expired = self.queue.expire_stale(self.config.stale_after).await?.len();

        if let Some(wait) = self.suspension_remaining() {
            debug!("Pushes suspended for another {:?}", wait);
            report.rate_limited = true;
            return Ok(());
        }

        let batch = self.queue.drain(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(());
        }

        // Same-document operations stay in queue order; documents go in parallel.
        let mut groups: Vec<(String, Vec<SyncOperation>)> = Vec::new();
        for op in batch {
            match groups.iter_mut().find(|(id, _)| *id == op.document_id) {
                Some((_, ops)) => ops.push(op),
                None => groups.push((op.document_id.clone(), vec![op])),
            }
        }
        debug!("Pushing operations for {} documents", groups.len());

        let tallies = join_all(groups.into_iter().map(|(id, ops)| self.push_document(id, ops))).await;
        for tally in tallies {
            let tally = tally?;
            report.pushed += tally.pushed;
            report.failed += tally.failed;
        }
        report.rate_limited = self.suspension_remaining().is_some();
        Ok(())
    }

    async fn push_document(&self, document_id: String, ops: Vec<SyncOperation>) -> Result<Tally> {
        let mut tally = Tally::default();
        let mut document_id = document_id;

        for op in ops {
            if self.suspension_remaining().is_some() {
                break;
            }
            let (result, current_id) = self.push_operation(op).await?;
            document_id = current_id;
            match result {
                PushResult::Acknowledged => tally.pushed += 1,
                PushResult::Rejected => tally.failed += 1,
                PushResult::GaveUp => {
                    // Later intents for this document would likely fail the
                    // same way and must not overtake this one.
                    tally.failed += 1;
                    break;
                }
                PushResult::Suspended => break,
                PushResult::Vanished => {}
            }
        }

        self.settle_document(&document_id).await?;
        Ok(tally)
    }

    /// Mark the document synced once nothing is queued for it, or errored
    /// when something is parked.
    async fn settle_document(&self, document_id: &str) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let remaining = self.queue.for_document(document_id).await?;
        if remaining.is_empty() {
            self.store.mark_synced(document_id).await?;
        } else if remaining.iter().any(|op| op.status == OperationStatus::Failed) {
            self.store.set_sync_status(document_id, SyncStatus::Error).await?;
        }
        Ok(())
    }

    /// Submit one operation, applying the recovery each failure class calls
    /// for. Returns the outcome and the operation's document id, which changes
    /// if the document id had to be regenerated.
    async fn push_operation(&self, op: SyncOperation) -> Result<(PushResult, String)> {
        let Some(mut op) = self.queue.mark_in_flight(&op.id).await? else {
            return Ok((PushResult::Vanished, op.document_id));
        };
        let mut regenerations = 0;
        let mut resynced = false;
        let mut carried: Option<RemoteError> = None;

        loop {
            let outcome = match carried.take() {
                Some(error) => Err(error),
                None => {
                    self.remote_call(self.remote.apply(&self.origin, &op.document_id, &op.payload))
                        .await
                }
            };
            let error = match outcome {
                Ok(()) => {
                    self.queue.mark_completed(&op.id).await?;
                    self.set_mirrored(
                        &op.document_id,
                        matches!(op.kind(), OperationKind::CreateDoc | OperationKind::UpdateDoc),
                    );
                    debug!("Pushed {} {} for {}", op.kind(), op.id, op.document_id);
                    return Ok((PushResult::Acknowledged, op.document_id));
                }
                Err(error) => error,
            };

            match error.class() {
                FailureClass::NotFound
                    if matches!(op.kind(), OperationKind::DeleteDoc | OperationKind::DeleteNode) =>
                {
                    self.queue.mark_completed(&op.id).await?;
                    debug!("{} {} target already gone remotely", op.kind(), op.id);
                    return Ok((PushResult::Acknowledged, op.document_id));
                }
                FailureClass::RateLimited(wait) => {
                    self.suspend_for(wait);
                    self.queue.release(&op.id).await?;
                    warn!("Rate limited by remote, suspending pushes for {:?}", wait);
                    self.events.emit(SyncEvent::RateLimited {
                        retry_after_ms: wait.as_millis() as u64,
                    });
                    return Ok((PushResult::Suspended, op.document_id));
                }
                FailureClass::Transient => {
                    warn!(
                        "Push of {} {} failed (document {}, node {:?}): {}",
                        op.kind(),
                        op.id,
                        op.document_id,
                        op.node_id(),
                        error
                    );
                    let Some(failed) = self.queue.mark_failed(&op.id, &error.to_string()).await? else {
                        return Ok((PushResult::Vanished, op.document_id));
                    };
                    if failed.status == OperationStatus::Failed {
                        self.report_failure(&failed, &error);
                        return Ok((PushResult::GaveUp, op.document_id));
                    }
                    tokio::time::sleep(calculate_backoff(failed.retry_count, &self.config.retry)).await;
                    // Re-read: a newer update may have been folded in meanwhile.
                    match self.queue.mark_in_flight(&op.id).await? {
                        Some(next) => op = next,
                        None => return Ok((PushResult::Vanished, op.document_id)),
                    }
                }
                FailureClass::IdCollision
                    if regenerations < self.config.max_id_regenerations
                        && matches!(op.kind(), OperationKind::CreateNode | OperationKind::CreateDoc) =>
                {
                    regenerations += 1;
                    match self.regenerate_id(&op).await? {
                        Some(next) => op = next,
                        None => return Ok((PushResult::Vanished, op.document_id)),
                    }
                }
                FailureClass::MissingParent if !resynced => {
                    resynced = true;
                    match self.resync_document(&op.document_id).await? {
                        Ok(Some(pushed)) if already_applied(&op.payload, &pushed) => {
                            self.queue.mark_completed(&op.id).await?;
                            self.set_mirrored(&op.document_id, true);
                            debug!("{} {} carried by document resync", op.kind(), op.id);
                            return Ok((PushResult::Acknowledged, op.document_id));
                        }
                        Ok(_) => {}
                        Err(resync_error) => carried = Some(resync_error),
                    }
                }
                _ => {
                    let Some(rejected) = self.queue.mark_rejected(&op.id, &error.to_string()).await? else {
                        return Ok((PushResult::Vanished, op.document_id));
                    };
                    self.report_failure(&rejected, &error);
                    return Ok((PushResult::Rejected, op.document_id));
                }
            }
        }
    }

    fn report_failure(&self, op: &SyncOperation, error: &RemoteError) {
        error!(
            "Parked {} {} after {} retries (document {}, node {:?}): {}",
            op.kind(),
            op.id,
            op.retry_count,
            op.document_id,
            op.node_id(),
            error
        );
        self.events.emit(SyncEvent::OperationFailed {
            operation_id: op.id.clone(),
            kind: op.kind().to_string(),
            document_id: op.document_id.clone(),
            node_id: op.node_id().map(str::to_string),
            error: error.to_string(),
        });
    }

    /// Give a create operation's entity a fresh id, locally and in every
    /// queued intent. Returns the rewritten operation.
    async fn regenerate_id(&self, op: &SyncOperation) -> Result<Option<SyncOperation>> {
        let _lock = self.write_lock.lock().await;
        match &op.payload {
            OperationPayload::CreateNode { node, .. } => {
                let old_id = node.id.clone();
                let new_id = match self.store.find(&op.document_id).await? {
                    Some(mut document) => {
                        let new_id = ids::generate_unique_node_id(&document.root_node);
                        if mutators::replace_node_id(&mut document.root_node, &old_id, &new_id)? {
                            self.store.put(document).await?;
                        }
                        new_id
                    }
                    None => ids::generate_node_id(),
                };
                self.queue.rewrite_node_id(&op.document_id, &old_id, &new_id).await?;
                self.guard.rename_node(&old_id, &new_id);
                info!("Node id {} taken remotely, resubmitting as {}", old_id, new_id);
            }
            OperationPayload::CreateDoc { .. } => {
                let new_id = ids::generate_document_id();
                if let Some(mut document) = self.store.find(&op.document_id).await? {
                    document.id = new_id.clone();
                    self.store.put(document).await?;
                    self.store.delete(&op.document_id).await?;
                }
                self.queue.rewrite_document_id(&op.document_id, &new_id).await?;
                self.guard.rename_document(&op.document_id, &new_id);
                info!("Document id {} taken remotely, resubmitting as {}", op.document_id, new_id);
            }
            _ => return Ok(Some(op.clone())),
        }
        Ok(self.store.find_operation(&op.id).await?)
    }

    /// Push the whole local document, creating it remotely if the remote
    /// does not know it. The outer error is local; the inner one is the
    /// remote's answer.
    async fn resync_document(
        &self,
        document_id: &str,
    ) -> Result<std::result::Result<Option<Document>, RemoteError>> {
        let Some(document) = self.store.find(document_id).await? else {
            return Ok(Ok(None));
        };
        info!("Resyncing document {} after a missing parent", document_id);

        let update = OperationPayload::UpdateDoc {
            document: document.clone(),
        };
        let pushed = match self
            .remote_call(self.remote.apply(&self.origin, document_id, &update))
            .await
        {
            Err(e) if e.class() == FailureClass::NotFound => {
                let create = OperationPayload::CreateDoc {
                    document: document.clone(),
                };
                self.remote_call(self.remote.apply(&self.origin, document_id, &create))
                    .await
            }
            other => other,
        };
        Ok(pushed.map(|()| Some(document)))
    }
}
