//! Pull phase: bring newer remote documents into the Local Store.

use super::{EngineError, Result, SyncEngine, SyncReport};
use crate::events::SyncEvent;
use crate::model::{Document, DocumentSummary, SyncStatus};
use crate::mutators;
use crate::queue::OperationKind;
use crate::remote::{RemoteError, RemoteStore};
use crate::store::StorageBackend;
use std::collections::HashSet;
use tracing::{debug, info, warn};

enum PullResult {
    Applied,
    Deferred,
    Skipped,
}

impl<B: StorageBackend, R: RemoteStore> SyncEngine<B, R> {
    pub(super) async fn pull_phase(&self, report: &mut SyncReport) -> Result<()> {
        if self.suspension_remaining().is_some() {
            report.rate_limited = true;
            return Ok(());
        }

        let summaries = match self.remote_call(self.remote.list_documents()).await {
            Ok(summaries) => summaries,
            Err(RemoteError::RateLimited(wait)) => {
                self.suspend_for(wait);
                report.rate_limited = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut remote_ids = HashSet::with_capacity(summaries.len());
        for summary in &summaries {
            remote_ids.insert(summary.id.clone());
            match self.pull_document(summary).await {
                Ok(PullResult::Applied) => report.pulled += 1,
                Ok(PullResult::Deferred) => report.deferred += 1,
                Ok(PullResult::Skipped) => {}
                Err(EngineError::Remote(RemoteError::RateLimited(wait))) => {
                    warn!("Rate limited while pulling, suspending for {:?}", wait);
                    self.suspend_for(wait);
                    report.rate_limited = true;
                    return Ok(());
                }
                Err(EngineError::Remote(e)) => {
                    warn!("Failed to pull document {}: {}", summary.id, e);
                }
                Err(e) => return Err(e),
            }
        }

        report.removed = self.confirm_deletions(&remote_ids).await?;
        Ok(())
    }

    async fn pull_document(&self, summary: &DocumentSummary) -> Result<PullResult> {
        let local = self.store.find(&summary.id).await?;
        if let Some(local) = &local {
            if summary.origin.as_deref() == Some(self.origin.as_str())
                && local.sync_status == SyncStatus::Synced
                && self.is_mirrored(&summary.id)
            {
                debug!("Skipping echo of our own write to {}", summary.id);
                return Ok(PullResult::Skipped);
            }
            if summary.updated_at <= local.last_modified {
                return Ok(PullResult::Skipped);
            }
        }
        if self.has_pending_delete(&summary.id).await? {
            return Ok(PullResult::Skipped);
        }
        // Checked again when applying; this only saves the fetch.
        if self.guard.is_document_protected(&summary.id) {
            return self.defer(&summary.id).await;
        }

        let remote = self
            .remote_call(self.remote.get_document(&summary.id))
            .await?;
        self.apply_remote(remote).await
    }

    async fn has_pending_delete(&self, document_id: &str) -> Result<bool> {
        Ok(self
            .queue
            .for_document(document_id)
            .await?
            .iter()
            .any(|op| op.kind() == OperationKind::DeleteDoc))
    }

    /// Replace the local copy with `remote` if it is still newer and no node
    /// of the document is being edited right now.
    async fn apply_remote(&self, mut remote: Document) -> Result<PullResult> {
        let _lock = self.write_lock.lock().await;

        if self.guard.is_document_protected(&remote.id) {
            return self.defer(&remote.id).await;
        }
        let local = self.store.find(&remote.id).await?;
        if let Some(local) = &local {
            if remote.last_modified <= local.last_modified {
                return Ok(PullResult::Skipped);
            }
        }
        if let Err(e) = mutators::validate(&remote.root_node) {
            warn!("Ignoring remote copy of {}: {}", remote.id, e);
            return Ok(PullResult::Skipped);
        }

        let superseded = self.queue.discard_for_document(&remote.id).await?;
        if superseded > 0 {
            info!(
                "Remote copy of {} is newer; dropped {} superseded operations",
                remote.id, superseded
            );
        }
        remote.local_version = local.map_or(0, |l| l.local_version);
        let stored = self.store.put_synced(remote).await?;
        debug!("Pulled {} (lastModified {})", stored.id, stored.last_modified);
        self.events.emit(SyncEvent::DocumentPulled {
            document_id: stored.id,
        });
        Ok(PullResult::Applied)
    }

    async fn defer(&self, document_id: &str) -> Result<PullResult> {
        self.store.set_sync_status(document_id, SyncStatus::Conflict).await?;
        info!("Deferring pull of {}: a node is being edited", document_id);
        self.events.emit(SyncEvent::PullDeferred {
            document_id: document_id.to_string(),
        });
        Ok(PullResult::Deferred)
    }

    /// Remove local documents the remote no longer has. Only documents that
    /// were synced before and have nothing queued qualify.
    async fn confirm_deletions(&self, remote_ids: &HashSet<String>) -> Result<usize> {
        let owner = self.auth.get_current_user().map(|u| u.id);
        let mut removed = 0;

        for document in self.store.list(owner.as_deref()).await? {
            if remote_ids.contains(&document.id) || document.cloud_version.is_none() {
                continue;
            }
            let _lock = self.write_lock.lock().await;
            if self.guard.is_document_protected(&document.id)
                || !self.queue.for_document(&document.id).await?.is_empty()
            {
                continue;
            }
            self.store.delete(&document.id).await?;
            info!("Document {} was deleted remotely, removed locally", document.id);
            self.events.emit(SyncEvent::DocumentRemoved {
                document_id: document.id,
            });
            removed += 1;
        }
        Ok(removed)
    }
}
