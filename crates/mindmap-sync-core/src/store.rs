//! Local persistence: a keyed backend abstraction and the document store on
//! top of it.
//!
//! Implementations of `StorageBackend`:
//! - `MemoryBackend` - For testing and ephemeral sessions
//! - `FileBackend` (in mindmap-sync-daemon) - One JSON file per record via tokio::fs
//!
//! A backend write must be durable before it resolves; `LocalStore` adds the
//! document contract (version bumps, timestamps, idempotent delete) and JSON
//! encoding.

use crate::clock::Clock;
use crate::model::{Document, SyncStatus};
use crate::queue::SyncOperation;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Keyed collections held by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Documents,
    Operations,
    Meta,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Documents => "documents",
            Collection::Operations => "operations",
            Collection::Meta => "meta",
        }
    }
}

/// Durable key-value storage, one namespace per `Collection`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a record, `None` if absent
    async fn read(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace a record; durable once this resolves
    async fn write(&self, collection: Collection, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a record; removing an absent key succeeds
    async fn delete(&self, collection: Collection, key: &str) -> Result<()>;

    /// All keys in a collection, in no particular order
    async fn keys(&self, collection: Collection) -> Result<Vec<String>>;
}

/// In-memory backend for testing
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<Collection, BTreeMap<String, Vec<u8>>>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, simulating a full or broken disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("simulated write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(&collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn write(&self, collection: Collection, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records
            .entry(collection)
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<()> {
        self.check_writable()?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = records.get_mut(&collection) {
            c.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, collection: Collection) -> Result<Vec<String>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(&collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }
}

// Lets tests keep a handle on the backend they hand to a store.
#[async_trait]
impl<T: StorageBackend> StorageBackend for Arc<T> {
    async fn read(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).read(collection, key).await
    }

    async fn write(&self, collection: Collection, key: &str, value: &[u8]) -> Result<()> {
        (**self).write(collection, key, value).await
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<()> {
        (**self).delete(collection, key).await
    }

    async fn keys(&self, collection: Collection) -> Result<Vec<String>> {
        (**self).keys(collection).await
    }
}

/// Metadata key holding the time of the last completed sync cycle.
pub const META_LAST_SYNC: &str = "last_sync_at";

/// Document store: the single source of truth for rendering.
pub struct LocalStore<B: StorageBackend> {
    backend: B,
    clock: Arc<dyn Clock>,
}

impl<B: StorageBackend> LocalStore<B> {
    pub fn new(backend: B, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<T>> {
        match self.backend.read(collection, key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("{}/{}: {}", collection.name(), key, e))),
            None => Ok(None),
        }
    }

    async fn write_json<T: Serialize>(&self, collection: Collection, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend.write(collection, key, &bytes).await
    }

    async fn read_all<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for key in self.backend.keys(collection).await? {
            if let Some(value) = self.read_json(collection, &key).await? {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// Upsert a locally edited document.
    ///
    /// Bumps `local_version`, stamps `last_modified` with the current time and
    /// marks the document pending. Returns the stored copy.
    pub async fn put(&self, mut document: Document) -> Result<Document> {
        let previous = self.find(&document.id).await?;
        let base = previous.map(|p| p.local_version).unwrap_or(0);
        document.local_version = base.max(document.local_version) + 1;
        document.last_modified = self.clock.now_ms();
        document.sync_status = SyncStatus::Pending;
        self.write_json(Collection::Documents, &document.id, &document).await?;
        Ok(document)
    }

    /// Store a copy received from the remote, keeping its `last_modified`.
    pub async fn put_synced(&self, mut document: Document) -> Result<Document> {
        let previous = self.find(&document.id).await?;
        let base = previous.map(|p| p.local_version).unwrap_or(0);
        document.local_version = base.max(document.local_version) + 1;
        document.cloud_version = Some(document.local_version);
        document.sync_status = SyncStatus::Synced;
        self.write_json(Collection::Documents, &document.id, &document).await?;
        Ok(document)
    }

    /// Write a document exactly as given. Used for seeding and migrations.
    pub async fn put_raw(&self, document: &Document) -> Result<()> {
        self.write_json(Collection::Documents, &document.id, document).await
    }

    /// Record that the remote acknowledged everything up to the current
    /// local version. No-op for unknown ids.
    pub async fn mark_synced(&self, id: &str) -> Result<()> {
        if let Some(mut document) = self.find(id).await? {
            document.sync_status = SyncStatus::Synced;
            document.cloud_version = Some(document.local_version);
            self.write_json(Collection::Documents, id, &document).await?;
        }
        Ok(())
    }

    /// Change only the sync status; content and versions stay as they are.
    pub async fn set_sync_status(&self, id: &str, status: SyncStatus) -> Result<()> {
        if let Some(mut document) = self.find(id).await? {
            if document.sync_status != status {
                document.sync_status = status;
                self.write_json(Collection::Documents, id, &document).await?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        self.find(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub async fn find(&self, id: &str) -> Result<Option<Document>> {
        self.read_json(Collection::Documents, id).await
    }

    /// Documents, newest `last_modified` first, optionally for one owner.
    pub async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Document>> {
        let mut documents: Vec<Document> = self.read_all(Collection::Documents).await?;
        if let Some(owner) = owner_id {
            documents.retain(|d| d.owner_id == owner);
        }
        documents.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(documents)
    }

    /// Remove a document. Absent ids succeed.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.backend.delete(Collection::Documents, id).await
    }

    pub async fn save_operation(&self, operation: &SyncOperation) -> Result<()> {
        self.write_json(Collection::Operations, &operation.id, operation).await
    }

    pub async fn find_operation(&self, id: &str) -> Result<Option<SyncOperation>> {
        self.read_json(Collection::Operations, id).await
    }

    pub async fn delete_operation(&self, id: &str) -> Result<()> {
        self.backend.delete(Collection::Operations, id).await
    }

    /// All persisted operations, unordered.
    pub async fn operations(&self) -> Result<Vec<SyncOperation>> {
        self.read_all(Collection::Operations).await
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.read_json(Collection::Meta, key).await
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.write_json(Collection::Meta, key, &value).await
    }
}
