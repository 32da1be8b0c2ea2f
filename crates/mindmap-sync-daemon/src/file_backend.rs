//! Durable storage backend using tokio::fs.
//!
//! Each record is one JSON file: `<root>/<collection>/<key>.json`. Writes go
//! to a temporary sibling, are fsynced, then renamed over the target so a
//! crash never leaves a half-written record behind.

use async_trait::async_trait;
use mindmap_sync_core::store::{Collection, Result, StorageBackend, StoreError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const RECORD_EXT: &str = ".json";
const TMP_EXT: &str = ".tmp";

const COLLECTIONS: [Collection; 3] = [Collection::Documents, Collection::Operations, Collection::Meta];

fn io_error(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {}", path.display(), e))
}

/// Percent-encode anything outside `[A-Za-z0-9_-]` so keys map to safe file names.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// File-per-record backend for the daemon.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for collection in COLLECTIONS {
            let dir = root.join(collection.name());
            fs::create_dir_all(&dir).await.map_err(|e| io_error(&dir, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, collection: Collection, key: &str) -> PathBuf {
        self.root
            .join(collection.name())
            .join(format!("{}{}", encode_key(key), RECORD_EXT))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn read(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(collection, key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn write(&self, collection: Collection, key: &str, value: &[u8]) -> Result<()> {
        let path = self.record_path(collection, key);
        let tmp = path.with_extension(format!("json{}", TMP_EXT));

        let mut file = fs::File::create(&tmp).await.map_err(|e| io_error(&tmp, e))?;
        file.write_all(value).await.map_err(|e| io_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| io_error(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path).await.map_err(|e| io_error(&path, e))
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<()> {
        let path = self.record_path(collection, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn keys(&self, collection: Collection) -> Result<Vec<String>> {
        let dir = self.root.join(collection.name());
        let mut entries = fs::read_dir(&dir).await.map_err(|e| io_error(&dir, e))?;
        let mut keys = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            // Leftover temp files from an interrupted write are not records.
            let Some(stem) = name.strip_suffix(RECORD_EXT) else {
                continue;
            };
            match decode_key(stem) {
                Some(key) => keys.push(key),
                None => tracing::warn!("Ignoring unreadable record name {:?} in {}", name, dir.display()),
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindmap_sync_core::{Document, LocalStore, ManualClock};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();

        backend.write(Collection::Meta, "last_sync_at", b"42").await.unwrap();
        assert_eq!(
            backend.read(Collection::Meta, "last_sync_at").await.unwrap(),
            Some(b"42".to_vec())
        );
        assert_eq!(backend.keys(Collection::Meta).await.unwrap(), vec!["last_sync_at"]);

        backend.delete(Collection::Meta, "last_sync_at").await.unwrap();
        assert_eq!(backend.read(Collection::Meta, "last_sync_at").await.unwrap(), None);
        // Absent keys delete fine.
        backend.delete(Collection::Meta, "last_sync_at").await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_with_unsafe_characters_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();

        backend.write(Collection::Documents, "../a b/c", b"{}").await.unwrap();
        assert_eq!(backend.keys(Collection::Documents).await.unwrap(), vec!["../a b/c"]);
        let files: Vec<_> = std::fs::read_dir(dir.path().join("documents")).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_temp_files_are_not_listed() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("operations").join("op1.json.tmp"), b"{").unwrap();

        assert!(backend.keys(Collection::Operations).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));

        let store = LocalStore::new(FileBackend::open(dir.path()).await.unwrap(), clock.clone());
        store.put(Document::new("d1", "Plans", "u1")).await.unwrap();
        drop(store);

        let store = LocalStore::new(FileBackend::open(dir.path()).await.unwrap(), clock);
        let document = store.get("d1").await.unwrap();
        assert_eq!(document.title, "Plans");
        assert_eq!(document.last_modified, 1_000);
    }
}
