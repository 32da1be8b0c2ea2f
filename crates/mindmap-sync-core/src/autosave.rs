//! Debounced snapshot saves.
//!
//! The UI hands over its in-memory document on every keystroke; only the
//! latest snapshot per document is kept, and it becomes due once the debounce
//! window has passed without a newer one. Nothing is due while any edit
//! session is open.

use crate::edit_guard::EditGuard;
use crate::model::Document;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

struct PendingSave {
    document: Document,
    requested_at: Instant,
}

pub struct SaveDebouncer {
    window: Duration,
    guard: Arc<EditGuard>,
    pending: Mutex<HashMap<String, PendingSave>>,
}

impl SaveDebouncer {
    pub fn new(window: Duration, guard: Arc<EditGuard>) -> Self {
        Self {
            window,
            guard,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Replace any waiting snapshot of the same document and restart its
    /// window.
    pub fn request(&self, document: Document) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(
            document.id.clone(),
            PendingSave {
                document,
                requested_at: Instant::now(),
            },
        );
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Remove and return snapshots whose window has elapsed.
    pub fn take_due(&self) -> Vec<Document> {
        if self.guard.is_editing(None) {
            return Vec::new();
        }
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, save)| now.duration_since(save.requested_at) >= self.window)
            .map(|(id, _)| id.clone())
            .collect();
        due.into_iter()
            .filter_map(|id| pending.remove(&id))
            .map(|save| save.document)
            .collect()
    }

    /// Time until the earliest waiting snapshot becomes due.
    pub fn next_due_in(&self) -> Option<Duration> {
        let now = Instant::now();
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending
            .values()
            .map(|save| (save.requested_at + self.window).saturating_duration_since(now))
            .min()
    }
}
