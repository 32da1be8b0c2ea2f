//! Edit protection: which nodes a human is typing into right now.
//!
//! Each node is either idle or has exactly one `EditSession`. Sessions for
//! different nodes may coexist. While a node has a session, nothing sourced
//! from sync or autosave may overwrite its text; the engine checks this at the
//! moment it applies a write, not when the sync cycle started.

use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Live edit of one node's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSession {
    pub document_id: String,
    pub node_id: String,
    pub original_value: String,
    pub current_value: String,
    /// Milliseconds since Unix epoch
    pub started_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    Idle,
    Editing,
}

/// Registry of active edit sessions, keyed by node id.
pub struct EditGuard {
    sessions: RwLock<HashMap<String, EditSession>>,
    clock: Arc<dyn Clock>,
}

impl EditGuard {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// IDLE -> EDITING. If the node is already being edited the existing
    /// session is returned unchanged.
    pub fn start_edit(&self, document_id: &str, node_id: &str, original_value: &str) -> EditSession {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = sessions.get(node_id) {
            debug!("Edit already active for node {}", node_id);
            return existing.clone();
        }
        let session = EditSession {
            document_id: document_id.to_string(),
            node_id: node_id.to_string(),
            original_value: original_value.to_string(),
            current_value: original_value.to_string(),
            started_at: self.clock.now_ms(),
        };
        sessions.insert(node_id.to_string(), session.clone());
        debug!("Edit started for node {} in {}", node_id, document_id);
        session
    }

    /// Record the in-flight value. Returns false if the node is idle.
    pub fn update_edit(&self, node_id: &str, current_value: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(node_id) {
            Some(session) => {
                session.current_value = current_value.to_string();
                true
            }
            None => false,
        }
    }

    /// EDITING -> IDLE with `final_value` as the committed text. The caller
    /// persists the returned session.
    pub fn finish_edit(&self, node_id: &str, final_value: &str) -> Option<EditSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(node_id).map(|mut session| {
            session.current_value = final_value.to_string();
            session
        })
    }

    /// EDITING -> IDLE, discarding the in-flight value. Returns the original
    /// text for the UI to restore.
    pub fn cancel_edit(&self, node_id: &str) -> Option<String> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(node_id).map(|session| session.original_value)
    }

    /// With `None`, whether any session is active; otherwise whether that node
    /// is being edited.
    pub fn is_editing(&self, node_id: Option<&str>) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        match node_id {
            Some(id) => sessions.contains_key(id),
            None => !sessions.is_empty(),
        }
    }

    pub fn state(&self, node_id: &str) -> EditState {
        if self.is_editing(Some(node_id)) {
            EditState::Editing
        } else {
            EditState::Idle
        }
    }

    pub fn session(&self, node_id: &str) -> Option<EditSession> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(node_id).cloned()
    }

    /// Whether any node of the document has an active session.
    pub fn is_document_protected(&self, document_id: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.values().any(|s| s.document_id == document_id)
    }

    /// Node ids with active sessions in the document.
    pub fn protected_nodes(&self, document_id: &str) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .values()
            .filter(|s| s.document_id == document_id)
            .map(|s| s.node_id.clone())
            .collect()
    }

    /// Move sessions to a replacement node id.
    pub(crate) fn rename_node(&self, old_id: &str, new_id: &str) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(mut session) = sessions.remove(old_id) {
            session.node_id = new_id.to_string();
            sessions.insert(new_id.to_string(), session);
        }
    }

    /// Move sessions to a replacement document id.
    pub(crate) fn rename_document(&self, old_id: &str, new_id: &str) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        for session in sessions.values_mut() {
            if session.document_id == old_id {
                session.document_id = new_id.to_string();
            }
        }
    }
}
