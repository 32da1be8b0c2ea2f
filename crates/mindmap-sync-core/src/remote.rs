//! RemoteStore trait for the cloud document service.
//!
//! Implementations:
//! - `HttpRemote` (in mindmap-sync-daemon) - REST API over reqwest
//! - `InMemoryRemote` - Simulated service for testing, with fault injection

use crate::clock::Clock;
use crate::model::{Document, DocumentSummary};
use crate::mutators;
use crate::queue::{OperationKind, OperationPayload};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Error message fragment the API uses for id uniqueness violations.
pub const UNIQUE_VIOLATION: &str = "UNIQUE constraint failed";
/// Error message fragment the API uses when a node's parent is unknown.
pub const PARENT_NOT_FOUND: &str = "Parent node not found";

/// Retry-After assumed when a 429 response omits the header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Id already exists: {0}")]
    IdCollision(String),

    #[error("Parent node not found: {0}")]
    ParentNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// How the sync engine reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeout, 5xx, network: exponential backoff, bounded retries
    Transient,
    /// 429: wait for the given duration, not counted as a retry
    RateLimited(Duration),
    /// Client-generated id already taken: regenerate and resubmit
    IdCollision,
    /// Remote does not know the parent: resync the document, retry once
    MissingParent,
    /// Target does not exist remotely
    NotFound,
    /// Validation or auth failure: park without retry
    Permanent,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: String,
}

impl RemoteError {
    /// Map a non-2xx response into the error taxonomy.
    ///
    /// The API has no structured error codes, so the recoverable conditions
    /// are recognized by substrings of the envelope's `error` message.
    pub fn from_response(status: u16, body: &str, retry_after_secs: Option<u64>) -> Self {
        let message = serde_json::from_str::<ErrorEnvelope>(body)
            .map(|e| e.error)
            .unwrap_or_else(|_| body.trim().to_string());

        if status == 429 {
            return RemoteError::RateLimited(
                retry_after_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_RETRY_AFTER),
            );
        }
        if message.contains(UNIQUE_VIOLATION) {
            return RemoteError::IdCollision(message);
        }
        if message.contains(PARENT_NOT_FOUND) {
            return RemoteError::ParentNotFound(message);
        }
        match status {
            404 => RemoteError::NotFound(message),
            401 | 403 => RemoteError::Unauthorized(message),
            408 => RemoteError::Timeout,
            500..=599 => RemoteError::Server { status, message },
            _ => RemoteError::Rejected { status, message },
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            RemoteError::Timeout
            | RemoteError::Network(_)
            | RemoteError::Server { .. }
            | RemoteError::InvalidResponse(_) => FailureClass::Transient,
            RemoteError::RateLimited(after) => FailureClass::RateLimited(*after),
            RemoteError::IdCollision(_) => FailureClass::IdCollision,
            RemoteError::ParentNotFound(_) => FailureClass::MissingParent,
            RemoteError::NotFound(_) => FailureClass::NotFound,
            RemoteError::Unauthorized(_) | RemoteError::Rejected { .. } => FailureClass::Permanent,
        }
    }
}

/// The cloud document service.
///
/// `origin` is the writing client's id; services that record it report it
/// back in `DocumentSummary::origin`. Deleting something that is already
/// gone must succeed.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// `GET /documents`
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>>;

    /// `GET /documents/{id}`
    async fn get_document(&self, id: &str) -> Result<Document>;

    /// Submit one queued intent to the matching endpoint.
    async fn apply(&self, origin: &str, document_id: &str, payload: &OperationPayload) -> Result<()>;
}

#[async_trait]
impl<T: RemoteStore> RemoteStore for Arc<T> {
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        (**self).list_documents().await
    }

    async fn get_document(&self, id: &str) -> Result<Document> {
        (**self).get_document(id).await
    }

    async fn apply(&self, origin: &str, document_id: &str, payload: &OperationPayload) -> Result<()> {
        (**self).apply(origin, document_id, payload).await
    }
}

/// A request the in-memory remote received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    List,
    Get(String),
    Apply {
        kind: OperationKind,
        document_id: String,
        node_id: Option<String>,
    },
}

struct ScriptedFailure {
    kind: Option<OperationKind>,
    error: RemoteError,
}

#[derive(Default)]
struct RemoteState {
    documents: HashMap<String, Document>,
    origins: HashMap<String, String>,
    calls: Vec<RemoteCall>,
    failures: VecDeque<ScriptedFailure>,
}

/// Simulated document service for tests.
///
/// Enforces node id uniqueness per document and parent existence like the
/// real API, stamps `updatedAt` from its own clock, and can be scripted to
/// fail.
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    clock: Arc<dyn Clock>,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryRemote {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            clock,
            offline: AtomicBool::new(false),
            latency: Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every call fails with a network error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every call, yielding to other tasks.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Fail the next `apply` with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.state().failures.push_back(ScriptedFailure { kind: None, error });
    }

    /// Fail the next `apply` of `kind` with `error`.
    pub fn fail_next_kind(&self, kind: OperationKind, error: RemoteError) {
        self.state().failures.push_back(ScriptedFailure {
            kind: Some(kind),
            error,
        });
    }

    /// Place a document on the server as another client would have.
    pub fn seed(&self, document: Document, origin: Option<&str>) {
        let mut state = self.state();
        match origin {
            Some(o) => state.origins.insert(document.id.clone(), o.to_string()),
            None => state.origins.remove(&document.id),
        };
        state.documents.insert(document.id.clone(), document);
    }

    pub fn document(&self, id: &str) -> Option<Document> {
        self.state().documents.get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        let mut state = self.state();
        state.documents.remove(id);
        state.origins.remove(id);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    /// Only the `apply` calls, in arrival order.
    pub fn applied(&self) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, RemoteCall::Apply { .. }))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    async fn simulate_network(&self) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection refused".into()));
        }
        Ok(())
    }

    fn take_failure(state: &mut RemoteState, kind: OperationKind) -> Option<RemoteError> {
        let index = state
            .failures
            .iter()
            .position(|f| f.kind.is_none() || f.kind == Some(kind))?;
        state.failures.remove(index).map(|f| f.error)
    }

    fn rejected(message: String) -> RemoteError {
        RemoteError::from_response(400, &serde_json::json!({ "error": message }).to_string(), None)
    }

    fn apply_locked(
        state: &mut RemoteState,
        now: u64,
        document_id: &str,
        payload: &OperationPayload,
    ) -> Result<()> {
        match payload {
            OperationPayload::CreateDoc { document } => {
                if state.documents.contains_key(document_id) {
                    return Err(Self::rejected(format!("{}: documents.id", UNIQUE_VIOLATION)));
                }
                let mut document = document.clone();
                document.last_modified = now;
                state.documents.insert(document_id.to_string(), document);
            }
            OperationPayload::UpdateDoc { document } => {
                let Some(existing) = state.documents.get_mut(document_id) else {
                    return Err(RemoteError::NotFound(document_id.to_string()));
                };
                *existing = document.clone();
                existing.last_modified = now;
            }
            OperationPayload::DeleteDoc => {
                state.documents.remove(document_id);
            }
            OperationPayload::CreateNode { parent_id, node } => {
                let Some(document) = state.documents.get_mut(document_id) else {
                    return Err(Self::rejected(format!("{} (document {})", PARENT_NOT_FOUND, document_id)));
                };
                if mutators::find_node(&document.root_node, parent_id).is_none()
                    && parent_id != crate::model::ROOT_ALIAS
                {
                    return Err(Self::rejected(format!("{}: {}", PARENT_NOT_FOUND, parent_id)));
                }
                if mutators::insert_node(&mut document.root_node, parent_id, node.clone()).is_err() {
                    return Err(Self::rejected(format!("{}: nodes.id", UNIQUE_VIOLATION)));
                }
                document.last_modified = now;
            }
            OperationPayload::UpdateNode { node_id, patch } => {
                let Some(document) = state.documents.get_mut(document_id) else {
                    return Err(RemoteError::NotFound(document_id.to_string()));
                };
                if !mutators::update_node(&mut document.root_node, node_id, patch) {
                    return Err(RemoteError::NotFound(node_id.clone()));
                }
                document.last_modified = now;
            }
            OperationPayload::DeleteNode { node_id } => {
                if let Some(document) = state.documents.get_mut(document_id) {
                    if let Ok(Some(_)) = mutators::delete_node(&mut document.root_node, node_id) {
                        document.last_modified = now;
                    }
                }
            }
            OperationPayload::MoveNode {
                node_id,
                new_parent_id,
            } => {
                let Some(document) = state.documents.get_mut(document_id) else {
                    return Err(RemoteError::NotFound(document_id.to_string()));
                };
                if mutators::find_node(&document.root_node, new_parent_id).is_none() {
                    return Err(Self::rejected(format!("{}: {}", PARENT_NOT_FOUND, new_parent_id)));
                }
                match mutators::move_node(&mut document.root_node, node_id, new_parent_id) {
                    Ok(true) => document.last_modified = now,
                    Ok(false) => return Err(RemoteError::NotFound(node_id.clone())),
                    Err(e) => return Err(Self::rejected(e.to_string())),
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        self.state().calls.push(RemoteCall::List);
        self.simulate_network().await?;

        let state = self.state();
        let mut summaries: Vec<_> = state
            .documents
            .values()
            .map(|d| DocumentSummary {
                origin: state.origins.get(&d.id).cloned(),
                ..d.summary()
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn get_document(&self, id: &str) -> Result<Document> {
        self.state().calls.push(RemoteCall::Get(id.to_string()));
        self.simulate_network().await?;

        self.state()
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn apply(&self, origin: &str, document_id: &str, payload: &OperationPayload) -> Result<()> {
        self.state().calls.push(RemoteCall::Apply {
            kind: payload.kind(),
            document_id: document_id.to_string(),
            node_id: payload.node_id().map(str::to_string),
        });
        self.simulate_network().await?;

        let now = self.clock.now_ms();
        let mut state = self.state();
        if let Some(error) = Self::take_failure(&mut state, payload.kind()) {
            return Err(error);
        }
        Self::apply_locked(&mut state, now, document_id, payload)?;
        if !matches!(payload, OperationPayload::DeleteDoc) {
            state.origins.insert(document_id.to_string(), origin.to_string());
        } else {
            state.origins.remove(document_id);
        }
        Ok(())
    }
}
