//! mindmap-sync-core: local-first storage and cloud sync for mind-map documents.
//!
//! This crate provides:
//! - The document model and pure tree mutators
//! - A durable Local Store over a pluggable `StorageBackend`
//! - A persistent Operation Queue of not-yet-acknowledged intents
//! - Edit protection for nodes a human is typing into
//! - The `SyncEngine`, which pushes the queue to a `RemoteStore` and pulls
//!   newer remote documents back

pub mod auth;
pub mod autosave;
pub mod clock;
pub mod config;
pub mod edit_guard;
pub mod engine;
pub mod events;
pub mod ids;
pub mod model;
pub mod mutators;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod store;

pub use auth::{AuthProvider, CurrentUser, StaticTokenAuth};
pub use autosave::SaveDebouncer;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SyncConfig, SyncConfigBuilder};
pub use edit_guard::{EditGuard, EditSession, EditState};
pub use engine::{EngineError, SyncEngine, SyncOutcome, SyncReport};
pub use events::{EventBus, Subscription, SyncEvent};
pub use ids::ClientId;
pub use model::{Document, DocumentSummary, Node, NodePatch, SyncStatus};
pub use queue::{OperationKind, OperationPayload, OperationQueue, OperationStatus, SyncOperation};
pub use remote::{FailureClass, InMemoryRemote, RemoteError, RemoteStore};
pub use retry::{RetryConfig, calculate_backoff, calculate_backoff_delay};
pub use store::{Collection, LocalStore, MemoryBackend, StorageBackend, StoreError};
