//! mindmap-sync-daemon library: the native pieces behind `mindmap-syncd`.
//!
//! Exposed as a library so integration tests can drive the same engine the
//! binary runs.

pub mod config;
pub mod file_backend;
pub mod http_remote;

pub use config::{Command, DaemonConfig};
pub use file_backend::FileBackend;
pub use http_remote::{CLIENT_ID_HEADER, HttpRemote};

use mindmap_sync_core::{AuthProvider, SyncEngine, SystemClock};
use std::sync::Arc;
use tracing::info;

/// The engine as the daemon runs it.
pub type DaemonEngine = SyncEngine<FileBackend, HttpRemote>;

/// Open the on-disk store under `config.data_dir` and connect it to the
/// configured remote.
pub async fn open_engine(config: &DaemonConfig) -> anyhow::Result<DaemonEngine> {
    let client_id = config::load_client_id(&config.data_dir).await?;
    let backend = FileBackend::open(config.store_dir()).await?;
    let auth: Arc<dyn AuthProvider> = Arc::new(config.auth());
    let remote = HttpRemote::new(config.remote_url.clone(), Arc::clone(&auth));

    info!("Client id {}, store at {:?}", client_id, backend.root());
    let engine = SyncEngine::open(
        backend,
        remote,
        auth,
        Arc::new(SystemClock),
        config.sync_config(client_id),
    )
    .await?;
    Ok(engine)
}
