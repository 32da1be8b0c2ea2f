//! Command line and environment configuration for `mindmap-syncd`.

use clap::{Parser, Subcommand};
use mindmap_sync_core::{ClientId, CurrentUser, StaticTokenAuth, SyncConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File in the data directory holding this installation's client id.
pub const CLIENT_ID_FILE: &str = "client_id";

#[derive(Parser, Debug, Clone)]
#[command(name = "mindmap-syncd")]
#[command(about = "Local-first mind-map sync daemon")]
pub struct DaemonConfig {
    /// Directory holding the local store
    #[arg(short, long, env = "MINDMAP_DATA_DIR", default_value = ".mindmap")]
    pub data_dir: PathBuf,

    /// Base URL of the document API
    #[arg(short, long, env = "MINDMAP_REMOTE_URL", default_value = "http://localhost:8787/api")]
    pub remote_url: String,

    /// Bearer token for the document API
    #[arg(long, env = "MINDMAP_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Id of the signed-in user; scopes which local documents may be removed
    /// when the remote no longer lists them
    #[arg(long, env = "MINDMAP_OWNER_ID")]
    pub owner_id: Option<String>,

    /// Seconds between sync cycles
    #[arg(long, default_value_t = 30)]
    pub interval: u64,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sync periodically until interrupted (default)
    Run,
    /// Print queued operations and document sync states
    Status,
    /// Return parked operations to the queue
    RetryFailed,
}

impl DaemonConfig {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    pub fn auth(&self) -> StaticTokenAuth {
        let user = self.owner_id.as_ref().map(|id| CurrentUser {
            id: id.clone(),
            email: String::new(),
        });
        StaticTokenAuth::new(self.token.clone(), user)
    }

    pub fn sync_config(&self, client_id: ClientId) -> SyncConfig {
        SyncConfig::builder()
            .client_id(client_id)
            .sync_interval(Duration::from_secs(self.interval.max(1)))
            .build()
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}

/// Read the persisted client id, creating one on first start.
pub async fn load_client_id(data_dir: &Path) -> anyhow::Result<ClientId> {
    let path = data_dir.join(CLIENT_ID_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Corrupt client id in {}: {}", path.display(), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => create_client_id(&path).await,
        Err(e) => Err(e.into()),
    }
}

async fn create_client_id(path: &Path) -> anyhow::Result<ClientId> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let id = ClientId::generate();
    tokio::fs::write(path, id.to_string()).await?;
    tracing::info!("Generated client id {}", id);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindmap_sync_core::AuthProvider;

    #[test]
    fn test_defaults_to_run() {
        let config = DaemonConfig::parse_from(["mindmap-syncd", "--data-dir", "/tmp/x"]);
        assert_eq!(config.command(), Command::Run);
        assert_eq!(config.interval, 30);
        assert_eq!(config.store_dir(), PathBuf::from("/tmp/x/store"));
    }

    #[test]
    fn test_subcommands_and_auth() {
        let config = DaemonConfig::parse_from([
            "mindmap-syncd",
            "--token",
            "secret",
            "--owner-id",
            "u1",
            "--interval",
            "5",
            "retry-failed",
        ]);
        assert_eq!(config.command(), Command::RetryFailed);

        let auth = config.auth();
        assert!(auth.is_authenticated());
        assert_eq!(auth.get_auth_header().as_deref(), Some("Bearer secret"));
        assert_eq!(auth.get_current_user().map(|u| u.id).as_deref(), Some("u1"));

        let sync = config.sync_config(ClientId::from(0xc1u64));
        assert_eq!(sync.sync_interval, Duration::from_secs(5));
        assert_eq!(sync.client_id, ClientId::from(0xc1u64));
    }

    #[tokio::test]
    async fn test_client_id_is_stable_across_starts() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = load_client_id(dir.path()).await.unwrap();
        let second = load_client_id(dir.path()).await.unwrap();
        assert_eq!(first, second);
    }
}
