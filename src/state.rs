use crate::config::{self, AppSettings};
use crate::error::AppResult;
use crate::servers::ServerStore;
use crate::session::Broadcaster;
use crate::sftp::TransferController;
use crate::ssh::ShellController;
use crate::transport::{Connector, Ssh2Connector};
use crate::vault::CredentialVault;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

/// Global application state
pub struct AppState {
    pub data_dir: PathBuf,
    pub vault: Arc<CredentialVault>,
    pub servers: Arc<ServerStore>,
    pub settings: Arc<RwLock<AppSettings>>,
    pub broadcaster: Arc<Broadcaster>,
    pub shells: ShellController,
    pub transfers: TransferController,
}

impl AppState {
    pub fn new(data_dir: PathBuf) -> AppResult<Self> {
        let connector = Arc::new(Ssh2Connector::new(config::known_hosts_path(&data_dir)));
        Self::with_connector(data_dir, connector)
    }

    pub fn with_connector(data_dir: PathBuf, connector: Arc<dyn Connector>) -> AppResult<Self> {
        config::ensure_data_dir(&data_dir)?;

        let settings = Arc::new(RwLock::new(AppSettings::load(&data_dir)?));
        let vault = Arc::new(CredentialVault::new(config::key_path(&data_dir)));
        let servers = Arc::new(ServerStore::new(config::servers_path(&data_dir), vault.clone()));
        let broadcaster = Arc::new(Broadcaster::new());

        let shells = ShellController::new(
            servers.clone(),
            connector.clone(),
            broadcaster.clone(),
            settings.clone(),
        );
        let transfers = TransferController::new(servers.clone(), connector, broadcaster.clone(), settings.clone());

        Ok(Self {
            data_dir,
            vault,
            servers,
            settings,
            broadcaster,
            shells,
            transfers,
        })
    }

    /// Close every live session
    pub async fn shutdown(&self) {
        self.shells.close_all();
        self.transfers.close_all().await;
        tracing::info!("All sessions closed");
    }
}
