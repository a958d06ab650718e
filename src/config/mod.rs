pub mod commands;
pub mod settings;

pub use settings::*;

use crate::error::{AppError, AppResult};
use std::path::{Path, PathBuf};

/// Environment override for the data directory
pub const DATA_DIR_ENV: &str = "SHELLVAULT_DATA_DIR";

/// Get the per-installation data directory
pub fn get_data_dir() -> AppResult<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let data_dir = dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .ok_or_else(|| AppError::Config("Could not find data directory".into()))?
        .join("shellvault");

    Ok(data_dir)
}

/// Create the data directory (owner-only on Unix)
pub fn ensure_data_dir(dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        let _ = std::fs::set_permissions(dir, perms);
    }

    Ok(())
}

pub fn servers_path(data_dir: &Path) -> PathBuf {
    data_dir.join("servers.json")
}

pub fn key_path(data_dir: &Path) -> PathBuf {
    data_dir.join("key.dat")
}

pub fn known_hosts_path(data_dir: &Path) -> PathBuf {
    data_dir.join("known_hosts")
}
