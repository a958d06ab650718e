//! Local filesystem browsing for the transfer panel

pub mod commands;

use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Listing row for a local directory
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,
}

pub fn home_dir() -> AppResult<String> {
    dirs::home_dir()
        .map(|p| p.to_string_lossy().to_string())
        .ok_or_else(|| AppError::Config("Could not determine home directory".to_string()))
}

/// Expand `~`, make absolute, and fold `.` and `..` lexically
pub fn normalize(path: &str) -> AppResult<PathBuf> {
    let expanded = if path == "~" || path.starts_with("~/") {
        PathBuf::from(home_dir()?).join(path.trim_start_matches('~').trim_start_matches('/'))
    } else {
        PathBuf::from(path)
    };
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()?.join(expanded)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// List a directory, directories first, then by name ignoring case
pub fn list(path: &str) -> AppResult<Vec<LocalEntry>> {
    let dir = normalize(path)?;
    if !dir.is_dir() {
        return Err(AppError::LocalFileNotFound(dir.to_string_lossy().to_string()));
    }

    let mut entries = Vec::new();
    for item in fs::read_dir(&dir)? {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry in {:?}: {}", dir, e);
                continue;
            }
        };
        match describe(&item.path()) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!("Skipping {:?}: {}", item.path(), e),
        }
    }

    entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });

    Ok(entries)
}

fn describe(path: &Path) -> std::io::Result<LocalEntry> {
    // Follows symlinks; dangling links fail here and are skipped
    let meta = fs::metadata(path)?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64);

    Ok(LocalEntry {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        path: path.to_string_lossy().to_string(),
        is_directory: meta.is_dir(),
        size: meta.len(),
        modified,
    })
}
