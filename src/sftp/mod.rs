//! File-transfer sessions
//!
//! Each transfer session owns one SFTP connection. Remote operations are
//! blocking and run on the blocking pool; they may overlap freely.

pub mod commands;

use crate::config::AppSettings;
use crate::error::{AppError, AppResult};
use crate::logging::sanitize_error_message;
use crate::servers::{generate_id, ServerStore};
use crate::session::{
    resolve_target, settle_connect, Broadcaster, Claim, ConnectOptions, ConnectionRegistry,
    SessionEvent, SessionInfo, SessionKind, SessionStatus, TrackedSession,
};
use crate::transport::{is_connection_lost, Connector, RemoteDirEntry, RemoteFs};
use parking_lot::RwLock;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

const LIVE: &[SessionStatus] = &[SessionStatus::Connecting, SessionStatus::Ready];

/// Path reported while the real home directory is not yet known
const PENDING_REMOTE_PATH: &str = "~";

/// Listing row for a remote directory
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    /// Epoch millis
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOpened {
    pub session_id: String,
    pub initial_remote_path: String,
}

pub enum TransferPhase {
    Connecting,
    Ready { fs: Arc<dyn RemoteFs> },
    Error { message: String },
}

pub struct TransferSession {
    pub id: String,
    pub server_id: String,
    pub phase: TransferPhase,
    pub created_at: i64,
}

impl TransferSession {
    fn new(id: String, server_id: &str) -> Self {
        Self {
            id,
            server_id: server_id.to_string(),
            phase: TransferPhase::Connecting,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn fs(&self) -> Option<Arc<dyn RemoteFs>> {
        match &self.phase {
            TransferPhase::Ready { fs } => Some(fs.clone()),
            _ => None,
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            server_id: self.server_id.clone(),
            kind: SessionKind::Transfer,
            status: self.status(),
            error_message: match &self.phase {
                TransferPhase::Error { message } => Some(message.clone()),
                _ => None,
            },
            created_at: self.created_at,
        }
    }
}

impl TrackedSession for TransferSession {
    type Status = SessionStatus;

    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn status(&self) -> SessionStatus {
        match self.phase {
            TransferPhase::Connecting => SessionStatus::Connecting,
            TransferPhase::Ready { .. } => SessionStatus::Ready,
            TransferPhase::Error { .. } => SessionStatus::Error,
        }
    }
}

/// Join a directory and a child name without doubling the separator
pub fn join_remote_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

fn to_remote_entry(parent: &str, entry: RemoteDirEntry) -> RemoteEntry {
    RemoteEntry {
        path: join_remote_path(parent, &entry.filename),
        is_directory: entry.longname.starts_with('d'),
        size: entry.size.unwrap_or(0),
        modified: entry.mtime.map(|secs| secs as i64 * 1000),
        name: entry.filename,
    }
}

/// Home directory, falling back to the login directory and then `/`.
/// A dead connection is returned as an error instead of falling back.
fn initial_remote_path(fs: &dyn RemoteFs) -> io::Result<String> {
    for candidate in ["~", "."] {
        match fs.realpath(candidate) {
            Ok(path) if !path.is_empty() => return Ok(path),
            Ok(_) => {}
            Err(e) if is_connection_lost(&e) => return Err(e),
            Err(e) => tracing::debug!("realpath({}) failed: {}", candidate, e),
        }
    }
    Ok("/".to_string())
}

/// A failed remote call and the operation it belonged to
struct RemoteFailure {
    op: &'static str,
    source: io::Error,
}

fn during(op: &'static str) -> impl FnOnce(io::Error) -> RemoteFailure {
    move |source| RemoteFailure { op, source }
}

async fn run_blocking<T, F>(f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Transport(format!("Blocking task failed: {}", e)))?
}

/// Owns every file-transfer session
pub struct TransferController {
    registry: Arc<ConnectionRegistry<TransferSession>>,
    servers: Arc<ServerStore>,
    connector: Arc<dyn Connector>,
    broadcaster: Arc<Broadcaster>,
    settings: Arc<RwLock<AppSettings>>,
}

impl TransferController {
    pub fn new(
        servers: Arc<ServerStore>,
        connector: Arc<dyn Connector>,
        broadcaster: Arc<Broadcaster>,
        settings: Arc<RwLock<AppSettings>>,
    ) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            servers,
            connector,
            broadcaster,
            settings,
        }
    }

    pub async fn open(&self, server_id: &str) -> AppResult<TransferOpened> {
        if let Some(existing) = self.reuse(server_id).await {
            return Ok(existing);
        }

        let server = self.servers.require(server_id)?;
        let options = ConnectOptions::from(&*self.settings.read());
        let target = resolve_target(&server, options)?;

        let session_id = match self.registry.claim(server_id, LIVE, || {
            let id = generate_id("sftp-");
            (id.clone(), TransferSession::new(id, server_id))
        }) {
            Claim::Existing(_) => {
                return match self.reuse(server_id).await {
                    Some(existing) => Ok(existing),
                    None => Err(AppError::SessionNotFound(server_id.to_string())),
                }
            }
            Claim::Created(id) => id,
        };

        tracing::info!(
            "Opening transfer session {} to {}@{}:{}",
            session_id,
            server.username,
            server.host,
            server.port
        );
        self.emit_if_present(&session_id, SessionStatus::Connecting, None);

        let connector = self.connector.clone();
        let connected = settle_connect(
            move || connector.connect(&target)?.into_sftp(),
            options.timeout,
            |fs: Box<dyn RemoteFs>| fs.close(),
        )
        .await;

        let fs: Arc<dyn RemoteFs> = match connected {
            Ok(fs) => Arc::from(fs),
            Err(e) => {
                self.fail(&session_id, &e);
                return Err(e);
            }
        };

        let published = self
            .registry
            .update(&session_id, |session| {
                if !session.status().can_advance_to(SessionStatus::Ready) {
                    return false;
                }
                session.phase = TransferPhase::Ready { fs: fs.clone() };
                self.broadcaster.emit(&SessionEvent::status(
                    &session_id,
                    SessionKind::Transfer,
                    SessionStatus::Ready,
                    None,
                ));
                true
            })
            .unwrap_or(false);

        if !published {
            tracing::info!("Transfer session {} was closed while connecting", session_id);
            tokio::task::spawn_blocking(move || fs.close());
            return Err(AppError::SessionNotFound(session_id));
        }

        let initial_remote_path = match run_blocking(move || Ok(initial_remote_path(fs.as_ref()))).await? {
            Ok(path) => path,
            Err(e) => {
                self.connection_lost(&session_id, &e);
                return Err(AppError::Transport(format!("Connection lost: {}", e)));
            }
        };
        tracing::info!("Transfer session {} ready at {}", session_id, initial_remote_path);

        Ok(TransferOpened {
            session_id,
            initial_remote_path,
        })
    }

    /// Answer an open for a server that already has a live session
    async fn reuse(&self, server_id: &str) -> Option<TransferOpened> {
        let (session_id, status) = self.registry.find_active_for(server_id, LIVE)?;
        tracing::debug!("Reusing transfer session {} ({:?})", session_id, status);

        let fs = self.registry.get(&session_id, |session| session.fs()).flatten();
        let initial_remote_path = match fs {
            Some(fs) => match run_blocking(move || Ok(initial_remote_path(fs.as_ref()))).await {
                Ok(Ok(path)) => path,
                Ok(Err(e)) => {
                    self.connection_lost(&session_id, &e);
                    return None;
                }
                Err(_) => PENDING_REMOTE_PATH.to_string(),
            },
            None => PENDING_REMOTE_PATH.to_string(),
        };

        Some(TransferOpened {
            session_id,
            initial_remote_path,
        })
    }

    fn emit_if_present(&self, session_id: &str, status: SessionStatus, message: Option<String>) {
        self.registry.get(session_id, |_| {
            self.broadcaster
                .emit(&SessionEvent::status(session_id, SessionKind::Transfer, status, message));
        });
    }

    fn fail(&self, session_id: &str, err: &AppError) {
        let message = sanitize_error_message(&err.to_string());
        tracing::warn!("Transfer session {} failed: {}", session_id, message);

        self.registry.update(session_id, |session| {
            if session.status().can_advance_to(SessionStatus::Error) {
                session.phase = TransferPhase::Error {
                    message: message.clone(),
                };
                self.broadcaster.emit(&SessionEvent::status(
                    session_id,
                    SessionKind::Transfer,
                    SessionStatus::Error,
                    Some(message),
                ));
            }
        });
    }

    /// Drop a session whose connection died. Only the caller that removes
    /// the entry reports it.
    fn connection_lost(&self, session_id: &str, err: &io::Error) {
        let Some(session) = self.registry.remove(session_id) else {
            return;
        };

        let message = sanitize_error_message(&format!("Connection lost: {}", err));
        tracing::warn!("Transfer session {} failed: {}", session_id, message);
        let status = session.status();
        if let Some(fs) = session.fs() {
            tokio::task::spawn_blocking(move || fs.close());
        }

        if status.can_advance_to(SessionStatus::Error) {
            self.broadcaster.emit(&SessionEvent::status(
                session_id,
                SessionKind::Transfer,
                SessionStatus::Error,
                Some(message),
            ));
        }
    }

    /// Run remote calls against a ready session on the blocking pool.
    /// A connection-level failure ends the session.
    async fn remote_op<T, F>(&self, session_id: &str, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RemoteFs) -> Result<T, RemoteFailure> + Send + 'static,
    {
        let fs = self.ready_fs(session_id)?;
        let outcome = run_blocking(move || Ok(f(fs.as_ref()))).await?;

        outcome.map_err(|failure| {
            if is_connection_lost(&failure.source) {
                self.connection_lost(session_id, &failure.source);
            }
            AppError::remote(failure.op, failure.source)
        })
    }

    /// The remote fs of a ready session
    fn ready_fs(&self, session_id: &str) -> AppResult<Arc<dyn RemoteFs>> {
        self.registry
            .get(session_id, |session| session.fs())
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?
            .ok_or_else(|| AppError::SessionNotConnected(session_id.to_string()))
    }

    pub async fn list(&self, session_id: &str, remote_path: &str) -> AppResult<Vec<RemoteEntry>> {
        let path = remote_path.to_string();
        self.remote_op(session_id, move |fs| {
            let entries = fs.readdir(&path).map_err(during("List directory"))?;
            Ok(entries
                .into_iter()
                .map(|entry| to_remote_entry(&path, entry))
                .collect())
        })
        .await
    }

    pub async fn download(&self, session_id: &str, remote_path: &str, local_path: &str) -> AppResult<()> {
        let remote = remote_path.to_string();
        let local = PathBuf::from(local_path);

        let bytes = self
            .remote_op(session_id, move |fs| fs.download(&remote, &local).map_err(during("Download")))
            .await?;

        tracing::info!("Downloaded {} ({} bytes) on {}", remote_path, bytes, session_id);
        Ok(())
    }

    pub async fn upload(&self, session_id: &str, local_path: &str, remote_path: &str) -> AppResult<()> {
        self.ready_fs(session_id)?;
        let local = PathBuf::from(local_path);
        if !local.is_file() {
            return Err(AppError::LocalFileNotFound(local_path.to_string()));
        }
        let remote = remote_path.to_string();

        let bytes = self
            .remote_op(session_id, move |fs| fs.upload(&local, &remote).map_err(during("Upload")))
            .await?;

        tracing::info!("Uploaded {} ({} bytes) on {}", remote_path, bytes, session_id);
        Ok(())
    }

    pub async fn mkdir(&self, session_id: &str, remote_path: &str) -> AppResult<()> {
        let path = remote_path.to_string();
        self.remote_op(session_id, move |fs| fs.mkdir(&path).map_err(during("Create directory")))
            .await
    }

    pub async fn rename(&self, session_id: &str, old_path: &str, new_path: &str) -> AppResult<()> {
        let (from, to) = (old_path.to_string(), new_path.to_string());
        self.remote_op(session_id, move |fs| fs.rename(&from, &to).map_err(during("Rename")))
            .await
    }

    /// Remove a file or an empty directory, chosen by a stat of the path
    pub async fn delete(&self, session_id: &str, remote_path: &str) -> AppResult<()> {
        let path = remote_path.to_string();
        self.remote_op(session_id, move |fs| {
            let stat = fs.stat(&path).map_err(during("Stat"))?;
            if stat.is_dir {
                fs.rmdir(&path).map_err(during("Delete directory"))
            } else {
                fs.unlink(&path).map_err(during("Delete file"))
            }
        })
        .await
    }

    /// Close a session. Unknown or already closed ids are a no-op.
    pub async fn close(&self, session_id: &str) {
        let Some(session) = self.registry.remove(session_id) else {
            tracing::debug!("Close for unknown transfer session {}", session_id);
            return;
        };

        let status = session.status();
        if let Some(fs) = session.fs() {
            let _ = run_blocking(move || {
                fs.close();
                Ok(())
            })
            .await;
        }

        tracing::info!("Closed transfer session {}", session_id);
        if status.can_advance_to(SessionStatus::Closed) {
            self.broadcaster.emit(&SessionEvent::status(
                session_id,
                SessionKind::Transfer,
                SessionStatus::Closed,
                None,
            ));
        }
    }

    pub async fn close_all(&self) {
        for id in self.registry.ids() {
            self.close(&id).await;
        }
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.registry.get(session_id, |session| session.status())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.snapshot(|_, session| session.info())
    }
}
