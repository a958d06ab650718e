//! Shared session plumbing: status model, events, the registry, and the
//! connect-and-settle path used by both shell and transfer sessions.

pub mod broadcast;
pub mod registry;

pub use broadcast::{Broadcaster, EventSink, SubscriptionId};
pub use registry::{Claim, ConnectionRegistry, TrackedSession};

use crate::config::AppSettings;
use crate::error::{AppError, AppResult};
use crate::servers::{AuthType, ServerRecord};
use crate::transport::{ConnectTarget, Credentials};
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Shell,
    Transfer,
}

/// Externally visible session status.
///
/// Shell sessions use `Connected`, transfer sessions use `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Ready,
    Error,
    Closed,
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            SessionStatus::Connecting => 0,
            SessionStatus::Connected | SessionStatus::Ready => 1,
            SessionStatus::Error | SessionStatus::Closed => 2,
        }
    }

    /// Status only moves forward; `Error` and `Closed` are terminal
    pub fn can_advance_to(self, next: SessionStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEvent {
    pub session_id: String,
    pub kind: SessionKind,
    #[serde(serialize_with = "serialize_lossy")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub session_id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Event pushed to observers; serialized as `{"event": ..., "payload": ...}`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum SessionEvent {
    #[serde(rename = "session:data")]
    Data(DataEvent),
    #[serde(rename = "session:status")]
    Status(StatusEvent),
}

impl SessionEvent {
    pub fn data(session_id: &str, kind: SessionKind, data: &[u8]) -> Self {
        SessionEvent::Data(DataEvent {
            session_id: session_id.to_string(),
            kind,
            data: data.to_vec(),
        })
    }

    pub fn status(
        session_id: &str,
        kind: SessionKind,
        status: SessionStatus,
        error_message: Option<String>,
    ) -> Self {
        SessionEvent::Status(StatusEvent {
            session_id: session_id.to_string(),
            kind,
            status,
            error_message,
        })
    }

    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Data(e) => &e.session_id,
            SessionEvent::Status(e) => &e.session_id,
        }
    }
}

/// Terminal output is not guaranteed to be valid UTF-8
fn serialize_lossy<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(data))
}

/// Summary of one registry entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub server_id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: i64,
}

/// Connection tunables taken from settings at open time
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub timeout: Duration,
    pub keepalive_interval: u32,
}

impl From<&AppSettings> for ConnectOptions {
    fn from(settings: &AppSettings) -> Self {
        Self {
            timeout: settings.connect_timeout(),
            keepalive_interval: settings.keepalive_interval_secs,
        }
    }
}

/// Validate a server's credentials and build the connection target.
///
/// Fails before any network I/O when the selected auth mode is unusable.
pub fn resolve_target(server: &ServerRecord, options: ConnectOptions) -> AppResult<ConnectTarget> {
    let credentials = match server.auth_type {
        AuthType::Password => match server.password.as_deref() {
            Some(password) if !password.is_empty() => Credentials::Password(password.to_string()),
            _ => {
                return Err(AppError::AuthConfig(
                    "Password is required for password authentication".to_string(),
                ))
            }
        },
        AuthType::PrivateKey => {
            let raw = server
                .private_key_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .ok_or_else(|| {
                    AppError::AuthConfig("Private key path is required for key authentication".to_string())
                })?;

            let path = expand_key_path(raw)?;
            if !path.is_file() {
                return Err(AppError::AuthConfig(format!(
                    "Private key file not found: {}",
                    path.display()
                )));
            }
            if let Err(e) = std::fs::File::open(&path) {
                return Err(AppError::AuthConfig(format!(
                    "Private key file is not readable: {} ({})",
                    path.display(),
                    e
                )));
            }

            Credentials::KeyFile {
                path,
                passphrase: server.passphrase.clone().filter(|p| !p.is_empty()),
            }
        }
    };

    Ok(ConnectTarget {
        host: server.host.clone(),
        port: server.port,
        username: server.username.clone(),
        credentials,
        timeout: options.timeout,
        keepalive_interval: options.keepalive_interval,
    })
}

/// Expand a leading `~` and make the path absolute
fn expand_key_path(raw: &str) -> AppResult<PathBuf> {
    let raw = raw.trim();
    let path = if raw == "~" || raw.starts_with("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| AppError::AuthConfig("Cannot expand ~ without a home directory".to_string()))?;
        home.join(raw.trim_start_matches('~').trim_start_matches('/'))
    } else {
        PathBuf::from(raw)
    };

    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Run a blocking connect and settle on whichever finishes first, the
/// connect or the timeout.
///
/// A connection that completes after the timeout has fired is passed to
/// `orphan` so it can be torn down.
pub async fn settle_connect<T, C, O>(connect: C, timeout: Duration, orphan: O) -> AppResult<T>
where
    T: Send + 'static,
    C: FnOnce() -> AppResult<T> + Send + 'static,
    O: FnOnce(T) + Send + 'static,
{
    let mut task = tokio::task::spawn_blocking(connect);

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(AppError::Transport(format!("Connect task failed: {}", join_err))),
        Err(_) => {
            tokio::spawn(async move {
                if let Ok(Ok(late)) = task.await {
                    tracing::debug!("Tearing down connection that completed after timeout");
                    orphan(late);
                }
            });
            Err(AppError::ConnectionTimeout(timeout.as_secs()))
        }
    }
}
