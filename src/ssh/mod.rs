pub mod commands;
pub mod session;

pub use session::*;

use crate::config::AppSettings;
use crate::error::{AppError, AppResult};
use crate::logging::sanitize_error_message;
use crate::servers::{generate_id, ServerStore};
use crate::session::{
    resolve_target, settle_connect, Broadcaster, Claim, ConnectOptions, ConnectionRegistry,
    SessionEvent, SessionInfo, SessionKind, SessionStatus, TrackedSession,
};
use crate::transport::{Connector, PtySize, ShellChannel};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Statuses that count as an existing session when deduplicating opens
const LIVE: &[SessionStatus] = &[SessionStatus::Connecting, SessionStatus::Connected];

/// Owns every interactive shell session
pub struct ShellController {
    registry: Arc<ConnectionRegistry<ShellSession>>,
    servers: Arc<ServerStore>,
    connector: Arc<dyn Connector>,
    broadcaster: Arc<Broadcaster>,
    settings: Arc<RwLock<AppSettings>>,
}

impl ShellController {
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

    /// Open a shell to a saved server, or return the session already
    /// connecting or connected to it.
    ///
    /// Resolves once the shell is up or the attempt has failed.
    pub async fn open(&self, server_id: &str) -> AppResult<String> {
        if let Some((id, status)) = self.registry.find_active_for(server_id, LIVE) {
            tracing::debug!("Reusing shell session {} ({:?}) for server {}", id, status, server_id);
            return Ok(id);
        }

        let server = self.servers.require(server_id)?;
        let options = ConnectOptions::from(&*self.settings.read());
        let target = resolve_target(&server, options)?;

        let session_id = match self.registry.claim(server_id, LIVE, || {
            let id = generate_id("session-");
            (id.clone(), ShellSession::new(id, server_id))
        }) {
            Claim::Existing(id) => return Ok(id),
            Claim::Created(id) => id,
        };

        tracing::info!(
            "Opening shell session {} to {}@{}:{}",
            session_id,
            server.username,
            server.host,
            server.port
        );
        self.registry.get(&session_id, |_| {
            self.broadcaster.emit(&SessionEvent::status(
                &session_id,
                SessionKind::Shell,
                SessionStatus::Connecting,
                None,
            ));
        });

        let connector = self.connector.clone();
        let connected = settle_connect(
            move || connector.connect(&target)?.into_shell(PtySize::default()),
            options.timeout,
            |mut channel: Box<dyn ShellChannel>| channel.close(),
        )
        .await;

        match connected {
            Ok(channel) => {
                self.attach(&session_id, channel)?;
                Ok(session_id)
            }
            Err(e) => {
                self.fail(&session_id, &e);
                Err(e)
            }
        }
    }

    /// Move a connecting session to connected and start its I/O thread
    fn attach(&self, session_id: &str, mut channel: Box<dyn ShellChannel>) -> AppResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();

        let attached = self
            .registry
            .update(session_id, |session| {
                if !session.status().can_advance_to(SessionStatus::Connected) {
                    return false;
                }
                session.phase = ShellPhase::Connected { commands: tx };
                self.broadcaster.emit(&SessionEvent::status(
                    session_id,
                    SessionKind::Shell,
                    SessionStatus::Connected,
                    None,
                ));
                true
            })
            .unwrap_or(false);

        if !attached {
            tracing::info!("Shell session {} was closed while connecting", session_id);
            tokio::task::spawn_blocking(move || channel.close());
            return Err(AppError::SessionNotFound(session_id.to_string()));
        }

        let io_loop = IoLoop {
            session_id: session_id.to_string(),
            registry: self.registry.clone(),
            broadcaster: self.broadcaster.clone(),
        };
        if let Err(e) = io_loop.spawn(channel, rx) {
            let err = AppError::Transport(format!("Failed to start I/O thread: {}", e));
            if self.registry.remove(session_id).is_some() {
                self.broadcaster.emit(&SessionEvent::status(
                    session_id,
                    SessionKind::Shell,
                    SessionStatus::Error,
                    Some(err.to_string()),
                ));
            }
            return Err(err);
        }

        tracing::info!("Shell session {} connected", session_id);
        Ok(())
    }

    /// Record a failed connect attempt on a still-registered session
    fn fail(&self, session_id: &str, err: &AppError) {
        let message = sanitize_error_message(&err.to_string());
        tracing::warn!("Shell session {} failed: {}", session_id, message);

        self.registry.update(session_id, |session| {
            if session.status().can_advance_to(SessionStatus::Error) {
                session.phase = ShellPhase::Error {
                    message: message.clone(),
                };
                self.broadcaster.emit(&SessionEvent::status(
                    session_id,
                    SessionKind::Shell,
                    SessionStatus::Error,
                    Some(message),
                ));
            }
        });
    }

    /// Forward keystrokes to a connected session
    pub fn write(&self, session_id: &str, data: &[u8]) -> AppResult<()> {
        let commands = self
            .registry
            .get(session_id, |session| session.commands().cloned())
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?
            .ok_or_else(|| AppError::SessionNotConnected(session_id.to_string()))?;

        commands
            .send(ShellCommand::Write(data.to_vec()))
            .map_err(|_| AppError::SessionNotConnected(session_id.to_string()))
    }

    /// Best-effort PTY resize; ignored unless the session is connected
    pub fn resize(&self, session_id: &str, cols: u32, rows: u32) {
        let sent = self
            .registry
            .get(session_id, |session| {
                session
                    .commands()
                    .map(|tx| tx.send(ShellCommand::Resize(PtySize { cols, rows })).is_ok())
            })
            .flatten()
            .unwrap_or(false);

        if !sent {
            tracing::debug!("Ignoring resize for shell session {} (not connected)", session_id);
        }
    }

    /// Close a session. Unknown or already closed ids are a no-op.
    pub fn close(&self, session_id: &str) {
        let Some(session) = self.registry.remove(session_id) else {
            tracing::debug!("Close for unknown shell session {}", session_id);
            return;
        };

        let status = session.status();
        // Dropping the entry drops the command sender, which stops the I/O thread
        drop(session);

        tracing::info!("Closed shell session {}", session_id);
        if status.can_advance_to(SessionStatus::Closed) {
            self.broadcaster.emit(&SessionEvent::status(
                session_id,
                SessionKind::Shell,
                SessionStatus::Closed,
                None,
            ));
        }
    }

    pub fn close_all(&self) {
        for id in self.registry.ids() {
            self.close(&id);
        }
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.registry.get(session_id, |session| session.status())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.registry.snapshot(|_, session| session.info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::{AuthType, ServerInput};
    use crate::session::test_support::{password_server, record_events, server_store, statuses_for, wait_for};
    use crate::transport::mock::MockConnector;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        shells: Arc<ShellController>,
        connector: Arc<MockConnector>,
        broadcaster: Arc<Broadcaster>,
        servers: Arc<ServerStore>,
        settings: Arc<RwLock<AppSettings>>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let servers = server_store(dir.path());
        let connector = MockConnector::new();
        let broadcaster = Arc::new(Broadcaster::new());
        let settings = Arc::new(RwLock::new(AppSettings::default()));
        let shells = Arc::new(ShellController::new(
            servers.clone(),
            connector.clone(),
            broadcaster.clone(),
            settings.clone(),
        ));
        Fixture {
            _dir: dir,
            shells,
            connector,
            broadcaster,
            servers,
            settings,
        }
    }

    #[tokio::test]
    async fn test_open_connects_and_emits_in_order() {
        let f = fixture();
        let server = password_server(&f.servers);
        let events = record_events(&f.broadcaster);

        let id = f.shells.open(&server.id).await.unwrap();
        assert!(id.starts_with("session-"));
        assert_eq!(f.shells.status(&id), Some(SessionStatus::Connected));
        assert_eq!(
            statuses_for(&events.lock(), &id),
            vec![SessionStatus::Connecting, SessionStatus::Connected]
        );
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_one_connection() {
        let f = fixture();
        let server = password_server(&f.servers);
        f.connector.set_delay(Duration::from_millis(100));

        let (a, b) = tokio::join!(f.shells.open(&server.id), f.shells.open(&server.id));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(f.connector.connect_count(), 1);

        let again = f.shells.open(&server.id).await.unwrap();
        assert_eq!(f.shells.list().len(), 1);
        assert_eq!(f.shells.list()[0].session_id, again);
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let f = fixture();
        let err = f.shells.open("missing").await.unwrap_err();
        assert!(matches!(err, AppError::ServerNotFound(_)));
        assert!(f.shells.list().is_empty());
    }

    #[tokio::test]
    async fn test_auth_config_fails_before_connecting() {
        let f = fixture();
        let server = f
            .servers
            .create(ServerInput {
                name: String::new(),
                host: "h".into(),
                port: 22,
                username: "u".into(),
                auth_type: AuthType::Password,
                password: None,
                private_key_path: None,
                passphrase: None,
                notes: None,
            })
            .unwrap();

        let err = f.shells.open(&server.id).await.unwrap_err();
        assert!(matches!(err, AppError::AuthConfig(_)));
        assert_eq!(f.connector.connect_count(), 0);
        assert!(f.shells.list().is_empty());
    }

    #[tokio::test]
    async fn test_write_and_output() {
        let f = fixture();
        let server = password_server(&f.servers);
        let events = record_events(&f.broadcaster);
        let id = f.shells.open(&server.id).await.unwrap();

        f.shells.write(&id, b"ls\n").unwrap();
        let shell = f.connector.shell.clone();
        assert!(wait_for(|| shell.written_text() == "ls\n").await);

        f.connector.shell.push_output(b"file.txt\r\n");
        let seen = events.clone();
        assert!(
            wait_for(|| seen.lock().iter().any(|e| matches!(e,
                SessionEvent::Data(d) if d.session_id == id && d.data == b"file.txt\r\n")))
            .await
        );

        assert!(matches!(f.shells.write("nope", b"x"), Err(AppError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_resize_is_best_effort() {
        let f = fixture();
        let server = password_server(&f.servers);
        f.shells.resize("nope", 100, 40);

        let id = f.shells.open(&server.id).await.unwrap();
        f.shells.resize(&id, 120, 40);
        let shell = f.connector.shell.clone();
        assert!(wait_for(|| shell.resizes.lock().contains(&PtySize { cols: 120, rows: 40 })).await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let f = fixture();
        let server = password_server(&f.servers);
        let events = record_events(&f.broadcaster);
        let id = f.shells.open(&server.id).await.unwrap();

        f.shells.close(&id);
        f.shells.close(&id);
        f.shells.close("never-existed");

        let closed = statuses_for(&events.lock(), &id)
            .into_iter()
            .filter(|s| *s == SessionStatus::Closed)
            .count();
        assert_eq!(closed, 1);
        assert!(matches!(f.shells.write(&id, b"x"), Err(AppError::SessionNotFound(_))));

        let shell = f.connector.shell.clone();
        assert!(wait_for(|| shell.closed.load(Ordering::SeqCst)).await);
    }

    #[tokio::test]
    async fn test_remote_eof_closes_session() {
        let f = fixture();
        let server = password_server(&f.servers);
        let events = record_events(&f.broadcaster);
        let id = f.shells.open(&server.id).await.unwrap();

        f.connector.shell.eof.store(true, Ordering::SeqCst);
        let shells = f.shells.clone();
        assert!(wait_for(|| shells.status(&id).is_none()).await);
        assert_eq!(statuses_for(&events.lock(), &id).last(), Some(&SessionStatus::Closed));
    }

    #[tokio::test]
    async fn test_transport_fault_marks_error() {
        let f = fixture();
        let server = password_server(&f.servers);
        let events = record_events(&f.broadcaster);
        let id = f.shells.open(&server.id).await.unwrap();

        *f.connector.shell.read_fault.lock() = Some("reset by peer".into());
        let shells = f.shells.clone();
        assert!(wait_for(|| shells.status(&id).is_none()).await);

        let last = events.lock().iter().rev().find_map(|e| match e {
            SessionEvent::Status(s) if s.session_id == id => Some(s.clone()),
            _ => None,
        });
        let last = last.unwrap();
        assert_eq!(last.status, SessionStatus::Error);
        assert!(last.error_message.unwrap().contains("reset by peer"));
    }

    #[tokio::test]
    async fn test_connect_failure_then_retry_creates_new_session() {
        let f = fixture();
        let server = password_server(&f.servers);
        f.connector.fail_connects_with("Connection refused");

        let err = f.shells.open(&server.id).await.unwrap_err();
        assert!(matches!(err, AppError::Transport(_)));
        let failed = f.shells.list();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, SessionStatus::Error);
        assert_eq!(failed[0].error_message.as_deref(), Some("Transport error: Connection refused"));

        assert!(matches!(
            f.shells.write(&failed[0].session_id, b"x"),
            Err(AppError::SessionNotConnected(_))
        ));

        *f.connector.fail_with.lock() = None;
        let id = f.shells.open(&server.id).await.unwrap();
        assert_ne!(id, failed[0].session_id);
        assert_eq!(f.connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_write_while_connecting_is_rejected() {
        let f = fixture();
        let server = password_server(&f.servers);
        f.connector.set_delay(Duration::from_millis(150));

        let shells = f.shells.clone();
        let server_id = server.id.clone();
        let open = tokio::spawn(async move { shells.open(&server_id).await });

        let shells = f.shells.clone();
        assert!(wait_for(|| !shells.list().is_empty()).await);
        let id = f.shells.list()[0].session_id.clone();
        assert_eq!(f.shells.status(&id), Some(SessionStatus::Connecting));
        assert!(matches!(f.shells.write(&id, b"early"), Err(AppError::SessionNotConnected(_))));

        assert_eq!(open.await.unwrap().unwrap(), id);
        f.shells.write(&id, b"late").unwrap();
        let shell = f.connector.shell.clone();
        assert!(wait_for(|| shell.written_text() == "late").await);
    }

    #[tokio::test]
    async fn test_multibyte_output_split_across_reads() {
        let f = fixture();
        let server = password_server(&f.servers);
        let events = record_events(&f.broadcaster);
        let id = f.shells.open(&server.id).await.unwrap();

        let e_acute = "é".as_bytes();
        f.connector.shell.push_output(&e_acute[..1]);
        f.connector.shell.push_output(&e_acute[1..]);

        let seen = events.clone();
        assert!(
            wait_for(|| seen.lock().iter().any(|e| matches!(e,
                SessionEvent::Data(d) if d.session_id == id && d.data == e_acute)))
            .await
        );

        let wire: Vec<String> = events
            .lock()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Data(_)))
            .map(|e| serde_json::to_value(e).unwrap()["payload"]["data"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(wire.concat(), "é");
    }

    #[tokio::test]
    async fn test_sink_hands_off_before_closing() {
        let f = fixture();
        let server = password_server(&f.servers);

        // Sinks run under the session entry; act on events from another task
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        f.broadcaster.subscribe(Arc::new(move |event: &SessionEvent| {
            if let SessionEvent::Status(s) = event {
                if s.status == SessionStatus::Connected {
                    let _ = tx.send(s.session_id.clone());
                }
            }
        }));

        let shells = f.shells.clone();
        let closer = tokio::spawn(async move {
            let id = rx.recv().await.unwrap();
            shells.close(&id);
            id
        });

        let id = f.shells.open(&server.id).await.unwrap();
        assert_eq!(closer.await.unwrap(), id);
        assert!(f.shells.status(&id).is_none());
    }

    #[tokio::test]
    async fn test_timeout_settles_once_and_reaps_late_channel() {
        let f = fixture();
        let server = password_server(&f.servers);
        f.settings.write().connect_timeout_secs = 1;
        f.connector.set_delay(Duration::from_millis(1500));
        let events = record_events(&f.broadcaster);

        let err = f.shells.open(&server.id).await.unwrap_err();
        assert!(matches!(err, AppError::ConnectionTimeout(1)));

        let id = f.shells.list()[0].session_id.clone();
        assert_eq!(f.shells.status(&id), Some(SessionStatus::Error));

        let shell = f.connector.shell.clone();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(wait_for(|| shell.closed.load(Ordering::SeqCst)).await);

        // The late connection never moves the session out of error
        assert_eq!(f.shells.status(&id), Some(SessionStatus::Error));
        assert_eq!(
            statuses_for(&events.lock(), &id),
            vec![SessionStatus::Connecting, SessionStatus::Error]
        );
    }

    #[tokio::test]
    async fn test_close_while_connecting_discards_late_result() {
        let f = fixture();
        let server = password_server(&f.servers);
        f.connector.set_delay(Duration::from_millis(150));
        let events = record_events(&f.broadcaster);

        let shells = f.shells.clone();
        let server_id = server.id.clone();
        let open = tokio::spawn(async move { shells.open(&server_id).await });

        let shells = f.shells.clone();
        assert!(wait_for(|| !shells.list().is_empty()).await);
        let id = f.shells.list()[0].session_id.clone();
        f.shells.close(&id);

        let err = open.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound(_)));

        let shell = f.connector.shell.clone();
        assert!(wait_for(|| shell.closed.load(Ordering::SeqCst)).await);
        assert!(!statuses_for(&events.lock(), &id).contains(&SessionStatus::Connected));
    }
}
