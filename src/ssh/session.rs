use crate::logging::sanitize_error_message;
use crate::session::{
    Broadcaster, ConnectionRegistry, SessionEvent, SessionInfo, SessionKind, SessionStatus,
    TrackedSession,
};
use crate::transport::{is_connection_lost, PtySize, ShellChannel};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Read buffer for channel output
const READ_BUF_SIZE: usize = 32 * 1024;

/// Non-fatal read errors tolerated in a row before giving up
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Idle sleep between loop iterations
const LOOP_SLEEP: Duration = Duration::from_millis(2);

/// Commands sent to a live session's I/O thread
#[derive(Debug)]
pub enum ShellCommand {
    Write(Vec<u8>),
    Resize(PtySize),
}

/// Lifecycle phase. The command sender only exists while connected.
#[derive(Debug)]
pub enum ShellPhase {
    Connecting,
    Connected {
        commands: mpsc::UnboundedSender<ShellCommand>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug)]
pub struct ShellSession {
    pub id: String,
    pub server_id: String,
    pub phase: ShellPhase,
    pub created_at: i64,
}

impl ShellSession {
    pub fn new(id: String, server_id: &str) -> Self {
        Self {
            id,
            server_id: server_id.to_string(),
            phase: ShellPhase::Connecting,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn commands(&self) -> Option<&mpsc::UnboundedSender<ShellCommand>> {
        match &self.phase {
            ShellPhase::Connected { commands } => Some(commands),
            _ => None,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            server_id: self.server_id.clone(),
            kind: SessionKind::Shell,
            status: self.status(),
            error_message: match &self.phase {
                ShellPhase::Error { message } => Some(message.clone()),
                _ => None,
            },
            created_at: self.created_at,
        }
    }
}

impl TrackedSession for ShellSession {
    type Status = SessionStatus;

    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn status(&self) -> SessionStatus {
        match self.phase {
            ShellPhase::Connecting => SessionStatus::Connecting,
            ShellPhase::Connected { .. } => SessionStatus::Connected,
            ShellPhase::Error { .. } => SessionStatus::Error,
        }
    }
}

/// Why the I/O loop stopped
#[derive(Debug, PartialEq)]
enum LoopExit {
    /// The registry entry is gone; whoever removed it reported the close
    Detached,
    RemoteClosed,
    Fault(String),
}

/// Holds back a trailing partial UTF-8 sequence until the next read
/// completes it, so a character split across reads reaches the UI whole
#[derive(Debug, Default)]
struct Utf8Carry {
    tail: Vec<u8>,
}

impl Utf8Carry {
    /// Bytes ready to emit, ending on a character boundary where possible
    fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.tail);
        data.extend_from_slice(chunk);
        let keep = incomplete_tail_len(&data);
        self.tail = data.split_off(data.len() - keep);
        data
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tail)
    }
}

/// Length of an unfinished multi-byte sequence at the end of `data`
fn incomplete_tail_len(data: &[u8]) -> usize {
    let start = data.len().saturating_sub(3);
    for i in (start..data.len()).rev() {
        let needed = match data[i] {
            0x80..=0xBF => continue,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return 0,
        };
        let have = data.len() - i;
        return if have < needed { have } else { 0 };
    }
    0
}

/// Blocking pump between one shell channel and the broadcaster
pub(crate) struct IoLoop {
    pub session_id: String,
    pub registry: Arc<ConnectionRegistry<ShellSession>>,
    pub broadcaster: Arc<Broadcaster>,
}

impl IoLoop {
    pub fn spawn(
        self,
        channel: Box<dyn ShellChannel>,
        commands: mpsc::UnboundedReceiver<ShellCommand>,
    ) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("io-{}", self.session_id))
            .spawn(move || self.run(channel, commands))
    }

    fn run(self, mut channel: Box<dyn ShellChannel>, mut commands: mpsc::UnboundedReceiver<ShellCommand>) {
        tracing::debug!("Entering I/O loop (session {})", self.session_id);
        let mut carry = Utf8Carry::default();
        let exit = self.pump(channel.as_mut(), &mut commands, &mut carry);
        channel.close();

        let rest = carry.take();
        if exit != LoopExit::Detached && !rest.is_empty() {
            self.deliver(&rest);
        }
        self.finish(exit);
    }

    fn pump(
        &self,
        channel: &mut dyn ShellChannel,
        commands: &mut mpsc::UnboundedReceiver<ShellCommand>,
        carry: &mut Utf8Carry,
    ) -> LoopExit {
        let mut read_buf = vec![0u8; READ_BUF_SIZE];
        let mut consecutive_errors = 0u32;

        loop {
            // Drain queued commands in order
            loop {
                match commands.try_recv() {
                    Ok(ShellCommand::Write(data)) => {
                        if let Err(e) = channel.write_all(&data) {
                            if channel.is_eof() {
                                return LoopExit::RemoteClosed;
                            }
                            return LoopExit::Fault(format!("Write failed: {}", e));
                        }
                    }
                    Ok(ShellCommand::Resize(size)) => {
                        if let Err(e) = channel.resize(size) {
                            tracing::warn!("Failed to resize PTY (session {}): {}", self.session_id, e);
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return LoopExit::Detached,
                }
            }

            // Drain output until the channel would block
            loop {
                match channel.read(&mut read_buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        consecutive_errors = 0;
                        let data = carry.push(&read_buf[..n]);
                        if !data.is_empty() && !self.deliver(&data) {
                            return LoopExit::Detached;
                        }
                    }
                    Err(ref e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if channel.is_eof() {
                            return LoopExit::RemoteClosed;
                        }
                        if is_connection_lost(&e) {
                            return LoopExit::Fault(format!("Connection lost: {}", e));
                        }
                        consecutive_errors += 1;
                        tracing::warn!(
                            "Read error (session {}): {}; count={}",
                            self.session_id,
                            e,
                            consecutive_errors
                        );
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            return LoopExit::Fault(format!("Connection lost: {}", e));
                        }
                        break;
                    }
                }
            }

            if channel.is_eof() {
                return LoopExit::RemoteClosed;
            }

            thread::sleep(LOOP_SLEEP);
        }
    }

    /// Emit output while the entry is still registered
    fn deliver(&self, data: &[u8]) -> bool {
        self.registry
            .get(&self.session_id, |_| {
                self.broadcaster
                    .emit(&SessionEvent::data(&self.session_id, SessionKind::Shell, data));
            })
            .is_some()
    }

    fn finish(&self, exit: LoopExit) {
        let (status, message) = match exit {
            LoopExit::Detached => {
                tracing::debug!("I/O loop detached (session {})", self.session_id);
                return;
            }
            LoopExit::RemoteClosed => (SessionStatus::Closed, None),
            LoopExit::Fault(message) => (SessionStatus::Error, Some(sanitize_error_message(&message))),
        };

        if self.registry.remove(&self.session_id).is_none() {
            return;
        }

        match &message {
            Some(message) => tracing::warn!("Shell session {} failed: {}", self.session_id, message),
            None => tracing::info!("Shell session {} closed by remote", self.session_id),
        }
        self.broadcaster
            .emit(&SessionEvent::status(&self.session_id, SessionKind::Shell, status, message));
    }
}
