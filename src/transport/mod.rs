//! Transport seam between the session controllers and the wire.
//!
//! A [`Connector`] produces an authenticated [`Transport`], which is then
//! consumed into either an interactive [`ShellChannel`] or a [`RemoteFs`].
//! All methods block; controllers call them from blocking tasks or the
//! per-session I/O thread.

pub mod libssh;
#[cfg(test)]
pub mod mock;

pub use libssh::Ssh2Connector;

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved credentials for one connection attempt
#[derive(Clone)]
pub enum Credentials {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password([REDACTED])"),
            Credentials::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "[REDACTED]"))
                .finish(),
        }
    }
}

/// Everything needed to open an authenticated connection
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub timeout: Duration,
    pub keepalive_interval: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// One row of a remote directory listing
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDirEntry {
    pub filename: String,
    /// Long-form mode string, e.g. `drwxr-xr-x`
    pub longname: String,
    pub size: Option<u64>,
    /// Seconds since the epoch
    pub mtime: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub is_dir: bool,
    pub size: Option<u64>,
}

pub trait Connector: Send + Sync {
    fn connect(&self, target: &ConnectTarget) -> AppResult<Box<dyn Transport>>;
}

/// An authenticated connection, not yet bound to a channel
pub trait Transport: Send {
    /// Request a PTY-backed interactive shell on this connection
    fn into_shell(self: Box<Self>, size: PtySize) -> AppResult<Box<dyn ShellChannel>>;

    /// Negotiate the file-transfer subsystem on this connection
    fn into_sftp(self: Box<Self>) -> AppResult<Box<dyn RemoteFs>>;

    fn disconnect(self: Box<Self>);
}

/// Interactive shell channel. Stdout and stderr arrive interleaved on `read`.
pub trait ShellChannel: Send {
    /// Non-blocking read; `WouldBlock` or `Ok(0)` mean no data yet
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    fn resize(&mut self, size: PtySize) -> io::Result<()>;

    fn is_eof(&self) -> bool;

    /// Close the channel and terminate the underlying connection
    fn close(&mut self);
}

/// Whether an I/O error means the connection itself is gone rather than one
/// operation failing
pub fn is_connection_lost(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Remote file operations over one connection.
///
/// Implementations report a dead connection with an error that satisfies
/// [`is_connection_lost`].
pub trait RemoteFs: Send + Sync {
    fn realpath(&self, path: &str) -> io::Result<String>;
    fn readdir(&self, path: &str) -> io::Result<Vec<RemoteDirEntry>>;
    fn stat(&self, path: &str) -> io::Result<RemoteStat>;
    fn download(&self, remote: &str, local: &Path) -> io::Result<u64>;
    fn upload(&self, local: &Path, remote: &str) -> io::Result<u64>;
    fn mkdir(&self, path: &str) -> io::Result<()>;
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;
    fn rmdir(&self, path: &str) -> io::Result<()>;
    fn unlink(&self, path: &str) -> io::Result<()>;

    /// Terminate the underlying connection
    fn close(&self);
}
