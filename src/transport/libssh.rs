//! libssh2-backed transport

use super::{
    ConnectTarget, Connector, Credentials, PtySize, RemoteDirEntry, RemoteFs, RemoteStat,
    ShellChannel, Transport,
};
use crate::error::{AppError, AppResult};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use ssh2::{
    Channel, CheckResult, ErrorCode, FileStat, KnownHostFileKind, KnownHostKeyFormat, Session, Sftp,
};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Per-operation timeout once a transfer session is up
const SFTP_OP_TIMEOUT_MS: u32 = 60_000;

/// Keepalives that may fail in a row before the link is declared dead
const KEEPALIVE_COUNT_MAX: u32 = 3;

/// libssh2 session codes that mean the socket or the channel is gone:
/// SOCKET_SEND, TIMEOUT, SOCKET_DISCONNECT, CHANNEL_CLOSED, SOCKET_TIMEOUT,
/// SOCKET_RECV
const LINK_DOWN_CODES: [i32; 6] = [-7, -9, -13, -26, -30, -43];

fn is_link_down(code: ErrorCode) -> bool {
    matches!(code, ErrorCode::Session(rc) if LINK_DOWN_CODES.contains(&rc))
}

/// Map an ssh2 error to io, marking a dead connection as `ConnectionAborted`
fn classify(err: ssh2::Error) -> io::Error {
    if is_link_down(err.code()) {
        io::Error::new(io::ErrorKind::ConnectionAborted, err.to_string())
    } else {
        err.into()
    }
}

pub struct Ssh2Connector {
    known_hosts_path: PathBuf,
}

impl Ssh2Connector {
    pub fn new(known_hosts_path: impl Into<PathBuf>) -> Self {
        Self {
            known_hosts_path: known_hosts_path.into(),
        }
    }
}

impl Connector for Ssh2Connector {
    fn connect(&self, target: &ConnectTarget) -> AppResult<Box<dyn Transport>> {
        tracing::info!(
            "Connecting to {}@{}:{}",
            target.username,
            target.host,
            target.port
        );

        let tcp = connect_tcp(&target.host, target.port, target.timeout)?;
        tcp.set_nodelay(true)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(target.timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| AppError::Transport(format!("SSH handshake failed: {}", e)))?;

        verify_host_key(&session, &self.known_hosts_path, &target.host, target.port)?;
        authenticate(&session, &target.username, &target.credentials)?;

        session.set_keepalive(true, target.keepalive_interval);
        session.set_timeout(0);

        tracing::info!("Authenticated to {}:{}", target.host, target.port);
        Ok(Box::new(Ssh2Transport {
            session,
            keepalive_interval: target.keepalive_interval,
        }))
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> AppResult<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| AppError::Transport(format!("Failed to resolve {}: {}", host, e)))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("TCP connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(match last_err {
        Some(e) if e.kind() == io::ErrorKind::TimedOut => AppError::ConnectionTimeout(timeout.as_secs()),
        Some(e) => AppError::Transport(format!("TCP connect failed: {}", e)),
        None => AppError::Transport(format!("No addresses found for {}", host)),
    })
}

/// Trust-on-first-use check against the app's own known_hosts file
fn verify_host_key(session: &Session, known_hosts_path: &Path, host: &str, port: u16) -> AppResult<()> {
    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| AppError::Transport("No host key received".to_string()))?;
    let fingerprint = compute_sha256_fingerprint(key);

    let mut known_hosts = session.known_hosts()?;
    if known_hosts_path.exists() {
        if let Err(e) = known_hosts.read_file(known_hosts_path, KnownHostFileKind::OpenSSH) {
            tracing::warn!("Failed to read {:?}: {}", known_hosts_path, e);
        }
    }

    match known_hosts.check_port(host, port, key) {
        CheckResult::Match => {
            tracing::debug!("Host key matched for {}:{}", host, port);
            Ok(())
        }
        CheckResult::NotFound => {
            let entry = if port == 22 {
                host.to_string()
            } else {
                format!("[{}]:{}", host, port)
            };
            known_hosts.add(
                &entry,
                key,
                &format!("added by shellvault on {}", chrono::Utc::now().format("%Y-%m-%d")),
                KnownHostKeyFormat::from(key_type),
            )?;

            if let Some(parent) = known_hosts_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            known_hosts.write_file(known_hosts_path, KnownHostFileKind::OpenSSH)?;

            tracing::info!("Trusted new host key for {}:{} ({})", host, port, fingerprint);
            Ok(())
        }
        CheckResult::Mismatch => {
            tracing::error!("HOST KEY MISMATCH for {}:{} ({})", host, port, fingerprint);
            Err(AppError::Transport(format!(
                "Host key for {}:{} has changed ({}). Remove the old entry from {} if the change is expected.",
                host,
                port,
                fingerprint,
                known_hosts_path.display()
            )))
        }
        CheckResult::Failure => Err(AppError::Transport("Failed to check known hosts".to_string())),
    }
}

fn authenticate(session: &Session, username: &str, credentials: &Credentials) -> AppResult<()> {
    match credentials {
        Credentials::Password(password) => {
            session
                .userauth_password(username, password)
                .map_err(|_| AppError::Transport("Password authentication failed".to_string()))?;
        }
        Credentials::KeyFile { path, passphrase } => {
            session
                .userauth_pubkey_file(username, None, path, passphrase.as_deref())
                .map_err(|e| {
                    let msg = e.message().to_lowercase();
                    if msg.contains("passphrase") || msg.contains("decrypt") || msg.contains("parse") {
                        AppError::Transport(
                            "Invalid passphrase or key format. Ensure the key is in PEM or OpenSSH format."
                                .to_string(),
                        )
                    } else {
                        AppError::Transport("Private key not accepted by server".to_string())
                    }
                })?;
        }
    }

    if !session.authenticated() {
        return Err(AppError::Transport("Authentication failed".to_string()));
    }
    Ok(())
}

/// Compute SHA256 fingerprint of a host key, OpenSSH style
fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, digest);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

struct Ssh2Transport {
    session: Session,
    keepalive_interval: u32,
}

impl Transport for Ssh2Transport {
    fn into_shell(self: Box<Self>, size: PtySize) -> AppResult<Box<dyn ShellChannel>> {
        let channel = match open_interactive_channel(&self.session, size) {
            Ok(channel) => channel,
            Err(e) => {
                let _ = self.session.disconnect(None, "Shell request failed", None);
                return Err(e);
            }
        };
        self.session.set_blocking(false);

        Ok(Box::new(Ssh2Shell {
            session: self.session,
            channel,
            keepalive: Keepalive::new(Duration::from_secs(self.keepalive_interval.max(1) as u64)),
        }))
    }

    fn into_sftp(self: Box<Self>) -> AppResult<Box<dyn RemoteFs>> {
        let sftp = match self.session.sftp() {
            Ok(sftp) => sftp,
            Err(e) => {
                let _ = self.session.disconnect(None, "SFTP request failed", None);
                return Err(AppError::Transport(format!("Failed to open SFTP: {}", e)));
            }
        };
        self.session.set_timeout(SFTP_OP_TIMEOUT_MS);

        Ok(Box::new(Ssh2Fs {
            session: self.session,
            sftp: Mutex::new(sftp),
        }))
    }

    fn disconnect(self: Box<Self>) {
        let _ = self.session.disconnect(None, "Closed", None);
    }
}

/// Open a PTY shell, falling back to a login shell via exec
fn open_interactive_channel(session: &Session, size: PtySize) -> AppResult<Channel> {
    let open_channel = || -> AppResult<Channel> {
        let mut ch = session
            .channel_session()
            .map_err(|e| AppError::Transport(format!("Failed to open channel: {}", e)))?;
        ch.handle_extended_data(ssh2::ExtendedData::Merge)?;
        ch.request_pty("xterm-256color", None, Some((size.cols, size.rows, 0, 0)))
            .map_err(|e| AppError::Transport(format!("Failed to request PTY: {}", e)))?;
        Ok(ch)
    };

    let mut ch = open_channel()?;
    match ch.shell() {
        Ok(()) => return Ok(ch),
        Err(e) => {
            tracing::debug!("Shell request refused: {}", e);
            let _ = ch.close();
        }
    }

    for cmd in ["bash -l", "sh -l"] {
        let mut ch = open_channel()?;
        match ch.exec(cmd) {
            Ok(()) => {
                tracing::debug!("Interactive shell started via exec '{}'", cmd);
                return Ok(ch);
            }
            Err(e) => {
                tracing::debug!("exec '{}' refused: {}", cmd, e);
                let _ = ch.close();
            }
        }
    }

    Err(AppError::Transport("Failed to start interactive shell".to_string()))
}

/// Keepalive schedule and the count of sends that failed in a row
struct Keepalive {
    every: Duration,
    last_sent: Instant,
    misses: u32,
}

impl Keepalive {
    fn new(every: Duration) -> Self {
        Self {
            every,
            last_sent: Instant::now(),
            misses: 0,
        }
    }

    fn due(&self) -> bool {
        self.last_sent.elapsed() >= self.every
    }

    /// Record one send. Errors once `KEEPALIVE_COUNT_MAX` sends failed in a row.
    fn record(&mut self, sent: Result<(), ssh2::Error>) -> io::Result<()> {
        self.last_sent = Instant::now();
        match sent {
            Ok(()) => {
                self.misses = 0;
                Ok(())
            }
            Err(e) => {
                self.misses += 1;
                tracing::warn!("Keepalive send failed ({}/{}): {}", self.misses, KEEPALIVE_COUNT_MAX, e);
                if self.misses >= KEEPALIVE_COUNT_MAX || is_link_down(e.code()) {
                    Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        format!("Keepalive failed: {}", e),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

struct Ssh2Shell {
    session: Session,
    channel: Channel,
    keepalive: Keepalive,
}

impl Ssh2Shell {
    /// Run `f` with the session in blocking mode
    fn blocking<T>(&mut self, f: impl FnOnce(&mut Channel) -> io::Result<T>) -> io::Result<T> {
        self.session.set_blocking(true);
        let result = f(&mut self.channel);
        self.session.set_blocking(false);
        result
    }
}

impl ShellChannel for Ssh2Shell {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Keepalives ride on the read cadence of the I/O loop
        if self.keepalive.due() {
            self.session.set_blocking(true);
            let sent = self.session.keepalive_send().map(|_| ());
            self.session.set_blocking(false);
            self.keepalive.record(sent)?;
        }
        self.channel.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.blocking(|channel| {
            channel.write_all(data)?;
            channel.flush()
        })
    }

    fn resize(&mut self, size: PtySize) -> io::Result<()> {
        self.blocking(|channel| {
            channel
                .request_pty_size(size.cols, size.rows, None, None)
                .map_err(io::Error::from)
        })
    }

    fn is_eof(&self) -> bool {
        self.channel.eof()
    }

    fn close(&mut self) {
        self.session.set_blocking(true);
        let _ = self.channel.close();
        let _ = self.session.disconnect(None, "Session closed", None);
    }
}

struct Ssh2Fs {
    session: Session,
    sftp: Mutex<Sftp>,
}

impl Ssh2Fs {
    /// Classify an error from a file stream. Stream errors lose the libssh2
    /// code, so the link is checked with a keepalive.
    fn classify_stream(&self, err: io::Error) -> io::Error {
        if !matches!(err.kind(), io::ErrorKind::Other | io::ErrorKind::TimedOut) {
            return err;
        }
        match self.session.keepalive_send() {
            Err(ka) if is_link_down(ka.code()) => {
                io::Error::new(io::ErrorKind::ConnectionAborted, format!("{} ({})", err, ka))
            }
            _ => err,
        }
    }
}

impl RemoteFs for Ssh2Fs {
    fn realpath(&self, path: &str) -> io::Result<String> {
        let resolved = self.sftp.lock().realpath(Path::new(path)).map_err(classify)?;
        Ok(resolved.to_string_lossy().to_string())
    }

    fn readdir(&self, path: &str) -> io::Result<Vec<RemoteDirEntry>> {
        let entries = self.sftp.lock().readdir(Path::new(path)).map_err(classify)?;

        Ok(entries
            .into_iter()
            .map(|(file_path, stat)| RemoteDirEntry {
                filename: file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                longname: format_permissions(&stat),
                size: stat.size,
                mtime: stat.mtime,
            })
            .collect())
    }

    fn stat(&self, path: &str) -> io::Result<RemoteStat> {
        let stat = self.sftp.lock().stat(Path::new(path)).map_err(classify)?;
        Ok(RemoteStat {
            is_dir: stat.is_dir(),
            size: stat.size,
        })
    }

    fn download(&self, remote: &str, local: &Path) -> io::Result<u64> {
        let sftp = self.sftp.lock();
        let mut source = sftp.open(Path::new(remote)).map_err(classify)?;
        let mut target = File::create(local)?;
        let mut buf = vec![0u8; 32 * 1024];
        let mut copied = 0u64;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.classify_stream(e)),
            };
            target.write_all(&buf[..n])?;
            copied += n as u64;
        }
        Ok(copied)
    }

    fn upload(&self, local: &Path, remote: &str) -> io::Result<u64> {
        let mut source = File::open(local)?;
        let sftp = self.sftp.lock();
        let mut target = sftp.create(Path::new(remote)).map_err(classify)?;
        let mut buf = vec![0u8; 32 * 1024];
        let mut copied = 0u64;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            target
                .write_all(&buf[..n])
                .map_err(|e| self.classify_stream(e))?;
            copied += n as u64;
        }
        target.flush().map_err(|e| self.classify_stream(e))?;
        Ok(copied)
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        self.sftp.lock().mkdir(Path::new(path), 0o755).map_err(classify)
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        self.sftp
            .lock()
            .rename(Path::new(from), Path::new(to), None)
            .map_err(classify)
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        self.sftp.lock().rmdir(Path::new(path)).map_err(classify)
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        self.sftp.lock().unlink(Path::new(path)).map_err(classify)
    }

    fn close(&self) {
        let _ = self.session.disconnect(None, "Session closed", None);
    }
}

/// Format a long-form mode string like `drwxr-xr-x`
fn format_permissions(stat: &FileStat) -> String {
    let perms = stat.perm.unwrap_or(0);

    let mut s = String::with_capacity(10);
    s.push(if stat.is_dir() {
        'd'
    } else if stat.file_type().is_symlink() {
        'l'
    } else {
        '-'
    });

    for (mask, c) in [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ] {
        s.push(if perms & mask != 0 { c } else { '-' });
    }

    s
}
