//! In-memory transport for controller tests

use super::{
    ConnectTarget, Connector, PtySize, RemoteDirEntry, RemoteFs, RemoteStat, ShellChannel, Transport,
};
use crate::error::{AppError, AppResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct MockShellState {
    pub written: Mutex<Vec<u8>>,
    pub incoming: Mutex<VecDeque<Vec<u8>>>,
    pub resizes: Mutex<Vec<PtySize>>,
    pub eof: AtomicBool,
    pub closed: AtomicBool,
    pub read_fault: Mutex<Option<String>>,
}

impl MockShellState {
    pub fn push_output(&self, data: &[u8]) {
        self.incoming.lock().push_back(data.to_vec());
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written.lock()).to_string()
    }
}

#[derive(Default)]
pub struct MockFs {
    pub realpaths: Mutex<HashMap<String, String>>,
    pub dirs: Mutex<HashMap<String, Vec<RemoteDirEntry>>>,
    pub stats: Mutex<HashMap<String, RemoteStat>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub calls: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    /// When set, every operation fails as if the connection dropped
    pub link_down: Mutex<Option<String>>,
}

impl MockFs {
    fn check_link(&self) -> io::Result<()> {
        match self.link_down.lock().clone() {
            Some(message) => Err(io::Error::new(io::ErrorKind::ConnectionReset, message)),
            None => Ok(()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such file: {}", path))
}

#[derive(Default)]
pub struct MockConnector {
    pub connects: AtomicUsize,
    pub delay: Mutex<Duration>,
    pub fail_with: Mutex<Option<String>>,
    pub shell: Arc<MockShellState>,
    pub fs: Arc<MockFs>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_connects_with(&self, message: &str) {
        *self.fail_with.lock() = Some(message.to_string());
    }

    /// A remote fs over the shared state, without going through a connect
    pub fn connect_fs(&self) -> Box<dyn RemoteFs> {
        Box::new(SharedFs(self.fs.clone()))
    }
}

impl Connector for MockConnector {
    fn connect(&self, _target: &ConnectTarget) -> AppResult<Box<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(message) = self.fail_with.lock().clone() {
            return Err(AppError::Transport(message));
        }

        Ok(Box::new(MockTransport {
            shell: self.shell.clone(),
            fs: self.fs.clone(),
        }))
    }
}

struct MockTransport {
    shell: Arc<MockShellState>,
    fs: Arc<MockFs>,
}

impl Transport for MockTransport {
    fn into_shell(self: Box<Self>, _size: PtySize) -> AppResult<Box<dyn ShellChannel>> {
        Ok(Box::new(MockShell { state: self.shell }))
    }

    fn into_sftp(self: Box<Self>) -> AppResult<Box<dyn RemoteFs>> {
        Ok(Box::new(SharedFs(self.fs)))
    }

    fn disconnect(self: Box<Self>) {}
}

struct MockShell {
    state: Arc<MockShellState>,
}

impl ShellChannel for MockShell {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(fault) = self.state.read_fault.lock().take() {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, fault));
        }
        let mut incoming = self.state.incoming.lock();
        match incoming.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    incoming.push_front(chunk[n..].to_vec());
                }
                Ok(n)
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.state.written.lock().extend_from_slice(data);
        Ok(())
    }

    fn resize(&mut self, size: PtySize) -> io::Result<()> {
        self.state.resizes.lock().push(size);
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.state.eof.load(Ordering::SeqCst) && self.state.incoming.lock().is_empty()
    }

    fn close(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Lets tests keep a handle on the fs the controller owns
struct SharedFs(Arc<MockFs>);

impl RemoteFs for SharedFs {
    fn realpath(&self, path: &str) -> io::Result<String> {
        self.0.check_link()?;
        self.0
            .realpaths
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    fn readdir(&self, path: &str) -> io::Result<Vec<RemoteDirEntry>> {
        self.0.check_link()?;
        self.0.record(format!("readdir {}", path));
        self.0.dirs.lock().get(path).cloned().ok_or_else(|| not_found(path))
    }

    fn stat(&self, path: &str) -> io::Result<RemoteStat> {
        self.0.check_link()?;
        self.0.stats.lock().get(path).copied().ok_or_else(|| not_found(path))
    }

    fn download(&self, remote: &str, local: &Path) -> io::Result<u64> {
        self.0.check_link()?;
        self.0.record(format!("download {}", remote));
        let data = self.0.files.lock().get(remote).cloned().ok_or_else(|| not_found(remote))?;
        std::fs::write(local, &data)?;
        Ok(data.len() as u64)
    }

    fn upload(&self, local: &Path, remote: &str) -> io::Result<u64> {
        self.0.check_link()?;
        self.0.record(format!("upload {}", remote));
        let data = std::fs::read(local)?;
        let len = data.len() as u64;
        self.0.files.lock().insert(remote.to_string(), data);
        Ok(len)
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        self.0.check_link()?;
        self.0.record(format!("mkdir {}", path));
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        self.0.check_link()?;
        self.0.record(format!("rename {} {}", from, to));
        Ok(())
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        self.0.check_link()?;
        self.0.record(format!("rmdir {}", path));
        Ok(())
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        self.0.check_link()?;
        self.0.record(format!("unlink {}", path));
        Ok(())
    }

    fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}
