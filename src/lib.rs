pub mod config;
pub mod error;
pub mod ipc;
pub mod localfs;
pub mod logging;
pub mod servers;
pub mod session;
pub mod sftp;
pub mod ssh;
pub mod state;
pub mod transport;
pub mod vault;

pub use error::{AppError, AppResult};
pub use state::AppState;
