use serde::Serialize;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is not connected")]
    SessionNotConnected(String),

    #[error("Authentication configuration error: {0}")]
    AuthConfig(String),

    #[error("Connection timeout after {0} seconds")]
    ConnectionTimeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("{op} failed: {message}")]
    RemoteOperation { op: &'static str, message: String },

    #[error("Local file not found: {0}")]
    LocalFileNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AppError {
    pub fn remote(op: &'static str, err: impl std::fmt::Display) -> Self {
        AppError::RemoteOperation {
            op,
            message: err.to_string(),
        }
    }
}

/// Serializable error for the UI bridge
#[derive(Debug, Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let (code, message, details) = match err {
            AppError::ServerNotFound(id) => ("SERVER_NOT_FOUND", format!("Server {} not found", id), None),
            AppError::SessionNotFound(id) => ("SESSION_NOT_FOUND", format!("Session {} not found", id), None),
            AppError::SessionNotConnected(id) => (
                "SESSION_NOT_CONNECTED",
                format!("Session {} is not connected", id),
                None,
            ),
            AppError::AuthConfig(msg) => ("AUTH_CONFIG_ERROR", msg.clone(), None),
            AppError::ConnectionTimeout(secs) => (
                "CONNECTION_TIMEOUT",
                format!("Connection timeout after {} seconds", secs),
                Some("Check that the server is reachable, the port is correct and no firewall blocks it".to_string()),
            ),
            AppError::Transport(msg) => ("TRANSPORT_ERROR", msg.clone(), None),
            AppError::Decryption(msg) => ("DECRYPTION_ERROR", "Failed to decrypt stored secret".to_string(), Some(msg.clone())),
            AppError::RemoteOperation { op, message } => {
                ("REMOTE_OPERATION_ERROR", format!("{} failed", op), Some(message.clone()))
            }
            AppError::LocalFileNotFound(path) => ("LOCAL_FILE_NOT_FOUND", format!("Local file not found: {}", path), None),
            AppError::Config(msg) => ("CONFIG_ERROR", msg.clone(), None),
            AppError::InvalidInput(msg) => ("INVALID_INPUT", msg.clone(), None),
            AppError::Io(e) => ("IO_ERROR", e.to_string(), None),
            AppError::Serialization(msg) => ("SERIALIZATION_ERROR", msg.clone(), None),
        };

        SerializableError {
            code: code.to_string(),
            message,
            details,
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<ssh2::Error> for AppError {
    fn from(err: ssh2::Error) -> Self {
        AppError::Transport(err.message().to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
