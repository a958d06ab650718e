//! Line-delimited JSON bridge between the UI process and the backend.
//!
//! Every input line is one request `{"id", "method", "params"}`. Every output
//! line is either a response `{"id", "result" | "error"}` or a pushed event
//! `{"event", "payload"}`. Requests run concurrently; one writer task owns
//! the output stream so lines never interleave.

use crate::config::{self, AppSettings};
use crate::error::{AppError, AppResult, SerializableError};
use crate::localfs;
use crate::servers::{self, ServerInput, ServerPatch};
use crate::session::SessionEvent;
use crate::sftp;
use crate::ssh;
use crate::state::AppState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Option<u64>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(SerializableError),
}

impl Response {
    fn from_result(id: Option<u64>, result: AppResult<Value>) -> Self {
        let outcome = match result {
            Ok(value) => Outcome::Result(value),
            Err(e) => Outcome::Error(SerializableError::from(&e)),
        };
        Self { id, outcome }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateServerParams {
    id: String,
    updates: ServerPatch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerIdParams {
    server_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteParams {
    session_id: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResizeParams {
    session_id: String,
    cols: u32,
    rows: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemotePathParams {
    session_id: String,
    remote_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CopyParams {
    session_id: String,
    remote_path: String,
    local_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameParams {
    session_id: String,
    old_path: String,
    new_path: String,
}

#[derive(Debug, Deserialize)]
struct PathParams {
    path: String,
}

fn params<T: DeserializeOwned>(value: Value) -> AppResult<T> {
    serde_json::from_value(value).map_err(|e| AppError::InvalidInput(format!("Invalid params: {}", e)))
}

fn reply<T: Serialize>(result: AppResult<T>) -> AppResult<Value> {
    Ok(serde_json::to_value(result?)?)
}

/// Route one request to its handler
pub async fn dispatch(state: &AppState, method: &str, raw: Value) -> AppResult<Value> {
    match method {
        "servers.list" => reply(servers::commands::list_servers(state).await),
        "servers.get" => {
            let p: IdParams = params(raw)?;
            reply(servers::commands::get_server(state, p.id).await)
        }
        "servers.create" => {
            let input: ServerInput = params(raw)?;
            reply(servers::commands::create_server(state, input).await)
        }
        "servers.update" => {
            let p: UpdateServerParams = params(raw)?;
            reply(servers::commands::update_server(state, p.id, p.updates).await)
        }
        "servers.delete" => {
            let p: IdParams = params(raw)?;
            reply(servers::commands::delete_server(state, p.id).await)
        }

        "shell.open" => {
            let p: ServerIdParams = params(raw)?;
            reply(ssh::commands::open_shell(state, p.server_id).await)
        }
        "shell.write" => {
            let p: WriteParams = params(raw)?;
            reply(ssh::commands::write_shell(state, p.session_id, p.data).await)
        }
        "shell.resize" => {
            let p: ResizeParams = params(raw)?;
            reply(ssh::commands::resize_shell(state, p.session_id, p.cols, p.rows).await)
        }
        "shell.close" => {
            let p: SessionParams = params(raw)?;
            reply(ssh::commands::close_shell(state, p.session_id).await)
        }
        "shell.list" => reply(ssh::commands::list_shells(state).await),

        "transfer.open" => {
            let p: ServerIdParams = params(raw)?;
            reply(sftp::commands::open_transfer(state, p.server_id).await)
        }
        "transfer.list" => {
            let p: RemotePathParams = params(raw)?;
            reply(sftp::commands::list_remote(state, p.session_id, p.remote_path).await)
        }
        "transfer.download" => {
            let p: CopyParams = params(raw)?;
            reply(sftp::commands::download(state, p.session_id, p.remote_path, p.local_path).await)
        }
        "transfer.upload" => {
            let p: CopyParams = params(raw)?;
            reply(sftp::commands::upload(state, p.session_id, p.local_path, p.remote_path).await)
        }
        "transfer.mkdir" => {
            let p: RemotePathParams = params(raw)?;
            reply(sftp::commands::mkdir(state, p.session_id, p.remote_path).await)
        }
        "transfer.rename" => {
            let p: RenameParams = params(raw)?;
            reply(sftp::commands::rename(state, p.session_id, p.old_path, p.new_path).await)
        }
        "transfer.delete" => {
            let p: RemotePathParams = params(raw)?;
            reply(sftp::commands::delete(state, p.session_id, p.remote_path).await)
        }
        "transfer.close" => {
            let p: SessionParams = params(raw)?;
            reply(sftp::commands::close_transfer(state, p.session_id).await)
        }
        "transfer.sessions" => reply(sftp::commands::list_transfers(state).await),

        "localfs.homeDir" => reply(localfs::commands::home_dir().await),
        "localfs.list" => {
            let p: PathParams = params(raw)?;
            reply(localfs::commands::list_local(p.path).await)
        }

        "settings.get" => reply(config::commands::get_settings(state).await),
        "settings.save" => {
            let settings: AppSettings = params(raw)?;
            reply(config::commands::save_settings(state, settings).await)
        }

        "app.version" => Ok(Value::String(env!("CARGO_PKG_VERSION").to_string())),

        other => Err(AppError::InvalidInput(format!("Unknown method: {}", other))),
    }
}

fn encode<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(line) => Some(line),
        Err(e) => {
            tracing::error!("Failed to encode output line: {}", e);
            None
        }
    }
}

/// Serve requests from `input` until it closes, writing responses and
/// session events to `output`.
pub async fn serve<R, W>(state: Arc<AppState>, input: R, output: W) -> AppResult<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = out_rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let events_tx = out_tx.clone();
    let subscription = state.broadcaster.subscribe(Arc::new(move |event: &SessionEvent| {
        if let Some(line) = encode(event) {
            let _ = events_tx.send(line);
        }
    }));
    tracing::info!("Bridge ready");

    let mut lines = input.lines();
    let read_result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Malformed request line: {}", e);
                let response = Response::from_result(
                    None,
                    Err(AppError::InvalidInput(format!("Malformed request: {}", e))),
                );
                if let Some(line) = encode(&response) {
                    let _ = out_tx.send(line);
                }
                continue;
            }
        };

        let state = state.clone();
        let tx = out_tx.clone();
        tokio::spawn(async move {
            tracing::debug!("Request {:?}: {}", request.id, request.method);
            let result = dispatch(&state, &request.method, request.params).await;
            if let Err(e) = &result {
                tracing::debug!("Request {:?} failed: {}", request.id, e);
            }
            if let Some(line) = encode(&Response::from_result(request.id, result)) {
                let _ = tx.send(line);
            }
        });
    };

    state.broadcaster.unsubscribe(subscription);
    drop(out_tx);

    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Output stream closed: {}", e),
        Err(e) => tracing::warn!("Writer task failed: {}", e),
    }

    read_result?;
    Ok(())
}
