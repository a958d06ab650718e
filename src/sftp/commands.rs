use super::{RemoteEntry, TransferOpened};
use crate::error::AppResult;
use crate::session::SessionInfo;
use crate::state::AppState;

pub async fn open_transfer(state: &AppState, server_id: String) -> AppResult<TransferOpened> {
    state.transfers.open(&server_id).await
}

pub async fn list_remote(state: &AppState, session_id: String, remote_path: String) -> AppResult<Vec<RemoteEntry>> {
    tracing::debug!("Listing {} on {}", remote_path, session_id);
    state.transfers.list(&session_id, &remote_path).await
}

pub async fn download(
    state: &AppState,
    session_id: String,
    remote_path: String,
    local_path: String,
) -> AppResult<()> {
    state.transfers.download(&session_id, &remote_path, &local_path).await
}

pub async fn upload(
    state: &AppState,
    session_id: String,
    local_path: String,
    remote_path: String,
) -> AppResult<()> {
    state.transfers.upload(&session_id, &local_path, &remote_path).await
}

pub async fn mkdir(state: &AppState, session_id: String, remote_path: String) -> AppResult<()> {
    state.transfers.mkdir(&session_id, &remote_path).await
}

pub async fn rename(state: &AppState, session_id: String, old_path: String, new_path: String) -> AppResult<()> {
    state.transfers.rename(&session_id, &old_path, &new_path).await
}

pub async fn delete(state: &AppState, session_id: String, remote_path: String) -> AppResult<()> {
    state.transfers.delete(&session_id, &remote_path).await
}

pub async fn close_transfer(state: &AppState, session_id: String) -> AppResult<()> {
    state.transfers.close(&session_id).await;
    Ok(())
}

pub async fn list_transfers(state: &AppState) -> AppResult<Vec<SessionInfo>> {
    Ok(state.transfers.sessions())
}
