use crate::error::AppResult;
use crate::session::SessionInfo;
use crate::state::AppState;

/// Open (or reuse) a shell session for a saved server
pub async fn open_shell(state: &AppState, server_id: String) -> AppResult<String> {
    state.shells.open(&server_id).await
}

pub async fn write_shell(state: &AppState, session_id: String, data: String) -> AppResult<()> {
    state.shells.write(&session_id, data.as_bytes())
}

pub async fn resize_shell(state: &AppState, session_id: String, cols: u32, rows: u32) -> AppResult<()> {
    state.shells.resize(&session_id, cols, rows);
    Ok(())
}

pub async fn close_shell(state: &AppState, session_id: String) -> AppResult<()> {
    state.shells.close(&session_id);
    Ok(())
}

pub async fn list_shells(state: &AppState) -> AppResult<Vec<SessionInfo>> {
    Ok(state.shells.list())
}
