use super::{ServerInput, ServerPatch, ServerRecord, ServerStore};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use std::sync::Arc;

/// Run a store operation on the blocking pool; it does file I/O and AES work
async fn with_store<T, F>(state: &AppState, f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce(&ServerStore) -> AppResult<T> + Send + 'static,
{
    let store = Arc::clone(&state.servers);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| AppError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

pub async fn list_servers(state: &AppState) -> AppResult<Vec<ServerRecord>> {
    with_store(state, |store| store.list()).await
}

pub async fn get_server(state: &AppState, id: String) -> AppResult<Option<ServerRecord>> {
    with_store(state, move |store| store.get(&id)).await
}

pub async fn create_server(state: &AppState, input: ServerInput) -> AppResult<ServerRecord> {
    // Never log the input itself, it carries secrets
    tracing::info!("Creating server for {}@{}:{}", input.username, input.host, input.port);
    with_store(state, move |store| store.create(input)).await
}

pub async fn update_server(state: &AppState, id: String, patch: ServerPatch) -> AppResult<ServerRecord> {
    with_store(state, move |store| store.update(&id, patch)).await
}

pub async fn delete_server(state: &AppState, id: String) -> AppResult<()> {
    with_store(state, move |store| store.delete(&id)).await
}
