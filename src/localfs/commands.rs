use super::LocalEntry;
use crate::error::AppResult;

pub async fn home_dir() -> AppResult<String> {
    super::home_dir()
}

pub async fn list_local(path: String) -> AppResult<Vec<LocalEntry>> {
    tokio::task::spawn_blocking(move || super::list(&path))
        .await
        .map_err(|e| crate::error::AppError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}
