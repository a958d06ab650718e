use super::AppSettings;
use crate::error::AppResult;
use crate::state::AppState;

pub async fn get_settings(state: &AppState) -> AppResult<AppSettings> {
    Ok(state.settings.read().clone())
}

pub async fn save_settings(state: &AppState, settings: AppSettings) -> AppResult<()> {
    settings.save(&state.data_dir)?;
    *state.settings.write() = settings;
    tracing::info!("Settings saved");
    Ok(())
}
