use anyhow::Context;
use shellvault::{config, ipc, logging, AppState};
use std::sync::Arc;
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let data_dir = config::get_data_dir()?;
    let state = Arc::new(AppState::new(data_dir.clone()).context("Failed to initialize app state")?);
    tracing::info!("ShellVault data dir: {:?}", data_dir);

    let served = ipc::serve(state.clone(), BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await;

    state.shutdown().await;
    served.context("Bridge failed")?;

    tracing::info!("ShellVault exiting");
    Ok(())
}
