//! vtytousb - serial device gateway daemon

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vtytousb_server::config::{AppConfig, ConfigStore, Defaults};
use vtytousb_server::hotplug::{DeviceWatcher, POLL_INTERVAL};
use vtytousb_server::vty::host_key::{HostKey, HOST_KEY_BITS};
use vtytousb_server::{BridgeManager, GatewayContext, TokioSerialConnector};
use vtytousb_utils::{paths, GatewayError, Result, RunMode};

async fn run_daemon(mode: RunMode) -> Result<()> {
    info!("Starting app in {} mode.", mode);

    paths::ensure_all_dirs()?;

    let key_path = paths::ssh_key_file();
    let host_key = tokio::task::spawn_blocking(move || {
        HostKey::load_or_generate(&key_path, HOST_KEY_BITS)
    })
    .await
    .map_err(|e| GatewayError::internal(format!("Host key task failed: {}", e)))??;

    let app_defaults: Defaults<AppConfig> = Arc::new(|_| AppConfig::default());
    let app_config = ConfigStore::open(paths::app_config_file(), app_defaults).await?;
    info!(path = %app_config.path().display(), "Loaded app config");

    let ctx = Arc::new(GatewayContext::new(
        Arc::new(app_config),
        Arc::new(TokioSerialConnector),
        &host_key,
        paths::serials_dir(),
    )?);

    let cancel = CancellationToken::new();
    let (device_tx, device_rx) = mpsc::unbounded_channel();
    let watcher = DeviceWatcher::new(paths::device_dir(), POLL_INTERVAL);
    let watcher_cancel = cancel.clone();
    let watcher_task = tokio::spawn(async move {
        if let Err(e) = watcher.run(device_tx, watcher_cancel).await {
            error!("Device watcher stopped: {}", e);
        }
    });

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutting down");
        shutdown.cancel();
    });

    let mut manager = BridgeManager::new(Arc::clone(&ctx));
    info!("Ready! Waiting for connections.");
    manager.run(device_rx, cancel.clone()).await;

    cancel.cancel();
    let _ = watcher_task.await;
    ctx.app_config.close().await;

    info!("vtytousb stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mode = RunMode::from_env();
    vtytousb_utils::init_logging_with_config(mode.log_config())?;

    run_daemon(mode).await
}
