use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio_graceful::Shutdown;
use tracing::info;

mod live_logic;
use live_logic::{components, config, downstream, logger, monitor, state};

#[tokio::main]
/// # Main Entry Point
///
/// Loads the layered configuration, starts logging, wires the engine and runs
/// the WebSocket server and the maintenance loop until a shutdown signal.
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    // Dropping the guard stops the file writer.
    let _log_guard = logger::setup_logging(&log_dir, &log_level)?;

    let live_config = config.live_config()?;
    let prune_every = Duration::from_secs(config.backup_prune_interval_seconds.unwrap_or(3600));
    let app_state = state::AppState::new(live_config, prune_every)?;
    components::register_all(&app_state.registry);

    let port = config.port.unwrap_or(9010);
    let shutdown = Shutdown::default();

    let server_state = app_state.clone();
    shutdown.spawn_task_fn(move |guard| downstream::run(port, server_state, guard));
    shutdown.spawn_task_fn(move |guard| monitor::run(app_state, guard));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            info!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    info!("Bye!");

    Ok(())
}
