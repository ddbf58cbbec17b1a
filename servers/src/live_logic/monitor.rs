use crate::live_logic::state::AppState;
use chrono::Utc;
use lib_live::{AlertSeverity, utils::now_millis};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;
use tokio_graceful::ShutdownGuard;
use tracing::{debug, error, info, warn};

/// Periodic engine maintenance: component health, stale uploads, connection
/// heartbeats and backup retention. Also logs performance alerts as they fire.
pub async fn run(app_state: AppState, shutdown_guard: ShutdownGuard) {
    let config = app_state.config.clone();
    let mut health_interval = interval(config.registry.health_check_interval());
    let mut upload_interval = interval(config.uploads.sweep_interval());
    let mut heartbeat_interval = interval(config.connections.heartbeat_interval());
    let mut prune_interval = interval(app_state.backup_prune_interval.max(Duration::from_secs(1)));
    let backup_max_age = Duration::from_secs(config.signature.backup_max_age_secs);
    let mut alerts = app_state.monitor().subscribe();

    loop {
        tokio::select! {
            _ = shutdown_guard.cancelled() => {
                info!("Monitor service received shutdown signal.");
                break;
            }
            _ = health_interval.tick() => {
                let report = app_state.registry.run_health_check(Utc::now());
                if report.unhealthy > 0 || !report.recovered.is_empty() {
                    warn!(
                        checked = report.checked,
                        degraded = report.degraded,
                        unhealthy = report.unhealthy,
                        recovered = ?report.recovered,
                        "health check"
                    );
                } else {
                    debug!(checked = report.checked, degraded = report.degraded, "health check");
                }
            }
            _ = upload_interval.tick() => {
                let purged = app_state.uploads.sweep_stale(Utc::now());
                if !purged.is_empty() {
                    info!(uploads = ?purged, "stale uploads purged");
                }
            }
            _ = heartbeat_interval.tick() => {
                let report = app_state.connections().heartbeat_sweep(Utc::now());
                for connection_id in &report.evicted {
                    app_state.registry.cleanup_connection(connection_id);
                }
                if !report.stale.is_empty() || !report.evicted.is_empty() {
                    info!(stale = report.stale.len(), evicted = report.evicted.len(), "heartbeat sweep");
                }
            }
            _ = prune_interval.tick() => {
                let removed = app_state.signer().prune_backups(backup_max_age, now_millis());
                if removed > 0 {
                    info!(removed, "expired state backups pruned");
                }
            }
            alert = alerts.recv() => match alert {
                Ok(alert) => match alert.severity {
                    AlertSeverity::Critical => error!(
                        component_id = %alert.component_id,
                        kind = ?alert.kind,
                        value = alert.value,
                        threshold = alert.threshold,
                        "{}", alert.message
                    ),
                    AlertSeverity::Warning => warn!(
                        component_id = %alert.component_id,
                        kind = ?alert.kind,
                        value = alert.value,
                        threshold = alert.threshold,
                        "{}", alert.message
                    ),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "alert log lagging"),
                Err(RecvError::Closed) => {
                    // Monitor dropped; keep the maintenance ticks running.
                    alerts = app_state.monitor().subscribe();
                }
            },
        }
    }
}
