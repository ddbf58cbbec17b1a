use anyhow::Result;
use chrono::{DateTime, Utc};
use lib_live::{
    ComponentRegistry, ConnectionManager, LiveConfig, PerformanceMonitor, ProtocolDispatcher, ServiceContainer,
    StateSigner, UploadManager,
};
use std::sync::Arc;
use std::time::Duration;

/// Engine handles shared by the socket handlers and the background loops.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ComponentRegistry>,
    pub uploads: Arc<UploadManager>,
    pub dispatcher: Arc<ProtocolDispatcher>,
    pub config: Arc<LiveConfig>,
    pub backup_prune_interval: Duration,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wires every engine part from one configuration.
    pub fn new(config: LiveConfig, backup_prune_interval: Duration) -> Result<Self> {
        let signer = Arc::new(StateSigner::new(config.signature.clone())?);
        let connections = Arc::new(ConnectionManager::new(config.connections.clone()));
        let monitor = Arc::new(PerformanceMonitor::new(config.performance.clone()));
        let services = Arc::new(ServiceContainer::new());
        let uploads = Arc::new(UploadManager::new(config.uploads.clone()));
        let registry = Arc::new(ComponentRegistry::new(
            config.registry.clone(),
            signer,
            connections,
            monitor,
            services,
        ));
        let dispatcher = Arc::new(ProtocolDispatcher::new(registry.clone(), uploads.clone()));

        Ok(Self {
            registry,
            uploads,
            dispatcher,
            config: Arc::new(config),
            backup_prune_interval,
            started_at: Utc::now(),
        })
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        self.registry.connections()
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        self.registry.monitor()
    }

    pub fn signer(&self) -> &Arc<StateSigner> {
        self.registry.signer()
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
