//! # Live Engine Configuration
//!
//! Typed configuration for every engine component. All structs deserialize from
//! camelCase JSON and every field has a default, so a partial file only needs
//! to name the values it overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading the engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error while reading the configuration file.
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// The file content is not valid JSON for `LiveConfig`.
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A value is present but unusable.
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The offending field, dotted path.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// # Load Balancing Strategy
///
/// How a pool-targeted send picks one of the pool's healthy members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum LoadBalancingStrategy {
    /// Rotate through members in registration order.
    #[default]
    RoundRobin,
    /// Pick the member with the fewest messages sent so far.
    LeastLoaded,
    /// Pick a member uniformly at random.
    Random,
}

/// # Signature Config
///
/// Keys and retention for the signed-state envelopes and server-side backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignatureConfig {
    /// HMAC secret. Must be non-empty.
    pub secret_key: String,
    /// Optional hex-encoded 32-byte AES key. Derived from the secret when absent.
    pub encryption_key: Option<String>,
    /// Maximum envelope age accepted by `validate`.
    pub max_age_ms: u64,
    /// Backups kept per component; the oldest is evicted first.
    pub max_backups_per_component: usize,
    /// Backups older than this are removed by `prune_backups`.
    pub backup_max_age_secs: u64,
    /// Retired keys still accepted for validation after a rotation.
    pub retired_key_limit: usize,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            encryption_key: None,
            max_age_ms: 24 * 60 * 60 * 1000,
            max_backups_per_component: 10,
            backup_max_age_secs: 24 * 60 * 60,
            retired_key_limit: 2,
        }
    }
}

impl SignatureConfig {
    /// Convenience constructor used by tests and embedders.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret_key: secret.into(),
            ..Default::default()
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

/// # Registry Config
///
/// Health-check cadence and thresholds, plus how state envelopes are produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// Seconds between health-check ticks.
    pub health_check_interval_secs: u64,
    /// A component idle longer than this is `degraded`.
    pub idle_threshold_secs: u64,
    /// A component whose state is larger than this is `degraded`.
    pub memory_threshold_bytes: usize,
    /// A component with more errors than this is `unhealthy`.
    pub error_threshold: u64,
    /// State larger than this is compressed before signing.
    pub compression_threshold_bytes: usize,
    /// Encrypt state inside envelopes.
    pub encrypt_state: bool,
    /// Keep a server-side backup of each signed version.
    pub backup_state: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            idle_threshold_secs: 5 * 60,
            memory_threshold_bytes: 100 * 1024 * 1024,
            error_threshold: 10,
            compression_threshold_bytes: 4 * 1024,
            encrypt_state: false,
            backup_state: true,
        }
    }
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// # Connection Config
///
/// Liveness timing for client connections and how pool sends pick a member.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    /// Seconds between heartbeat sweeps.
    pub heartbeat_interval_secs: u64,
    /// Idle seconds after which a connection is marked unhealthy.
    pub stale_after_secs: u64,
    /// Idle seconds after which a connection is evicted.
    pub evict_after_secs: u64,
    /// Member selection for pool sends.
    pub load_balancing: LoadBalancingStrategy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            stale_after_secs: 60,
            evict_after_secs: 120,
            load_balancing: LoadBalancingStrategy::RoundRobin,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// # Upload Config
///
/// Limits checked when an upload starts and where finished files go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadConfig {
    /// Largest declared file size accepted at start.
    pub max_file_size: u64,
    /// MIME types accepted at start.
    pub allowed_types: Vec<String>,
    /// Uploads without a chunk for this long are purged.
    pub chunk_timeout_secs: u64,
    /// Directory finished files are written to.
    pub upload_dir: PathBuf,
    /// URL prefix returned for finished files.
    pub public_prefix: String,
    /// Seconds between staleness sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            allowed_types: [
                "image/jpeg",
                "image/png",
                "image/gif",
                "image/webp",
                "application/pdf",
                "text/plain",
                "application/json",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            chunk_timeout_secs: 30,
            upload_dir: PathBuf::from("./uploads"),
            public_prefix: "/uploads".to_string(),
            sweep_interval_secs: 10,
        }
    }
}

impl UploadConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// # Performance Config
///
/// Sampling and the thresholds that turn metrics into alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    /// Master switch; disabled monitors record nothing.
    pub enabled: bool,
    /// Fraction of events recorded, in `[0, 1]`.
    pub sample_rate: f64,
    /// Renders slower than this count as slow and raise alerts.
    pub render_time_threshold_ms: f64,
    /// Actions slower than this raise alerts.
    pub action_time_threshold_ms: f64,
    /// State larger than this raises a memory alert.
    pub memory_threshold_bytes: u64,
    /// Action failure ratio above this raises an alert.
    pub error_rate_threshold: f64,
    /// Minimum seconds between two alerts of the same kind for the same component.
    pub alert_cooldown_secs: u64,
    /// Samples kept in each rolling history.
    pub history_size: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 1.0,
            render_time_threshold_ms: 100.0,
            action_time_threshold_ms: 1000.0,
            memory_threshold_bytes: 50 * 1024 * 1024,
            error_rate_threshold: 0.1,
            alert_cooldown_secs: 60,
            history_size: 100,
        }
    }
}

/// # Live Config
///
/// Root configuration object handed to the engine at construction time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveConfig {
    /// Envelope signing keys and backup retention.
    pub signature: SignatureConfig,
    /// Component health checks and envelope encoding.
    pub registry: RegistryConfig,
    /// Heartbeats and pool routing.
    pub connections: ConnectionConfig,
    /// Chunked upload limits and storage.
    pub uploads: UploadConfig,
    /// Metric sampling and alert thresholds.
    pub performance: PerformanceConfig,
}

impl LiveConfig {
    /// Parses a (possibly partial) JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: LiveConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Checks cross-field constraints. The secret key is checked by the signer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.performance.sample_rate) {
            return Err(ConfigError::InvalidValue {
                field: "performance.sampleRate".to_string(),
                reason: format!("{} is outside [0, 1]", self.performance.sample_rate),
            });
        }
        for (field, secs) in [
            ("registry.healthCheckIntervalSecs", self.registry.health_check_interval_secs),
            ("connections.heartbeatIntervalSecs", self.connections.heartbeat_interval_secs),
            ("uploads.sweepIntervalSecs", self.uploads.sweep_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "interval must be at least one second".to_string(),
                });
            }
        }
        if self.connections.evict_after_secs < self.connections.stale_after_secs {
            return Err(ConfigError::InvalidValue {
                field: "connections.evictAfterSecs".to_string(),
                reason: "must not be shorter than staleAfterSecs".to_string(),
            });
        }
        Ok(())
    }
}
