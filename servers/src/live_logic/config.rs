use anyhow::{Context, Result};
use clap::Parser;
use lib_live::LiveConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const DEFAULT_CONFIG_FILE: &str = "server_live.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Live Component WebSocket Server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "LIVE_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "LIVE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "LIVE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LIVE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "LIVE_ENGINE_CONFIG", help = "Path to a standalone engine configuration (JSON).")]
    pub engine_config_path: Option<PathBuf>,

    #[clap(long, env = "LIVE_SECRET_KEY", help = "HMAC secret used to sign component state.")]
    pub secret_key: Option<String>,

    #[clap(long, env = "LIVE_ENCRYPTION_KEY", help = "Hex-encoded 32-byte key for state encryption.")]
    pub encryption_key: Option<String>,

    #[clap(long, env = "LIVE_ENCRYPT_STATE", help = "Encrypt component state inside signed envelopes.")]
    pub encrypt_state: Option<bool>,

    #[clap(long, env = "LIVE_UPLOAD_DIR", help = "Directory finished uploads are written to.")]
    pub upload_dir: Option<PathBuf>,

    #[clap(long, env = "LIVE_MAX_FILE_SIZE", help = "Largest accepted upload in bytes.")]
    pub max_file_size: Option<u64>,

    #[clap(long, env = "LIVE_HEALTH_CHECK_INTERVAL_SECONDS", help = "Seconds between component health checks.")]
    pub health_check_interval_seconds: Option<u64>,

    #[clap(long, env = "LIVE_HEARTBEAT_INTERVAL_SECONDS", help = "Seconds between connection heartbeat sweeps.")]
    pub heartbeat_interval_seconds: Option<u64>,

    #[clap(long, env = "LIVE_BACKUP_PRUNE_INTERVAL_SECONDS", help = "Seconds between state backup pruning runs.")]
    pub backup_prune_interval_seconds: Option<u64>,

    /// Inline engine section of the config file.
    #[clap(skip)]
    pub engine: Option<LiveConfig>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            engine_config_path: other.engine_config_path.or(self.engine_config_path),
            secret_key: other.secret_key.or(self.secret_key),
            encryption_key: other.encryption_key.or(self.encryption_key),
            encrypt_state: other.encrypt_state.or(self.encrypt_state),
            upload_dir: other.upload_dir.or(self.upload_dir),
            max_file_size: other.max_file_size.or(self.max_file_size),
            health_check_interval_seconds: other.health_check_interval_seconds.or(self.health_check_interval_seconds),
            heartbeat_interval_seconds: other.heartbeat_interval_seconds.or(self.heartbeat_interval_seconds),
            backup_prune_interval_seconds: other.backup_prune_interval_seconds.or(self.backup_prune_interval_seconds),
            engine: other.engine.or(self.engine),
        }
    }

    /// Builds the engine configuration: the engine file (or inline section),
    /// then the individual overrides from this config.
    ///
    /// A missing secret is replaced by a random one. States signed with it do
    /// not survive a restart.
    pub fn live_config(&self) -> Result<LiveConfig> {
        let mut live = match &self.engine_config_path {
            Some(path) => LiveConfig::from_json_file(path)
                .with_context(|| format!("failed to load engine config {}", path.display()))?,
            None => self.engine.clone().unwrap_or_default(),
        };

        if let Some(secret) = &self.secret_key {
            live.signature.secret_key = secret.clone();
        }
        if let Some(key) = &self.encryption_key {
            live.signature.encryption_key = Some(key.clone());
        }
        if let Some(encrypt) = self.encrypt_state {
            live.registry.encrypt_state = encrypt;
        }
        if let Some(dir) = &self.upload_dir {
            live.uploads.upload_dir = dir.clone();
        }
        if let Some(max) = self.max_file_size {
            live.uploads.max_file_size = max;
        }
        if let Some(secs) = self.health_check_interval_seconds {
            live.registry.health_check_interval_secs = secs;
        }
        if let Some(secs) = self.heartbeat_interval_seconds {
            live.connections.heartbeat_interval_secs = secs;
        }

        if live.signature.secret_key.is_empty() {
            warn!("No LIVE_SECRET_KEY configured, using a random key for this run. Client-held states will not rehydrate after a restart.");
            live.signature.secret_key = generate_secret();
        }

        live.validate()?;
        Ok(live)
    }
}

fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

fn read_config_file(path: &Path) -> Option<Config> {
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                eprintln!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            eprintln!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Candidate config file locations: the explicit path, then the working
/// directory, then the user config directory.
fn config_file_candidates(explicit: Option<PathBuf>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path];
    }
    let mut candidates = vec![PathBuf::from(DEFAULT_CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("live").join(DEFAULT_CONFIG_FILE));
    }
    candidates
}

fn defaults() -> Config {
    Config {
        port: Some(9010),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        backup_prune_interval_seconds: Some(3600),
        ..Default::default()
    }
}

/// Runs before logging is initialized, so problems go to stderr.
pub fn load_config() -> Config {
    // 1. Load defaults
    let mut current_config = defaults();

    // 2. Load from config file if present. The CLI may point at another file.
    let cli_args_for_path = Config::parse();
    let file_config = config_file_candidates(cli_args_for_path.config_path)
        .into_iter()
        .find(|path| path.exists())
        .and_then(|path| read_config_file(&path));
    if let Some(file_config) = file_config {
        current_config = current_config.merge(file_config);
    }

    // 3. Environment variables and CLI arguments win over the file.
    let cli_args_final = Config::parse();
    current_config.merge(cli_args_final)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefers_other() {
        let base = defaults();
        let file = Config {
            port: Some(8080),
            secret_key: Some("from-file".to_string()),
            ..Default::default()
        };
        let merged = base.merge(file);
        assert_eq!(merged.port, Some(8080));
        assert_eq!(merged.log_level.as_deref(), Some("info"));
        assert_eq!(merged.secret_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_file_config_with_engine_section() {
        let text = r#"{
            "port": 9100,
            "secretKey": "file-secret",
            "engine": {"registry": {"errorThreshold": 4}}
        }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        let live = config.live_config().unwrap();
        assert_eq!(config.port, Some(9100));
        assert_eq!(live.signature.secret_key, "file-secret");
        assert_eq!(live.registry.error_threshold, 4);
    }

    #[test]
    fn test_overrides_apply_on_top_of_engine_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{"uploads": {"maxFileSize": 10}, "signature": {"secretKey": "engine"}}"#).unwrap();
        let config = Config {
            engine_config_path: Some(path),
            max_file_size: Some(2048),
            encrypt_state: Some(true),
            ..Default::default()
        };
        let live = config.live_config().unwrap();
        assert_eq!(live.uploads.max_file_size, 2048);
        assert!(live.registry.encrypt_state);
        assert_eq!(live.signature.secret_key, "engine");
    }

    #[test]
    fn test_missing_secret_is_generated() {
        let live = Config::default().live_config().unwrap();
        assert_eq!(live.signature.secret_key.len(), 64);
        let other = Config::default().live_config().unwrap();
        assert_ne!(live.signature.secret_key, other.signature.secret_key);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = Config {
            secret_key: Some("s".to_string()),
            heartbeat_interval_seconds: Some(0),
            ..Default::default()
        };
        assert!(config.live_config().is_err());
    }
}
