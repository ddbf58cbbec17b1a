//! # Signature Engine
//!
//! Produces and validates tamper-evident, time-bounded envelopes around
//! component state so the client can hold the only durable copy and hand it
//! back after a reconnect.
//!
//! ## Envelope integrity
//!
//! The signature is HMAC-SHA256 over the canonical rendering (keys sorted at
//! every depth) of `{componentId, data, timestamp, version}`. When the state
//! is compressed and/or encrypted, `data` is replaced by the base64 of the
//! transformed bytes *before* signing, so the signature covers exactly the
//! bytes that `extract_data` will later decode. The `compressed`/`encrypted`
//! flags join the signed tuple when they are set.
//!
//! ## Transforms
//!
//! - Compression: LZ4 block format with the uncompressed size prepended.
//! - Encryption: AES-256-CBC with PKCS7 padding; a random 16-byte IV is
//!   prepended to the ciphertext.
//!
//! Validation checks expiry first and then compares signatures in constant
//! time (`Mac::verify_slice`). Retired keys from `rotate_key` are accepted
//! until they fall off the retention list.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use aes::Aes256;
use base64::{engine::general_purpose, Engine as _};
use cbc::{Decryptor, Encryptor};
use cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::configs::config_live::SignatureConfig;
use crate::utils::{canonical_json, now_millis};

type HmacSha256 = Hmac<Sha256>;

/// Envelopes are signed by this process; anything further ahead than this was not.
const MAX_CLOCK_SKEW_MS: i64 = 5_000;

/// Errors raised by the signature engine itself (not validation outcomes).
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// # Signed State Envelope
///
/// The self-contained capsule that crosses the trust boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedState {
    /// Plain state, or base64 of the compressed/encrypted bytes.
    pub data: Value,
    /// Hex-encoded HMAC-SHA256.
    pub signature: String,
    /// Epoch milliseconds at signing time.
    pub timestamp: i64,
    pub component_id: String,
    pub version: u64,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub encrypted: bool,
}

/// Transform and retention switches for `sign`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignOptions {
    pub compress: bool,
    pub encrypt: bool,
    pub backup: bool,
}

/// Outcome of `validate`. Both failure modes are reported separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tampered: bool,
    pub expired: bool,
}

impl ValidationResult {
    fn ok() -> Self {
        Self { valid: true, error: None, tampered: false, expired: false }
    }

    fn expired(age_ms: i64, max_age_ms: u64) -> Self {
        Self {
            valid: false,
            error: Some(format!("State expired: {}ms old, maximum is {}ms", age_ms, max_age_ms)),
            tampered: false,
            expired: true,
        }
    }

    fn tampered(reason: &str) -> Self {
        Self {
            valid: false,
            error: Some(format!("State signature invalid: {}", reason)),
            tampered: true,
            expired: false,
        }
    }
}

/// # State Backup
///
/// Server-side snapshot of one signed version, with its own signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateBackup {
    pub component_id: String,
    pub version: u64,
    pub data: Value,
    pub signature: String,
    pub timestamp: i64,
}

/// A state transform between two versions.
pub type MigrationFn = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;

struct KeyRing {
    current: Vec<u8>,
    /// Newest first.
    retired: Vec<Vec<u8>>,
}

/// # State Signer
///
/// Thread-safe; shared by `Arc` between the registry and the host.
pub struct StateSigner {
    config: SignatureConfig,
    keys: RwLock<KeyRing>,
    encryption_key: [u8; 32],
    migrations: Mutex<HashMap<(u64, u64), MigrationFn>>,
    backups: Mutex<HashMap<String, VecDeque<StateBackup>>>,
}

impl StateSigner {
    /// Builds a signer from its configuration.
    ///
    /// Fails when the secret is empty or the explicit encryption key is not
    /// 32 bytes of hex.
    pub fn new(config: SignatureConfig) -> Result<Self, SignatureError> {
        if config.secret_key.is_empty() {
            return Err(SignatureError::InvalidKey("secret key must not be empty".to_string()));
        }

        let encryption_key = match &config.encryption_key {
            Some(hex_key) => {
                let key_vec = hex::decode(hex_key.trim())
                    .map_err(|e| SignatureError::InvalidKey(format!("Invalid Key Hex: {}", e)))?;
                let key_arr: [u8; 32] = key_vec.as_slice().try_into().map_err(|_| {
                    SignatureError::InvalidKey(format!("Key must be 32 bytes, found {}", key_vec.len()))
                })?;
                key_arr
            }
            None => {
                let mut hasher = Sha256::new();
                hasher.update(b"live-state-encryption:");
                hasher.update(config.secret_key.as_bytes());
                hasher.finalize().into()
            }
        };

        Ok(Self {
            keys: RwLock::new(KeyRing {
                current: config.secret_key.as_bytes().to_vec(),
                retired: Vec::new(),
            }),
            encryption_key,
            migrations: Mutex::new(HashMap::new()),
            backups: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &SignatureConfig {
        &self.config
    }

    /// Signs `data` for `component_id` at the current time.
    pub fn sign(
        &self,
        component_id: &str,
        data: &Value,
        version: u64,
        options: SignOptions,
    ) -> Result<SignedState, SignatureError> {
        self.sign_at(component_id, data, version, options, now_millis())
    }

    /// Signs with an explicit timestamp (epoch milliseconds).
    pub fn sign_at(
        &self,
        component_id: &str,
        data: &Value,
        version: u64,
        options: SignOptions,
        timestamp: i64,
    ) -> Result<SignedState, SignatureError> {
        let payload = if options.compress || options.encrypt {
            let mut bytes = serde_json::to_vec(data)?;
            if options.compress {
                bytes = lz4_flex::compress_prepend_size(&bytes);
            }
            if options.encrypt {
                bytes = self.encrypt(&bytes);
            }
            Value::String(general_purpose::STANDARD.encode(&bytes))
        } else {
            data.clone()
        };

        let mut envelope = SignedState {
            data: payload,
            signature: String::new(),
            timestamp,
            component_id: component_id.to_string(),
            version,
            compressed: options.compress,
            encrypted: options.encrypt,
        };

        let key = self.current_key();
        envelope.signature = hex::encode(compute_mac(&key, &envelope_tuple(&envelope))?);

        if options.backup {
            self.store_backup(component_id, version, data, timestamp)?;
        }

        debug!(component_id, version, compressed = options.compress, encrypted = options.encrypt, "state signed");
        Ok(envelope)
    }

    /// Validates an envelope against the configured maximum age (or `max_age`).
    pub fn validate(&self, envelope: &SignedState, max_age: Option<Duration>) -> ValidationResult {
        self.validate_at(envelope, max_age, now_millis())
    }

    /// Deterministic variant of `validate` with an explicit "now".
    pub fn validate_at(
        &self,
        envelope: &SignedState,
        max_age: Option<Duration>,
        now_ms: i64,
    ) -> ValidationResult {
        let max_age_ms = max_age
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(self.config.max_age_ms);
        let max_age_limit = i64::try_from(max_age_ms).unwrap_or(i64::MAX);

        // 1. Expiry. The timestamp is client-supplied.
        let age_ms = now_ms.saturating_sub(envelope.timestamp);
        if age_ms > max_age_limit {
            return ValidationResult::expired(age_ms, max_age_ms);
        }
        if age_ms < -MAX_CLOCK_SKEW_MS {
            return ValidationResult::tampered("timestamp is in the future");
        }

        // 2. Signature, constant time
        let provided = match hex::decode(&envelope.signature) {
            Ok(bytes) => bytes,
            Err(_) => return ValidationResult::tampered("signature is not valid hex"),
        };
        let tuple = envelope_tuple(envelope);
        let keys = self.keys.read().expect("Signer key lock poisoned");
        let candidates = std::iter::once(&keys.current).chain(keys.retired.iter());
        for key in candidates {
            if verify_mac(key, &tuple, &provided) {
                return ValidationResult::ok();
            }
        }
        ValidationResult::tampered("signature mismatch")
    }

    /// Reverses encryption and compression. Call only after `validate` succeeded.
    pub fn extract_data(&self, envelope: &SignedState) -> Result<Value, SignatureError> {
        if !envelope.compressed && !envelope.encrypted {
            return Ok(envelope.data.clone());
        }

        let encoded = envelope.data.as_str().ok_or_else(|| {
            SignatureError::Encoding("transformed data must be a base64 string".to_string())
        })?;
        let mut bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SignatureError::Encoding(format!("Invalid Base64 data: {}", e)))?;

        if envelope.encrypted {
            bytes = self.decrypt(&bytes)?;
        }
        if envelope.compressed {
            bytes = lz4_flex::decompress_size_prepended(&bytes)
                .map_err(|e| SignatureError::Decompression(e.to_string()))?;
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Registers a state transform from `from` to `to`.
    pub fn register_migration<F>(&self, from: u64, to: u64, transform: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let mut migrations = self.migrations.lock().expect("Migration lock poisoned");
        if migrations.insert((from, to), Arc::new(transform)).is_some() {
            warn!(from, to, "migration replaced");
        }
    }

    /// Migrates an envelope to `target_version`.
    ///
    /// Uses a direct `(from, to)` transform when registered, otherwise a chain
    /// of single-version steps. Returns `None` when no path exists or a step
    /// fails; the caller decides what to do.
    pub fn migrate(&self, envelope: &SignedState, target_version: u64) -> Option<SignedState> {
        let from = envelope.version;
        if from == target_version {
            return Some(envelope.clone());
        }

        let steps = self.migration_path(from, target_version)?;

        let mut data = match self.extract_data(envelope) {
            Ok(data) => data,
            Err(e) => {
                warn!(component_id = %envelope.component_id, "cannot migrate unreadable state: {}", e);
                return None;
            }
        };
        for (step_from, step_to, transform) in steps {
            data = match transform(data) {
                Ok(next) => next,
                Err(e) => {
                    warn!(component_id = %envelope.component_id, step_from, step_to, "migration step failed: {}", e);
                    return None;
                }
            };
        }

        let options = SignOptions {
            compress: envelope.compressed,
            encrypt: envelope.encrypted,
            backup: false,
        };
        match self.sign(&envelope.component_id, &data, target_version, options) {
            Ok(migrated) => Some(migrated),
            Err(e) => {
                warn!(component_id = %envelope.component_id, "re-signing migrated state failed: {}", e);
                None
            }
        }
    }

    fn migration_path(&self, from: u64, to: u64) -> Option<Vec<(u64, u64, MigrationFn)>> {
        let migrations = self.migrations.lock().expect("Migration lock poisoned");
        if let Some(direct) = migrations.get(&(from, to)) {
            return Some(vec![(from, to, direct.clone())]);
        }

        let mut path = Vec::new();
        let mut current = from;
        while current != to {
            let next = if to > current { current + 1 } else { current - 1 };
            let step = migrations.get(&(current, next))?;
            path.push((current, next, step.clone()));
            current = next;
        }
        Some(path)
    }

    /// Retires the current key and starts signing with `new_secret`.
    pub fn rotate_key(&self, new_secret: &str) -> Result<(), SignatureError> {
        if new_secret.is_empty() {
            return Err(SignatureError::InvalidKey("secret key must not be empty".to_string()));
        }
        let mut keys = self.keys.write().expect("Signer key lock poisoned");
        let previous = std::mem::replace(&mut keys.current, new_secret.as_bytes().to_vec());
        keys.retired.insert(0, previous);
        let limit = self.config.retired_key_limit;
        keys.retired.truncate(limit);
        tracing::info!(retired = keys.retired.len(), "signing key rotated");
        Ok(())
    }

    // --- Backups ---

    fn store_backup(
        &self,
        component_id: &str,
        version: u64,
        data: &Value,
        timestamp: i64,
    ) -> Result<(), SignatureError> {
        let key = self.current_key();
        let signature = hex::encode(compute_mac(&key, &backup_tuple(component_id, version, data, timestamp))?);
        let backup = StateBackup {
            component_id: component_id.to_string(),
            version,
            data: data.clone(),
            signature,
            timestamp,
        };

        let mut backups = self.backups.lock().expect("Backup lock poisoned");
        let entries = backups.entry(component_id.to_string()).or_default();
        entries.retain(|b| b.version != version);
        entries.push_back(backup);
        while entries.len() > self.config.max_backups_per_component {
            entries.pop_front();
        }
        Ok(())
    }

    /// Checks a backup's own signature against the current and retired keys.
    pub fn verify_backup(&self, backup: &StateBackup) -> bool {
        let Ok(provided) = hex::decode(&backup.signature) else {
            return false;
        };
        let tuple = backup_tuple(&backup.component_id, backup.version, &backup.data, backup.timestamp);
        let keys = self.keys.read().expect("Signer key lock poisoned");
        std::iter::once(&keys.current)
            .chain(keys.retired.iter())
            .any(|key| verify_mac(key, &tuple, &provided))
    }

    /// Returns the state stored for `(component_id, version)` if it verifies.
    pub fn recover_from_backup(&self, component_id: &str, version: u64) -> Option<Value> {
        let backup = {
            let backups = self.backups.lock().expect("Backup lock poisoned");
            backups
                .get(component_id)?
                .iter()
                .find(|b| b.version == version)
                .cloned()?
        };
        if self.verify_backup(&backup) {
            Some(backup.data)
        } else {
            warn!(component_id, version, "backup failed verification");
            None
        }
    }

    /// Newest backup for a component.
    pub fn latest_backup(&self, component_id: &str) -> Option<StateBackup> {
        let backups = self.backups.lock().expect("Backup lock poisoned");
        backups.get(component_id)?.iter().max_by_key(|b| b.version).cloned()
    }

    /// Removes backups older than `max_age`. Returns how many were removed.
    pub fn prune_backups(&self, max_age: Duration, now_ms: i64) -> usize {
        let cutoff = now_ms - max_age.as_millis() as i64;
        let mut removed = 0;
        let mut backups = self.backups.lock().expect("Backup lock poisoned");
        backups.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|b| b.timestamp >= cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    pub fn backup_count(&self) -> usize {
        let backups = self.backups.lock().expect("Backup lock poisoned");
        backups.values().map(|v| v.len()).sum()
    }

    // --- Internals ---

    fn current_key(&self) -> Vec<u8> {
        self.keys.read().expect("Signer key lock poisoned").current.clone()
    }

    fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let iv: [u8; 16] = rand::random();
        let key_arr = self.encryption_key;
        let encryptor = Encryptor::<Aes256>::new(&key_arr.into(), &iv.into());
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plain);
        let mut out = Vec::with_capacity(iv.len() + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>, SignatureError> {
        if bytes.len() <= 16 {
            return Err(SignatureError::Decryption("ciphertext too short".to_string()));
        }
        let (iv, ciphertext) = bytes.split_at(16);
        let iv_arr: [u8; 16] = iv
            .try_into()
            .map_err(|_| SignatureError::Decryption(format!("Invalid IV length: {}", iv.len())))?;
        let key_arr = self.encryption_key;
        let decryptor = Decryptor::<Aes256>::new(&key_arr.into(), &iv_arr.into());
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| SignatureError::Decryption(format!("Decryption failed: {:?}", e)))
    }
}

fn envelope_tuple(envelope: &SignedState) -> String {
    let mut tuple = json!({
        "componentId": envelope.component_id,
        "data": envelope.data,
        "timestamp": envelope.timestamp,
        "version": envelope.version,
    });
    if envelope.compressed {
        tuple["compressed"] = Value::Bool(true);
    }
    if envelope.encrypted {
        tuple["encrypted"] = Value::Bool(true);
    }
    canonical_json(&tuple)
}

fn backup_tuple(component_id: &str, version: u64, data: &Value, timestamp: i64) -> String {
    canonical_json(&json!({
        "backup": true,
        "componentId": component_id,
        "data": data,
        "timestamp": timestamp,
        "version": version,
    }))
}

fn compute_mac(key: &[u8], message: &str) -> Result<Vec<u8>, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_mac(key: &[u8], message: &str, provided: &[u8]) -> bool {
    match HmacSha256::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(message.as_bytes());
            mac.verify_slice(provided).is_ok()
        }
        Err(_) => false,
    }
}
