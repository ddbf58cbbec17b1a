//! # Upload Engine
//!
//! Chunked file transfer over the component socket. A client announces an
//! upload, streams base64 chunks in any order, and the engine reassembles them
//! in index order once every index in `[0, totalChunks)` has arrived.
//!
//! Chunks are bounded by the declared chunk size and the running total by the
//! declared file size.
//!
//! Finalization is idempotent: the upload is flagged and its chunks taken
//! under the map lock before any file I/O starts, and the result is cached so
//! a late duplicate `complete` gets the same answer. A failed write puts the
//! chunks back so the client can retry.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::configs::config_live::UploadConfig;

/// How long a finished upload's result stays cached for idempotent replies.
const COMPLETED_RETENTION_SECS: i64 = 60 * 60;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload '{0}' not found")]
    UnknownUpload(String),

    #[error("Upload '{0}' already exists")]
    DuplicateUpload(String),

    #[error("File type '{0}' is not allowed")]
    TypeNotAllowed(String),

    #[error("Invalid file size {size} (maximum {max})")]
    InvalidSize { size: u64, max: u64 },

    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("Chunk count mismatch: expected {expected}, got {got}")]
    ChunkCountMismatch { expected: u32, got: u32 },

    #[error("Chunk index {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("Chunk {index} is not valid base64: {reason}")]
    InvalidChunkData { index: u32, reason: String },

    #[error("Chunk {index} is {size} bytes, larger than the declared chunk size {max}")]
    ChunkTooLarge { index: u32, size: u64, max: u64 },

    #[error("Chunk {index} failed hash verification")]
    HashMismatch { index: u32 },

    #[error("Upload '{upload_id}' is missing chunks {missing:?}")]
    MissingChunks { upload_id: String, missing: Vec<u32> },

    #[error("Upload '{0}' is already being finalized")]
    Finalizing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// `FILE_UPLOAD_START` metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStart {
    pub upload_id: String,
    pub component_id: String,
    pub filename: String,
    pub file_type: String,
    pub file_size: u64,
    pub chunk_size: u64,
}

#[derive(Debug, Clone)]
pub struct ActiveUpload {
    pub upload_id: String,
    pub component_id: String,
    pub filename: String,
    pub file_type: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received_chunks: BTreeMap<u32, Vec<u8>>,
    /// Sum of the stored chunk lengths.
    pub received_bytes: u64,
    pub start_time: DateTime<Utc>,
    pub last_chunk_time: DateTime<Utc>,
    /// Set while the file is being written; the chunks are out of the map then.
    pub finalizing: bool,
}

impl ActiveUpload {
    pub fn is_complete(&self) -> bool {
        self.received_chunks.len() as u32 == self.total_chunks
    }

    /// Longest base64 text that can decode to one chunk.
    fn max_encoded_chunk_len(&self) -> u64 {
        self.chunk_size.div_ceil(3).saturating_mul(4)
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received_chunks.contains_key(i))
            .collect()
    }

    pub fn bytes_received(&self) -> u64 {
        self.received_bytes
    }

    fn progress(&self, chunk_index: u32) -> UploadProgress {
        let received = self.received_chunks.len() as u32;
        UploadProgress {
            upload_id: self.upload_id.clone(),
            component_id: self.component_id.clone(),
            chunk_index,
            received_chunks: received,
            total_chunks: self.total_chunks,
            bytes_received: self.bytes_received(),
            progress: received as f64 / self.total_chunks as f64 * 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub upload_id: String,
    pub component_id: String,
    pub chunk_index: u32,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub bytes_received: u64,
    /// Percentage, `0..=100`.
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadComplete {
    pub upload_id: String,
    pub component_id: String,
    pub filename: String,
    pub file_url: String,
    pub file_size: u64,
}

/// Result of feeding one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Progress(UploadProgress),
    Completed(UploadComplete),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStats {
    pub active_uploads: usize,
    pub bytes_in_flight: u64,
    pub completed_uploads: usize,
}

/// # Upload Manager
pub struct UploadManager {
    config: UploadConfig,
    uploads: Mutex<HashMap<String, ActiveUpload>>,
    completed: Mutex<HashMap<String, (UploadComplete, DateTime<Utc>)>>,
}

impl UploadManager {
    pub fn new(config: UploadConfig) -> Self {
        Self {
            config,
            uploads: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Validates and registers a new upload.
    pub fn start(&self, meta: UploadStart) -> Result<UploadProgress, UploadError> {
        self.start_at(meta, Utc::now())
    }

    pub fn start_at(&self, meta: UploadStart, now: DateTime<Utc>) -> Result<UploadProgress, UploadError> {
        if !self.config.allowed_types.iter().any(|t| t == &meta.file_type) {
            return Err(UploadError::TypeNotAllowed(meta.file_type));
        }
        if meta.file_size == 0 || meta.file_size > self.config.max_file_size {
            return Err(UploadError::InvalidSize {
                size: meta.file_size,
                max: self.config.max_file_size,
            });
        }
        if meta.chunk_size == 0 {
            return Err(UploadError::InvalidChunkSize);
        }

        let total_chunks = meta.file_size.div_ceil(meta.chunk_size) as u32;
        let upload = ActiveUpload {
            upload_id: meta.upload_id.clone(),
            component_id: meta.component_id,
            filename: meta.filename,
            file_type: meta.file_type,
            file_size: meta.file_size,
            chunk_size: meta.chunk_size,
            total_chunks,
            received_chunks: BTreeMap::new(),
            received_bytes: 0,
            start_time: now,
            last_chunk_time: now,
            finalizing: false,
        };

        let mut uploads = self.uploads.lock().expect("Upload lock poisoned");
        if uploads.contains_key(&meta.upload_id) {
            return Err(UploadError::DuplicateUpload(meta.upload_id));
        }
        let progress = upload.progress(0);
        info!(
            upload_id = %upload.upload_id,
            filename = %upload.filename,
            size = upload.file_size,
            total_chunks,
            "upload started"
        );
        uploads.insert(meta.upload_id, upload);
        Ok(progress)
    }

    /// Stores one chunk. The last missing chunk triggers finalization.
    pub async fn receive_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        data: &str,
        hash: Option<&str>,
    ) -> Result<ChunkOutcome, UploadError> {
        // Oversized text is refused before it is decoded.
        let max_encoded = {
            let uploads = self.uploads.lock().expect("Upload lock poisoned");
            uploads.get(upload_id).map(|u| u.max_encoded_chunk_len())
        };
        if let Some(max_encoded) = max_encoded {
            if data.len() as u64 > max_encoded {
                return Err(UploadError::ChunkTooLarge {
                    index: chunk_index,
                    size: (data.len() as u64 / 4).saturating_mul(3),
                    max: max_encoded / 4 * 3,
                });
            }
        }

        let bytes = general_purpose::STANDARD
            .decode(data)
            .map_err(|e| UploadError::InvalidChunkData { index: chunk_index, reason: e.to_string() })?;

        if let Some(expected) = hash {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(UploadError::HashMismatch { index: chunk_index });
            }
        }

        let stored = {
            let mut uploads = self.uploads.lock().expect("Upload lock poisoned");
            match uploads.get_mut(upload_id) {
                None => None,
                Some(upload) => {
                    if upload.finalizing {
                        return Err(UploadError::Finalizing(upload_id.to_string()));
                    }
                    if total_chunks != upload.total_chunks {
                        return Err(UploadError::ChunkCountMismatch {
                            expected: upload.total_chunks,
                            got: total_chunks,
                        });
                    }
                    if chunk_index >= upload.total_chunks {
                        return Err(UploadError::ChunkOutOfRange {
                            index: chunk_index,
                            total: upload.total_chunks,
                        });
                    }
                    let size = bytes.len() as u64;
                    if size > upload.chunk_size {
                        return Err(UploadError::ChunkTooLarge {
                            index: chunk_index,
                            size,
                            max: upload.chunk_size,
                        });
                    }

                    if upload.received_chunks.contains_key(&chunk_index) {
                        debug!(upload_id, chunk_index, "duplicate chunk ignored");
                    } else {
                        let total = upload.received_bytes.saturating_add(size);
                        if total > upload.file_size {
                            return Err(UploadError::InvalidSize {
                                size: total,
                                max: upload.file_size,
                            });
                        }
                        upload.received_chunks.insert(chunk_index, bytes);
                        upload.received_bytes = total;
                    }
                    upload.last_chunk_time = Utc::now();
                    Some((upload.progress(chunk_index), upload.is_complete()))
                }
            }
        };

        let Some((progress, complete)) = stored else {
            // A duplicate of the final chunk may arrive after auto-finalize.
            if let Some(done) = self.completed_result(upload_id) {
                return Ok(ChunkOutcome::Completed(done));
            }
            return Err(UploadError::UnknownUpload(upload_id.to_string()));
        };

        if complete {
            let done = self.complete(upload_id).await?;
            return Ok(ChunkOutcome::Completed(done));
        }
        Ok(ChunkOutcome::Progress(progress))
    }

    /// Reassembles and writes the file. Safe to call more than once.
    pub async fn complete(&self, upload_id: &str) -> Result<UploadComplete, UploadError> {
        if let Some(done) = self.completed_result(upload_id) {
            return Ok(done);
        }

        let job = {
            let mut uploads = self.uploads.lock().expect("Upload lock poisoned");
            match uploads.get_mut(upload_id) {
                Some(upload) if upload.finalizing => {
                    return Err(UploadError::Finalizing(upload_id.to_string()));
                }
                Some(upload) if !upload.is_complete() => {
                    return Err(UploadError::MissingChunks {
                        upload_id: upload_id.to_string(),
                        missing: upload.missing_chunks(),
                    });
                }
                Some(upload) => {
                    upload.finalizing = true;
                    let chunks = std::mem::take(&mut upload.received_chunks);
                    let mut job = upload.clone();
                    job.received_chunks = chunks;
                    Some(job)
                }
                None => None,
            }
        };

        let Some(job) = job else {
            if let Some(done) = self.completed_result(upload_id) {
                return Ok(done);
            }
            return Err(UploadError::UnknownUpload(upload_id.to_string()));
        };

        match self.write_file(&job).await {
            Ok(done) => {
                // Cache first so a concurrent `complete` never sees the id missing.
                self.completed
                    .lock()
                    .expect("Upload lock poisoned")
                    .insert(upload_id.to_string(), (done.clone(), Utc::now()));
                self.uploads.lock().expect("Upload lock poisoned").remove(upload_id);
                info!(upload_id, url = %done.file_url, size = done.file_size, "upload completed");
                Ok(done)
            }
            Err(e) => {
                let mut uploads = self.uploads.lock().expect("Upload lock poisoned");
                if let Some(upload) = uploads.get_mut(upload_id) {
                    upload.received_chunks = job.received_chunks;
                    upload.finalizing = false;
                    upload.last_chunk_time = Utc::now();
                }
                warn!(upload_id, "upload finalization failed, chunks kept for retry: {}", e);
                Err(e)
            }
        }
    }

    async fn write_file(&self, upload: &ActiveUpload) -> Result<UploadComplete, UploadError> {
        let mut content = Vec::with_capacity(upload.file_size as usize);
        for index in 0..upload.total_chunks {
            let chunk = upload.received_chunks.get(&index).ok_or_else(|| UploadError::MissingChunks {
                upload_id: upload.upload_id.clone(),
                missing: upload.missing_chunks(),
            })?;
            content.extend_from_slice(chunk);
        }

        tokio::fs::create_dir_all(&self.config.upload_dir).await?;
        let file_name = unique_file_name(&upload.filename);
        let path: PathBuf = self.config.upload_dir.join(&file_name);
        tokio::fs::write(&path, &content).await?;

        Ok(UploadComplete {
            upload_id: upload.upload_id.clone(),
            component_id: upload.component_id.clone(),
            filename: upload.filename.clone(),
            file_url: format!("{}/{}", self.config.public_prefix.trim_end_matches('/'), file_name),
            file_size: content.len() as u64,
        })
    }

    fn completed_result(&self, upload_id: &str) -> Option<UploadComplete> {
        let completed = self.completed.lock().expect("Upload lock poisoned");
        completed.get(upload_id).map(|(done, _)| done.clone())
    }

    /// Drops uploads that have not received a chunk within the chunk timeout.
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = ChronoDuration::seconds(self.config.chunk_timeout_secs as i64);
        let mut purged = Vec::new();
        {
            let mut uploads = self.uploads.lock().expect("Upload lock poisoned");
            uploads.retain(|id, upload| {
                let stale = !upload.finalizing && now - upload.last_chunk_time > timeout;
                if stale {
                    warn!(upload_id = %id, received = upload.received_chunks.len(), total = upload.total_chunks, "stale upload purged");
                    purged.push(id.clone());
                }
                !stale
            });
        }

        let retention = ChronoDuration::seconds(COMPLETED_RETENTION_SECS);
        self.completed
            .lock()
            .expect("Upload lock poisoned")
            .retain(|_, (_, at)| now - *at <= retention);

        purged
    }

    pub fn progress(&self, upload_id: &str) -> Option<UploadProgress> {
        let uploads = self.uploads.lock().expect("Upload lock poisoned");
        uploads.get(upload_id).map(|u| {
            let last = u.received_chunks.keys().next_back().copied().unwrap_or(0);
            u.progress(last)
        })
    }

    pub fn stats(&self) -> UploadStats {
        let (active_uploads, bytes_in_flight) = {
            let uploads = self.uploads.lock().expect("Upload lock poisoned");
            (uploads.len(), uploads.values().map(|u| u.bytes_received()).sum())
        };
        let completed_uploads = self.completed.lock().expect("Upload lock poisoned").len();
        UploadStats { active_uploads, bytes_in_flight, completed_uploads }
    }
}

/// Keeps ASCII alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

fn unique_file_name(original: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", Utc::now().timestamp_millis(), &id[..8], sanitize_file_name(original))
}
