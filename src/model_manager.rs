// Model management for the Whisper server
//
// This module owns the closed model-id set, alias normalization, and on-disk
// provisioning of GGML model files. Downloads are single-flight per model id
// and installed atomically: bytes stream to a sibling `.downloading` path and
// only a completed file is renamed into place, so readers never observe a
// partial model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Canonical model ids and their upstream GGML variant names
const CATALOG: &[(&str, &str)] = &[
    ("whisper-tiny", "tiny"),
    ("whisper-tiny.en", "tiny.en"),
    ("whisper-base", "base"),
    ("whisper-base.en", "base.en"),
    ("whisper-small", "small"),
    ("whisper-small.en", "small.en"),
    ("whisper-medium", "medium"),
    ("whisper-medium.en", "medium.en"),
    ("whisper-large-v1", "large-v1"),
    ("whisper-large-v2", "large-v2"),
    ("whisper-large-v3", "large-v3"),
];

const UPSTREAM_BASE_URL: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// Anything smaller than this is a truncated or corrupt model file
const MIN_MODEL_BYTES: u64 = 1024;

/// Log cumulative download progress every this many bytes
const PROGRESS_STEP_BYTES: u64 = 25 * 1024 * 1024;

/// All canonical model ids, in catalog order.
pub fn model_ids() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|(id, _)| *id)
}

/// Normalize a client-supplied model id to its canonical form.
///
/// Accepts canonical ids, bare GGML names (`base`, `tiny.en`) and the
/// historical `whisper-v3` alias, case-insensitively. Unknown ids yield
/// `None`; they are never coerced to a nearby model.
pub fn normalize_model_id(input: &str) -> Option<&'static str> {
    let lowered = input.trim().to_ascii_lowercase();
    let stripped = lowered.strip_prefix("whisper-").unwrap_or(&lowered);
    let short = match stripped {
        "v3" | "large" => "large-v3",
        other => other,
    };
    CATALOG
        .iter()
        .find(|(_, ggml)| *ggml == short)
        .map(|(id, _)| *id)
}

/// Upstream GGML variant for a canonical id.
fn ggml_variant(canonical: &str) -> Option<&'static str> {
    CATALOG
        .iter()
        .find(|(id, _)| *id == canonical)
        .map(|(_, ggml)| *ggml)
}

/// Errors raised while provisioning model files
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("unknown model id: {0}")]
    Unknown(String),
    #[error("model download failed: {0}")]
    Download(String),
    #[error("upstream returned HTTP {0}")]
    UpstreamStatus(u16),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves model ids to validated local files, downloading on demand.
pub struct ModelManager {
    models_dir: PathBuf,
    client: reqwest::Client,
    /// Per-id download locks; waiters for the same id share one outcome
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ModelManager {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            client: reqwest::Client::new(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// On-disk location for a canonical model id.
    pub fn model_path(&self, canonical: &str) -> PathBuf {
        self.models_dir.join(format!("{}.bin", canonical))
    }

    /// Return the path to a validated local model file, downloading it first
    /// when absent. Idempotent; concurrent calls for the same id collapse to
    /// one download.
    pub async fn ensure(&self, model_id: &str) -> Result<PathBuf, ModelError> {
        let canonical =
            normalize_model_id(model_id).ok_or_else(|| ModelError::Unknown(model_id.to_string()))?;
        let target = self.model_path(canonical);

        if is_valid_model_file(&target).await {
            debug!("model {} already present at {}", canonical, target.display());
            return Ok(target);
        }

        let lock = self.download_lock(canonical).await;
        let _guard = lock.lock().await;

        // Another caller may have finished the download while we waited
        if is_valid_model_file(&target).await {
            return Ok(target);
        }

        self.download(canonical, &target).await?;
        Ok(target)
    }

    async fn download_lock(&self, canonical: &str) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight
            .entry(canonical.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn download(&self, canonical: &str, target: &Path) -> Result<(), ModelError> {
        let variant = ggml_variant(canonical)
            .ok_or_else(|| ModelError::Unknown(canonical.to_string()))?;
        let url = format!("{}/ggml-{}.bin", UPSTREAM_BASE_URL, variant);

        fs::create_dir_all(&self.models_dir).await?;
        let temp_path = target.with_extension("bin.downloading");

        info!("downloading model {} from {}", canonical, url);

        let result = self.stream_to_file(&url, &temp_path).await;
        if let Err(e) = result {
            // Never leave a partial file behind
            if let Err(remove_err) = fs::remove_file(&temp_path).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "failed to remove partial download {}: {}",
                        temp_path.display(),
                        remove_err
                    );
                }
            }
            return Err(e);
        }

        fs::rename(&temp_path, target).await?;
        info!("installed model {} at {}", canonical, target.display());
        Ok(())
    }

    async fn stream_to_file(&self, url: &str, temp_path: &Path) -> Result<(), ModelError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ModelError::Download(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::UpstreamStatus(status.as_u16()));
        }

        let mut file = fs::File::create(temp_path).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut next_progress = PROGRESS_STEP_BYTES;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ModelError::Download(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if written >= next_progress {
                info!("downloaded {} MB", written / (1024 * 1024));
                next_progress += PROGRESS_STEP_BYTES;
            }
        }

        file.flush().await?;
        if let Err(e) = file.sync_all().await {
            warn!("fsync of {} failed: {}", temp_path.display(), e);
        }

        if written < MIN_MODEL_BYTES {
            return Err(ModelError::Download(format!(
                "upstream returned only {} bytes",
                written
            )));
        }

        Ok(())
    }
}

/// A model file is usable once it exists and clears the minimum size check.
pub(crate) async fn is_valid_model_file(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() >= MIN_MODEL_BYTES,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ids_normalize_to_themselves() {
        for id in model_ids() {
            assert_eq!(normalize_model_id(id), Some(id));
        }
    }

    #[test]
    fn aliases_normalize() {
        assert_eq!(normalize_model_id("base"), Some("whisper-base"));
        assert_eq!(normalize_model_id("tiny.en"), Some("whisper-tiny.en"));
        assert_eq!(normalize_model_id("whisper-v3"), Some("whisper-large-v3"));
        assert_eq!(normalize_model_id("large"), Some("whisper-large-v3"));
        assert_eq!(normalize_model_id("LARGE-V2"), Some("whisper-large-v2"));
        assert_eq!(normalize_model_id("  Base  "), Some("whisper-base"));
    }

    #[test]
    fn unknown_ids_are_rejected_not_coerced() {
        assert_eq!(normalize_model_id("whisper-xxl"), None);
        assert_eq!(normalize_model_id("gpt-4"), None);
        assert_eq!(normalize_model_id(""), None);
    }

    #[test]
    fn model_paths_are_per_id_bin_files() {
        let manager = ModelManager::new(PathBuf::from("/var/lib/whisper/models"));
        assert_eq!(
            manager.model_path("whisper-base"),
            PathBuf::from("/var/lib/whisper/models/whisper-base.bin")
        );
    }

    #[tokio::test]
    async fn ensure_returns_existing_valid_file_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path().to_path_buf());

        let target = manager.model_path("whisper-base");
        tokio::fs::write(&target, vec![0u8; 4096]).await.unwrap();

        let resolved = manager.ensure("base").await.unwrap();
        assert_eq!(resolved, target);
    }

    #[tokio::test]
    async fn ensure_rejects_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path().to_path_buf());
        assert!(matches!(
            manager.ensure("whisper-xxl").await,
            Err(ModelError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn undersized_files_are_not_valid_models() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub.bin");
        tokio::fs::write(&path, b"tiny").await.unwrap();
        assert!(!is_valid_model_file(&path).await);

        tokio::fs::write(&path, vec![0u8; 2048]).await.unwrap();
        assert!(is_valid_model_file(&path).await);
    }

    #[tokio::test]
    async fn download_locks_are_shared_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path().to_path_buf());

        let first = manager.download_lock("whisper-base").await;
        let second = manager.download_lock("whisper-base").await;
        let other = manager.download_lock("whisper-tiny").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
