// Transcription engine adapter for the Whisper server
//
// The HTTP layer depends on the `Transcriber` trait instead of a concrete
// engine, which keeps request handling decoupled from inference code. The
// whisper.cpp implementation loads one context per process, lazily and
// serialized; each request gets its own single-use inference state.
//
// Inference runs inside `spawn_blocking`, so the per-request state is
// created and dropped on the blocking thread. When the awaiting future is
// cancelled or times out, the state still finishes and is released there —
// it is never dropped mid-iteration from async code.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;
use tokio::sync::Mutex;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::audio;
use crate::config::Device;

/// Anything smaller than this cannot be a real GGML model
const MIN_MODEL_BYTES: u64 = 1024;

/// Input for one transcription run
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    /// Canonical 16 kHz mono WAV produced by the normalizer
    pub wav_path: PathBuf,
    /// Language hint, `auto` to detect
    pub language: String,
    /// Remaining request budget for the inference phase
    pub timeout: Duration,
}

/// Timestamped transcript chunk
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub id: u32,
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    pub text: String,
}

/// Full inference result
#[derive(Debug, Clone)]
pub struct TranscriptResult {
    pub text: String,
    pub language: String,
    /// End of the last segment in seconds, 0.0 for silence
    pub duration: f64,
    pub segments: Vec<TranscriptSegment>,
}

/// Failures surfaced by the engine adapter
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model not ready: {0}")]
    ModelNotReady(String),
    #[error("transcription timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
    #[error("engine failure: {0}")]
    Engine(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backend contract implemented by speech-to-text engines.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, request: TranscribeRequest) -> Result<TranscriptResult, EngineError>;
}

/// whisper.cpp backend via whisper-rs
pub struct WhisperTranscriber {
    model_path: PathBuf,
    use_gpu: bool,
    /// Loaded context; publish-once, read-many
    context: Mutex<Option<Arc<WhisperContext>>>,
}

impl WhisperTranscriber {
    pub fn new(model_path: PathBuf, device: Device) -> Self {
        Self {
            model_path,
            use_gpu: device.use_gpu(),
            context: Mutex::new(None),
        }
    }

    /// Load the context on first use. The lock serializes initialization;
    /// later callers see the cached context without reloading.
    async fn context(&self) -> Result<Arc<WhisperContext>, EngineError> {
        let mut slot = self.context.lock().await;
        if let Some(context) = slot.as_ref() {
            return Ok(context.clone());
        }

        check_model_file(&self.model_path)?;

        let path = self.model_path.clone();
        let use_gpu = self.use_gpu;
        info!("loading whisper model from {}", path.display());

        let context = tokio::task::spawn_blocking(move || {
            let mut params = WhisperContextParameters::default();
            params.use_gpu(use_gpu);
            WhisperContext::new_with_params(&path.to_string_lossy(), params)
        })
        .await
        .map_err(|e| EngineError::Engine(format!("model load task failed: {e}")))?
        .map_err(|e| EngineError::ModelNotReady(format!("failed to load model: {e}")))?;

        let context = Arc::new(context);
        *slot = Some(context.clone());
        info!("whisper model loaded");
        Ok(context)
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, request: TranscribeRequest) -> Result<TranscriptResult, EngineError> {
        let context = self.context().await?;
        let timeout_seconds = request.timeout.as_secs();
        let language = request.language.clone();
        let wav_path = request.wav_path.clone();

        let worker = tokio::task::spawn_blocking(move || {
            let samples = audio::read_canonical_wav(&wav_path)
                .map_err(|e| EngineError::Engine(format!("failed to read normalized audio: {e}")))?;
            run_inference(&context, &samples, &language)
        });

        match tokio::time::timeout(request.timeout, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(EngineError::Engine(format!(
                "inference task failed: {join_error}"
            ))),
            Err(_) => {
                debug!("inference exceeded {}s budget", timeout_seconds);
                Err(EngineError::Timeout {
                    seconds: timeout_seconds,
                })
            }
        }
    }
}

fn check_model_file(path: &Path) -> Result<(), EngineError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() >= MIN_MODEL_BYTES => Ok(()),
        Ok(meta) => Err(EngineError::ModelNotReady(format!(
            "model file {} is only {} bytes",
            path.display(),
            meta.len()
        ))),
        Err(_) => Err(EngineError::ModelNotReady(format!(
            "model file {} does not exist",
            path.display()
        ))),
    }
}

/// One inference pass; runs on a blocking thread.
fn run_inference(
    context: &WhisperContext,
    samples: &[f32],
    language: &str,
) -> Result<TranscriptResult, EngineError> {
    let mut state = context
        .create_state()
        .map_err(|e| EngineError::Engine(format!("failed to create whisper state: {e}")))?;

    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);
    params.set_translate(false);
    params.set_language(Some(language));
    params.set_n_threads(engine_threads());

    state
        .full(params, samples)
        .map_err(|e| EngineError::Engine(format!("inference failed: {e}")))?;

    let segment_count = state
        .full_n_segments()
        .map_err(|e| EngineError::Engine(format!("failed to count segments: {e}")))?;

    let mut segments = Vec::new();
    let mut next_id = 0u32;
    for i in 0..segment_count {
        let segment_text = state
            .full_get_segment_text(i)
            .map_err(|e| EngineError::Engine(format!("failed to read segment {i}: {e}")))?;
        let trimmed = segment_text.trim();
        if trimmed.is_empty() {
            continue;
        }
        // timestamps arrive in centiseconds
        let start = state
            .full_get_segment_t0(i)
            .map_err(|e| EngineError::Engine(format!("failed to read segment start: {e}")))?
            as f64
            / 100.0;
        let end = state
            .full_get_segment_t1(i)
            .map_err(|e| EngineError::Engine(format!("failed to read segment end: {e}")))?
            as f64
            / 100.0;
        segments.push(TranscriptSegment {
            id: next_id,
            start,
            end,
            text: trimmed.to_string(),
        });
        next_id += 1;
    }

    let resolved_language = if language.eq_ignore_ascii_case("auto") {
        match state.full_lang_id_from_state() {
            Ok(id) => whisper_rs::get_lang_str(id).unwrap_or("en").to_string(),
            Err(_) => "en".to_string(),
        }
    } else {
        language.to_string()
    };

    let duration = segments.last().map(|s| s.end).unwrap_or(0.0);
    let text = segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    Ok(TranscriptResult {
        text,
        language: resolved_language,
        duration,
        segments,
    })
}

fn engine_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| (n.get() as i32 - 1).max(1))
        .unwrap_or(2)
}
