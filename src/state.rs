// Shared application state for the Whisper server
//
// Everything a handler needs arrives through this one context: the resolved
// configuration, the admission gate, the model manager and the transcription
// engine. No ambient or thread-local state.

use std::sync::Arc;
use std::time::Duration;

use crate::admission::AdmissionController;
use crate::config::EffectiveConfig;
use crate::file_utils::exe_dir;
use crate::model_manager::ModelManager;
use crate::transcriber::{Transcriber, WhisperTranscriber};

pub struct AppState {
    pub config: EffectiveConfig,
    pub admission: AdmissionController,
    pub models: ModelManager,
    pub engine: Arc<dyn Transcriber>,
    /// Client used for URL ingress fetches
    pub http: reqwest::Client,
}

impl AppState {
    /// Build the production state: models beside the executable, whisper.cpp
    /// engine bound to the configured model file.
    pub fn new(config: EffectiveConfig) -> Self {
        let models = ModelManager::new(exe_dir().join("models"));
        let model_path = models.model_path(&config.whisper.model_name);
        let engine = Arc::new(WhisperTranscriber::new(model_path, config.whisper.device));
        Self::with_engine(config, models, engine)
    }

    /// Build state with an explicit engine and model manager. This is the
    /// seam used by tests to swap in a mock backend.
    pub fn with_engine(
        config: EffectiveConfig,
        models: ModelManager,
        engine: Arc<dyn Transcriber>,
    ) -> Self {
        let admission = AdmissionController::new(
            config.server.max_concurrent_requests,
            Duration::from_secs(config.server.queue_wait_seconds),
        );
        Self {
            config,
            admission,
            models,
            engine,
            http: reqwest::Client::new(),
        }
    }

    /// Per-request budget for the normalize + transcribe phase
    pub fn request_budget(&self) -> Duration {
        Duration::from_secs(self.config.server.timeout_seconds)
    }

    /// Timeout applied to URL ingress fetches
    pub fn url_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.timeout_seconds + 10)
    }
}
