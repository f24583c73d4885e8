// Whisper Server Library
//
// This crate provides an OpenAI-compatible HTTP API for audio transcription
// backed by a local whisper.cpp engine. Requests pass through admission
// control, audio normalization and deadline-bounded inference.

pub mod admission;
pub mod audio;
pub mod config;
pub mod config_loader;
pub mod error;
pub mod file_utils;
pub mod handlers;
pub mod model_manager;
pub mod models;
pub mod state;
pub mod transcriber;

// Re-export common types for easier access
pub use admission::{AdmissionController, AdmissionTicket, BusyError};
pub use config::EffectiveConfig;
pub use config_loader::{resolve, CliOverrides, ConfigError};
pub use error::ApiError;
pub use handlers::{
    config_echo, config_echo_v1, get_model, health, list_models, transcribe, transcribe_base64,
    transcribe_url,
};
pub use model_manager::ModelManager;
pub use models::{ErrorEnvelope, TranscriptionResponse};
pub use state::AppState;
pub use transcriber::{Transcriber, WhisperTranscriber};
