// Error handling for the Whisper server
//
// This module defines the typed error kinds raised across the pipeline and
// the single place they are mapped to HTTP statuses and OpenAI-style error
// envelopes. Components return kinds, never pre-rendered responses.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use log::error;
use std::io;
use thiserror::Error;

use crate::admission::BusyError;
use crate::audio::AudioError;
use crate::model_manager::ModelError;
use crate::models::ErrorEnvelope;
use crate::transcriber::EngineError;

/// Errors surfaced to HTTP clients
#[derive(Error, Debug)]
pub enum ApiError {
    /// No audio file in the multipart form
    #[error("no audio file provided in the request")]
    MissingFile,

    /// Malformed request body or fields
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The `audio` field did not decode as base64
    #[error("invalid base64 audio payload: {0}")]
    InvalidBase64(String),

    /// A request named a model outside the supported set
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// `GET /v1/models/{id}` for an id outside the supported set
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Payload exceeds the configured size cap
    #[error("file of {size} bytes exceeds the limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    /// File extension outside the accepted audio formats
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Decoding or resampling the audio failed
    #[error("audio processing failed: {0}")]
    AudioProcessing(String),

    /// Admission refused: concurrency cap reached and queue wait elapsed
    #[error("server is busy, concurrency limit reached")]
    Busy,

    /// The request deadline elapsed during normalize or transcribe
    #[error("request timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Configured model file absent or invalid at time of use
    #[error("model not ready: {0}")]
    ModelNotReady(String),

    /// Fetching the remote audio URL failed
    #[error("failed to fetch audio url: {message}")]
    UrlFetch { status: u16, message: String },

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected engine or internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn envelope(&self) -> ErrorEnvelope {
        match self {
            ApiError::MissingFile => ErrorEnvelope::new(
                self.to_string(),
                "invalid_request_error",
                Some("file".to_string()),
                Some("missing_file".to_string()),
            ),
            ApiError::InvalidRequest(_) => ErrorEnvelope::new(
                self.to_string(),
                "invalid_request_error",
                None,
                Some("invalid_request_error".to_string()),
            ),
            ApiError::InvalidBase64(_) => ErrorEnvelope::new(
                self.to_string(),
                "invalid_request_error",
                Some("audio".to_string()),
                Some("invalid_base64".to_string()),
            ),
            ApiError::UnknownModel(_) => ErrorEnvelope::new(
                self.to_string(),
                "invalid_request_error",
                Some("model".to_string()),
                Some("model_not_found".to_string()),
            ),
            ApiError::ModelNotFound(_) => ErrorEnvelope::new(
                self.to_string(),
                "invalid_request_error",
                None,
                Some("model_not_found".to_string()),
            ),
            ApiError::FileTooLarge { .. } => ErrorEnvelope::new(
                self.to_string(),
                "invalid_request_error",
                Some("file".to_string()),
                Some("file_too_large".to_string()),
            ),
            ApiError::UnsupportedMediaType(_) => ErrorEnvelope::new(
                self.to_string(),
                "invalid_request_error",
                Some("file".to_string()),
                Some("unsupported_media_type".to_string()),
            ),
            ApiError::AudioProcessing(_) => ErrorEnvelope::new(
                self.to_string(),
                "invalid_request_error",
                Some("file".to_string()),
                Some("audio_processing_failed".to_string()),
            ),
            ApiError::Busy => ErrorEnvelope::new(
                self.to_string(),
                "rate_limit_exceeded",
                None,
                Some("concurrency_limit".to_string()),
            ),
            ApiError::Timeout { .. } => ErrorEnvelope::new(
                self.to_string(),
                "request_timeout",
                None,
                Some("timeout".to_string()),
            ),
            ApiError::ModelNotReady(_) => ErrorEnvelope::new(
                self.to_string(),
                "server_error",
                None,
                Some("model_not_ready".to_string()),
            ),
            ApiError::UrlFetch { .. } => ErrorEnvelope::new(
                self.to_string(),
                "invalid_request_error",
                Some("url".to_string()),
                Some("url_fetch_failed".to_string()),
            ),
            // Internal detail stays in the log, not in the envelope
            ApiError::Io(_) | ApiError::Internal(_) => {
                ErrorEnvelope::new("internal server error", "server_error", None, None)
            }
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingFile
            | ApiError::InvalidRequest(_)
            | ApiError::InvalidBase64(_)
            | ApiError::UnknownModel(_) => StatusCode::BAD_REQUEST,
            ApiError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMediaType(_) | ApiError::AudioProcessing(_) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ApiError::Busy => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            ApiError::ModelNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            // Upstream statuses are mirrored verbatim; pure network failures
            // arrive here already mapped to 502/504
            ApiError::UrlFetch { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Io(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            error!("request failed: {}", self);
        }
        HttpResponse::build(self.status_code()).json(self.envelope())
    }
}

impl From<AudioError> for ApiError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::UnsupportedFormat(ext) => ApiError::UnsupportedMediaType(ext),
            AudioError::Decode(msg) => ApiError::AudioProcessing(msg),
            AudioError::Resample(msg) => ApiError::AudioProcessing(msg),
            AudioError::Io(e) => ApiError::Io(e),
        }
    }
}

impl From<ModelError> for ApiError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Unknown(id) => ApiError::UnknownModel(id),
            // Provisioning failures mean the model cannot be served right now
            ModelError::Download(msg) => ApiError::ModelNotReady(msg),
            ModelError::UpstreamStatus(status) => {
                ApiError::ModelNotReady(format!("model download failed with HTTP {status}"))
            }
            ModelError::Io(e) => ApiError::ModelNotReady(e.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ModelNotReady(msg) => ApiError::ModelNotReady(msg),
            EngineError::Timeout { seconds } => ApiError::Timeout { seconds },
            EngineError::Engine(msg) => ApiError::Internal(msg),
            EngineError::Io(e) => ApiError::Io(e),
        }
    }
}

impl From<BusyError> for ApiError {
    fn from(_: BusyError) -> Self {
        ApiError::Busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_of(err: &ApiError) -> serde_json::Value {
        serde_json::to_value(err.envelope()).unwrap()
    }

    #[test]
    fn missing_file_maps_to_400_missing_file() {
        let err = ApiError::MissingFile;
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        let json = envelope_of(&err);
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(json["error"]["code"], "missing_file");
        assert_eq!(json["error"]["param"], "file");
    }

    #[test]
    fn oversize_maps_to_413_file_too_large() {
        let err = ApiError::FileTooLarge {
            size: 200,
            limit: 100,
        };
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(envelope_of(&err)["error"]["code"], "file_too_large");
    }

    #[test]
    fn admission_refusal_maps_to_429_rate_limit() {
        let err = ApiError::from(BusyError);
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        let json = envelope_of(&err);
        assert_eq!(json["error"]["type"], "rate_limit_exceeded");
        assert_eq!(json["error"]["code"], "concurrency_limit");
    }

    #[test]
    fn timeout_maps_to_408() {
        let err = ApiError::Timeout { seconds: 30 };
        assert_eq!(err.status_code(), StatusCode::REQUEST_TIMEOUT);
        let json = envelope_of(&err);
        assert_eq!(json["error"]["type"], "request_timeout");
        assert_eq!(json["error"]["code"], "timeout");
    }

    #[test]
    fn model_not_ready_maps_to_503() {
        let err = ApiError::ModelNotReady("file missing".to_string());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        let json = envelope_of(&err);
        assert_eq!(json["error"]["type"], "server_error");
        assert_eq!(json["error"]["code"], "model_not_ready");
    }

    #[test]
    fn url_fetch_mirrors_upstream_status() {
        let err = ApiError::UrlFetch {
            status: 404,
            message: "upstream said 404".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(envelope_of(&err)["error"]["code"], "url_fetch_failed");
    }

    #[test]
    fn internal_errors_keep_details_out_of_the_envelope() {
        let err = ApiError::Internal("whisper_full returned -6".to_string());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = envelope_of(&err);
        assert_eq!(json["error"]["message"], "internal server error");
        assert_eq!(json["error"]["type"], "server_error");
        assert!(json["error"].get("code").is_none());
    }

    #[test]
    fn decode_failures_map_to_415_audio_processing_failed() {
        let err = ApiError::from(AudioError::Decode("bad frame".to_string()));
        assert_eq!(err.status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(envelope_of(&err)["error"]["code"], "audio_processing_failed");
    }

    #[test]
    fn unknown_request_model_maps_to_400() {
        let err = ApiError::UnknownModel("whisper-xxl".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(envelope_of(&err)["error"]["code"], "model_not_found");
    }

    #[test]
    fn model_listing_miss_maps_to_404() {
        let err = ApiError::ModelNotFound("whisper-xxl".to_string());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(envelope_of(&err)["error"]["code"], "model_not_found");
    }
}
