// Wire types for the Whisper server
//
// Request and response bodies for the OpenAI-compatible surface. Error
// payloads use the `{error: {message, type, param, code}}` envelope clients
// of the upstream API already handle.

use serde::{Deserialize, Serialize};

/// One transcribed utterance span
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentData {
    pub id: u32,
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    pub text: String,
}

/// Successful transcription response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
    /// Total audio duration in seconds (end of the last segment)
    pub duration: f64,
    pub language: String,
    pub segments: Vec<SegmentData>,
}

/// OpenAI-style error envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(
        message: impl Into<String>,
        error_type: impl Into<String>,
        param: Option<String>,
        code: Option<String>,
    ) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                error_type: error_type.into(),
                param,
                code,
            },
        }
    }
}

/// Health probe response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// One entry of the model listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

impl ModelEntry {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "model".to_string(),
            owned_by: "openai".to_string(),
        }
    }
}

/// `GET /v1/models` response
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

impl ModelList {
    pub fn new(entries: Vec<ModelEntry>) -> Self {
        Self {
            object: "list".to_string(),
            data: entries,
        }
    }
}

/// Body of `POST /v1/audio/transcriptions/base64`
#[derive(Debug, Deserialize)]
pub struct Base64Request {
    pub audio: String,
    pub filename: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
}

/// Body of `POST /v1/audio/transcriptions/url`
#[derive(Debug, Deserialize)]
pub struct UrlRequest {
    pub url: String,
    pub filename: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_omits_empty_fields() {
        let envelope = ErrorEnvelope::new("boom", "server_error", None, None);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"]["message"], "boom");
        assert_eq!(json["error"]["type"], "server_error");
        assert!(json["error"].get("param").is_none());
        assert!(json["error"].get("code").is_none());
    }

    #[test]
    fn error_envelope_serializes_type_keyword() {
        let envelope = ErrorEnvelope::new(
            "missing",
            "invalid_request_error",
            Some("file".to_string()),
            Some("missing_file".to_string()),
        );
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""type":"invalid_request_error""#));
        assert!(json.contains(r#""code":"missing_file""#));
    }

    #[test]
    fn model_list_has_openai_shape() {
        let list = ModelList::new(vec![ModelEntry::new("whisper-base")]);
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["object"], "model");
        assert_eq!(json["data"][0]["owned_by"], "openai");
    }
}
