// API route handlers for the Whisper server
//
// The three transcription entry points share one tail: validate the request
// model, take an admission slot, make sure the configured model file is on
// disk, normalize the audio, run inference under the request deadline and
// shape the OpenAI-style response. Scratch files and the admission ticket
// are guards, released on every exit path.

use actix_multipart::Multipart;
use actix_web::{get, post, web, HttpResponse};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{info, warn};
use tokio::time::Instant;

use crate::audio;
use crate::error::ApiError;
use crate::file_utils::ScratchFile;
use crate::handlers::form::{extract_form_data, UploadedAudio};
use crate::handlers::{write_stream_capped, StreamWriteError};
use crate::model_manager;
use crate::models::{
    Base64Request, HealthResponse, ModelEntry, ModelList, SegmentData, TranscriptionResponse,
    UrlRequest,
};
use crate::state::AppState;
use crate::transcriber::TranscribeRequest;

/// Fallback name for payloads that arrive without one
const DEFAULT_FILE_NAME: &str = "audio.wav";

/// Liveness probe
#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Effective configuration echo
#[get("/config")]
pub async fn config_echo(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(&state.config)
}

#[get("/v1/config")]
pub async fn config_echo_v1(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(&state.config)
}

/// OpenAI-shaped model listing over the supported set
#[get("/v1/models")]
pub async fn list_models() -> HttpResponse {
    let entries = model_manager::model_ids().map(ModelEntry::new).collect();
    HttpResponse::Ok().json(ModelList::new(entries))
}

/// Single model lookup; aliases and casing are accepted
#[get("/v1/models/{id}")]
pub async fn get_model(id: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let id = id.into_inner();
    let canonical =
        model_manager::normalize_model_id(&id).ok_or_else(|| ApiError::ModelNotFound(id))?;
    Ok(HttpResponse::Ok().json(ModelEntry::new(canonical)))
}

/// Handler for multipart transcription requests
#[post("/v1/audio/transcriptions")]
pub async fn transcribe(
    form: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let max_bytes = state.config.whisper.max_file_size_bytes();
    let upload = extract_form_data(form, max_bytes).await?;
    run_transcription(&state, upload).await
}

/// Handler for base64 JSON transcription requests
#[post("/v1/audio/transcriptions/base64")]
pub async fn transcribe_base64(
    body: web::Json<Base64Request>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();

    let decoded = BASE64
        .decode(body.audio.as_bytes())
        .map_err(|e| ApiError::InvalidBase64(e.to_string()))?;

    let max_bytes = state.config.whisper.max_file_size_bytes();
    if decoded.len() as u64 > max_bytes {
        return Err(ApiError::FileTooLarge {
            size: decoded.len() as u64,
            limit: max_bytes,
        });
    }

    let original_name = body
        .filename
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
    let extension = audio::extension_of(&original_name)
        .filter(|ext| audio::SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .ok_or_else(|| ApiError::UnsupportedMediaType(original_name.clone()))?;

    let scratch = ScratchFile::allocate(&extension)?;
    tokio::fs::write(scratch.path(), &decoded).await?;

    run_transcription(
        &state,
        UploadedAudio {
            scratch,
            original_name,
            model: body.model,
            language: body.language,
        },
    )
    .await
}

/// Handler for URL JSON transcription requests
#[post("/v1/audio/transcriptions/url")]
pub async fn transcribe_url(
    body: web::Json<UrlRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    let max_bytes = state.config.whisper.max_file_size_bytes();

    let original_name = body
        .filename
        .clone()
        .or_else(|| file_name_from_url(&body.url))
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
    let extension = audio::extension_of(&original_name)
        .filter(|ext| audio::SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .ok_or_else(|| ApiError::UnsupportedMediaType(original_name.clone()))?;

    let response = state
        .http
        .get(&body.url)
        .timeout(state.url_fetch_timeout())
        .send()
        .await
        .map_err(|e| {
            let status = if e.is_timeout() { 504 } else { 502 };
            ApiError::UrlFetch {
                status,
                message: e.to_string(),
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        // Mirror the upstream status verbatim
        return Err(ApiError::UrlFetch {
            status: status.as_u16(),
            message: format!("upstream returned HTTP {}", status.as_u16()),
        });
    }

    // Reject from the declared length before reading the body at all
    if let Some(declared) = response.content_length() {
        if declared > max_bytes {
            return Err(ApiError::FileTooLarge {
                size: declared,
                limit: max_bytes,
            });
        }
    }

    let scratch = ScratchFile::allocate(&extension)?;
    let mut file = tokio::fs::File::create(scratch.path()).await?;
    let body_stream = Box::pin(response.bytes_stream());
    let written = write_stream_capped(body_stream, &mut file, max_bytes)
        .await
        .map_err(|e| match e {
            StreamWriteError::TooLarge { written } => ApiError::FileTooLarge {
                size: written,
                limit: max_bytes,
            },
            StreamWriteError::Source(e) => ApiError::UrlFetch {
                status: 502,
                message: format!("error reading upstream body: {e}"),
            },
            StreamWriteError::Io(e) => ApiError::Io(e),
        })?;

    info!("fetched {} bytes from {}", written, body.url);

    run_transcription(
        &state,
        UploadedAudio {
            scratch,
            original_name,
            model: body.model,
            language: body.language,
        },
    )
    .await
}

/// Common tail shared by all three ingress shapes.
async fn run_transcription(
    state: &AppState,
    upload: UploadedAudio,
) -> Result<HttpResponse, ApiError> {
    // A request may name a model; it must be a known id, but it never
    // switches the loaded engine.
    if let Some(requested) = upload.model.as_deref() {
        let canonical = model_manager::normalize_model_id(requested)
            .ok_or_else(|| ApiError::UnknownModel(requested.to_string()))?;
        if canonical != state.config.whisper.model_name {
            warn!(
                "request asked for {} but the server runs {}",
                canonical, state.config.whisper.model_name
            );
        }
    }

    let _ticket = state.admission.try_enter().await?;

    // Recover a missing model file before touching the engine
    state.models.ensure(&state.config.whisper.model_name).await?;

    let budget = state.request_budget();
    let started = Instant::now();

    let wav = ScratchFile::allocate("wav")?;
    let input_path = upload.scratch.path().to_path_buf();
    let original_name = upload.original_name.clone();
    let wav_path = wav.path().to_path_buf();

    let normalize =
        tokio::task::spawn_blocking(move || audio::normalize_to_wav(&input_path, &original_name, &wav_path));
    tokio::time::timeout(budget, normalize)
        .await
        .map_err(|_| ApiError::Timeout {
            seconds: budget.as_secs(),
        })?
        .map_err(|e| ApiError::Internal(format!("normalization task failed: {e}")))??;

    let remaining = budget.saturating_sub(started.elapsed());
    if remaining.is_zero() {
        return Err(ApiError::Timeout {
            seconds: budget.as_secs(),
        });
    }

    let language = upload
        .language
        .clone()
        .unwrap_or_else(|| state.config.whisper.language.clone());

    let result = state
        .engine
        .transcribe(TranscribeRequest {
            wav_path: wav.path().to_path_buf(),
            language,
            timeout: remaining,
        })
        .await?;

    info!(
        "transcribed {} ({} segments, {:.2}s of audio) in {:.2}s",
        upload.original_name,
        result.segments.len(),
        result.duration,
        started.elapsed().as_secs_f64()
    );

    let response = TranscriptionResponse {
        text: result.text,
        duration: result.duration,
        language: result.language,
        segments: result
            .segments
            .into_iter()
            .map(|s| SegmentData {
                id: s.id,
                start: s.start,
                end: s.end,
                text: s.text,
            })
            .collect(),
    };

    Ok(HttpResponse::Ok().json(response))
}

/// Last path segment of a URL, when it looks like a file name.
fn file_name_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let segment = without_query.rsplit('/').next()?;
    if segment.contains('.') {
        Some(segment.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_file_names_are_derived_from_the_path() {
        assert_eq!(
            file_name_from_url("https://example.com/media/talk.mp3"),
            Some("talk.mp3".to_string())
        );
        assert_eq!(
            file_name_from_url("https://example.com/media/talk.ogg?sig=abc"),
            Some("talk.ogg".to_string())
        );
        assert_eq!(file_name_from_url("https://example.com/media"), None);
    }
}
