// Multipart form processing for the Whisper server
//
// Extracts the audio file and optional parameters from a multipart upload.
// The file body streams straight to a scratch file, never into memory, and
// the size cap is enforced while the bytes arrive. Scratch cleanup rides on
// the guard, so any early return leaves nothing behind.

use actix_multipart::Multipart;
use futures::{StreamExt, TryStreamExt};
use log::debug;

use crate::audio;
use crate::error::ApiError;
use crate::file_utils::ScratchFile;
use crate::handlers::{write_stream_capped, StreamWriteError};

/// An upload materialized on disk, plus its request parameters
#[derive(Debug)]
pub struct UploadedAudio {
    pub scratch: ScratchFile,
    pub original_name: String,
    pub model: Option<String>,
    pub language: Option<String>,
}

/// Walk the multipart form and persist the audio file.
pub async fn extract_form_data(
    mut form: Multipart,
    max_bytes: u64,
) -> Result<UploadedAudio, ApiError> {
    let mut model: Option<String> = None;
    let mut language: Option<String> = None;
    let mut upload: Option<(ScratchFile, String)> = None;

    loop {
        let field = form
            .try_next()
            .await
            .map_err(|e| ApiError::InvalidRequest(format!("malformed multipart body: {e}")))?;
        let Some(mut field) = field else {
            break;
        };

        let content_disposition = field.content_disposition();
        let field_name = content_disposition
            .and_then(|cd| cd.get_name().map(|name| name.to_string()))
            .unwrap_or_default();

        match field_name.as_str() {
            "model" | "language" => {
                let mut value = String::new();
                while let Some(chunk) = field.next().await {
                    let chunk = chunk.map_err(|e| {
                        ApiError::InvalidRequest(format!("error reading field {field_name}: {e}"))
                    })?;
                    if let Ok(s) = std::str::from_utf8(&chunk) {
                        value.push_str(s);
                    }
                }

                let value = value.trim().to_string();
                if !value.is_empty() {
                    if field_name == "model" {
                        model = Some(value);
                    } else {
                        language = Some(value);
                    }
                }
            }
            "file" => {
                let file_name = field
                    .content_disposition()
                    .and_then(|cd| cd.get_filename().map(|name| name.to_string()))
                    .ok_or_else(|| {
                        ApiError::InvalidRequest("file field has no filename".to_string())
                    })?;

                let extension = audio::extension_of(&file_name)
                    .filter(|ext| audio::SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
                    .ok_or_else(|| ApiError::UnsupportedMediaType(file_name.clone()))?;

                let scratch = ScratchFile::allocate(&extension)?;
                let mut file = tokio::fs::File::create(scratch.path()).await?;

                let written = write_stream_capped(&mut field, &mut file, max_bytes)
                    .await
                    .map_err(|e| match e {
                        StreamWriteError::TooLarge { written } => ApiError::FileTooLarge {
                            size: written,
                            limit: max_bytes,
                        },
                        StreamWriteError::Source(e) => {
                            ApiError::InvalidRequest(format!("error processing file upload: {e}"))
                        }
                        StreamWriteError::Io(e) => ApiError::Io(e),
                    })?;

                debug!("saved {} byte upload to {}", written, scratch.path().display());
                upload = Some((scratch, file_name));
            }
            _ => {
                // Skip unknown fields
                while field.next().await.is_some() {}
            }
        }
    }

    let (scratch, original_name) = upload.ok_or(ApiError::MissingFile)?;

    Ok(UploadedAudio {
        scratch,
        original_name,
        model,
        language,
    })
}
