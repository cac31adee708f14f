//! Single-file multipart upload: size limit, content sniffing and storage.

use axum::extract::Extension;
use axum::extract::multipart::{Field, Multipart, MultipartError, MultipartRejection};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{SNIFF_LEN, UploadConfig};
use crate::error::ApiError;
use crate::response::{ApiResponse, respond};
use crate::sniff::{is_allowed, sniff_mime};
use crate::storage::{UploadStore, generate_file_name};

pub const FILE_FIELD: &str = "file";
const UPLOAD_OK: &str = "File uploaded successfully!";
const INVALID_REQUEST: &str = "Invalid request.";
const MISSING_FILE_FIELD: &str = "Failed to get file from form. Ensure the field name is 'file'.";
const EMPTY_FILE: &str = "Failed to read file header.";
const DIR_FAILED: &str = "Server error while processing file.";
const CREATE_FAILED: &str = "Failed to save file on server.";
const COPY_FAILED: &str = "Failed to save file content.";

#[derive(Debug, Serialize)]
pub struct UploadedFile {
    pub path: String,
}

/// `POST /upload`: stores the `file` field under a generated name.
pub async fn upload_file(
    Extension(upload): Extension<Arc<UploadConfig>>,
    Extension(store): Extension<Arc<UploadStore>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    if declared_length(&headers).is_some_and(|len| len > upload.max_upload_size) {
        warn!(limit = upload.max_upload_size, "declared length exceeds body limit");
        return Err(too_large(&upload));
    }

    let mut multipart = multipart.map_err(|rejection| {
        warn!(error = %rejection, "rejected multipart request");
        ApiError::BadRequest(INVALID_REQUEST.into())
    })?;

    loop {
        let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| multipart_error(err, &upload))?
        else {
            break;
        };
        if field.name() != Some(FILE_FIELD) || field.file_name().is_none() {
            continue;
        }
        let result = store_field(field, &upload, &store).await;
        if matches!(result, Err(ApiError::UnsupportedMediaType(_))) {
            drain_remaining(&mut multipart, &upload).await?;
        }
        return result;
    }

    warn!("upload without file field");
    Err(ApiError::BadRequest(MISSING_FILE_FIELD.into()))
}

async fn store_field(
    mut field: Field<'_>,
    upload: &UploadConfig,
    store: &UploadStore,
) -> Result<Response, ApiError> {
    let original_name = field.file_name().unwrap_or_default().to_string();

    // Buffer at least the sniff window; these bytes are written first below.
    let mut head = Vec::with_capacity(SNIFF_LEN);
    while head.len() < SNIFF_LEN {
        match field
            .chunk()
            .await
            .map_err(|err| multipart_error(err, upload))?
        {
            Some(chunk) => head.extend_from_slice(&chunk),
            None => break,
        }
    }
    if head.is_empty() {
        warn!(filename = original_name, "empty upload");
        return Err(ApiError::BadRequest(EMPTY_FILE.into()));
    }

    let mime = sniff_mime(&head[..head.len().min(SNIFF_LEN)]);
    if !is_allowed(mime) {
        warn!(filename = original_name, mime_type = mime, "file type rejected");
        // An oversized body still reports 413, however early its type is known.
        drain_field(&mut field, upload).await?;
        return Err(ApiError::UnsupportedMediaType(format!(
            "File type '{mime}' is not allowed."
        )));
    }
    info!(filename = original_name, mime_type = mime, "file validated");

    let name = generate_file_name(&original_name);
    store
        .ensure_root()
        .await
        .map_err(|err| ApiError::internal(DIR_FAILED, err))?;
    let mut staged = store
        .stage(&name)
        .await
        .map_err(|err| ApiError::internal(CREATE_FAILED, err))?;

    let copy_result: Result<(), ApiError> = async {
        staged
            .write_all(&head)
            .await
            .map_err(|err| ApiError::internal(COPY_FAILED, err))?;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| multipart_error(err, upload))?
        {
            staged
                .write_all(&chunk)
                .await
                .map_err(|err| ApiError::internal(COPY_FAILED, err))?;
        }
        Ok(())
    }
    .await;
    if let Err(err) = copy_result {
        staged.cleanup().await;
        return Err(err);
    }

    let size = staged.written();
    staged
        .finalize()
        .await
        .map_err(|err| ApiError::internal(COPY_FAILED, err))?;
    info!(name, size, mime_type = mime, "file stored");

    Ok(respond(
        StatusCode::OK,
        ApiResponse::ok(
            UPLOAD_OK,
            UploadedFile {
                path: upload.public_url(&name),
            },
        ),
    ))
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// Reads the rest of a rejected field. Only a body limit violation is surfaced.
async fn drain_field(field: &mut Field<'_>, upload: &UploadConfig) -> Result<(), ApiError> {
    loop {
        match field.chunk().await {
            Ok(Some(_)) => continue,
            Ok(None) => return Ok(()),
            Err(err) if err.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                return Err(multipart_error(err, upload));
            }
            Err(_) => return Ok(()),
        }
    }
}

async fn drain_remaining(multipart: &mut Multipart, upload: &UploadConfig) -> Result<(), ApiError> {
    loop {
        match multipart.next_field().await {
            Ok(Some(mut field)) => drain_field(&mut field, upload).await?,
            Ok(None) => return Ok(()),
            Err(err) if err.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                return Err(multipart_error(err, upload));
            }
            Err(_) => return Ok(()),
        }
    }
}

fn too_large(upload: &UploadConfig) -> ApiError {
    ApiError::PayloadTooLarge(format!(
        "File is too large. Max size is {} MB.",
        upload.max_upload_size_mb()
    ))
}

/// Body limit violations become 413, everything else is a malformed request.
fn multipart_error(err: MultipartError, upload: &UploadConfig) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!(limit = upload.max_upload_size, "upload exceeds body limit");
        return too_large(upload);
    }
    warn!(error = %err, "failed to read multipart body");
    ApiError::BadRequest(INVALID_REQUEST.into())
}
