// Copyright 2025 Ragstone (https://github.com/ragstone)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Document ingest routes. Text bodies are JSON; file uploads are
//! multipart with a `file` field (`files` repeated for batches) and
//! optional `knowledge_base` / `language` / `track_id` text fields.

use std::path::PathBuf;

use axum::extract::{Multipart, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use ragstone_core::ServiceError;

use super::{ok, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct InsertTextRequest {
    pub text: String,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub knowledge_base: Option<String>,
    #[serde(default)]
    pub track_id: Option<String>,
}

/// POST /api/v1/insert/text
pub async fn insert_text(
    State(state): State<AppState>,
    Json(request): Json<InsertTextRequest>,
) -> ApiResult<Response> {
    let receipt = state
        .ingest
        .insert_text(
            request.knowledge_base.as_deref(),
            request.text,
            request.doc_id,
            request.track_id,
            None,
        )
        .await?;
    Ok(ok("text accepted", serde_json::to_value(receipt).unwrap_or_default()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct InsertTextsRequest {
    pub texts: Vec<String>,
    #[serde(default)]
    pub knowledge_base: Option<String>,
    #[serde(default)]
    pub track_id: Option<String>,
}

/// POST /api/v1/insert/texts
pub async fn insert_texts(
    State(state): State<AppState>,
    Json(request): Json<InsertTextsRequest>,
) -> ApiResult<Response> {
    let receipts = state
        .ingest
        .insert_texts(
            request.knowledge_base.as_deref(),
            request.texts,
            request.track_id,
        )
        .await?;
    Ok(ok(
        format!("{} texts accepted", receipts.len()),
        json!({ "documents": receipts }),
    )
    .into_response())
}

struct UploadFields {
    files: Vec<(String, Vec<u8>)>,
    knowledge_base: Option<String>,
    track_id: Option<String>,
}

async fn read_upload(mut multipart: Multipart) -> Result<UploadFields, ServiceError> {
    let mut fields = UploadFields {
        files: Vec::new(),
        knowledge_base: None,
        track_id: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::BadInput(format!("invalid multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" | "files" => {
                let filename = field.file_name().unwrap_or("upload.txt").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::BadInput(format!("failed reading upload: {e}")))?;
                fields.files.push((filename, bytes.to_vec()));
            }
            "knowledge_base" => {
                fields.knowledge_base = Some(field.text().await.unwrap_or_default());
            }
            "track_id" => {
                fields.track_id = Some(field.text().await.unwrap_or_default());
            }
            // Language rides along for parity with the text routes; the
            // KB's configured language governs generation.
            "language" => {
                let _ = field.text().await;
            }
            other => {
                tracing::debug!("ignoring unknown upload field '{}'", other);
            }
        }
    }
    Ok(fields)
}

/// POST /api/v1/insert/file — one file.
pub async fn insert_file(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let fields = read_upload(multipart).await?;
    let (filename, bytes) = fields
        .files
        .into_iter()
        .next()
        .ok_or_else(|| ServiceError::BadInput("missing 'file' field".into()))?;

    let receipt = state
        .ingest
        .insert_file_bytes(
            fields.knowledge_base.as_deref(),
            &filename,
            &bytes,
            fields.track_id,
        )
        .await?;
    Ok(ok(
        format!("file '{filename}' accepted"),
        serde_json::to_value(receipt).unwrap_or_default(),
    )
    .into_response())
}

/// POST /api/v1/insert/files — many files; each succeeds or fails on its
/// own.
pub async fn insert_files(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let fields = read_upload(multipart).await?;
    if fields.files.is_empty() {
        return Err(ServiceError::BadInput("missing 'files' fields".into()).into());
    }

    let mut results = Vec::with_capacity(fields.files.len());
    for (filename, bytes) in fields.files {
        match state
            .ingest
            .insert_file_bytes(
                fields.knowledge_base.as_deref(),
                &filename,
                &bytes,
                fields.track_id.clone(),
            )
            .await
        {
            Ok(receipt) => results.push(json!({
                "file": filename,
                "success": true,
                "receipt": receipt,
            })),
            Err(err) => results.push(json!({
                "file": filename,
                "success": false,
                "error_code": err.code(),
                "message": err.to_string(),
            })),
        }
    }
    Ok(ok("files processed", json!({ "results": results })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct InsertDirectoryRequest {
    pub directory: PathBuf,
    #[serde(default)]
    pub knowledge_base: Option<String>,
    #[serde(default)]
    pub track_id: Option<String>,
}

/// POST /api/v1/insert/directory — server-local path walk.
pub async fn insert_directory(
    State(state): State<AppState>,
    Json(request): Json<InsertDirectoryRequest>,
) -> ApiResult<Response> {
    let receipts = state
        .ingest
        .insert_directory(
            request.knowledge_base.as_deref(),
            &request.directory,
            request.track_id,
        )
        .await?;
    Ok(ok(
        format!("{} files accepted from directory", receipts.len()),
        json!({ "documents": receipts }),
    )
    .into_response())
}
