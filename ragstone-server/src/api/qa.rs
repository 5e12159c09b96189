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

//! Fixed-QA routes: pair CRUD, similarity queries, import/export,
//! statistics and category management.

use axum::extract::{Multipart, Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use ragstone_core::{QaPairInput, ServiceError};

use crate::qa::{parse_import, ImportFormat, ListFilter, QaPairPatch};

use super::{ok, ApiResult, AppState};

/// POST /api/v1/qa/pairs
pub async fn add_pair(
    State(state): State<AppState>,
    Json(input): Json<QaPairInput>,
) -> ApiResult<Response> {
    let id = state.qa.add(input).await?;
    Ok(ok("QA pair added", json!({ "qa_id": id })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct BatchAddRequest {
    pub pairs: Vec<QaPairInput>,
}

/// POST /api/v1/qa/pairs/batch — partial success, per-pair outcomes.
pub async fn add_pairs_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchAddRequest>,
) -> ApiResult<Response> {
    if request.pairs.is_empty() {
        return Err(ServiceError::BadInput("pairs must not be empty".into()).into());
    }
    let outcome = state.qa.add_batch(request.pairs).await?;
    Ok(ok(
        format!(
            "batch processed: {} succeeded, {} failed",
            outcome.succeeded.len(),
            outcome.failed.len()
        ),
        serde_json::to_value(outcome).unwrap_or_default(),
    )
    .into_response())
}

/// GET /api/v1/qa/pairs?category=&min_confidence=&offset=&limit=
pub async fn list_pairs(
    State(state): State<AppState>,
    Query(filter): Query<ListFilter>,
) -> ApiResult<Response> {
    let pairs = state.qa.list_pairs(&filter).await?;
    Ok(ok(
        "QA pairs",
        json!({ "total": pairs.len(), "pairs": pairs }),
    )
    .into_response())
}

/// GET /api/v1/qa/pairs/:id
pub async fn get_pair(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let pair = state.qa.get_pair(&id).await?;
    Ok(ok("QA pair", serde_json::to_value(pair).unwrap_or_default()).into_response())
}

/// PUT /api/v1/qa/pairs/:id
pub async fn update_pair(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<QaPairPatch>,
) -> ApiResult<Response> {
    let pair = state.qa.update_pair(&id, patch).await?;
    Ok(ok("QA pair updated", serde_json::to_value(pair).unwrap_or_default()).into_response())
}

/// DELETE /api/v1/qa/pairs/:id
pub async fn delete_pair(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    state.qa.delete_pair(&id).await?;
    Ok(ok("QA pair deleted", json!({ "qa_id": id })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct QaQueryRequest {
    pub question: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_similarity: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
}

fn default_top_k() -> usize {
    1
}

/// POST /api/v1/qa/query
pub async fn query(
    State(state): State<AppState>,
    Json(request): Json<QaQueryRequest>,
) -> ApiResult<Response> {
    let outcome = state
        .qa
        .query(
            &request.question,
            request.top_k,
            request.min_similarity,
            request.category.as_deref(),
        )
        .await?;
    Ok(ok("QA query complete", serde_json::to_value(outcome).unwrap_or_default()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct QaBatchQueryRequest {
    pub questions: Vec<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_similarity: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
}

/// POST /api/v1/qa/query/batch — one outcome per question.
pub async fn query_batch(
    State(state): State<AppState>,
    Json(request): Json<QaBatchQueryRequest>,
) -> ApiResult<Response> {
    if request.questions.is_empty() {
        return Err(ServiceError::BadInput("questions must not be empty".into()).into());
    }
    let mut results = Vec::with_capacity(request.questions.len());
    for question in &request.questions {
        match state
            .qa
            .query(
                question,
                request.top_k,
                request.min_similarity,
                request.category.as_deref(),
            )
            .await
        {
            Ok(outcome) => results.push(json!({
                "question": question,
                "success": true,
                "outcome": outcome,
            })),
            Err(err) => results.push(json!({
                "question": question,
                "success": false,
                "error_code": err.code(),
                "message": err.to_string(),
            })),
        }
    }
    Ok(ok("QA batch query complete", json!({ "results": results })).into_response())
}

/// POST /api/v1/qa/import — multipart with a `file` field plus optional
/// `overwrite_existing`.
pub async fn import(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut payload: Option<(String, Vec<u8>)> = None;
    let mut overwrite_existing = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::BadInput(format!("invalid multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::BadInput(format!("failed reading upload: {e}")))?;
                payload = Some((filename, bytes.to_vec()));
            }
            "overwrite_existing" => {
                let value = field.text().await.unwrap_or_default();
                overwrite_existing = matches!(value.as_str(), "true" | "1" | "yes");
            }
            other => {
                tracing::debug!("ignoring unknown import field '{}'", other);
            }
        }
    }

    let (filename, bytes) =
        payload.ok_or_else(|| ServiceError::BadInput("missing 'file' field".into()))?;
    let format = ImportFormat::detect(&filename, &bytes)?;
    let records = parse_import(format, &bytes)?;
    let report = state.qa.import_records(records, overwrite_existing).await?;

    Ok(ok(
        format!(
            "import complete: {} processed, {} succeeded",
            report.processed, report.succeeded
        ),
        serde_json::to_value(report).unwrap_or_default(),
    )
    .into_response())
}

/// GET /api/v1/qa/export — full dump of all pairs.
pub async fn export(State(state): State<AppState>) -> ApiResult<Response> {
    let pairs = state.qa.export().await?;
    Ok(ok(
        "QA export",
        json!({ "total": pairs.len(), "pairs": pairs }),
    )
    .into_response())
}

/// GET /api/v1/qa/statistics
pub async fn statistics(State(state): State<AppState>) -> ApiResult<Response> {
    let stats = state.qa.statistics().await?;
    Ok(ok("QA statistics", serde_json::to_value(stats).unwrap_or_default()).into_response())
}

/// GET /api/v1/qa/categories
pub async fn list_categories(State(state): State<AppState>) -> ApiResult<Response> {
    let categories = state.qa.category_names();
    Ok(ok("QA categories", json!({ "categories": categories })).into_response())
}

/// DELETE /api/v1/qa/categories/:category
pub async fn delete_category(
    State(state): State<AppState>,
    Path(category): Path<String>,
) -> ApiResult<Response> {
    let report = state.qa.delete_category(&category).await?;
    Ok(ok(
        format!("category '{category}' deleted"),
        serde_json::to_value(report).unwrap_or_default(),
    )
    .into_response())
}
