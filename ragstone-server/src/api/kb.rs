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

//! Knowledge-base lifecycle routes.

use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use ragstone_core::kb::KbConfigPatch;
use ragstone_core::KbConfig;

use super::{ok, ApiResult, AppState};

/// GET /api/v1/knowledge-bases
pub async fn list_kbs(State(state): State<AppState>) -> ApiResult<Response> {
    let kbs = state.kb_manager.list().await?;
    Ok(ok(
        "knowledge bases",
        json!({ "total": kbs.len(), "knowledge_bases": kbs, "current": state.kb_manager.current_name() }),
    )
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct CreateKbRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub config: Option<KbConfig>,
}

fn default_language() -> String {
    "English".to_string()
}

/// POST /api/v1/knowledge-bases
pub async fn create_kb(
    State(state): State<AppState>,
    Json(request): Json<CreateKbRequest>,
) -> ApiResult<Response> {
    let info = state
        .kb_manager
        .create(
            &request.name,
            &request.description,
            &request.language,
            request.config.unwrap_or_default(),
        )
        .await?;
    Ok(ok(
        format!("knowledge base '{}' created", request.name),
        serde_json::to_value(info).unwrap_or_default(),
    )
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct DeleteKbQuery {
    #[serde(default)]
    pub force: bool,
}

/// DELETE /api/v1/knowledge-bases/:name?force=
pub async fn delete_kb(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DeleteKbQuery>,
) -> ApiResult<Response> {
    state.kb_manager.delete(&name, query.force).await?;
    Ok(ok(
        format!("knowledge base '{name}' deleted"),
        json!({ "name": name }),
    )
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct SwitchKbRequest {
    pub name: String,
}

/// POST /api/v1/knowledge-bases/switch
pub async fn switch_kb(
    State(state): State<AppState>,
    Json(request): Json<SwitchKbRequest>,
) -> ApiResult<Response> {
    let previous = state.kb_manager.switch_current(&request.name)?;
    Ok(ok(
        format!("switched to knowledge base '{}'", request.name),
        json!({ "current": request.name, "previous": previous }),
    )
    .into_response())
}

/// GET /api/v1/knowledge-bases/current
pub async fn current_kb(State(state): State<AppState>) -> ApiResult<Response> {
    let name = state.kb_manager.current_name();
    let info = state.kb_manager.info(&name).await?;
    Ok(ok("current knowledge base", serde_json::to_value(info).unwrap_or_default()).into_response())
}

/// PUT /api/v1/knowledge-bases/:name/config — partial update; never
/// touches stored documents.
pub async fn update_kb_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<KbConfigPatch>,
) -> ApiResult<Response> {
    let meta = state.kb_manager.update_config(&name, &patch).await?;
    Ok(ok(
        format!("knowledge base '{name}' config updated"),
        serde_json::to_value(meta).unwrap_or_default(),
    )
    .into_response())
}

/// POST /api/v1/knowledge-bases/:name/backup
pub async fn backup_kb(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let path = state.kb_manager.backup(&name).await?;
    Ok(ok(
        format!("knowledge base '{name}' backed up"),
        json!({ "backup_path": path }),
    )
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct RestoreKbRequest {
    pub path: PathBuf,
}

/// POST /api/v1/knowledge-bases/:name/restore
pub async fn restore_kb(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<RestoreKbRequest>,
) -> ApiResult<Response> {
    state.kb_manager.restore(&name, &request.path).await?;
    Ok(ok(
        format!("knowledge base '{name}' restored"),
        json!({ "name": name, "restored_from": request.path }),
    )
    .into_response())
}
