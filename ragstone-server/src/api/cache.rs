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

//! Cache coordinator routes.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};

use super::{ok, ApiResult, AppState};

/// GET /api/v1/cache/stats
pub async fn stats(State(state): State<AppState>) -> ApiResult<Response> {
    let stats = state.caches.stats_all();
    Ok(ok("cache statistics", serde_json::to_value(stats).unwrap_or_default()).into_response())
}

/// DELETE /api/v1/cache/clear — every cache, fixed order.
pub async fn clear_all(State(state): State<AppState>) -> ApiResult<Response> {
    let report = state.caches.clear_all();
    Ok(ok(
        format!(
            "cleared {} caches, {:.2} MB freed",
            report.cleared_caches.len(),
            report.freed_mb
        ),
        serde_json::to_value(report).unwrap_or_default(),
    )
    .into_response())
}

/// DELETE /api/v1/cache/clear/:type — one of llm, vector,
/// knowledge_graph, documents, queries.
pub async fn clear_type(
    State(state): State<AppState>,
    Path(cache_type): Path<String>,
) -> ApiResult<Response> {
    let report = state.caches.clear_type(&cache_type)?;
    Ok(ok(
        format!("cache '{cache_type}' cleared"),
        serde_json::to_value(report).unwrap_or_default(),
    )
    .into_response())
}
