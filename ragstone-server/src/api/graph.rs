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

//! Knowledge-graph routes, operating on the active (or named) KB's graph.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{ok, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct SubgraphRequest {
    pub label: String,
    #[serde(default = "default_depth")]
    pub max_depth: usize,
    #[serde(default = "default_nodes")]
    pub max_nodes: usize,
    #[serde(default)]
    pub knowledge_base: Option<String>,
}

fn default_depth() -> usize {
    2
}

fn default_nodes() -> usize {
    100
}

/// POST /api/v1/knowledge-graph — subgraph around a label.
pub async fn subgraph(
    State(state): State<AppState>,
    Json(request): Json<SubgraphRequest>,
) -> ApiResult<Response> {
    let storage = state
        .kb_manager
        .resolve(request.knowledge_base.as_deref())
        .await?;
    let subgraph = storage.graph().subgraph(
        &request.label,
        request.max_depth.clamp(1, 10),
        request.max_nodes.clamp(1, 1_000),
    )?;
    Ok(ok("subgraph", serde_json::to_value(subgraph).unwrap_or_default()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct GraphScopeQuery {
    #[serde(default)]
    pub knowledge_base: Option<String>,
}

/// GET /api/v1/knowledge-graph/stats
pub async fn graph_stats(
    State(state): State<AppState>,
    Query(scope): Query<GraphScopeQuery>,
) -> ApiResult<Response> {
    let storage = state.kb_manager.resolve(scope.knowledge_base.as_deref()).await?;
    let stats = storage.graph().stats();
    Ok(ok(
        "knowledge graph statistics",
        json!({
            "knowledge_base": storage.name(),
            "node_count": stats.node_count,
            "edge_count": stats.edge_count,
        }),
    )
    .into_response())
}

/// DELETE /api/v1/knowledge-graph/clear
pub async fn clear_graph(
    State(state): State<AppState>,
    Query(scope): Query<GraphScopeQuery>,
) -> ApiResult<Response> {
    let storage = state.kb_manager.resolve(scope.knowledge_base.as_deref()).await?;
    let removed = storage.graph().clear()?;
    Ok(ok(
        "knowledge graph cleared",
        json!({
            "knowledge_base": storage.name(),
            "removed_nodes": removed.node_count,
            "removed_edges": removed.edge_count,
        }),
    )
    .into_response())
}
