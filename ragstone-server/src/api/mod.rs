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

//! HTTP surface: application state, the error-to-envelope mapping and the
//! route table. All routes mount under `/api/v1`.

pub mod cache;
pub mod graph;
pub mod insert;
pub mod intent;
pub mod kb;
pub mod qa;
pub mod query;
pub mod system;

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};

use ragstone_core::{ApiEnvelope, ServiceError};

use crate::cache::CacheCoordinator;
use crate::config::ServerConfig;
use crate::gate::AdmissionGate;
use crate::ingest::IngestPipeline;
use crate::kb::KbManager;
use crate::llm::EmbeddingProvider;
use crate::locks::KeyedLocks;
use crate::metrics::{HealthProbe, MetricsRegistry};
use crate::orchestrator::Orchestrator;
use crate::qa::QaStore;
use crate::retrieval::RetrievalEngine;

/// Everything a handler can reach, constructed once at startup and
/// cloned per request. Each component has one owner; handlers only use
/// their published operations.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub gate: Arc<AdmissionGate>,
    pub caches: Arc<CacheCoordinator>,
    pub locks: Arc<KeyedLocks>,
    pub qa: Arc<QaStore>,
    pub kb_manager: Arc<KbManager>,
    pub retrieval: Arc<RetrievalEngine>,
    pub orchestrator: Arc<Orchestrator>,
    pub ingest: Arc<IngestPipeline>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub metrics: Arc<MetricsRegistry>,
    pub probe: Arc<HealthProbe>,
    pub log_file: PathBuf,
}

/// Handler error carrying a taxonomy entry; responds with the common
/// envelope and the variant's status code.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, code = self.0.code(), "request failed");
        } else {
            tracing::debug!(error = %self.0, code = self.0.code(), "request rejected");
        }
        let envelope = ApiEnvelope::error(self.0.to_string(), self.0.code(), None);
        (status, Json(envelope)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Success envelope shorthand.
pub fn ok(message: impl Into<String>, data: serde_json::Value) -> Json<ApiEnvelope> {
    Json(ApiEnvelope::ok(message, data))
}

/// The `/api/v1` route table.
pub fn api_router() -> Router<AppState> {
    Router::new()
        // System
        .route("/health", get(system::health))
        .route("/system/status", get(system::system_status))
        .route("/metrics", get(system::metrics))
        .route("/logs", get(system::logs))
        // Query
        .route("/query", post(query::execute_query))
        .route("/query/analyze", post(query::analyze_query))
        .route("/query/safe", post(query::safe_query))
        .route("/query/batch", post(query::batch_query))
        .route("/query/modes", get(query::list_modes))
        // Ingest
        .route("/insert/text", post(insert::insert_text))
        .route("/insert/texts", post(insert::insert_texts))
        .route("/insert/file", post(insert::insert_file))
        .route("/insert/files", post(insert::insert_files))
        .route("/insert/directory", post(insert::insert_directory))
        // Knowledge bases
        .route("/knowledge-bases", get(kb::list_kbs).post(kb::create_kb))
        .route("/knowledge-bases/switch", post(kb::switch_kb))
        .route("/knowledge-bases/current", get(kb::current_kb))
        .route("/knowledge-bases/:name", delete(kb::delete_kb))
        .route("/knowledge-bases/:name/config", put(kb::update_kb_config))
        .route("/knowledge-bases/:name/backup", post(kb::backup_kb))
        .route("/knowledge-bases/:name/restore", post(kb::restore_kb))
        // Knowledge graph
        .route("/knowledge-graph", post(graph::subgraph))
        .route("/knowledge-graph/stats", get(graph::graph_stats))
        .route("/knowledge-graph/clear", delete(graph::clear_graph))
        // Intent
        .route("/intent/analyze", post(intent::analyze))
        .route("/intent/safety-check", post(intent::safety_check))
        .route("/intent/status", post(intent::status))
        .route("/intent-config/status", get(intent::status))
        .route("/intent-config/intent-types", post(intent::register_intent_type))
        .route("/intent-config/safety-rules", post(intent::add_safety_rules))
        .route("/intent-config/templates", post(intent::set_template))
        // Fixed QA
        .route("/qa/pairs", get(qa::list_pairs).post(qa::add_pair))
        .route("/qa/pairs/batch", post(qa::add_pairs_batch))
        .route(
            "/qa/pairs/:id",
            get(qa::get_pair).put(qa::update_pair).delete(qa::delete_pair),
        )
        .route("/qa/query", post(qa::query))
        .route("/qa/query/batch", post(qa::query_batch))
        .route("/qa/import", post(qa::import))
        .route("/qa/export", get(qa::export))
        .route("/qa/statistics", get(qa::statistics))
        .route("/qa/categories", get(qa::list_categories))
        .route("/qa/categories/:category", delete(qa::delete_category))
        // Caches
        .route("/cache/stats", get(cache::stats))
        .route("/cache/clear", delete(cache::clear_all))
        .route("/cache/clear/:type", delete(cache::clear_type))
}
