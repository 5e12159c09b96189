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

//! System routes: health, verbose status, metrics and the log tail.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use ragstone_core::ServiceError;

use super::{ok, ApiResult, AppState};

/// GET /api/v1/health — `healthy` when the KB manager answers, the
/// embedding service is reachable (cached probe) and the cache
/// coordinator responds; otherwise `degraded` naming the failing
/// dependency. Bounded by a 3-second budget via the probe.
pub async fn health(State(state): State<AppState>) -> ApiResult<Response> {
    let mut failing: Vec<String> = Vec::new();

    // KB manager answers with its current KB when initialized.
    let current = state.kb_manager.current_name();
    if !state.kb_manager.exists(&current) {
        failing.push("kb_manager".to_string());
    }

    if let Err(err) = state.probe.embedding_reachable(state.embedder.as_ref()).await {
        tracing::debug!(error = %err, "embedding probe failed");
        failing.push("embedding".to_string());
    }

    // Cache coordinator responsive: a stats sweep answers immediately.
    let cache_stats = state.caches.stats_all();
    if cache_stats.caches.len() != crate::cache::CACHE_NAMES.len() {
        failing.push("cache_coordinator".to_string());
    }

    let status = if failing.is_empty() { "healthy" } else { "degraded" };
    Ok(ok(
        "health check",
        json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "failing_dependencies": failing,
            "current_knowledge_base": current,
        }),
    )
    .into_response())
}

/// GET /api/v1/system/status — the verbose view.
pub async fn system_status(State(state): State<AppState>) -> ApiResult<Response> {
    let metrics = state.metrics.snapshot();
    let cache_stats = state.caches.stats_all();
    let qa_stats = state.qa.statistics().await?;
    let intent_status = state.orchestrator.intent_engine().status();
    let lock_stats = state.locks.stats();

    Ok(ok(
        "system status",
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": metrics.uptime_seconds,
            "current_knowledge_base": state.kb_manager.current_name(),
            "requests": {
                "total": metrics.requests_total,
                "errors": metrics.errors_total,
            },
            "retrieval_queries": state.retrieval.query_count(),
            "qa": qa_stats,
            "intent": intent_status,
            "caches": cache_stats,
            "locks": lock_stats,
            "tracked_identities": state.gate.tracked_identities(),
        }),
    )
    .into_response())
}

/// GET /api/v1/metrics
pub async fn metrics(State(state): State<AppState>) -> ApiResult<Response> {
    let snapshot = state.metrics.snapshot();
    Ok(ok("metrics", serde_json::to_value(snapshot).unwrap_or_default()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_lines")]
    pub lines: usize,
}

fn default_lines() -> usize {
    100
}

/// GET /api/v1/logs?lines=N — last N lines of the JSON request log.
pub async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    let lines = query.lines.clamp(1, 10_000);
    let content = std::fs::read_to_string(&state.log_file)
        .map_err(|e| ServiceError::NotFound(format!("log file not readable: {e}")))?;
    let tail: Vec<&str> = content
        .lines()
        .rev()
        .take(lines)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    Ok(ok(
        format!("last {} log lines", tail.len()),
        json!({ "lines": tail }),
    )
    .into_response())
}
