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

//! Query routes: full retrieval (plain and SSE-streamed), analysis-only,
//! the analyze-then-retrieve pipeline, and batch queries.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use ragstone_core::{ApiEnvelope, ServiceError};

use crate::middleware::TraceId;
use crate::orchestrator::{ExecuteOutcome, ExecuteRequest};
use crate::retrieval::QueryMode;

use super::{ok, ApiResult, AppState};

/// POST /api/v1/query — full retrieval; `stream=true` switches to SSE.
pub async fn execute_query(
    State(state): State<AppState>,
    trace: Option<Extension<TraceId>>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Response> {
    let outcome = state.orchestrator.execute(request).await?;
    Ok(render_outcome(outcome, trace.map(|t| t.0 .0)))
}

/// POST /api/v1/query/safe — analyze first, retrieve only when the
/// safety gate passes. Intent analysis and the safety check are always
/// on for this route.
pub async fn safe_query(
    State(state): State<AppState>,
    trace: Option<Extension<TraceId>>,
    Json(mut request): Json<ExecuteRequest>,
) -> ApiResult<Response> {
    request.enable_intent_analysis = true;
    request.safety_check = true;
    let outcome = state.orchestrator.execute(request).await?;
    Ok(render_outcome(outcome, trace.map(|t| t.0 .0)))
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub query: String,
    #[serde(default = "default_true")]
    pub enable_query_enhancement: bool,
}

fn default_true() -> bool {
    true
}

/// POST /api/v1/query/analyze — analysis only; the retrieval engine is
/// never invoked from this route.
pub async fn analyze_query(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> ApiResult<Response> {
    if request.query.trim().is_empty() {
        return Err(ServiceError::BadInput("query must not be empty".into()).into());
    }
    let analysis = state
        .orchestrator
        .analyze(&request.query, request.enable_query_enhancement)
        .await;
    Ok(ok("analysis complete", serde_json::to_value(analysis).unwrap_or_default()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct BatchQueryRequest {
    pub queries: Vec<ExecuteRequest>,
}

/// POST /api/v1/query/batch — sequential execution, one report per query.
/// A failing query fails its slot, not the batch.
pub async fn batch_query(
    State(state): State<AppState>,
    Json(request): Json<BatchQueryRequest>,
) -> ApiResult<Response> {
    if request.queries.is_empty() {
        return Err(ServiceError::BadInput("queries must not be empty".into()).into());
    }
    if request.queries.iter().any(|q| q.stream) {
        return Err(ServiceError::BadInput("batch queries cannot stream".into()).into());
    }

    let total = request.queries.len();
    let mut results = Vec::with_capacity(total);
    for entry in request.queries {
        let query_text = entry.query.clone();
        match state.orchestrator.execute(entry).await {
            Ok(ExecuteOutcome::Complete {
                result,
                mode,
                knowledge_base,
                response_time,
                ..
            }) => results.push(json!({
                "query": query_text,
                "success": true,
                "result": result,
                "mode": mode.as_str(),
                "knowledge_base": knowledge_base,
                "response_time": response_time,
            })),
            Ok(ExecuteOutcome::Rejected(analysis)) => results.push(json!({
                "query": query_text,
                "success": false,
                "error_code": "rejected-by-safety",
                "analysis": analysis,
            })),
            Ok(ExecuteOutcome::Streaming { .. }) => unreachable!("stream rejected above"),
            Err(err) => results.push(json!({
                "query": query_text,
                "success": false,
                "error_code": err.code(),
                "message": err.to_string(),
            })),
        }
    }

    Ok(ok(
        "batch complete",
        json!({ "total": total, "results": results }),
    )
    .into_response())
}

/// GET /api/v1/query/modes — the static mode list.
pub async fn list_modes() -> Response {
    let modes: Vec<serde_json::Value> = QueryMode::ALL
        .iter()
        .map(|mode| {
            json!({
                "mode": mode.as_str(),
                "uses_vectors": mode.uses_vectors(),
                "uses_graph": mode.uses_graph(),
            })
        })
        .collect();
    ok("supported query modes", json!({ "modes": modes })).into_response()
}

fn render_outcome(outcome: ExecuteOutcome, trace_id: Option<String>) -> Response {
    match outcome {
        ExecuteOutcome::Rejected(analysis) => {
            // A safety rejection is a handled outcome: 200, but
            // success=false so clients can tell a blocked query from an
            // answered one; the full analysis rides in the details.
            Json(ApiEnvelope::error(
                "query rejected by safety check",
                "rejected-by-safety",
                Some(serde_json::to_value(&*analysis).unwrap_or_default()),
            ))
            .into_response()
        }
        ExecuteOutcome::Complete {
            result,
            mode,
            knowledge_base,
            analysis,
            response_time,
        } => {
            let mut data = json!({
                "result": result,
                "mode": mode.as_str(),
                "knowledge_base": knowledge_base,
                "response_time": response_time,
            });
            if let Some(analysis) = analysis {
                data["analysis"] = serde_json::to_value(&*analysis).unwrap_or_default();
            }
            ok("query complete", data).into_response()
        }
        ExecuteOutcome::Streaming {
            fragments,
            mode,
            knowledge_base,
            language,
            started,
        } => sse_response(fragments, mode, knowledge_base, language, started, trace_id),
    }
}

/// Bridge a fragment stream into the SSE wire format: one `metadata`
/// event, any number of `content` events, then exactly one terminal
/// `done` or `error` event. A client disconnect drops the event channel;
/// the pump logs the cancellation and stops pulling from upstream, which
/// closes the outbound LLM body.
fn sse_response(
    mut fragments: tokio::sync::mpsc::Receiver<Result<String, ServiceError>>,
    mode: QueryMode,
    knowledge_base: String,
    language: String,
    started: std::time::Instant,
    trace_id: Option<String>,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(32);
    let trace_id = trace_id.unwrap_or_default();

    tokio::spawn(async move {
        let send = |payload: serde_json::Value| {
            let tx = tx.clone();
            async move {
                tx.send(Ok(Event::default().data(payload.to_string())))
                    .await
                    .is_ok()
            }
        };

        let metadata = json!({
            "type": "metadata",
            "data": {
                "mode": mode.as_str(),
                "knowledge_base": knowledge_base,
                "language": language,
                "stream": true,
            }
        });
        if !send(metadata).await {
            tracing::info!(trace_id = %trace_id, "stream cancelled by client before metadata");
            return;
        }

        loop {
            match fragments.recv().await {
                Some(Ok(chunk)) => {
                    let payload = json!({ "type": "content", "data": chunk });
                    if !send(payload).await {
                        tracing::info!(trace_id = %trace_id, "stream cancelled by client");
                        return;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(trace_id = %trace_id, error = %err, "stream failed upstream");
                    let payload = json!({
                        "type": "error",
                        "data": { "message": err.to_string(), "error_code": err.code() }
                    });
                    let _ = send(payload).await;
                    return;
                }
                None => break,
            }
        }

        let done = json!({
            "type": "done",
            "data": { "response_time": started.elapsed().as_secs_f64() }
        });
        if !send(done).await {
            tracing::info!(trace_id = %trace_id, "stream cancelled by client before done");
        }
    });

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
