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

//! Intent subsystem routes: analysis, safety checks, status, and the
//! runtime configuration surface.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use ragstone_core::ServiceError;

use super::{ok, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct IntentAnalyzeRequest {
    pub query: String,
    #[serde(default)]
    pub enable_enhancement: bool,
}

/// POST /api/v1/intent/analyze
pub async fn analyze(
    State(state): State<AppState>,
    Json(request): Json<IntentAnalyzeRequest>,
) -> ApiResult<Response> {
    if request.query.trim().is_empty() {
        return Err(ServiceError::BadInput("query must not be empty".into()).into());
    }
    let outcome = state
        .orchestrator
        .intent_engine()
        .analyze(&request.query, request.enable_enhancement)
        .await;
    Ok(ok("intent analysis", serde_json::to_value(outcome).unwrap_or_default()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct SafetyCheckRequest {
    pub content: String,
}

/// POST /api/v1/intent/safety-check
pub async fn safety_check(
    State(state): State<AppState>,
    Json(request): Json<SafetyCheckRequest>,
) -> ApiResult<Response> {
    if request.content.trim().is_empty() {
        return Err(ServiceError::BadInput("content must not be empty".into()).into());
    }
    let outcome = state.orchestrator.intent_engine().safety_check(&request.content);
    Ok(ok("safety check", serde_json::to_value(outcome).unwrap_or_default()).into_response())
}

/// POST /api/v1/intent/status (also GET /api/v1/intent-config/status)
pub async fn status(State(state): State<AppState>) -> ApiResult<Response> {
    let status = state.orchestrator.intent_engine().status();
    Ok(ok("intent engine status", serde_json::to_value(status).unwrap_or_default()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct RegisterIntentRequest {
    pub name: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub template: Option<String>,
}

/// POST /api/v1/intent-config/intent-types — register a custom intent
/// type; takes effect atomically on the next call.
pub async fn register_intent_type(
    State(state): State<AppState>,
    Json(request): Json<RegisterIntentRequest>,
) -> ApiResult<Response> {
    if request.name.trim().is_empty() {
        return Err(ServiceError::BadInput("intent name must not be empty".into()).into());
    }
    if request.patterns.is_empty() {
        return Err(ServiceError::BadInput("patterns must not be empty".into()).into());
    }
    state.orchestrator.intent_engine().register_intent(
        request.name.clone(),
        request.patterns,
        request.template,
    );
    Ok(ok(
        format!("intent type '{}' registered", request.name),
        json!({ "name": request.name }),
    )
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct SafetyRulesRequest {
    pub words: Vec<String>,
}

/// POST /api/v1/intent-config/safety-rules — extend the sensitive-word
/// scanner.
pub async fn add_safety_rules(
    State(state): State<AppState>,
    Json(request): Json<SafetyRulesRequest>,
) -> ApiResult<Response> {
    if request.words.is_empty() {
        return Err(ServiceError::BadInput("words must not be empty".into()).into());
    }
    let count = request.words.len();
    state.orchestrator.intent_engine().add_safety_words(request.words);
    Ok(ok(
        format!("{count} safety words added"),
        json!({ "added": count }),
    )
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct SetTemplateRequest {
    pub intent_type: String,
    pub template: String,
}

/// POST /api/v1/intent-config/templates — replace an enhancement
/// template. The template must keep the `{query}` placeholder.
pub async fn set_template(
    State(state): State<AppState>,
    Json(request): Json<SetTemplateRequest>,
) -> ApiResult<Response> {
    if !request.template.contains("{query}") {
        return Err(
            ServiceError::BadInput("template must contain the {query} placeholder".into()).into(),
        );
    }
    state
        .orchestrator
        .intent_engine()
        .set_template(request.intent_type.clone(), request.template);
    Ok(ok(
        format!("template for '{}' updated", request.intent_type),
        json!({ "intent_type": request.intent_type }),
    )
    .into_response())
}
