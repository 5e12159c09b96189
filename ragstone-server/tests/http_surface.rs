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

//! HTTP-surface tests against the full router with stub upstream
//! providers: envelope shapes, the analyze/safe contract, rate limiting,
//! the SSE frame sequence, and the QA routes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tempfile::TempDir;
use tower::ServiceExt;

use ragstone_core::ServiceError;
use ragstone_server::api::AppState;
use ragstone_server::config::ServerConfig;
use ragstone_server::llm::{ChatMessage, ChatProvider, EmbeddingProvider};
use ragstone_server::{build_router, build_state, Providers};

const DIM: usize = 16;

struct StubChat {
    calls: Arc<AtomicU64>,
}

#[async_trait]
impl ChatProvider for StubChat {
    async fn chat(&self, _messages: Vec<ChatMessage>) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("AI is a branch of computer science.".to_string())
    }

    async fn stream_chat(
        &self,
        _messages: Vec<ChatMessage>,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<String, ServiceError>>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx.send(Ok("AI is ".to_string())).await;
            let _ = tx.send(Ok("a branch of computer science.".to_string())).await;
        });
        Ok(rx)
    }

    fn model(&self) -> &str {
        "stub-model"
    }
}

struct StubEmbedder;

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; DIM];
                let chars: Vec<char> = text.to_lowercase().chars().collect();
                for window in chars.windows(3.min(chars.len().max(1))) {
                    let mut hash: u64 = 1469598103934665603;
                    for c in window {
                        hash ^= *c as u64;
                        hash = hash.wrapping_mul(1099511628211);
                    }
                    vector[(hash % DIM as u64) as usize] += 1.0;
                }
                let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for v in &mut vector {
                        *v /= norm;
                    }
                }
                vector
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        DIM
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

struct TestServer {
    router: Router,
    #[allow(dead_code)]
    state: AppState,
    chat_calls: Arc<AtomicU64>,
    _dir: TempDir,
}

async fn test_server(tune: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig::default();
    config.storage.working_dir = dir.path().join("kb");
    config.storage.qa_storage_dir = dir.path().join("qa");
    config.storage.log_dir = dir.path().join("logs");
    config.storage.upload_dir = dir.path().join("uploads");
    config.embedding.embedding_dim = DIM;
    // The LLM path of the intent engine is off so the rule result is
    // deterministic in tests.
    config.intent.intent_enable_llm = false;
    tune(&mut config);

    let chat_calls = Arc::new(AtomicU64::new(0));
    let providers = Providers {
        chat: Arc::new(StubChat {
            calls: chat_calls.clone(),
        }),
        embedder: Arc::new(StubEmbedder),
        reranker: None,
    };
    let state = build_state(config, providers).await.unwrap();
    TestServer {
        router: build_router(state.clone()),
        state,
        chat_calls,
        _dir: dir,
    }
}

async fn send_json(
    router: &Router,
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn test_envelope_shape_on_modes_route() {
    let server = test_server(|_| {}).await;
    let (status, body) = send_json(&server.router, "GET", "/api/v1/query/modes", None, &[]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    let modes = body["data"]["modes"].as_array().unwrap();
    assert_eq!(modes.len(), 6);
    assert!(modes.iter().any(|m| m["mode"] == "bypass"));
}

#[tokio::test]
async fn test_unknown_cache_type_is_not_found_envelope() {
    let server = test_server(|_| {}).await;
    let (status, body) =
        send_json(&server.router, "DELETE", "/api/v1/cache/clear/sessions", None, &[]).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error_code"], "not-found");
}

#[tokio::test]
async fn test_clear_llm_cache_via_route_alias() {
    let server = test_server(|_| {}).await;
    let (status, body) =
        send_json(&server.router, "DELETE", "/api/v1/cache/clear/llm", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cleared_caches"][0], "llm_response");
}

/// Scenario: tier `free` with limit 2/min — the third request inside the
/// window answers 429 with the rate-limited code.
#[tokio::test]
async fn test_free_tier_rate_limit_returns_429() {
    let server = test_server(|config| {
        config.gate.rate_limit_tiers.insert("free".to_string(), 2);
        config.gate.min_interval_per_user = 0.0;
    })
    .await;

    let headers = [("x-user-id", "u1"), ("x-user-tier", "free")];
    for _ in 0..2 {
        let (status, _) =
            send_json(&server.router, "GET", "/api/v1/query/modes", None, &headers).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) =
        send_json(&server.router, "GET", "/api/v1/query/modes", None, &headers).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error_code"], "rate-limited");
    assert_eq!(body["details"]["reason"], "quota");
}

#[tokio::test]
async fn test_min_interval_rejection_is_distinguished() {
    let server = test_server(|config| {
        config.gate.min_interval_per_user = 30.0;
    })
    .await;

    let headers = [("x-user-id", "u2")];
    let (status, _) = send_json(&server.router, "GET", "/api/v1/query/modes", None, &headers).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) =
        send_json(&server.router, "GET", "/api/v1/query/modes", None, &headers).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["details"]["reason"], "min-interval");
}

/// `/query/analyze` never calls the retrieval engine; `/query/safe`
/// calls it only when the safety gate passes.
#[tokio::test]
async fn test_analyze_vs_safe_retrieval_contract() {
    let server = test_server(|_| {}).await;
    let engine = server.state.retrieval.clone();

    let before = engine.query_count();
    let (status, body) = send_json(
        &server.router,
        "POST",
        "/api/v1/query/analyze",
        Some(serde_json::json!({ "query": "what is artificial intelligence" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["intent_type"], "knowledge_query");
    assert_eq!(engine.query_count(), before, "analyze must not retrieve");

    // Rejected safe query: success=false, analysis in the details, and
    // still no retrieval.
    let (status, body) = send_json(
        &server.router,
        "POST",
        "/api/v1/query/safe",
        Some(serde_json::json!({ "query": "how to make a bomb", "mode": "bypass" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["error_code"], "rejected-by-safety");
    assert_eq!(body["details"]["should_reject"], true);
    assert_eq!(body["details"]["safety_level"], "illegal");
    assert!(!body["details"]["safe_alternatives"].as_array().unwrap().is_empty());
    assert_eq!(engine.query_count(), before, "rejected query must not retrieve");

    // Accepted safe query (bypass avoids the LLM): retrieval runs once.
    let (status, body) = send_json(
        &server.router,
        "POST",
        "/api/v1/query/safe",
        Some(serde_json::json!({ "query": "how to recognize and prevent fraud", "mode": "bypass" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(engine.query_count(), before + 1);
}

#[tokio::test]
async fn test_unknown_mode_is_bad_input() {
    let server = test_server(|_| {}).await;
    let (status, body) = send_json(
        &server.router,
        "POST",
        "/api/v1/query",
        Some(serde_json::json!({ "query": "hello", "mode": "turbo" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "bad-input");
}

/// Streaming contract: exactly one metadata event, ≥0 content events,
/// exactly one terminal done event; every frame is `data: <json>`
/// separated by blank lines.
#[tokio::test]
async fn test_streaming_emits_sse_frame_sequence() {
    let server = test_server(|_| {}).await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/query")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({
                "query": "what is ai",
                "mode": "naive",
                "stream": true
            })
            .to_string(),
        ))
        .unwrap();

    let response = server.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    let mut types = Vec::new();
    for frame in text.split("\n\n").filter(|f| !f.trim().is_empty()) {
        let payload = frame
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .unwrap_or_else(|| panic!("frame without data prefix: {frame:?}"));
        let json: serde_json::Value = serde_json::from_str(payload).expect("frame is valid JSON");
        types.push(json["type"].as_str().unwrap().to_string());
    }

    assert_eq!(types.first().map(String::as_str), Some("metadata"));
    assert_eq!(types.iter().filter(|t| *t == "metadata").count(), 1);
    assert_eq!(types.iter().filter(|t| *t == "done").count(), 1);
    assert_eq!(types.last().map(String::as_str), Some("done"));
    assert!(types.iter().filter(|t| *t == "content").count() >= 1);
}

/// QA flow over the routes: add a pair, query it back above threshold,
/// see it in statistics, then delete its category.
#[tokio::test]
async fn test_qa_routes_round_trip() {
    let server = test_server(|_| {}).await;

    let (status, body) = send_json(
        &server.router,
        "POST",
        "/api/v1/qa/pairs",
        Some(serde_json::json!({
            "question": "What is AI?",
            "answer": "Artificial intelligence.",
            "category": "tech",
            "confidence": 0.95
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let qa_id = body["data"]["qa_id"].as_str().unwrap().to_string();

    let (status, body) = send_json(
        &server.router,
        "POST",
        "/api/v1/qa/query",
        Some(serde_json::json!({ "question": "What is AI?", "top_k": 1, "min_similarity": 0.7 })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["found"], true);
    assert!(body["data"]["similarity"].as_f64().unwrap() >= 0.7);
    assert!(body["data"]["answer"]
        .as_str()
        .unwrap()
        .starts_with("Artificial intelligence"));

    let (_, body) = send_json(&server.router, "GET", "/api/v1/qa/statistics", None, &[]).await;
    assert_eq!(body["data"]["total_pairs"], 1);
    assert_eq!(body["data"]["categories"]["tech"], 1);

    let (status, body) = send_json(
        &server.router,
        "DELETE",
        "/api/v1/qa/categories/tech",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["deleted_count"], 1);
    assert_eq!(body["data"]["folder_deleted"], true);

    let (status, _) = send_json(
        &server.router,
        "GET",
        &format!("/api/v1/qa/pairs/{qa_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_kb_lifecycle_routes() {
    let server = test_server(|_| {}).await;

    let (status, _) = send_json(
        &server.router,
        "POST",
        "/api/v1/knowledge-bases",
        Some(serde_json::json!({ "name": "t1", "description": "test tenant" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Duplicate create conflicts.
    let (status, body) = send_json(
        &server.router,
        "POST",
        "/api/v1/knowledge-bases",
        Some(serde_json::json!({ "name": "t1" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "already-exists");

    let (status, _) = send_json(
        &server.router,
        "POST",
        "/api/v1/knowledge-bases/switch",
        Some(serde_json::json!({ "name": "t1" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send_json(
        &server.router,
        "GET",
        "/api/v1/knowledge-bases/current",
        None,
        &[],
    )
    .await;
    assert_eq!(body["data"]["name"], "t1");

    // Deleting the current KB without force is refused.
    let (status, _) = send_json(
        &server.router,
        "DELETE",
        "/api/v1/knowledge-bases/t1",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(
        &server.router,
        "DELETE",
        "/api/v1/knowledge-bases/t1?force=true",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

/// Non-streaming query caching: the second identical query is served
/// from the llm_response cache without another chat call; clearing the
/// cache forces a fresh call.
#[tokio::test]
async fn test_llm_response_cache_round_trip() {
    let server = test_server(|_| {}).await;
    let query = serde_json::json!({ "query": "what is ai", "mode": "naive" });

    let (status, _) = send_json(&server.router, "POST", "/api/v1/query", Some(query.clone()), &[]).await;
    assert_eq!(status, StatusCode::OK);
    let after_first = server.chat_calls.load(Ordering::SeqCst);

    let (status, _) = send_json(&server.router, "POST", "/api/v1/query", Some(query.clone()), &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        server.chat_calls.load(Ordering::SeqCst),
        after_first,
        "second identical query must be served from cache"
    );

    let (status, _) = send_json(&server.router, "DELETE", "/api/v1/cache/clear/llm", None, &[]).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(&server.router, "POST", "/api/v1/query", Some(query), &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        server.chat_calls.load(Ordering::SeqCst),
        after_first + 1,
        "cleared cache must trigger a fresh LLM call"
    );
}

#[tokio::test]
async fn test_health_and_metrics_routes() {
    let server = test_server(|_| {}).await;

    let (status, body) = send_json(&server.router, "GET", "/api/v1/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "healthy");

    let (status, body) = send_json(&server.router, "GET", "/api/v1/metrics", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["requests_total"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_insert_text_then_query_uses_kb() {
    let server = test_server(|_| {}).await;

    let (status, body) = send_json(
        &server.router,
        "POST",
        "/api/v1/insert/text",
        Some(serde_json::json!({
            "text": "AI is a branch of computer science studying intelligent agents."
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let doc_id = body["data"]["doc_id"].as_str().unwrap().to_string();
    assert!(!doc_id.is_empty());

    // Processing is asynchronous; poll statistics until the chunk index
    // catches up.
    let storage = server.state.kb_manager.resolve(None).await.unwrap();
    for _ in 0..100 {
        if storage.chunk_count() > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(storage.chunk_count() > 0, "document should be processed");

    let (status, body) = send_json(
        &server.router,
        "POST",
        "/api/v1/query",
        Some(serde_json::json!({ "query": "What is AI?", "mode": "hybrid" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["result"]
        .as_str()
        .unwrap()
        .contains("computer science"));
}
