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

//! Query orchestration: intent analysis → safety gate → enhancement →
//! retrieval → answer, with streaming hand-off to the SSE layer.
//!
//! Admission already happened in middleware; the orchestrator only reads
//! the derived identity and never consumes a second ticket. `/query/analyze`
//! stops after the safety gate and never calls the retrieval engine.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tokio::sync::mpsc;

use ragstone_core::ServiceError;

use crate::intent::{AnalyzeOutcome, IntentEngine};
use crate::retrieval::{
    PerformanceMode, QueryMode, QueryParams, RetrievalEngine, RetrievalOutput,
};

/// Flags and parameters for one orchestrated query.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub query: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub knowledge_base: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub performance_mode: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub enable_intent_analysis: bool,
    #[serde(default)]
    pub enable_query_enhancement: bool,
    #[serde(default)]
    pub safety_check: bool,
    #[serde(default)]
    pub enable_rerank: bool,
    #[serde(default)]
    pub max_total_tokens: Option<usize>,
    #[serde(default)]
    pub max_entity_tokens: Option<usize>,
    #[serde(default)]
    pub max_relation_tokens: Option<usize>,
}

fn default_mode() -> String {
    "hybrid".to_string()
}

fn default_top_k() -> usize {
    10
}

/// What one execution produced.
pub enum ExecuteOutcome {
    /// Safety gate terminated the pipeline; retrieval was never called.
    Rejected(Box<AnalyzeOutcome>),
    /// Collected non-streaming answer.
    Complete {
        result: String,
        mode: QueryMode,
        knowledge_base: String,
        analysis: Option<Box<AnalyzeOutcome>>,
        response_time: f64,
    },
    /// Streaming answer; the caller formats SSE events around it.
    Streaming {
        fragments: mpsc::Receiver<Result<String, ServiceError>>,
        mode: QueryMode,
        knowledge_base: String,
        language: String,
        started: Instant,
    },
}

pub struct Orchestrator {
    intent: Arc<IntentEngine>,
    retrieval: Arc<RetrievalEngine>,
    kb_manager: Arc<crate::kb::KbManager>,
}

impl Orchestrator {
    pub fn new(
        intent: Arc<IntentEngine>,
        retrieval: Arc<RetrievalEngine>,
        kb_manager: Arc<crate::kb::KbManager>,
    ) -> Self {
        Self {
            intent,
            retrieval,
            kb_manager,
        }
    }

    pub fn intent_engine(&self) -> &Arc<IntentEngine> {
        &self.intent
    }

    pub fn retrieval_engine(&self) -> &Arc<RetrievalEngine> {
        &self.retrieval
    }

    fn parse_params(&self, request: &ExecuteRequest) -> Result<QueryParams, ServiceError> {
        let mode = QueryMode::parse(&request.mode).ok_or_else(|| {
            ServiceError::BadInput(format!(
                "unsupported query mode '{}', expected one of: {}",
                request.mode,
                QueryMode::ALL
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
        let performance_mode = match &request.performance_mode {
            Some(raw) => PerformanceMode::parse(raw).ok_or_else(|| {
                ServiceError::BadInput(format!(
                    "unsupported performance_mode '{raw}', expected fast, balanced or quality"
                ))
            })?,
            None => PerformanceMode::default(),
        };

        Ok(QueryParams {
            query: request.query.clone(),
            mode,
            top_k: request.top_k,
            knowledge_base: request.knowledge_base.clone(),
            language: request.language.clone(),
            performance_mode,
            enable_rerank: request.enable_rerank,
            stream: request.stream,
            max_total_tokens: request.max_total_tokens,
            max_entity_tokens: request.max_entity_tokens,
            max_relation_tokens: request.max_relation_tokens,
        })
    }

    /// The full pipeline. Safety rejection short-circuits before any
    /// retrieval work.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteOutcome, ServiceError> {
        let started = Instant::now();
        // Parse early so a bad mode rejects before the intent engine runs.
        let mut params = self.parse_params(&request)?;

        let analysis = if request.enable_intent_analysis || request.safety_check {
            Some(Box::new(
                self.intent
                    .analyze(&request.query, request.enable_query_enhancement)
                    .await,
            ))
        } else {
            None
        };

        if request.safety_check {
            if let Some(analysis) = &analysis {
                if analysis.should_reject {
                    return Ok(ExecuteOutcome::Rejected(analysis.clone()));
                }
            }
        }

        if request.enable_query_enhancement {
            if let Some(enhanced) = analysis.as_ref().and_then(|a| a.enhanced_query.clone()) {
                params.query = enhanced;
            }
        }

        let kb_name = params
            .knowledge_base
            .clone()
            .unwrap_or_else(|| self.kb_manager.current_name());
        let language = params.language.clone().unwrap_or_else(|| "English".into());
        let mode = params.mode;

        match self.retrieval.query(params).await? {
            RetrievalOutput::Complete(result) => Ok(ExecuteOutcome::Complete {
                result,
                mode,
                knowledge_base: kb_name,
                analysis,
                response_time: started.elapsed().as_secs_f64(),
            }),
            RetrievalOutput::Stream(fragments) => Ok(ExecuteOutcome::Streaming {
                fragments,
                mode,
                knowledge_base: kb_name,
                language,
                started,
            }),
        }
    }

    /// Analysis only: `/query/analyze` never invokes the retrieval
    /// engine.
    pub async fn analyze(&self, query: &str, enable_enhancement: bool) -> AnalyzeOutcome {
        self.intent.analyze(query, enable_enhancement).await
    }
}
