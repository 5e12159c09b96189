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

//! Retrieval engine: six query modes over the chunk index and the
//! knowledge graph, with rerank, token-budgeted context assembly and
//! streaming answers.

mod context;

pub use context::{assemble, ContextBudget, ContextPiece};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use ragstone_core::ServiceError;

use crate::cache::{embed_with_cache, fingerprint, CacheCoordinator};
use crate::kb::{ChunkRecord, KbManager, KbStorage};
use crate::llm::{ChatMessage, ChatProvider, EmbeddingProvider, RerankProvider};

/// One of the six retrieval strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Naive,
    Local,
    Global,
    Hybrid,
    Mix,
    Bypass,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Naive => "naive",
            Self::Local => "local",
            Self::Global => "global",
            Self::Hybrid => "hybrid",
            Self::Mix => "mix",
            Self::Bypass => "bypass",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "naive" => Some(Self::Naive),
            "local" => Some(Self::Local),
            "global" => Some(Self::Global),
            "hybrid" => Some(Self::Hybrid),
            "mix" => Some(Self::Mix),
            "bypass" => Some(Self::Bypass),
            _ => None,
        }
    }

    pub const ALL: [QueryMode; 6] = [
        Self::Naive,
        Self::Local,
        Self::Global,
        Self::Hybrid,
        Self::Mix,
        Self::Bypass,
    ];

    pub fn uses_vectors(&self) -> bool {
        matches!(self, Self::Naive | Self::Local | Self::Hybrid | Self::Mix)
    }

    pub fn uses_graph(&self) -> bool {
        matches!(self, Self::Local | Self::Global | Self::Hybrid | Self::Mix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    Fast,
    #[default]
    Balanced,
    Quality,
}

impl PerformanceMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(Self::Fast),
            "balanced" => Some(Self::Balanced),
            "quality" => Some(Self::Quality),
            _ => None,
        }
    }

    /// Internal tuning knobs per performance level.
    fn tuning(&self) -> Tuning {
        match self {
            Self::Fast => Tuning {
                chunk_fanout: 1,
                rerank_depth: 0,
                max_total_tokens: 4_000,
                max_entity_tokens: 800,
                max_relation_tokens: 800,
            },
            Self::Balanced => Tuning {
                chunk_fanout: 2,
                rerank_depth: 2,
                max_total_tokens: 8_000,
                max_entity_tokens: 1_500,
                max_relation_tokens: 1_500,
            },
            Self::Quality => Tuning {
                chunk_fanout: 3,
                rerank_depth: 3,
                max_total_tokens: 16_000,
                max_entity_tokens: 3_000,
                max_relation_tokens: 3_000,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tuning {
    /// Chunk read fanout as a multiple of top_k.
    chunk_fanout: usize,
    /// Rerank depth as a multiple of top_k; zero skips reranking.
    rerank_depth: usize,
    max_total_tokens: usize,
    max_entity_tokens: usize,
    max_relation_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct QueryParams {
    pub query: String,
    pub mode: QueryMode,
    pub top_k: usize,
    pub knowledge_base: Option<String>,
    pub language: Option<String>,
    pub performance_mode: PerformanceMode,
    pub enable_rerank: bool,
    pub stream: bool,
    pub max_total_tokens: Option<usize>,
    pub max_entity_tokens: Option<usize>,
    pub max_relation_tokens: Option<usize>,
}

impl QueryParams {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.query.trim().is_empty() {
            return Err(ServiceError::BadInput("query must not be empty".into()));
        }
        if !(1..=100).contains(&self.top_k) {
            return Err(ServiceError::BadInput(format!(
                "top_k must be within [1, 100], got {}",
                self.top_k
            )));
        }
        Ok(())
    }
}

/// Answer as a whole or as a lazy fragment sequence. The stream ends when
/// the channel closes; an error mid-stream arrives as a final `Err` item.
pub enum RetrievalOutput {
    Complete(String),
    Stream(mpsc::Receiver<Result<String, ServiceError>>),
}

pub struct RetrievalEngine {
    kb_manager: Arc<KbManager>,
    llm: Arc<dyn ChatProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn RerankProvider>>,
    caches: Arc<CacheCoordinator>,
    query_count: AtomicU64,
}

impl RetrievalEngine {
    pub fn new(
        kb_manager: Arc<KbManager>,
        llm: Arc<dyn ChatProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Option<Arc<dyn RerankProvider>>,
        caches: Arc<CacheCoordinator>,
    ) -> Self {
        Self {
            kb_manager,
            llm,
            embedder,
            reranker,
            caches,
            query_count: AtomicU64::new(0),
        }
    }

    /// Retrievals executed since startup. The orchestrator's analyze path
    /// must leave this untouched.
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    pub async fn query(&self, params: QueryParams) -> Result<RetrievalOutput, ServiceError> {
        params.validate()?;
        self.query_count.fetch_add(1, Ordering::Relaxed);

        // Debug passthrough: no retrieval, no LLM.
        if params.mode == QueryMode::Bypass {
            return Ok(if params.stream {
                let (tx, rx) = mpsc::channel(1);
                let text = params.query.clone();
                tokio::spawn(async move {
                    let _ = tx.send(Ok(text)).await;
                });
                RetrievalOutput::Stream(rx)
            } else {
                RetrievalOutput::Complete(params.query.clone())
            });
        }

        let storage = self.kb_manager.resolve(params.knowledge_base.as_deref()).await?;

        let answer_key = fingerprint(&[
            "answer",
            storage.name(),
            params.mode.as_str(),
            &params.query,
            &params.top_k.to_string(),
            params.language.as_deref().unwrap_or(""),
        ]);
        if !params.stream {
            if let Some(cached) = self.caches.get("llm_response", &answer_key) {
                return Ok(RetrievalOutput::Complete(
                    String::from_utf8_lossy(&cached).to_string(),
                ));
            }
        }

        let body = self.build_context(&storage, &params).await?;
        let messages = self.build_prompt(&params, &body);

        if params.stream {
            let rx = self.llm.stream_chat(messages).await?;
            Ok(RetrievalOutput::Stream(rx))
        } else {
            let answer = self.llm.chat(messages).await?;
            self.caches
                .set("llm_response", &answer_key, answer.clone().into_bytes());
            Ok(RetrievalOutput::Complete(answer))
        }
    }

    /// Retrieve and assemble the context body for a query, consulting the
    /// queries cache.
    async fn build_context(
        &self,
        storage: &Arc<KbStorage>,
        params: &QueryParams,
    ) -> Result<String, ServiceError> {
        let context_key = fingerprint(&[
            "context",
            storage.name(),
            params.mode.as_str(),
            &params.query,
            &params.top_k.to_string(),
        ]);
        if let Some(cached) = self.caches.get("queries", &context_key) {
            return Ok(String::from_utf8_lossy(&cached).to_string());
        }

        let tuning = params.performance_mode.tuning();
        let budget = ContextBudget {
            max_total_tokens: params.max_total_tokens.unwrap_or(tuning.max_total_tokens),
            max_entity_tokens: params.max_entity_tokens.unwrap_or(tuning.max_entity_tokens),
            max_relation_tokens: params
                .max_relation_tokens
                .unwrap_or(tuning.max_relation_tokens),
        };

        let chunks = if params.mode.uses_vectors() {
            self.retrieve_chunks(storage, params, &tuning).await?
        } else {
            Vec::new()
        };

        let (entities, relations) = if params.mode.uses_graph() {
            self.retrieve_graph(storage, params, &chunks)?
        } else {
            (Vec::new(), Vec::new())
        };

        let chunk_pieces = chunks
            .into_iter()
            .map(|(record, score)| ContextPiece {
                text: record.content,
                score: score as f64,
            })
            .collect();

        let body = assemble(entities, relations, chunk_pieces, budget);
        self.caches
            .set("queries", &context_key, body.clone().into_bytes());
        Ok(body)
    }

    async fn retrieve_chunks(
        &self,
        storage: &Arc<KbStorage>,
        params: &QueryParams,
        tuning: &Tuning,
    ) -> Result<Vec<(ChunkRecord, f32)>, ServiceError> {
        let vector = embed_with_cache(&self.caches, self.embedder.as_ref(), &params.query).await?;
        let fanout = params.top_k * tuning.chunk_fanout.max(1);
        let mut hits = storage.search_chunks(&vector, fanout)?;

        if params.enable_rerank && tuning.rerank_depth > 0 {
            if let Some(reranker) = &self.reranker {
                let depth = (params.top_k * tuning.rerank_depth).min(hits.len());
                let documents: Vec<String> =
                    hits[..depth].iter().map(|(c, _)| c.content.clone()).collect();
                match reranker.rerank(&params.query, &documents).await {
                    Ok(scores) => {
                        let mut rescored: Vec<(ChunkRecord, f32, f32)> = hits
                            .drain(..depth)
                            .zip(scores)
                            .map(|((record, original), reranked)| (record, reranked, original))
                            .collect();
                        // Rerank score decides; ties fall back to the
                        // original vector score.
                        rescored.sort_by(|a, b| {
                            b.1.partial_cmp(&a.1)
                                .unwrap_or(std::cmp::Ordering::Equal)
                                .then(
                                    b.2.partial_cmp(&a.2)
                                        .unwrap_or(std::cmp::Ordering::Equal),
                                )
                        });
                        let mut merged: Vec<(ChunkRecord, f32)> = rescored
                            .into_iter()
                            .map(|(record, reranked, _)| (record, reranked))
                            .collect();
                        merged.extend(hits);
                        hits = merged;
                    }
                    Err(err) => {
                        tracing::warn!("rerank failed, keeping vector order: {}", err);
                    }
                }
            }
        }

        hits.truncate(params.top_k);
        Ok(hits)
    }

    /// Graph context. Local-style expansion walks 1-hop neighborhoods of
    /// matched entities; global-style traversal summarizes the strongest
    /// relations around them.
    fn retrieve_graph(
        &self,
        storage: &Arc<KbStorage>,
        params: &QueryParams,
        chunks: &[(ChunkRecord, f32)],
    ) -> Result<(Vec<ContextPiece>, Vec<ContextPiece>), ServiceError> {
        let graph = storage.graph();

        let graph_key = fingerprint(&["graph", storage.name(), &params.query]);
        if let Some(cached) = self.caches.get("knowledge_graph", &graph_key) {
            if let Ok((entities, relations)) =
                serde_json::from_slice::<(Vec<(String, f64)>, Vec<(String, f64)>)>(&cached)
            {
                return Ok((
                    entities
                        .into_iter()
                        .map(|(text, score)| ContextPiece { text, score })
                        .collect(),
                    relations
                        .into_iter()
                        .map(|(text, score)| ContextPiece { text, score })
                        .collect(),
                ));
            }
        }

        // Seed entities from the query, enriched by the retrieved chunks.
        let mut seed_text = params.query.clone();
        for (record, _) in chunks.iter().take(3) {
            seed_text.push(' ');
            seed_text.push_str(&record.content);
        }
        let seeds = graph.match_entities(&seed_text, params.top_k.max(5));

        let mut entities = Vec::new();
        let mut relations = Vec::new();
        for (rank, seed) in seeds.iter().enumerate() {
            let score = 1.0 / (rank + 1) as f64;
            if let Some(node) = graph.get_node(seed) {
                entities.push(ContextPiece {
                    text: format!(
                        "{} ({}, seen {} times)",
                        node.name, node.entity_type, node.occurrence_count
                    ),
                    score,
                });
            }
            for edge in graph.edges_of(seed) {
                relations.push(ContextPiece {
                    text: format!("{} -[{}]-> {}", edge.source, edge.relation, edge.target),
                    score: score * edge.weight,
                });
            }
            for neighbor in graph.neighbors(seed) {
                if let Some(node) = graph.get_node(&neighbor) {
                    entities.push(ContextPiece {
                        text: format!("{} ({})", node.name, node.entity_type),
                        score: score * 0.5,
                    });
                }
            }
        }

        let cacheable: (Vec<(String, f64)>, Vec<(String, f64)>) = (
            entities.iter().map(|p| (p.text.clone(), p.score)).collect(),
            relations.iter().map(|p| (p.text.clone(), p.score)).collect(),
        );
        if let Ok(bytes) = serde_json::to_vec(&cacheable) {
            self.caches.set("knowledge_graph", &graph_key, bytes);
        }

        Ok((entities, relations))
    }

    fn build_prompt(&self, params: &QueryParams, context_body: &str) -> Vec<ChatMessage> {
        let language = params.language.as_deref().unwrap_or("English");
        let mut system = format!(
            "You are a knowledge-base assistant. Answer strictly from the provided context. \
             If the context does not contain the answer, say so. Respond in {language}."
        );
        if params.mode == QueryMode::Mix {
            system.push_str(
                " First outline which context pieces are relevant, then give the final answer.",
            );
        }

        let user = if context_body.is_empty() {
            format!(
                "No relevant context was retrieved.\n\nQuestion: {}",
                params.query
            )
        } else {
            format!("Context:\n{}\n\nQuestion: {}", context_body, params.query)
        };

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_round_trip() {
        for mode in QueryMode::ALL {
            assert_eq!(QueryMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(QueryMode::parse("turbo"), None);
    }

    #[test]
    fn test_mode_capability_matrix() {
        assert!(QueryMode::Naive.uses_vectors() && !QueryMode::Naive.uses_graph());
        assert!(QueryMode::Local.uses_vectors() && QueryMode::Local.uses_graph());
        assert!(!QueryMode::Global.uses_vectors() && QueryMode::Global.uses_graph());
        assert!(QueryMode::Hybrid.uses_vectors() && QueryMode::Hybrid.uses_graph());
        assert!(!QueryMode::Bypass.uses_vectors() && !QueryMode::Bypass.uses_graph());
    }

    #[test]
    fn test_params_validation() {
        let mut params = QueryParams {
            query: "what is ai".into(),
            mode: QueryMode::Hybrid,
            top_k: 10,
            knowledge_base: None,
            language: None,
            performance_mode: PerformanceMode::Balanced,
            enable_rerank: false,
            stream: false,
            max_total_tokens: None,
            max_entity_tokens: None,
            max_relation_tokens: None,
        };
        assert!(params.validate().is_ok());

        params.top_k = 0;
        assert!(params.validate().is_err());
        params.top_k = 101;
        assert!(params.validate().is_err());
        params.top_k = 100;
        params.query = "  ".into();
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_quality_tuning_is_deeper_than_fast() {
        let fast = PerformanceMode::Fast.tuning();
        let quality = PerformanceMode::Quality.tuning();
        assert!(quality.chunk_fanout > fast.chunk_fanout);
        assert!(quality.max_total_tokens > fast.max_total_tokens);
        assert_eq!(fast.rerank_depth, 0);
    }
}
