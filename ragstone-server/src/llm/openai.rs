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

//! OpenAI-compatible providers over reqwest.
//!
//! Covers hosted OpenAI-style gateways and local servers exposing
//! `/chat/completions`, `/embeddings` and `/rerank`. All wire types are
//! private to this module.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use ragstone_core::ServiceError;

use super::{classify_reqwest, ChatMessage, ChatProvider, EmbeddingProvider, RerankProvider};

fn build_client(timeout: Duration) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ServiceError::Internal(format!("failed to build HTTP client: {e}")))
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(300).collect();
    Err(ServiceError::UpstreamFailure(format!(
        "{what} returned {status}: {snippet}"
    )))
}

// Chat

pub struct OpenAiCompatibleChat {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatibleChat {
    pub fn new(
        api_base: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_client(timeout)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }

    fn request(&self, body: serde_json::Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatStreamChunk {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Deserialize)]
struct ChatStreamChoice {
    delta: ChatStreamDelta,
}

#[derive(Deserialize, Default)]
struct ChatStreamDelta {
    content: Option<String>,
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleChat {
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, ServiceError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
        });
        let response = self
            .request(body)
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "chat completion"))?;
        let response = check_status(response, "chat completion").await?;
        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::UpstreamFailure(format!("unparseable chat reply: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::UpstreamFailure("chat reply had no content".into()))
    }

    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<mpsc::Receiver<Result<String, ServiceError>>, ServiceError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        let response = self
            .request(body)
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "chat stream"))?;
        let response = check_status(response, "chat stream").await?;

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut pending = String::new();
            'outer: while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = tx.send(Err(classify_reqwest(err, "chat stream"))).await;
                        break;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&bytes));

                // SSE frames are newline-delimited `data: {...}` lines; a
                // partial line stays in `pending` for the next chunk.
                while let Some(pos) = pending.find('\n') {
                    let line = pending[..pos].trim().to_string();
                    pending.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        break 'outer;
                    }
                    if let Ok(chunk) = serde_json::from_str::<ChatStreamChunk>(payload) {
                        if let Some(content) =
                            chunk.choices.into_iter().next().and_then(|c| c.delta.content)
                        {
                            if !content.is_empty() && tx.send(Ok(content)).await.is_err() {
                                // Receiver gone: client disconnected, stop
                                // pulling from upstream.
                                break 'outer;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// Embeddings

pub struct OpenAiCompatibleEmbedder {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
}

impl OpenAiCompatibleEmbedder {
    pub fn new(
        api_base: String,
        api_key: Option<String>,
        model: String,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_client(timeout)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model,
            dimension,
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.model,
            "input": texts,
        });
        let mut req = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "embedding"))?;
        let response = check_status(response, "embedding").await?;
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::UpstreamFailure(format!("unparseable embeddings: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(ServiceError::UpstreamFailure(format!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let mut vectors = vec![Vec::new(); texts.len()];
        for datum in parsed.data {
            if datum.index >= vectors.len() {
                return Err(ServiceError::UpstreamFailure(format!(
                    "embedding index {} out of range",
                    datum.index
                )));
            }
            vectors[datum.index] = datum.embedding;
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        // Any HTTP response means reachable; only transport failures count
        // as down. Hard 3-second budget regardless of the embed timeout.
        let client = build_client(Duration::from_secs(3))?;
        let mut req = client.head(&self.api_base);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req.send()
            .await
            .map(|_| ())
            .map_err(|e| classify_reqwest(e, "embedding probe"))
    }
}

// Rerank

pub struct OpenAiCompatibleReranker {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatibleReranker {
    pub fn new(
        api_base: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_client(timeout)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

#[async_trait]
impl RerankProvider for OpenAiCompatibleReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, ServiceError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.model,
            "query": query,
            "documents": documents,
        });
        let mut req = self
            .client
            .post(format!("{}/rerank", self.api_base))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| classify_reqwest(e, "rerank"))?;
        let response = check_status(response, "rerank").await?;
        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::UpstreamFailure(format!("unparseable rerank reply: {e}")))?;

        let mut scores = vec![0.0f32; documents.len()];
        for result in parsed.results {
            if result.index < scores.len() {
                scores[result.index] = result.relevance_score;
            }
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_chunk_parses_delta() {
        let payload = r#"{"choices":[{"delta":{"content":"hel"}}]}"#;
        let chunk: ChatStreamChunk = serde_json::from_str(payload).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hel"));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let chat = OpenAiCompatibleChat::new(
            "http://localhost:8100/v1/".into(),
            None,
            "qwen14b".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(chat.api_base, "http://localhost:8100/v1");
    }
}
