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

//! Upstream model adapters.
//!
//! Only the call contracts live here: chat completion (plain and
//! streamed), embedding, rerank. Everything speaks the OpenAI-compatible
//! wire shape against configurable base URLs.

mod openai;

pub use openai::{OpenAiCompatibleChat, OpenAiCompatibleEmbedder, OpenAiCompatibleReranker};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use ragstone_core::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion adapter. Streaming hands back an mpsc receiver of
/// content fragments; a mid-stream upstream failure arrives as the final
/// `Err` item. Dropping the receiver cancels the upstream request (the
/// forwarding task exits on the first failed send and the response body
/// is dropped with it).
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, ServiceError>;

    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<mpsc::Receiver<Result<String, ServiceError>>, ServiceError>;

    fn model(&self) -> &str;
}

/// Embedding adapter. `embed` preserves input order; the reported
/// dimension is the contract ingest validates against.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;

    fn dimension(&self) -> usize;

    /// Cheap reachability probe for the health endpoint.
    async fn ping(&self) -> Result<(), ServiceError>;
}

/// Rerank adapter: scores each document against the query, order
/// preserved.
#[async_trait]
pub trait RerankProvider: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, ServiceError>;
}

/// Map a reqwest error onto the upstream taxonomy.
pub(crate) fn classify_reqwest(err: reqwest::Error, what: &str) -> ServiceError {
    if err.is_timeout() {
        ServiceError::UpstreamTimeout(format!("{what}: {err}"))
    } else {
        ServiceError::UpstreamFailure(format!("{what}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::system("be brief");
        assert_eq!(msg.role, "system");
        let msg = ChatMessage::user("hi");
        assert_eq!(msg.role, "user");
    }
}
