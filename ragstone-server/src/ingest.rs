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

//! Document ingest pipeline.
//!
//! Inserts register the document and return immediately; a background
//! task chunks, embeds, stores and then builds the graph, moving the
//! document through pending → processing → ready (or failed, keeping the
//! KB consistent — no half-ingested chunks survive an upstream failure).

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use ragstone_core::{DocStatus, ServiceError};

use crate::cache::{fingerprint, CacheCoordinator};
use crate::kb::{ChunkRecord, KbManager, KbStorage};
use crate::knowledge_graph::extract_relations;
use crate::llm::EmbeddingProvider;

const EMBED_BATCH: usize = 16;

#[derive(Debug, Clone, Serialize)]
pub struct InsertReceipt {
    pub doc_id: String,
    pub track_id: String,
    pub knowledge_base: String,
    pub status: String,
}

pub struct IngestPipeline {
    kb_manager: Arc<KbManager>,
    embedder: Arc<dyn EmbeddingProvider>,
    caches: Arc<CacheCoordinator>,
    allowed_file_types: Vec<String>,
}

impl IngestPipeline {
    pub fn new(
        kb_manager: Arc<KbManager>,
        embedder: Arc<dyn EmbeddingProvider>,
        caches: Arc<CacheCoordinator>,
        allowed_file_types: Vec<String>,
    ) -> Self {
        Self {
            kb_manager,
            embedder,
            caches,
            allowed_file_types,
        }
    }

    /// Insert one text. Returns once the document is registered; chunking
    /// and embedding continue on a background task.
    pub async fn insert_text(
        self: &Arc<Self>,
        kb: Option<&str>,
        text: String,
        doc_id: Option<String>,
        track_id: Option<String>,
        source_path: Option<String>,
    ) -> Result<InsertReceipt, ServiceError> {
        if text.trim().is_empty() {
            return Err(ServiceError::BadInput("text must not be empty".into()));
        }
        let storage = self.kb_manager.resolve(kb).await?;
        let kb_name = storage.name().to_string();

        // Re-inserting identical text into the same KB is a no-op served
        // from the documents cache.
        let dedup_key = fingerprint(&["doc", &kb_name, &text]);
        if let Some(existing) = self.caches.get("documents", &dedup_key) {
            let existing_id = String::from_utf8_lossy(&existing).to_string();
            if storage.doc_status(&existing_id).is_some() {
                return Ok(InsertReceipt {
                    doc_id: existing_id,
                    track_id: track_id.unwrap_or_default(),
                    knowledge_base: kb_name,
                    status: "duplicate".to_string(),
                });
            }
        }

        let track_id =
            track_id.unwrap_or_else(|| format!("trk_{}", uuid::Uuid::new_v4().simple()));
        let doc_id =
            storage.register_document(doc_id, text.clone(), source_path, Some(track_id.clone()))?;
        self.caches
            .set("documents", &dedup_key, doc_id.clone().into_bytes());

        let pipeline = self.clone();
        let storage_for_task = storage.clone();
        let doc = doc_id.clone();
        tokio::spawn(async move {
            if let Err(err) = pipeline.process_document(&storage_for_task, &doc, &text).await {
                tracing::error!(doc_id = %doc, error = %err, "document processing failed");
                let _ = storage_for_task.set_status(&doc, DocStatus::Failed, Some(err.to_string()));
            }
        });

        Ok(InsertReceipt {
            doc_id,
            track_id,
            knowledge_base: kb_name,
            status: DocStatus::Pending.as_str().to_string(),
        })
    }

    /// Insert several texts under one track id.
    pub async fn insert_texts(
        self: &Arc<Self>,
        kb: Option<&str>,
        texts: Vec<String>,
        track_id: Option<String>,
    ) -> Result<Vec<InsertReceipt>, ServiceError> {
        if texts.is_empty() {
            return Err(ServiceError::BadInput("texts must not be empty".into()));
        }
        let track_id =
            track_id.unwrap_or_else(|| format!("trk_{}", uuid::Uuid::new_v4().simple()));
        let mut receipts = Vec::with_capacity(texts.len());
        for text in texts {
            receipts.push(
                self.insert_text(kb, text, None, Some(track_id.clone()), None)
                    .await?,
            );
        }
        Ok(receipts)
    }

    /// Insert the contents of an uploaded file. Only text-bearing types
    /// are decoded here; binary formats need a parser deployment this
    /// build does not ship.
    pub async fn insert_file_bytes(
        self: &Arc<Self>,
        kb: Option<&str>,
        filename: &str,
        bytes: &[u8],
        track_id: Option<String>,
    ) -> Result<InsertReceipt, ServiceError> {
        let ext = extension_of(filename);
        if !self.allowed_file_types.iter().any(|allowed| allowed == &ext) {
            return Err(ServiceError::BadInput(format!(
                "file type '{ext}' is not allowed (allowed: {})",
                self.allowed_file_types.join(", ")
            )));
        }
        let text = match ext.as_str() {
            ".txt" | ".md" | ".csv" | ".json" | ".xml" => String::from_utf8_lossy(bytes).to_string(),
            other => {
                return Err(ServiceError::BadInput(format!(
                    "no parser available for '{other}' files in this deployment"
                )))
            }
        };
        self.insert_text(kb, text, None, track_id, Some(filename.to_string()))
            .await
    }

    /// Walk a server-local directory and insert every allowed file.
    pub async fn insert_directory(
        self: &Arc<Self>,
        kb: Option<&str>,
        dir: &Path,
        track_id: Option<String>,
    ) -> Result<Vec<InsertReceipt>, ServiceError> {
        if !dir.is_dir() {
            return Err(ServiceError::BadInput(format!("{dir:?} is not a directory")));
        }
        let track_id =
            track_id.unwrap_or_else(|| format!("trk_{}", uuid::Uuid::new_v4().simple()));

        let mut receipts = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in std::fs::read_dir(&current)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let ext = extension_of(name);
                if !self.allowed_file_types.iter().any(|allowed| allowed == &ext) {
                    continue;
                }
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        match self
                            .insert_file_bytes(kb, name, &bytes, Some(track_id.clone()))
                            .await
                        {
                            Ok(receipt) => receipts.push(receipt),
                            Err(err) => {
                                tracing::warn!(file = %path.display(), error = %err, "skipping file")
                            }
                        }
                    }
                    Err(err) => tracing::warn!(file = %path.display(), error = %err, "unreadable file"),
                }
            }
        }
        Ok(receipts)
    }

    /// The background half: chunk, embed, store, then graph-build.
    async fn process_document(
        &self,
        storage: &Arc<KbStorage>,
        doc_id: &str,
        text: &str,
    ) -> Result<(), ServiceError> {
        storage.set_status(doc_id, DocStatus::Processing, None)?;
        let config = storage.metadata()?.config;

        let pieces = chunk_text(text, config.chunk_size, config.chunk_overlap);
        let mut records = Vec::with_capacity(pieces.len());
        let mut contents = Vec::with_capacity(pieces.len());
        for (index, (content, start, end)) in pieces.into_iter().enumerate() {
            records.push(ChunkRecord {
                chunk_id: format!("{doc_id}_chunk_{index}"),
                doc_id: doc_id.to_string(),
                content: content.clone(),
                chunk_index: index,
                start_offset: start,
                end_offset: end,
            });
            contents.push(content);
        }

        let mut vectors = Vec::with_capacity(contents.len());
        for batch in contents.chunks(EMBED_BATCH) {
            vectors.extend(self.embedder.embed(batch).await?);
        }
        if vectors.len() != records.len() {
            return Err(ServiceError::UpstreamFailure(format!(
                "embedding count mismatch: {} chunks, {} vectors",
                records.len(),
                vectors.len()
            )));
        }

        storage.store_chunks(records.iter().cloned().zip(vectors).collect())?;
        storage.set_status(doc_id, DocStatus::Ready, None)?;

        if config.enable_auto_update {
            let graph = storage.graph();
            for record in &records {
                for relation in extract_relations(&record.content) {
                    graph.add_relation(&relation.source, &relation.target, &relation.relation);
                }
            }
            if let Err(err) = graph.save() {
                // Retrieval still works from chunks; the graph catches up
                // on the next ingest.
                tracing::warn!(doc_id, error = %err, "graph persistence failed");
            }
        }
        Ok(())
    }
}

fn extension_of(filename: &str) -> String {
    match filename.rfind('.') {
        Some(pos) => filename[pos..].to_lowercase(),
        None => String::new(),
    }
}

/// Character-windowed chunking with overlap; offsets are byte positions
/// into the original text.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<(String, usize, usize)> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);
    let step = chunk_size - overlap;

    let indices: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    if indices.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < indices.len() {
        let end = (start + chunk_size).min(indices.len());
        let byte_start = indices[start];
        let byte_end = if end == indices.len() {
            text.len()
        } else {
            indices[end]
        };
        chunks.push((text[byte_start..byte_end].to_string(), byte_start, byte_end));
        if end == indices.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_text_covers_whole_input() {
        let text = "abcdefghij";
        let chunks = chunk_text(text, 4, 1);
        assert_eq!(chunks[0].0, "abcd");
        assert_eq!(chunks[1].0, "defg");
        assert!(chunks.last().unwrap().2 == text.len());
    }

    #[test]
    fn test_chunk_offsets_are_bytes_for_multibyte_text() {
        let text = "héllo wörld, this is multibyte";
        let chunks = chunk_text(text, 10, 2);
        for (content, start, end) in &chunks {
            assert_eq!(&text[*start..*end], content);
        }
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text("short", 1024, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, "short");
    }

    #[test]
    fn test_empty_text_no_chunks() {
        assert!(chunk_text("", 1024, 50).is_empty());
    }

    #[test]
    fn test_extension_detection() {
        assert_eq!(extension_of("notes.TXT"), ".txt");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("noext"), "");
    }
}
