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

//! One open knowledge-base working directory.
//!
//! Layout:
//! ```text
//! <working_dir>/
//!   meta.json
//!   kv_store_full_docs.json
//!   kv_store_text_chunks.json
//!   kv_store_doc_status.json
//!   graph_chunk_entity_relation.graphml
//!   vector_cache/chunks.bin + chunk_rows.json
//! ```
//! A KB directory is either fully laid out (every file present) or being
//! created under the manager's creation lock; readers never see a partial
//! layout. A missing KV file on open is healed with a warning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ragstone_core::kb::DocStatusEntry;
use ragstone_core::{DocStatus, KbConfig, KbMetadata, ServiceError};
use ragstone_index::{top_k_cosine, VectorMatrix};

use crate::fsutil::{dir_size, read_json, write_json_atomic};
use crate::knowledge_graph::KnowledgeGraph;

pub const META_FILE: &str = "meta.json";
pub const FULL_DOCS_FILE: &str = "kv_store_full_docs.json";
pub const TEXT_CHUNKS_FILE: &str = "kv_store_text_chunks.json";
pub const DOC_STATUS_FILE: &str = "kv_store_doc_status.json";
pub const GRAPH_FILE: &str = "graph_chunk_entity_relation.graphml";
pub const VECTOR_CACHE_DIR: &str = "vector_cache";
const CHUNK_VECTORS_FILE: &str = "chunks.bin";
const CHUNK_ROWS_FILE: &str = "chunk_rows.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullDoc {
    pub doc_id: String,
    pub content: String,
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub track_id: Option<String>,
    pub created_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub doc_id: String,
    pub content: String,
    pub chunk_index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
}

struct KbState {
    docs: HashMap<String, FullDoc>,
    chunks: HashMap<String, ChunkRecord>,
    statuses: HashMap<String, DocStatusEntry>,
    /// Row i of the matrix holds the embedding of `chunk_rows[i]`.
    chunk_rows: Vec<String>,
    matrix: VectorMatrix,
}

pub struct KbStorage {
    name: String,
    dir: PathBuf,
    deleted: AtomicBool,
    state: RwLock<KbState>,
    graph: KnowledgeGraph,
}

impl KbStorage {
    /// Lay out a fresh working directory. Caller holds the creation lock.
    pub fn layout(
        dir: &Path,
        name: &str,
        description: &str,
        language: &str,
        config: KbConfig,
        dim: usize,
    ) -> Result<(), ServiceError> {
        std::fs::create_dir_all(dir)?;
        std::fs::create_dir_all(dir.join(VECTOR_CACHE_DIR))?;

        let meta = KbMetadata {
            name: name.to_string(),
            description: description.to_string(),
            language: language.to_string(),
            created_at: ragstone_core::envelope::iso8601_now(),
            config,
        };
        write_json_atomic(&dir.join(META_FILE), &meta)?;
        write_json_atomic(&dir.join(FULL_DOCS_FILE), &HashMap::<String, FullDoc>::new())?;
        write_json_atomic(
            &dir.join(TEXT_CHUNKS_FILE),
            &HashMap::<String, ChunkRecord>::new(),
        )?;
        write_json_atomic(
            &dir.join(DOC_STATUS_FILE),
            &HashMap::<String, DocStatusEntry>::new(),
        )?;
        VectorMatrix::new(dim)
            .store(dir.join(VECTOR_CACHE_DIR).join(CHUNK_VECTORS_FILE))
            .map_err(|e| ServiceError::StorageFailure(e.to_string()))?;
        write_json_atomic(
            &dir.join(VECTOR_CACHE_DIR).join(CHUNK_ROWS_FILE),
            &Vec::<String>::new(),
        )?;
        // Graph file is created empty by the graph itself.
        KnowledgeGraph::with_persistence(dir.join(GRAPH_FILE))?;
        Ok(())
    }

    /// Open an existing working directory. Missing KV stores (partially
    /// created KBs from older builds) are healed with a warning.
    pub fn open(dir: PathBuf, name: &str, dim: usize) -> Result<Self, ServiceError> {
        if !dir.is_dir() {
            return Err(ServiceError::NotFound(format!("knowledge base '{name}'")));
        }

        let docs = Self::read_kv_or_heal(&dir.join(FULL_DOCS_FILE), name)?;
        let chunks: HashMap<String, ChunkRecord> =
            Self::read_kv_or_heal(&dir.join(TEXT_CHUNKS_FILE), name)?;
        let statuses = Self::read_kv_or_heal(&dir.join(DOC_STATUS_FILE), name)?;

        let vectors_path = dir.join(VECTOR_CACHE_DIR).join(CHUNK_VECTORS_FILE);
        let rows_path = dir.join(VECTOR_CACHE_DIR).join(CHUNK_ROWS_FILE);
        let (matrix, chunk_rows) = if vectors_path.exists() && rows_path.exists() {
            let matrix = VectorMatrix::load(&vectors_path)
                .map_err(|e| ServiceError::StorageFailure(format!("KB '{name}': {e}")))?;
            if matrix.dim() != dim {
                return Err(ServiceError::StorageFailure(format!(
                    "KB '{name}' vectors have dimension {}, embedding service reports {dim}",
                    matrix.dim()
                )));
            }
            let rows: Vec<String> = read_json(&rows_path)?;
            if rows.len() != matrix.rows() {
                return Err(ServiceError::StorageFailure(format!(
                    "KB '{name}': {} chunk rows but {} vectors",
                    rows.len(),
                    matrix.rows()
                )));
            }
            (matrix, rows)
        } else {
            tracing::warn!("KB '{}' missing vector cache, healing with empty index", name);
            std::fs::create_dir_all(dir.join(VECTOR_CACHE_DIR))?;
            let matrix = VectorMatrix::new(dim);
            matrix
                .store(&vectors_path)
                .map_err(|e| ServiceError::StorageFailure(e.to_string()))?;
            write_json_atomic(&rows_path, &Vec::<String>::new())?;
            (matrix, Vec::new())
        };

        let graph = KnowledgeGraph::with_persistence(dir.join(GRAPH_FILE))?;

        Ok(Self {
            name: name.to_string(),
            dir,
            deleted: AtomicBool::new(false),
            state: RwLock::new(KbState {
                docs,
                chunks,
                statuses,
                chunk_rows,
                matrix,
            }),
            graph,
        })
    }

    fn read_kv_or_heal<T: serde::de::DeserializeOwned + Serialize + Default>(
        path: &Path,
        kb: &str,
    ) -> Result<T, ServiceError> {
        if path.exists() {
            read_json(path)
        } else {
            tracing::warn!(
                "KB '{}' is missing {:?}; healing with an empty store",
                kb,
                path.file_name().unwrap_or_default()
            );
            let empty = T::default();
            write_json_atomic(path, &empty)?;
            Ok(empty)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    /// Flag set when the manager deletes this KB; every subsequent
    /// storage call from an in-flight handle observes not-found.
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    fn check_alive(&self) -> Result<(), ServiceError> {
        if self.deleted.load(Ordering::SeqCst) {
            Err(ServiceError::NotFound(format!(
                "knowledge base '{}' was deleted",
                self.name
            )))
        } else {
            Ok(())
        }
    }

    pub fn metadata(&self) -> Result<KbMetadata, ServiceError> {
        self.check_alive()?;
        read_json(&self.dir.join(META_FILE))
    }

    pub fn update_metadata<F: FnOnce(&mut KbMetadata)>(&self, apply: F) -> Result<KbMetadata, ServiceError> {
        self.check_alive()?;
        let mut meta: KbMetadata = read_json(&self.dir.join(META_FILE))?;
        apply(&mut meta);
        write_json_atomic(&self.dir.join(META_FILE), &meta)?;
        Ok(meta)
    }

    /// Record a new document with `pending` status.
    pub fn register_document(
        &self,
        doc_id: Option<String>,
        content: String,
        source_path: Option<String>,
        track_id: Option<String>,
    ) -> Result<String, ServiceError> {
        self.check_alive()?;
        let doc_id = doc_id.unwrap_or_else(|| format!("doc_{}", uuid::Uuid::new_v4().simple()));
        let now = ragstone_core::unix_timestamp();

        {
            let mut state = self.state.write();
            state.docs.insert(
                doc_id.clone(),
                FullDoc {
                    doc_id: doc_id.clone(),
                    content,
                    source_path: source_path.clone(),
                    track_id: track_id.clone(),
                    created_at: now,
                },
            );
            state.statuses.insert(
                doc_id.clone(),
                DocStatusEntry {
                    doc_id: doc_id.clone(),
                    status: DocStatus::Pending,
                    track_id,
                    source_path,
                    created_at: now,
                    updated_at: now,
                    error: None,
                },
            );
        }
        self.persist_docs()?;
        self.persist_statuses()?;
        Ok(doc_id)
    }

    pub fn set_status(
        &self,
        doc_id: &str,
        status: DocStatus,
        error: Option<String>,
    ) -> Result<(), ServiceError> {
        self.check_alive()?;
        {
            let mut state = self.state.write();
            let entry = state.statuses.get_mut(doc_id).ok_or_else(|| {
                ServiceError::NotFound(format!("document '{doc_id}' in KB '{}'", self.name))
            })?;
            entry.status = status;
            entry.error = error;
            entry.updated_at = ragstone_core::unix_timestamp();
        }
        self.persist_statuses()
    }

    /// Append the chunks of a document with their embeddings. Dimension
    /// mismatches fail loudly; nothing is partially appended.
    pub fn store_chunks(
        &self,
        chunks: Vec<(ChunkRecord, Vec<f32>)>,
    ) -> Result<(), ServiceError> {
        self.check_alive()?;
        {
            let mut state = self.state.write();
            let dim = state.matrix.dim();
            if let Some((record, vector)) = chunks.iter().find(|(_, v)| v.len() != dim) {
                return Err(ServiceError::UpstreamFailure(format!(
                    "chunk '{}' embedding has dimension {}, index expects {dim}",
                    record.chunk_id,
                    vector.len()
                )));
            }
            for (record, vector) in chunks {
                state
                    .matrix
                    .push(&vector)
                    .map_err(|e| ServiceError::StorageFailure(e.to_string()))?;
                state.chunk_rows.push(record.chunk_id.clone());
                state.chunks.insert(record.chunk_id.clone(), record);
            }
        }
        self.persist_chunks()
    }

    /// Delete a document and everything derived from it.
    pub fn remove_document(&self, doc_id: &str) -> Result<usize, ServiceError> {
        self.check_alive()?;
        let removed = {
            let mut state = self.state.write();
            if state.docs.remove(doc_id).is_none() {
                return Err(ServiceError::NotFound(format!(
                    "document '{doc_id}' in KB '{}'",
                    self.name
                )));
            }
            state.statuses.remove(doc_id);

            // Rebuild the chunk index without the document's rows; chunk
            // counts per document are small enough that rebuild beats
            // bookkeeping swap-removals across two structures.
            let dim = state.matrix.dim();
            let mut matrix = VectorMatrix::new(dim);
            let mut rows = Vec::new();
            let mut removed = 0usize;
            for (row, chunk_id) in state.chunk_rows.clone().iter().enumerate() {
                let keep = state
                    .chunks
                    .get(chunk_id)
                    .map(|c| c.doc_id != doc_id)
                    .unwrap_or(false);
                if keep {
                    matrix
                        .push(state.matrix.row(row))
                        .map_err(|e| ServiceError::Internal(e.to_string()))?;
                    rows.push(chunk_id.clone());
                } else {
                    state.chunks.remove(chunk_id);
                    removed += 1;
                }
            }
            state.matrix = matrix;
            state.chunk_rows = rows;
            removed
        };
        self.persist_docs()?;
        self.persist_statuses()?;
        self.persist_chunks()?;
        Ok(removed)
    }

    /// Brute-force cosine scan over the chunk index.
    pub fn search_chunks(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(ChunkRecord, f32)>, ServiceError> {
        self.check_alive()?;
        let state = self.state.read();
        let hits = top_k_cosine(&state.matrix, query, top_k)
            .into_iter()
            .filter_map(|scored| {
                let chunk_id = state.chunk_rows.get(scored.row)?;
                let record = state.chunks.get(chunk_id)?.clone();
                Some((record, scored.score))
            })
            .collect();
        Ok(hits)
    }

    pub fn get_document(&self, doc_id: &str) -> Result<FullDoc, ServiceError> {
        self.check_alive()?;
        self.state
            .read()
            .docs
            .get(doc_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("document '{doc_id}'")))
    }

    pub fn doc_status(&self, doc_id: &str) -> Option<DocStatusEntry> {
        self.state.read().statuses.get(doc_id).cloned()
    }

    pub fn statuses_by_track(&self, track_id: &str) -> Vec<DocStatusEntry> {
        self.state
            .read()
            .statuses
            .values()
            .filter(|s| s.track_id.as_deref() == Some(track_id))
            .cloned()
            .collect()
    }

    pub fn doc_count(&self) -> usize {
        self.state.read().docs.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.state.read().chunks.len()
    }

    pub fn size_bytes(&self) -> u64 {
        dir_size(&self.dir)
    }

    fn persist_docs(&self) -> Result<(), ServiceError> {
        let state = self.state.read();
        write_json_atomic(&self.dir.join(FULL_DOCS_FILE), &state.docs)
    }

    fn persist_statuses(&self) -> Result<(), ServiceError> {
        let state = self.state.read();
        write_json_atomic(&self.dir.join(DOC_STATUS_FILE), &state.statuses)
    }

    fn persist_chunks(&self) -> Result<(), ServiceError> {
        let state = self.state.read();
        write_json_atomic(&self.dir.join(TEXT_CHUNKS_FILE), &state.chunks)?;
        state
            .matrix
            .store(self.dir.join(VECTOR_CACHE_DIR).join(CHUNK_VECTORS_FILE))
            .map_err(|e| ServiceError::StorageFailure(e.to_string()))?;
        write_json_atomic(
            &self.dir.join(VECTOR_CACHE_DIR).join(CHUNK_ROWS_FILE),
            &state.chunk_rows,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh(dir: &Path, name: &str, dim: usize) -> KbStorage {
        KbStorage::layout(&dir.join(name), name, "", "English", KbConfig::default(), dim).unwrap();
        KbStorage::open(dir.join(name), name, dim).unwrap()
    }

    fn chunk(doc: &str, index: usize, content: &str) -> ChunkRecord {
        ChunkRecord {
            chunk_id: format!("{doc}_chunk_{index}"),
            doc_id: doc.to_string(),
            content: content.to_string(),
            chunk_index: index,
            start_offset: 0,
            end_offset: content.len(),
        }
    }

    #[test]
    fn test_layout_creates_all_files() {
        let dir = TempDir::new().unwrap();
        KbStorage::layout(&dir.path().join("t1"), "t1", "d", "English", KbConfig::default(), 4)
            .unwrap();
        for file in [META_FILE, FULL_DOCS_FILE, TEXT_CHUNKS_FILE, DOC_STATUS_FILE, GRAPH_FILE] {
            assert!(dir.path().join("t1").join(file).exists(), "{file} missing");
        }
        assert!(dir.path().join("t1").join(VECTOR_CACHE_DIR).join("chunks.bin").exists());
    }

    #[test]
    fn test_document_lifecycle() {
        let dir = TempDir::new().unwrap();
        let kb = fresh(dir.path(), "t1", 2);

        let doc_id = kb
            .register_document(None, "AI is a branch of computer science".into(), None, Some("trk1".into()))
            .unwrap();
        assert_eq!(kb.doc_status(&doc_id).unwrap().status, DocStatus::Pending);

        kb.store_chunks(vec![
            (chunk(&doc_id, 0, "AI is a branch"), vec![1.0, 0.0]),
            (chunk(&doc_id, 1, "of computer science"), vec![0.0, 1.0]),
        ])
        .unwrap();
        kb.set_status(&doc_id, DocStatus::Ready, None).unwrap();

        let hits = kb.search_chunks(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].0.doc_id, doc_id);
        assert_eq!(kb.statuses_by_track("trk1").len(), 1);
    }

    #[test]
    fn test_dimension_mismatch_fails_whole_batch() {
        let dir = TempDir::new().unwrap();
        let kb = fresh(dir.path(), "t1", 2);
        let doc_id = kb.register_document(None, "text".into(), None, None).unwrap();

        let err = kb
            .store_chunks(vec![
                (chunk(&doc_id, 0, "ok"), vec![1.0, 0.0]),
                (chunk(&doc_id, 1, "bad"), vec![1.0, 0.0, 0.0]),
            ])
            .unwrap_err();
        assert!(matches!(err, ServiceError::UpstreamFailure(_)));
        assert_eq!(kb.chunk_count(), 0);
    }

    #[test]
    fn test_remove_document_drops_chunks() {
        let dir = TempDir::new().unwrap();
        let kb = fresh(dir.path(), "t1", 2);
        let keep = kb.register_document(None, "keep".into(), None, None).unwrap();
        let gone = kb.register_document(None, "gone".into(), None, None).unwrap();
        kb.store_chunks(vec![(chunk(&keep, 0, "keep"), vec![1.0, 0.0])]).unwrap();
        kb.store_chunks(vec![(chunk(&gone, 0, "gone"), vec![0.0, 1.0])]).unwrap();

        assert_eq!(kb.remove_document(&gone).unwrap(), 1);
        assert_eq!(kb.doc_count(), 1);
        let hits = kb.search_chunks(&[0.0, 1.0], 2).unwrap();
        assert!(hits.iter().all(|(c, _)| c.doc_id == keep));
    }

    #[test]
    fn test_open_heals_missing_kv_store() {
        let dir = TempDir::new().unwrap();
        let kb_dir = dir.path().join("t1");
        KbStorage::layout(&kb_dir, "t1", "", "English", KbConfig::default(), 2).unwrap();
        std::fs::remove_file(kb_dir.join(DOC_STATUS_FILE)).unwrap();

        let kb = KbStorage::open(kb_dir.clone(), "t1", 2).unwrap();
        assert!(kb_dir.join(DOC_STATUS_FILE).exists());
        // The healed store accepts writes immediately.
        kb.register_document(None, "text".into(), None, None).unwrap();
    }

    #[test]
    fn test_deleted_flag_turns_calls_into_not_found() {
        let dir = TempDir::new().unwrap();
        let kb = fresh(dir.path(), "t1", 2);
        kb.mark_deleted();
        assert!(matches!(
            kb.register_document(None, "text".into(), None, None),
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            kb.search_chunks(&[0.0, 1.0], 1),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn test_reload_preserves_state() {
        let dir = TempDir::new().unwrap();
        let doc_id;
        {
            let kb = fresh(dir.path(), "t1", 2);
            doc_id = kb.register_document(None, "persisted".into(), None, None).unwrap();
            kb.store_chunks(vec![(chunk(&doc_id, 0, "persisted"), vec![0.5, 0.5])]).unwrap();
            kb.set_status(&doc_id, DocStatus::Ready, None).unwrap();
        }
        let kb = KbStorage::open(dir.path().join("t1"), "t1", 2).unwrap();
        assert_eq!(kb.doc_count(), 1);
        assert_eq!(kb.chunk_count(), 1);
        assert_eq!(kb.doc_status(&doc_id).unwrap().status, DocStatus::Ready);
    }
}
