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

//! One open QA category: the pair list, its embedding matrix and the
//! reverse index, backed by three files in the category directory.
//!
//! All mutation happens under the store's keyed lock for the category
//! name; the inner RwLock exists for shared ownership, not for the
//! concurrency discipline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ragstone_core::{QaPair, ServiceError};
use ragstone_index::{top_k_cosine, VectorMatrix};

use crate::fsutil::write_json_atomic;

const PAIRS_FILE: &str = "pairs.json";
const VECTORS_FILE: &str = "vectors.bin";
const META_FILE: &str = "meta.json";

/// `meta.json` sidecar.
#[derive(Debug, Serialize, Deserialize)]
struct CategoryMeta {
    pair_count: usize,
    embedding_dim: usize,
    updated_at: f64,
}

/// `pairs.json`: pair id → record. Each record carries its matrix row so
/// the id→row index survives restarts without relying on map iteration
/// order.
#[derive(Debug, Serialize, Deserialize)]
struct PairsFile {
    pairs: HashMap<String, StoredPair>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPair {
    row: usize,
    #[serde(flatten)]
    pair: QaPair,
}

#[derive(Debug)]
struct CategoryState {
    /// Pairs ordered by matrix row: `pairs[i]` embeds to matrix row `i`.
    pairs: Vec<QaPair>,
    row_by_id: HashMap<String, usize>,
    matrix: VectorMatrix,
}

#[derive(Debug)]
pub struct CategoryStore {
    name: String,
    dir: PathBuf,
    state: RwLock<CategoryState>,
}

/// A scored pair coming out of a category scan.
#[derive(Debug, Clone)]
pub struct ScoredPair {
    pub pair: QaPair,
    pub similarity: f64,
}

impl CategoryStore {
    /// Open an existing category directory or lay out an empty one.
    pub fn open(root: &Path, name: &str, dim: usize) -> Result<Self, ServiceError> {
        let dir = root.join(name);
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }

        let pairs_path = dir.join(PAIRS_FILE);
        let vectors_path = dir.join(VECTORS_FILE);

        let state = if pairs_path.exists() && vectors_path.exists() {
            let raw = std::fs::read_to_string(&pairs_path)?;
            let file: PairsFile = serde_json::from_str(&raw)?;
            let matrix = VectorMatrix::load(&vectors_path)
                .map_err(|e| ServiceError::StorageFailure(format!("category '{name}': {e}")))?;

            if matrix.dim() != dim {
                return Err(ServiceError::StorageFailure(format!(
                    "category '{name}' was built with dimension {}, embedding service reports {dim}",
                    matrix.dim()
                )));
            }
            if matrix.rows() != file.pairs.len() {
                return Err(ServiceError::StorageFailure(format!(
                    "category '{name}': {} pairs but {} vectors",
                    file.pairs.len(),
                    matrix.rows()
                )));
            }

            let mut ordered: Vec<StoredPair> = file.pairs.into_values().collect();
            ordered.sort_by_key(|p| p.row);
            if ordered.iter().enumerate().any(|(i, p)| p.row != i) {
                return Err(ServiceError::StorageFailure(format!(
                    "category '{name}': non-contiguous row index"
                )));
            }

            let mut row_by_id = HashMap::with_capacity(ordered.len());
            let pairs: Vec<QaPair> = ordered
                .into_iter()
                .enumerate()
                .map(|(row, stored)| {
                    row_by_id.insert(stored.pair.id.clone(), row);
                    stored.pair
                })
                .collect();

            CategoryState {
                pairs,
                row_by_id,
                matrix,
            }
        } else {
            CategoryState {
                pairs: Vec::new(),
                row_by_id: HashMap::new(),
                matrix: VectorMatrix::new(dim),
            }
        };

        let store = Self {
            name: name.to_string(),
            dir,
            state: RwLock::new(state),
        };
        store.persist()?;
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.state.read().pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, pair_id: &str) -> bool {
        self.state.read().row_by_id.contains_key(pair_id)
    }

    pub fn get(&self, pair_id: &str) -> Option<QaPair> {
        let state = self.state.read();
        state
            .row_by_id
            .get(pair_id)
            .map(|&row| state.pairs[row].clone())
    }

    pub fn pairs(&self) -> Vec<QaPair> {
        self.state.read().pairs.clone()
    }

    pub fn pair_ids(&self) -> Vec<String> {
        self.state.read().row_by_id.keys().cloned().collect()
    }

    /// Append a pair and its question embedding, then persist.
    pub fn append(&self, pair: QaPair, vector: &[f32]) -> Result<(), ServiceError> {
        {
            let mut state = self.state.write();
            if state.row_by_id.contains_key(&pair.id) {
                return Err(ServiceError::AlreadyExists(format!(
                    "QA pair '{}' already exists in category '{}'",
                    pair.id, self.name
                )));
            }
            let row = state.matrix.push(vector).map_err(|e| {
                ServiceError::BadInput(format!("embedding dimension mismatch: {e}"))
            })?;
            state.row_by_id.insert(pair.id.clone(), row);
            state.pairs.push(pair);
        }
        self.persist()
    }

    /// Remove one pair: swap the last matrix row into its slot, truncate,
    /// fix the moved pair's index, rewrite files.
    pub fn remove(&self, pair_id: &str) -> Result<bool, ServiceError> {
        {
            let mut state = self.state.write();
            let Some(row) = state.row_by_id.remove(pair_id) else {
                return Ok(false);
            };
            let moved = state
                .matrix
                .swap_remove(row)
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
            state.pairs.swap_remove(row);
            if moved.is_some() {
                let moved_id = state.pairs[row].id.clone();
                state.row_by_id.insert(moved_id, row);
            }
        }
        self.persist()?;
        Ok(true)
    }

    /// Replace a pair in place. A new vector means the question changed.
    pub fn replace(
        &self,
        pair: QaPair,
        vector: Option<&[f32]>,
    ) -> Result<(), ServiceError> {
        {
            let mut state = self.state.write();
            let Some(&row) = state.row_by_id.get(&pair.id) else {
                return Err(ServiceError::NotFound(format!(
                    "QA pair '{}' not in category '{}'",
                    pair.id, self.name
                )));
            };
            if let Some(vector) = vector {
                // Matrix rows are immutable in place; swap out and
                // re-append keeps the codec simple.
                let moved = state
                    .matrix
                    .swap_remove(row)
                    .map_err(|e| ServiceError::Internal(e.to_string()))?;
                state.pairs.swap_remove(row);
                if moved.is_some() {
                    let moved_id = state.pairs[row].id.clone();
                    state.row_by_id.insert(moved_id, row);
                }
                let new_row = state
                    .matrix
                    .push(vector)
                    .map_err(|e| ServiceError::BadInput(e.to_string()))?;
                state.row_by_id.insert(pair.id.clone(), new_row);
                state.pairs.push(pair);
            } else {
                state.pairs[row] = pair;
            }
        }
        self.persist()
    }

    /// Score the category against a query vector; returns up to `top_k`
    /// pairs, best first. No threshold filtering here — the store applies
    /// it after the global merge.
    pub fn query(&self, query_vector: &[f32], top_k: usize) -> Vec<ScoredPair> {
        let state = self.state.read();
        top_k_cosine(&state.matrix, query_vector, top_k)
            .into_iter()
            .map(|scored| ScoredPair {
                pair: state.pairs[scored.row].clone(),
                similarity: scored.score as f64,
            })
            .collect()
    }

    pub fn average_confidence(&self) -> f64 {
        let state = self.state.read();
        if state.pairs.is_empty() {
            return 0.0;
        }
        state.pairs.iter().map(|p| p.confidence).sum::<f64>() / state.pairs.len() as f64
    }

    /// Empty the in-memory state and truncate storage files.
    pub fn truncate(&self) -> Result<usize, ServiceError> {
        let removed = {
            let mut state = self.state.write();
            let removed = state.pairs.len();
            state.pairs.clear();
            state.row_by_id.clear();
            state.matrix.clear();
            removed
        };
        self.persist()?;
        Ok(removed)
    }

    /// Remove the category directory entirely.
    pub fn delete_files(&self) -> Result<bool, ServiceError> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Write pairs.json, vectors.bin and meta.json, each via temp+rename.
    pub fn persist(&self) -> Result<(), ServiceError> {
        let state = self.state.read();

        let file = PairsFile {
            pairs: state
                .pairs
                .iter()
                .enumerate()
                .map(|(row, pair)| {
                    (
                        pair.id.clone(),
                        StoredPair {
                            row,
                            pair: pair.clone(),
                        },
                    )
                })
                .collect(),
        };
        write_json_atomic(&self.dir.join(PAIRS_FILE), &file)?;

        state
            .matrix
            .store(self.dir.join(VECTORS_FILE))
            .map_err(|e| ServiceError::StorageFailure(e.to_string()))?;

        let meta = CategoryMeta {
            pair_count: state.pairs.len(),
            embedding_dim: state.matrix.dim(),
            updated_at: ragstone_core::unix_timestamp(),
        };
        write_json_atomic(&self.dir.join(META_FILE), &meta)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pair(id: &str, question: &str, confidence: f64) -> QaPair {
        QaPair {
            id: id.to_string(),
            question: question.to_string(),
            answer: format!("answer to {question}"),
            category: "tech".to_string(),
            confidence,
            keywords: vec![],
            source: "manual".to_string(),
            created_at: 1.0,
            updated_at: 1.0,
        }
    }

    #[test]
    fn test_append_and_reload() {
        let root = TempDir::new().unwrap();
        let store = CategoryStore::open(root.path(), "tech", 3).unwrap();
        store.append(pair("qa_1", "what is ai", 0.9), &[1.0, 0.0, 0.0]).unwrap();
        store.append(pair("qa_2", "what is ml", 0.8), &[0.0, 1.0, 0.0]).unwrap();
        drop(store);

        let reloaded = CategoryStore::open(root.path(), "tech", 3).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("qa_2").unwrap().question, "what is ml");

        let hits = reloaded.query(&[0.0, 1.0, 0.0], 2);
        assert_eq!(hits[0].pair.id, "qa_2");
        assert!(hits[0].similarity > 0.99);
    }

    #[test]
    fn test_remove_updates_moved_row() {
        let root = TempDir::new().unwrap();
        let store = CategoryStore::open(root.path(), "tech", 2).unwrap();
        store.append(pair("a", "qa", 0.9), &[1.0, 0.0]).unwrap();
        store.append(pair("b", "qb", 0.9), &[0.0, 1.0]).unwrap();
        store.append(pair("c", "qc", 0.9), &[0.6, 0.8]).unwrap();

        assert!(store.remove("a").unwrap());
        assert!(!store.contains("a"));
        // "c" was swapped into row 0 and must still be findable by vector.
        let hits = store.query(&[0.6, 0.8], 1);
        assert_eq!(hits[0].pair.id, "c");
    }

    #[test]
    fn test_remove_unknown_is_false() {
        let root = TempDir::new().unwrap();
        let store = CategoryStore::open(root.path(), "tech", 2).unwrap();
        assert!(!store.remove("ghost").unwrap());
    }

    #[test]
    fn test_dimension_mismatch_on_open_fails_loudly() {
        let root = TempDir::new().unwrap();
        {
            let store = CategoryStore::open(root.path(), "tech", 4).unwrap();
            store
                .append(pair("a", "q", 0.9), &[1.0, 0.0, 0.0, 0.0])
                .unwrap();
        }
        let err = CategoryStore::open(root.path(), "tech", 8).unwrap_err();
        assert!(matches!(err, ServiceError::StorageFailure(_)));
    }

    #[test]
    fn test_replace_with_new_vector() {
        let root = TempDir::new().unwrap();
        let store = CategoryStore::open(root.path(), "tech", 2).unwrap();
        store.append(pair("a", "old question", 0.9), &[1.0, 0.0]).unwrap();

        let mut updated = pair("a", "new question", 0.7);
        updated.answer = "new answer".to_string();
        store.replace(updated, Some(&[0.0, 1.0])).unwrap();

        let hits = store.query(&[0.0, 1.0], 1);
        assert_eq!(hits[0].pair.answer, "new answer");
        assert!(hits[0].similarity > 0.99);
    }

    #[test]
    fn test_truncate_then_delete_files() {
        let root = TempDir::new().unwrap();
        let store = CategoryStore::open(root.path(), "tech", 2).unwrap();
        store.append(pair("a", "q", 0.9), &[1.0, 0.0]).unwrap();

        assert_eq!(store.truncate().unwrap(), 1);
        assert!(store.is_empty());
        assert!(store.delete_files().unwrap());
        assert!(!root.path().join("tech").exists());
        assert!(!store.delete_files().unwrap());
    }
}
