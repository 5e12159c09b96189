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

//! Fixed-QA matching store.
//!
//! A category-partitioned vector store over `qa_storage_root`: each
//! category is a subdirectory with its own pair map and embedding matrix,
//! lazily opened on first touch through the double-checked init pattern.
//! All access to a category is fenced by the keyed lock carrying its name;
//! multi-category operations take their locks in lexicographic order.

mod category;
mod import;

pub use category::CategoryStore;
pub use import::{parse_import, ImportFormat};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ragstone_core::qa::QaMatch;
use ragstone_core::{QaPair, QaPairInput, ServiceError};

use crate::cache::CacheCoordinator;
use crate::llm::EmbeddingProvider;
use crate::locks::{get_or_init, KeyedLocks, QA_CATEGORY_INIT};

const INDEX_FILE: &str = "index.json";

/// Similarity above which an imported question is considered the same as
/// an existing one.
pub const DUPLICATE_THRESHOLD: f64 = 0.98;

#[derive(Debug, Serialize, Deserialize, Default)]
struct RootIndex {
    categories: Vec<String>,
}

/// Outcome of a similarity query.
#[derive(Debug, Clone, Serialize)]
pub struct QaQueryOutcome {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qa_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    pub best_similarity: f64,
    pub matches: Vec<QaMatch>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryDeleteReport {
    pub deleted_count: usize,
    pub folder_deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchAddOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub question: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QaStatistics {
    pub total_pairs: usize,
    pub categories: BTreeMap<String, usize>,
    pub average_confidence: f64,
    pub similarity_threshold: f64,
    pub vector_dim: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duplicate_skipped: usize,
    pub failed_records: Vec<BatchFailure>,
}

/// Filters for pair listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilter {
    pub category: Option<String>,
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

pub struct QaStore {
    root: PathBuf,
    dim: usize,
    default_similarity: f64,
    embedder: Arc<dyn EmbeddingProvider>,
    caches: Arc<CacheCoordinator>,
    locks: Arc<KeyedLocks>,
    categories: DashMap<String, Arc<CategoryStore>>,
    /// All category names known to exist on disk, loaded or not.
    known: RwLock<std::collections::BTreeSet<String>>,
    /// Global cross-reference: pair id → category name.
    pair_index: DashMap<String, String>,
}

impl QaStore {
    pub fn open(
        root: PathBuf,
        embedder: Arc<dyn EmbeddingProvider>,
        caches: Arc<CacheCoordinator>,
        locks: Arc<KeyedLocks>,
        default_similarity: f64,
    ) -> Result<Self, ServiceError> {
        std::fs::create_dir_all(&root)?;
        let dim = embedder.dimension();

        let index_path = root.join(INDEX_FILE);
        let index: RootIndex = if index_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&index_path)?)?
        } else {
            RootIndex::default()
        };

        let store = Self {
            root,
            dim,
            default_similarity,
            embedder,
            caches,
            locks,
            categories: DashMap::new(),
            known: RwLock::new(index.categories.into_iter().collect()),
            pair_index: DashMap::new(),
        };
        store.write_index()?;
        Ok(store)
    }

    pub fn default_similarity(&self) -> f64 {
        self.default_similarity
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Known category names in lexicographic order.
    pub fn category_names(&self) -> Vec<String> {
        self.known.read().iter().cloned().collect()
    }

    fn lock_name(category: &str) -> String {
        format!("qa:{category}")
    }

    fn validate_category_name(category: &str) -> Result<(), ServiceError> {
        if category.trim().is_empty() {
            return Err(ServiceError::BadInput("category must not be empty".into()));
        }
        if category.contains('/') || category.contains('\\') || category.contains("..") {
            return Err(ServiceError::BadInput(format!(
                "category name '{category}' must not contain path separators"
            )));
        }
        Ok(())
    }

    fn write_index(&self) -> Result<(), ServiceError> {
        let index = RootIndex {
            categories: self.category_names(),
        };
        crate::fsutil::write_json_atomic(&self.root.join(INDEX_FILE), &index)
    }

    /// Open a category that exists (on disk or in the known set),
    /// registering its pairs in the cross-reference. Returns None when it
    /// does not exist anywhere.
    async fn ensure_loaded(&self, category: &str) -> Result<Option<Arc<CategoryStore>>, ServiceError> {
        if let Some(open) = self.categories.get(category) {
            return Ok(Some(open.clone()));
        }
        let exists = self.known.read().contains(category) || self.root.join(category).is_dir();
        if !exists {
            return Ok(None);
        }
        let store = self.open_or_create(category).await?;
        Ok(Some(store))
    }

    /// Double-checked lazy creation of the category storage object. The
    /// global init lock guarantees exactly one storage object per
    /// category even for two concurrent first-writers.
    async fn open_or_create(&self, category: &str) -> Result<Arc<CategoryStore>, ServiceError> {
        let root = self.root.clone();
        let dim = self.dim;
        let name = category.to_string();
        let store = get_or_init(
            &self.categories,
            category,
            QA_CATEGORY_INIT,
            &self.locks,
            || async move { CategoryStore::open(&root, &name, dim) },
        )
        .await?;

        for id in store.pair_ids() {
            self.pair_index.insert(id, category.to_string());
        }
        let newly_known = self.known.write().insert(category.to_string());
        if newly_known {
            self.write_index()?;
        }
        Ok(store)
    }

    async fn ensure_all_loaded(&self) -> Result<Vec<Arc<CategoryStore>>, ServiceError> {
        let mut stores = Vec::new();
        for name in self.category_names() {
            if let Some(store) = self.ensure_loaded(&name).await? {
                stores.push(store);
            }
        }
        Ok(stores)
    }

    /// Embed one question, consulting the vector cache first.
    async fn embed_cached(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        crate::cache::embed_with_cache(&self.caches, self.embedder.as_ref(), text).await
    }

    /// Add one pair. Serializes with every other operation on the same
    /// category; different categories proceed independently.
    pub async fn add(&self, input: QaPairInput) -> Result<String, ServiceError> {
        input.validate()?;
        Self::validate_category_name(&input.category)?;

        let category = input.category.clone();
        let _guard = self.locks.acquire(&Self::lock_name(&category), "qa-add").await?;

        let store = self.open_or_create(&category).await?;
        let pair = input.into_pair("manual");
        let id = pair.id.clone();
        let vector = self.embed_cached(&pair.question).await?;

        store.append(pair, &vector)?;
        self.pair_index.insert(id.clone(), category);
        Ok(id)
    }

    /// Batch add: one multi-lock over every involved category, then
    /// per-pair appends. Each pair succeeds or fails on its own; nothing
    /// is rolled back.
    pub async fn add_batch(&self, inputs: Vec<QaPairInput>) -> Result<BatchAddOutcome, ServiceError> {
        let mut outcome = BatchAddOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        let mut valid: Vec<QaPairInput> = Vec::with_capacity(inputs.len());
        for input in inputs {
            if let Err(err) = input
                .validate()
                .and_then(|_| Self::validate_category_name(&input.category))
            {
                outcome.failed.push(BatchFailure {
                    question: input.question.clone(),
                    reason: err.to_string(),
                });
            } else {
                valid.push(input);
            }
        }

        let lock_names: Vec<String> = valid
            .iter()
            .map(|p| Self::lock_name(&p.category))
            .collect();
        let _guard = self.locks.acquire_many(&lock_names, "qa-add-batch").await?;

        for input in valid {
            let category = input.category.clone();
            let question = input.question.clone();
            let result: Result<String, ServiceError> = async {
                let store = self.open_or_create(&category).await?;
                let pair = input.into_pair("manual");
                let id = pair.id.clone();
                let vector = self.embed_cached(&pair.question).await?;
                store.append(pair, &vector)?;
                self.pair_index.insert(id.clone(), category.clone());
                Ok(id)
            }
            .await;

            match result {
                Ok(id) => outcome.succeeded.push(id),
                Err(err) => outcome.failed.push(BatchFailure {
                    question,
                    reason: err.to_string(),
                }),
            }
        }
        Ok(outcome)
    }

    /// Similarity query. With a category the read fences just that
    /// category; without one it fences every known category, locks taken
    /// in lexicographic order.
    pub async fn query(
        &self,
        question: &str,
        top_k: usize,
        min_similarity: Option<f64>,
        category: Option<&str>,
    ) -> Result<QaQueryOutcome, ServiceError> {
        if question.trim().is_empty() {
            return Err(ServiceError::BadInput("question must not be empty".into()));
        }
        let top_k = top_k.clamp(1, 100);
        let threshold = min_similarity.unwrap_or(self.default_similarity);

        let scope: Vec<Arc<CategoryStore>> = match category {
            Some(name) => match self.ensure_loaded(name).await? {
                Some(store) => vec![store],
                None => Vec::new(),
            },
            None => self.ensure_all_loaded().await?,
        };

        if scope.is_empty() || scope.iter().all(|s| s.is_empty()) {
            return Ok(QaQueryOutcome {
                found: false,
                qa_id: None,
                question: None,
                answer: None,
                category: None,
                confidence: None,
                similarity: None,
                best_similarity: 0.0,
                matches: Vec::new(),
                message: "No QA pairs available".to_string(),
            });
        }

        let vector = self.embed_cached(question).await?;

        let lock_names: Vec<String> = scope
            .iter()
            .map(|s| Self::lock_name(s.name()))
            .collect();
        let _guard = self.locks.acquire_many(&lock_names, "qa-query").await?;

        let mut merged: Vec<category::ScoredPair> = Vec::new();
        for store in &scope {
            merged.extend(store.query(&vector, top_k));
        }

        // Global re-sort: similarity, then confidence, then pair id.
        merged.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.pair
                        .confidence
                        .partial_cmp(&a.pair.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.pair.id.cmp(&b.pair.id))
        });

        let best_similarity = merged.first().map(|m| m.similarity).unwrap_or(0.0);
        let matches: Vec<QaMatch> = merged
            .into_iter()
            .filter(|m| m.similarity >= threshold)
            .take(top_k)
            .map(|m| QaMatch {
                qa_id: m.pair.id,
                question: m.pair.question,
                answer: m.pair.answer,
                category: m.pair.category,
                confidence: m.pair.confidence,
                similarity: m.similarity,
            })
            .collect();

        if let Some(best) = matches.first().cloned() {
            Ok(QaQueryOutcome {
                found: true,
                qa_id: Some(best.qa_id),
                question: Some(best.question),
                answer: Some(best.answer),
                category: Some(best.category),
                confidence: Some(best.confidence),
                similarity: Some(best.similarity),
                best_similarity,
                matches,
                message: "match found".to_string(),
            })
        } else {
            Ok(QaQueryOutcome {
                found: false,
                qa_id: None,
                question: None,
                answer: None,
                category: None,
                confidence: None,
                similarity: None,
                best_similarity,
                matches: Vec::new(),
                message: format!("No QA pair found with similarity >= {threshold}"),
            })
        }
    }

    pub async fn get_pair(&self, pair_id: &str) -> Result<QaPair, ServiceError> {
        self.ensure_all_loaded().await?;
        let category = self
            .pair_index
            .get(pair_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ServiceError::NotFound(format!("QA pair '{pair_id}'")))?;
        let store = self
            .ensure_loaded(&category)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("QA pair '{pair_id}'")))?;
        store
            .get(pair_id)
            .ok_or_else(|| ServiceError::NotFound(format!("QA pair '{pair_id}'")))
    }

    /// Update question/answer/confidence/keywords of an existing pair.
    /// A changed question is re-embedded.
    pub async fn update_pair(&self, pair_id: &str, patch: QaPairPatch) -> Result<QaPair, ServiceError> {
        let mut existing = self.get_pair(pair_id).await?;
        let category = existing.category.clone();
        let _guard = self
            .locks
            .acquire(&Self::lock_name(&category), "qa-update")
            .await?;
        let store = self
            .ensure_loaded(&category)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("QA pair '{pair_id}'")))?;

        let question_changed = patch
            .question
            .as_ref()
            .is_some_and(|q| q != &existing.question);

        if let Some(question) = patch.question {
            if question.trim().is_empty() {
                return Err(ServiceError::BadInput("question must not be empty".into()));
            }
            existing.question = question;
        }
        if let Some(answer) = patch.answer {
            if answer.trim().is_empty() {
                return Err(ServiceError::BadInput("answer must not be empty".into()));
            }
            existing.answer = answer;
        }
        if let Some(confidence) = patch.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(ServiceError::BadInput(format!(
                    "confidence must be within [0.0, 1.0], got {confidence}"
                )));
            }
            existing.confidence = confidence;
        }
        if let Some(keywords) = patch.keywords {
            existing.keywords = keywords;
        }
        existing.updated_at = ragstone_core::unix_timestamp();

        let vector = if question_changed {
            Some(self.embed_cached(&existing.question).await?)
        } else {
            None
        };
        store.replace(existing.clone(), vector.as_deref())?;
        Ok(existing)
    }

    pub async fn delete_pair(&self, pair_id: &str) -> Result<(), ServiceError> {
        let pair = self.get_pair(pair_id).await?;
        let _guard = self
            .locks
            .acquire(&Self::lock_name(&pair.category), "qa-delete")
            .await?;
        let store = self
            .ensure_loaded(&pair.category)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("QA pair '{pair_id}'")))?;
        if !store.remove(pair_id)? {
            return Err(ServiceError::NotFound(format!("QA pair '{pair_id}'")));
        }
        self.pair_index.remove(pair_id);
        Ok(())
    }

    /// Drop a whole category: pairs, cross-references, files, directory.
    pub async fn delete_category(&self, category: &str) -> Result<CategoryDeleteReport, ServiceError> {
        Self::validate_category_name(category)?;
        let _guard = self
            .locks
            .acquire(&Self::lock_name(category), "qa-delete-category")
            .await?;

        // Double-check under the lock: a concurrent delete may have won.
        let loaded = match self.ensure_loaded(category).await {
            Ok(loaded) => loaded,
            Err(err) => {
                // Unreadable storage still gets its directory removed.
                tracing::warn!(category, error = %err, "deleting unreadable category storage");
                None
            }
        };

        let report = match loaded {
            Some(store) => {
                for id in store.pair_ids() {
                    self.pair_index.remove(&id);
                }
                let deleted_count = store.truncate()?;
                let folder_deleted = store.delete_files()?;
                CategoryDeleteReport {
                    deleted_count,
                    folder_deleted,
                }
            }
            None => {
                let dir = self.root.join(category);
                let folder_deleted = if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                    true
                } else {
                    false
                };
                CategoryDeleteReport {
                    deleted_count: 0,
                    folder_deleted,
                }
            }
        };

        self.categories.remove(category);
        self.known.write().remove(category);
        self.write_index()?;
        Ok(report)
    }

    pub async fn list_pairs(&self, filter: &ListFilter) -> Result<Vec<QaPair>, ServiceError> {
        let scope: Vec<Arc<CategoryStore>> = match &filter.category {
            Some(name) => self.ensure_loaded(name).await?.into_iter().collect(),
            None => self.ensure_all_loaded().await?,
        };

        let mut pairs: Vec<QaPair> = scope
            .iter()
            .flat_map(|s| s.pairs())
            .filter(|p| {
                filter
                    .min_confidence
                    .map_or(true, |min| p.confidence >= min)
            })
            .collect();
        pairs.sort_by(|a, b| a.id.cmp(&b.id));

        let limited: Vec<QaPair> = pairs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(limited)
    }

    pub async fn export(&self) -> Result<Vec<QaPair>, ServiceError> {
        self.list_pairs(&ListFilter::default()).await
    }

    pub async fn statistics(&self) -> Result<QaStatistics, ServiceError> {
        let stores = self.ensure_all_loaded().await?;
        let mut categories = BTreeMap::new();
        let mut total = 0usize;
        let mut confidence_sum = 0.0f64;

        for store in &stores {
            let count = store.len();
            total += count;
            confidence_sum += store.average_confidence() * count as f64;
            categories.insert(store.name().to_string(), count);
        }

        Ok(QaStatistics {
            total_pairs: total,
            categories,
            average_confidence: if total > 0 {
                confidence_sum / total as f64
            } else {
                0.0
            },
            similarity_threshold: self.default_similarity,
            vector_dim: self.dim,
        })
    }

    /// Import parsed records. Near-duplicate questions (cosine above
    /// [`DUPLICATE_THRESHOLD`] within the same category) replace the
    /// existing pair when `overwrite_existing`, otherwise they are
    /// skipped and reported.
    pub async fn import_records(
        &self,
        records: Vec<QaPairInput>,
        overwrite_existing: bool,
    ) -> Result<ImportReport, ServiceError> {
        let mut report = ImportReport {
            processed: records.len(),
            succeeded: 0,
            failed: 0,
            duplicate_skipped: 0,
            failed_records: Vec::new(),
        };

        for mut record in records {
            if record.source.is_none() {
                record.source = Some("import".to_string());
            }
            let question = record.question.clone();
            match self.import_one(record, overwrite_existing).await {
                Ok(ImportOutcome::Added | ImportOutcome::Replaced) => report.succeeded += 1,
                Ok(ImportOutcome::DuplicateSkipped) => report.duplicate_skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    report.failed_records.push(BatchFailure {
                        question,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn import_one(
        &self,
        input: QaPairInput,
        overwrite_existing: bool,
    ) -> Result<ImportOutcome, ServiceError> {
        input.validate()?;
        Self::validate_category_name(&input.category)?;

        let category = input.category.clone();
        let _guard = self
            .locks
            .acquire(&Self::lock_name(&category), "qa-import")
            .await?;
        let store = self.open_or_create(&category).await?;

        let vector = self.embed_cached(&input.question).await?;
        let duplicate = store
            .query(&vector, 1)
            .into_iter()
            .next()
            .filter(|m| m.similarity > DUPLICATE_THRESHOLD);

        if let Some(existing) = duplicate {
            if !overwrite_existing {
                return Ok(ImportOutcome::DuplicateSkipped);
            }
            let mut replacement = input.into_pair("import");
            replacement.id = existing.pair.id.clone();
            replacement.created_at = existing.pair.created_at;
            store.replace(replacement, Some(&vector))?;
            return Ok(ImportOutcome::Replaced);
        }

        let pair = input.into_pair("import");
        let id = pair.id.clone();
        store.append(pair, &vector)?;
        self.pair_index.insert(id, category);
        Ok(ImportOutcome::Added)
    }
}

enum ImportOutcome {
    Added,
    Replaced,
    DuplicateSkipped,
}

/// Fields updatable through PUT /qa/pairs/{id}.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QaPairPatch {
    pub question: Option<String>,
    pub answer: Option<String>,
    pub confidence: Option<f64>,
    pub keywords: Option<Vec<String>>,
}

#[cfg(test)]
pub(crate) mod test_util {
    use async_trait::async_trait;

    use ragstone_core::ServiceError;

    use crate::llm::EmbeddingProvider;

    /// Deterministic embedder: a character-trigram bag hashed into the
    /// vector, L2-normalized. Identical text embeds identically; shared
    /// trigrams give proportionally similar vectors.
    pub struct HashEmbedder {
        pub dim: usize,
    }

    impl HashEmbedder {
        pub fn embed_one(&self, text: &str) -> Vec<f32> {
            let mut vector = vec![0.0f32; self.dim];
            let lower = text.to_lowercase();
            let chars: Vec<char> = lower.chars().collect();
            for window in chars.windows(3.min(chars.len().max(1))) {
                let mut hash: u64 = 1469598103934665603;
                for c in window {
                    hash ^= *c as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
                vector[(hash % self.dim as u64) as usize] += 1.0;
            }
            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut vector {
                    *v /= norm;
                }
            }
            vector
        }
    }

    #[async_trait]
    impl EmbeddingProvider for HashEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
            Ok(texts.iter().map(|t| self.embed_one(t)).collect())
        }

        fn dimension(&self) -> usize {
            self.dim
        }

        async fn ping(&self) -> Result<(), ServiceError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::HashEmbedder;
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> QaStore {
        let caches = Arc::new(CacheCoordinator::new(
            true,
            Duration::from_secs(600),
            &BTreeMap::new(),
        ));
        QaStore::open(
            dir.path().to_path_buf(),
            Arc::new(HashEmbedder { dim: 32 }),
            caches,
            Arc::new(KeyedLocks::default()),
            0.98,
        )
        .unwrap()
    }

    fn input(question: &str, category: &str, confidence: f64) -> QaPairInput {
        QaPairInput {
            id: None,
            question: question.to_string(),
            answer: format!("answer: {question}"),
            category: category.to_string(),
            confidence,
            keywords: vec![],
            source: None,
        }
    }

    #[tokio::test]
    async fn test_add_then_exact_query_finds_pair() {
        let dir = TempDir::new().unwrap();
        let qa = store(&dir);

        let id = qa.add(input("What is AI?", "tech", 0.95)).await.unwrap();
        let outcome = qa
            .query("What is AI?", 1, Some(0.7), None)
            .await
            .unwrap();
        assert!(outcome.found);
        assert_eq!(outcome.qa_id.as_deref(), Some(id.as_str()));
        assert!(outcome.similarity.unwrap() > 0.99);
    }

    #[tokio::test]
    async fn test_query_below_threshold_reports_best_similarity() {
        let dir = TempDir::new().unwrap();
        let qa = store(&dir);
        qa.add(input("completely unrelated topic", "misc", 0.9))
            .await
            .unwrap();

        let outcome = qa
            .query("zzzz qqqq xxxx", 1, Some(0.95), None)
            .await
            .unwrap();
        assert!(!outcome.found);
        assert!(outcome.best_similarity < 0.95);
        assert!(outcome.matches.is_empty());
    }

    #[tokio::test]
    async fn test_category_scoped_query() {
        let dir = TempDir::new().unwrap();
        let qa = store(&dir);
        qa.add(input("what is rust", "tech", 0.9)).await.unwrap();
        qa.add(input("what is rust", "cooking", 0.9)).await.unwrap();

        let outcome = qa
            .query("what is rust", 5, Some(0.9), Some("cooking"))
            .await
            .unwrap();
        assert!(outcome.found);
        assert!(outcome.matches.iter().all(|m| m.category == "cooking"));
    }

    #[tokio::test]
    async fn test_tie_break_prefers_higher_confidence_then_smaller_id() {
        let dir = TempDir::new().unwrap();
        let qa = store(&dir);
        let mut a = input("same question", "tech", 0.5);
        a.id = Some("qa_bbb".to_string());
        let mut b = input("same question", "tech", 0.9);
        b.id = Some("qa_ccc".to_string());
        let mut c = input("same question", "tech", 0.9);
        c.id = Some("qa_aaa".to_string());
        for record in [a, b, c] {
            qa.add(record).await.unwrap();
        }

        let outcome = qa.query("same question", 3, Some(0.9), None).await.unwrap();
        let ids: Vec<&str> = outcome.matches.iter().map(|m| m.qa_id.as_str()).collect();
        assert_eq!(ids, vec!["qa_aaa", "qa_ccc", "qa_bbb"]);
    }

    #[tokio::test]
    async fn test_delete_category_round_trip() {
        let dir = TempDir::new().unwrap();
        let qa = store(&dir);
        qa.add(input("q one", "temp", 0.9)).await.unwrap();
        let id = qa.add(input("q two", "temp", 0.9)).await.unwrap();

        let report = qa.delete_category("temp").await.unwrap();
        assert_eq!(report.deleted_count, 2);
        assert!(report.folder_deleted);
        assert!(!dir.path().join("temp").exists());
        assert!(matches!(
            qa.get_pair(&id).await,
            Err(ServiceError::NotFound(_))
        ));

        // A second delete reports an absent folder.
        let report = qa.delete_category("temp").await.unwrap();
        assert_eq!(report.deleted_count, 0);
        assert!(!report.folder_deleted);
    }

    #[tokio::test]
    async fn test_batch_add_partial_success() {
        let dir = TempDir::new().unwrap();
        let qa = store(&dir);
        let records = vec![
            input("valid one", "a", 0.9),
            input("", "a", 0.9),
            input("valid two", "b", 2.0),
            input("valid three", "b", 0.8),
        ];

        let outcome = qa.add_batch(records).await.unwrap();
        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(outcome.failed.len(), 2);

        let stats = qa.statistics().await.unwrap();
        assert_eq!(stats.total_pairs, 2);
        assert_eq!(stats.categories["a"], 1);
        assert_eq!(stats.categories["b"], 1);
    }

    #[tokio::test]
    async fn test_update_pair_reembeds_changed_question() {
        let dir = TempDir::new().unwrap();
        let qa = store(&dir);
        let id = qa.add(input("original question", "tech", 0.9)).await.unwrap();

        qa.update_pair(
            &id,
            QaPairPatch {
                question: Some("a different question entirely".to_string()),
                answer: Some("new answer".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let outcome = qa
            .query("a different question entirely", 1, Some(0.95), None)
            .await
            .unwrap();
        assert!(outcome.found);
        assert_eq!(outcome.answer.as_deref(), Some("new answer"));
    }

    #[tokio::test]
    async fn test_import_skips_then_overwrites_duplicates() {
        let dir = TempDir::new().unwrap();
        let qa = store(&dir);
        qa.add(input("What is AI?", "tech", 0.9)).await.unwrap();

        let report = qa
            .import_records(vec![input("What is AI?", "tech", 0.95)], false)
            .await
            .unwrap();
        assert_eq!(report.duplicate_skipped, 1);
        assert_eq!(report.succeeded, 0);

        let report = qa
            .import_records(vec![input("What is AI?", "tech", 0.95)], true)
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        let stats = qa.statistics().await.unwrap();
        assert_eq!(stats.total_pairs, 1);
    }

    #[tokio::test]
    async fn test_reload_from_disk_preserves_pairs() {
        let dir = TempDir::new().unwrap();
        let id;
        {
            let qa = store(&dir);
            id = qa.add(input("persisted question", "tech", 0.9)).await.unwrap();
        }
        let qa = store(&dir);
        let pair = qa.get_pair(&id).await.unwrap();
        assert_eq!(pair.question, "persisted question");
        assert_eq!(qa.category_names(), vec!["tech"]);
    }

    #[tokio::test]
    async fn test_invalid_category_name_rejected() {
        let dir = TempDir::new().unwrap();
        let qa = store(&dir);
        let err = qa.add(input("q", "../escape", 0.9)).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadInput(_)));
    }
}
