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

//! Multi-tenant knowledge-base lifecycle.
//!
//! Creation runs under the keyed lock for the KB name with a
//! double-checked existence test; the "current KB" pointer swaps
//! atomically so in-flight queries finish against the KB they started
//! with, and deletion flags open handles so their next storage call
//! observes not-found.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use ragstone_core::kb::KbConfigPatch;
use ragstone_core::{KbConfig, KbMetadata, ServiceError};

use crate::fsutil::copy_dir_recursive;
use crate::kb::storage::{KbStorage, FULL_DOCS_FILE, GRAPH_FILE, META_FILE};
use crate::locks::{get_or_init, KeyedLocks};

pub const DEFAULT_KB: &str = "default";

#[derive(Debug, Clone, Serialize)]
pub struct KbInfo {
    #[serde(flatten)]
    pub metadata: KbMetadata,
    pub document_count: usize,
    pub chunk_count: usize,
    pub node_count: usize,
    pub edge_count: usize,
    pub size_mb: f64,
    pub status: String,
    pub is_current: bool,
}

pub struct KbManager {
    base_dir: PathBuf,
    dim: usize,
    locks: Arc<KeyedLocks>,
    open_kbs: DashMap<String, Arc<KbStorage>>,
    current: RwLock<String>,
}

impl KbManager {
    /// Open the manager over `base_dir`, creating the default KB when
    /// none exists yet.
    pub async fn open(
        base_dir: PathBuf,
        dim: usize,
        locks: Arc<KeyedLocks>,
    ) -> Result<Self, ServiceError> {
        std::fs::create_dir_all(&base_dir)?;
        let manager = Self {
            base_dir,
            dim,
            locks,
            open_kbs: DashMap::new(),
            current: RwLock::new(DEFAULT_KB.to_string()),
        };
        if !manager.base_dir.join(DEFAULT_KB).is_dir() {
            manager
                .create(DEFAULT_KB, "Default knowledge base", "English", KbConfig::default())
                .await?;
        }
        Ok(manager)
    }

    fn lock_name(name: &str) -> String {
        format!("kb:{name}")
    }

    fn validate_name(name: &str) -> Result<(), ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::BadInput("knowledge base name must not be empty".into()));
        }
        if name.len() > 50 {
            return Err(ServiceError::BadInput(
                "knowledge base name must be at most 50 characters".into(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ServiceError::BadInput(
                "knowledge base name may only contain letters, digits, underscores and dashes"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.base_dir.join(name).is_dir()
    }

    pub fn current_name(&self) -> String {
        self.current.read().clone()
    }

    /// Resolve the KB a request should run against: explicit override or
    /// the ambient current KB.
    pub async fn resolve(&self, requested: Option<&str>) -> Result<Arc<KbStorage>, ServiceError> {
        match requested {
            Some(name) => self.storage(name).await,
            None => {
                let current = self.current_name();
                self.storage(&current).await
            }
        }
    }

    /// Open handle for a KB, created lazily through double-checked init.
    pub async fn storage(&self, name: &str) -> Result<Arc<KbStorage>, ServiceError> {
        Self::validate_name(name)?;
        if !self.exists(name) {
            return Err(ServiceError::NotFound(format!("knowledge base '{name}'")));
        }
        let dir = self.base_dir.join(name);
        let dim = self.dim;
        let owned = name.to_string();
        get_or_init(
            &self.open_kbs,
            name,
            &format!("kb-init:{name}"),
            &self.locks,
            || async move { KbStorage::open(dir, &owned, dim) },
        )
        .await
    }

    pub async fn create(
        &self,
        name: &str,
        description: &str,
        language: &str,
        config: KbConfig,
    ) -> Result<KbInfo, ServiceError> {
        Self::validate_name(name)?;
        let _guard = self.locks.acquire(&Self::lock_name(name), "kb-create").await?;

        // Double-check under the lock: a racing create may have won.
        if self.exists(name) {
            return Err(ServiceError::AlreadyExists(format!("knowledge base '{name}'")));
        }

        let dir = self.base_dir.join(name);
        if let Err(err) = KbStorage::layout(&dir, name, description, language, config, self.dim) {
            // A partial layout must never become visible to readers.
            let _ = std::fs::remove_dir_all(&dir);
            return Err(err);
        }
        tracing::info!("Created knowledge base '{}'", name);
        self.info(name).await
    }

    pub async fn delete(&self, name: &str, force: bool) -> Result<(), ServiceError> {
        Self::validate_name(name)?;
        if name == self.current_name() && !force {
            return Err(ServiceError::BadInput(format!(
                "knowledge base '{name}' is current; pass force=true to delete it"
            )));
        }

        let _guard = self.locks.acquire(&Self::lock_name(name), "kb-delete").await?;
        if !self.exists(name) {
            return Err(ServiceError::NotFound(format!("knowledge base '{name}'")));
        }

        if let Some((_, storage)) = self.open_kbs.remove(name) {
            storage.mark_deleted();
        }
        std::fs::remove_dir_all(self.base_dir.join(name))?;
        tracing::info!("Deleted knowledge base '{}'", name);

        // Deleting the current KB (force) falls back to the default.
        let mut current = self.current.write();
        if *current == name {
            *current = DEFAULT_KB.to_string();
        }
        Ok(())
    }

    /// Atomically repoint the ambient current KB. Queries already running
    /// keep their storage handle and complete against the previous KB.
    pub fn switch_current(&self, name: &str) -> Result<String, ServiceError> {
        Self::validate_name(name)?;
        if !self.exists(name) {
            return Err(ServiceError::NotFound(format!("knowledge base '{name}'")));
        }
        let mut current = self.current.write();
        let previous = std::mem::replace(&mut *current, name.to_string());
        tracing::info!("Switched current knowledge base: {} -> {}", previous, name);
        Ok(previous)
    }

    pub async fn list(&self) -> Result<Vec<KbInfo>, ServiceError> {
        let mut infos = Vec::new();
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        for name in names {
            match self.info(&name).await {
                Ok(info) => infos.push(info),
                Err(err) => tracing::warn!("Skipping unreadable KB '{}': {}", name, err),
            }
        }
        Ok(infos)
    }

    pub async fn info(&self, name: &str) -> Result<KbInfo, ServiceError> {
        let storage = self.storage(name).await?;
        let metadata = storage.metadata()?;
        let graph_stats = storage.graph().stats();
        let dir = self.base_dir.join(name);

        let status = if !dir.join(FULL_DOCS_FILE).exists() || !dir.join(META_FILE).exists() {
            "incomplete"
        } else if dir.join(GRAPH_FILE).exists() && !storage.graph().is_empty() {
            "ready"
        } else if storage.doc_count() > 0 {
            "building"
        } else {
            "ready"
        };

        Ok(KbInfo {
            metadata,
            document_count: storage.doc_count(),
            chunk_count: storage.chunk_count(),
            node_count: graph_stats.node_count,
            edge_count: graph_stats.edge_count,
            size_mb: storage.size_bytes() as f64 / (1024.0 * 1024.0),
            status: status.to_string(),
            is_current: self.current_name() == name,
        })
    }

    pub async fn update_config(
        &self,
        name: &str,
        patch: &KbConfigPatch,
    ) -> Result<KbMetadata, ServiceError> {
        let storage = self.storage(name).await?;
        let _guard = self.locks.acquire(&Self::lock_name(name), "kb-config").await?;
        storage.update_metadata(|meta| meta.config.apply(patch))
    }

    /// Copy the working directory into a timestamped sibling; returns the
    /// backup path.
    pub async fn backup(&self, name: &str) -> Result<PathBuf, ServiceError> {
        Self::validate_name(name)?;
        let _guard = self.locks.acquire(&Self::lock_name(name), "kb-backup").await?;
        if !self.exists(name) {
            return Err(ServiceError::NotFound(format!("knowledge base '{name}'")));
        }

        let stamp = ragstone_core::unix_timestamp() as u64;
        let backup_dir = self.base_dir.join(format!("{name}_backup_{stamp}"));
        copy_dir_recursive(&self.base_dir.join(name), &backup_dir)?;
        tracing::info!("Backed up knowledge base '{}' to {:?}", name, backup_dir);
        Ok(backup_dir)
    }

    /// Replace a KB's working directory from a backup path.
    pub async fn restore(&self, name: &str, backup_path: &PathBuf) -> Result<(), ServiceError> {
        Self::validate_name(name)?;
        if !backup_path.join(META_FILE).exists() {
            return Err(ServiceError::BadInput(format!(
                "{backup_path:?} is not a knowledge base backup (missing {META_FILE})"
            )));
        }

        let _guard = self.locks.acquire(&Self::lock_name(name), "kb-restore").await?;
        if let Some((_, storage)) = self.open_kbs.remove(name) {
            storage.mark_deleted();
        }
        let target = self.base_dir.join(name);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        copy_dir_recursive(backup_path, &target)?;
        tracing::info!("Restored knowledge base '{}' from {:?}", name, backup_path);
        Ok(())
    }
}
