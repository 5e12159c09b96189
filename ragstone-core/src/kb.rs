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

//! Knowledge-base metadata and document status records.

use serde::{Deserialize, Serialize};

/// Per-KB tuning knobs stored in `meta.json` and adjustable through the
/// config-update route. They affect future ingest/retrieval only, never
/// stored documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_auto_update")]
    pub enable_auto_update: bool,
}

fn default_chunk_size() -> usize {
    1024
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_auto_update() -> bool {
    true
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            enable_auto_update: default_auto_update(),
        }
    }
}

/// Partial config update: only supplied fields change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KbConfigPatch {
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub enable_auto_update: Option<bool>,
}

impl KbConfig {
    pub fn apply(&mut self, patch: &KbConfigPatch) {
        if let Some(v) = patch.chunk_size {
            self.chunk_size = v;
        }
        if let Some(v) = patch.chunk_overlap {
            self.chunk_overlap = v;
        }
        if let Some(v) = patch.enable_auto_update {
            self.enable_auto_update = v;
        }
    }
}

/// `meta.json` at the root of a KB working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
    #[serde(default)]
    pub config: KbConfig,
}

fn default_language() -> String {
    "English".to_string()
}

/// Lifecycle of an ingested document, tracked in `kv_store_doc_status.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

/// One entry of `kv_store_doc_status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocStatusEntry {
    pub doc_id: String,
    pub status: DocStatus,
    #[serde(default)]
    pub track_id: Option<String>,
    #[serde(default)]
    pub source_path: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_patch_is_partial() {
        let mut config = KbConfig::default();
        config.apply(&KbConfigPatch {
            chunk_size: Some(512),
            ..Default::default()
        });
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.chunk_overlap, 50);
        assert!(config.enable_auto_update);
    }

    #[test]
    fn test_metadata_defaults_on_deserialize() {
        let meta: KbMetadata = serde_json::from_str(
            r#"{"name": "t1", "created_at": "2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(meta.language, "English");
        assert_eq!(meta.config.chunk_size, 1024);
    }

    #[test]
    fn test_doc_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&DocStatus::Processing).unwrap(),
            "\"processing\""
        );
    }
}
