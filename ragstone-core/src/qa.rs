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

//! QA pair records as persisted in each category's `pairs.json`.

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// One predefined question→answer unit, owned by the QA store of its
/// category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaPair {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub category: String,
    pub confidence: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_source")]
    pub source: String,
    pub created_at: f64,
    pub updated_at: f64,
}

fn default_source() -> String {
    "manual".to_string()
}

/// Incoming pair before id assignment and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaPairInput {
    #[serde(default)]
    pub id: Option<String>,
    pub question: String,
    pub answer: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub source: Option<String>,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_confidence() -> f64 {
    1.0
}

impl QaPairInput {
    /// Rejects empty questions/answers/categories and out-of-range
    /// confidence before any lock is taken or embedding requested.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.question.trim().is_empty() {
            return Err(ServiceError::BadInput("question must not be empty".into()));
        }
        if self.answer.trim().is_empty() {
            return Err(ServiceError::BadInput("answer must not be empty".into()));
        }
        if self.category.trim().is_empty() {
            return Err(ServiceError::BadInput("category must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ServiceError::BadInput(format!(
                "confidence must be within [0.0, 1.0], got {}",
                self.confidence
            )));
        }
        Ok(())
    }

    /// Materialize a pair, minting an id when none was supplied.
    pub fn into_pair(self, default_source: &str) -> QaPair {
        let now = crate::unix_timestamp();
        QaPair {
            id: self
                .id
                .unwrap_or_else(|| format!("qa_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])),
            question: self.question,
            answer: self.answer,
            category: self.category,
            confidence: self.confidence,
            keywords: self.keywords,
            source: self.source.unwrap_or_else(|| default_source.to_string()),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One scored match from a similarity query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaMatch {
    pub qa_id: String,
    pub question: String,
    pub answer: String,
    pub category: String,
    pub confidence: f64,
    pub similarity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(question: &str, confidence: f64) -> QaPairInput {
        QaPairInput {
            id: None,
            question: question.to_string(),
            answer: "because".to_string(),
            category: "general".to_string(),
            confidence,
            keywords: vec![],
            source: None,
        }
    }

    #[test]
    fn test_validate_rejects_empty_question() {
        assert!(input("  ", 0.9).validate().is_err());
        assert!(input("why is the sky blue", 0.9).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_confidence() {
        assert!(input("q", 1.2).validate().is_err());
        assert!(input("q", -0.1).validate().is_err());
        assert!(input("q", 0.0).validate().is_ok());
        assert!(input("q", 1.0).validate().is_ok());
    }

    #[test]
    fn test_into_pair_mints_id_and_source() {
        let pair = input("q", 0.5).into_pair("import");
        assert!(pair.id.starts_with("qa_"));
        assert_eq!(pair.source, "import");
        assert!(pair.created_at > 0.0);
    }

    #[test]
    fn test_supplied_id_is_kept() {
        let mut raw = input("q", 0.5);
        raw.id = Some("qa_custom".to_string());
        assert_eq!(raw.into_pair("manual").id, "qa_custom");
    }
}
