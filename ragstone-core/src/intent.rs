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

//! Intent and safety classifications.
//!
//! The engine works on these tagged variants; the HTTP layer round-trips
//! them through the string forms below.

use serde::{Deserialize, Serialize};

/// Classified purpose of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    KnowledgeQuery,
    FactualQuestion,
    AnalyticalQuestion,
    ProceduralQuestion,
    CreativeRequest,
    IllegalContent,
    Other,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KnowledgeQuery => "knowledge_query",
            Self::FactualQuestion => "factual_question",
            Self::AnalyticalQuestion => "analytical_question",
            Self::ProceduralQuestion => "procedural_question",
            Self::CreativeRequest => "creative_request",
            Self::IllegalContent => "illegal_content",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "knowledge_query" => Some(Self::KnowledgeQuery),
            "factual_question" => Some(Self::FactualQuestion),
            "analytical_question" => Some(Self::AnalyticalQuestion),
            "procedural_question" => Some(Self::ProceduralQuestion),
            "creative_request" => Some(Self::CreativeRequest),
            "illegal_content" => Some(Self::IllegalContent),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub const ALL: [IntentType; 7] = [
        Self::KnowledgeQuery,
        Self::FactualQuestion,
        Self::AnalyticalQuestion,
        Self::ProceduralQuestion,
        Self::CreativeRequest,
        Self::IllegalContent,
        Self::Other,
    ];
}

/// Classified risk of a query's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Safe,
    Suspicious,
    Unsafe,
    Illegal,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Suspicious => "suspicious",
            Self::Unsafe => "unsafe",
            Self::Illegal => "illegal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "safe" => Some(Self::Safe),
            "suspicious" => Some(Self::Suspicious),
            "unsafe" => Some(Self::Unsafe),
            "illegal" => Some(Self::Illegal),
            _ => None,
        }
    }

    /// Queries at these levels proceed to retrieval; unsafe/illegal are
    /// terminated by the orchestrator.
    pub fn allows_retrieval(&self) -> bool {
        matches!(self, Self::Safe | Self::Suspicious)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_round_trip() {
        for intent in IntentType::ALL {
            assert_eq!(IntentType::parse(intent.as_str()), Some(intent));
        }
        assert_eq!(IntentType::parse("greeting"), None);
    }

    #[test]
    fn test_safety_round_trip() {
        for level in [
            SafetyLevel::Safe,
            SafetyLevel::Suspicious,
            SafetyLevel::Unsafe,
            SafetyLevel::Illegal,
        ] {
            assert_eq!(SafetyLevel::parse(level.as_str()), Some(level));
        }
    }

    #[test]
    fn test_retrieval_gate() {
        assert!(SafetyLevel::Safe.allows_retrieval());
        assert!(SafetyLevel::Suspicious.allows_retrieval());
        assert!(!SafetyLevel::Unsafe.allows_retrieval());
        assert!(!SafetyLevel::Illegal.allows_retrieval());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&IntentType::KnowledgeQuery).unwrap();
        assert_eq!(json, "\"knowledge_query\"");
        let json = serde_json::to_string(&SafetyLevel::Illegal).unwrap();
        assert_eq!(json, "\"illegal\"");
    }
}
