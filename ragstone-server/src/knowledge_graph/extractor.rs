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

//! Lightweight entity/relation extraction for graph construction.
//!
//! Pattern-based: noun-phrase candidates are capitalized token runs plus
//! lowercase terms flagged by "is a"/"part of" copulas; co-occurrence
//! within a sentence becomes a `related_to` edge. Runs after ingest on a
//! background task, so a slow or offline LLM never blocks inserts.

/// One extracted relation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    pub relation: String,
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "this", "that", "these", "those", "it", "its", "in", "on", "of", "and",
    "or", "but", "with", "for", "is", "are", "was", "were", "be", "been", "i", "we", "you",
];

/// Extract relations from one chunk of text.
pub fn extract_relations(text: &str) -> Vec<ExtractedRelation> {
    let mut relations = Vec::new();

    for sentence in text.split(['.', '!', '?', ';', '\n']) {
        let entities = sentence_entities(sentence);

        // Copula patterns give a typed relation.
        let lower = sentence.to_lowercase();
        for (pattern, relation) in [
            (" is a branch of ", "branch_of"),
            (" is a part of ", "part_of"),
            (" is part of ", "part_of"),
            (" is a type of ", "type_of"),
            (" is a ", "is_a"),
            (" belongs to ", "part_of"),
            (" consists of ", "has_part"),
        ] {
            if let Some(pos) = lower.find(pattern) {
                let subject = last_phrase(&lower[..pos]);
                let object = first_phrase(&lower[pos + pattern.len()..]);
                if let (Some(subject), Some(object)) = (subject, object) {
                    relations.push(ExtractedRelation {
                        source: subject,
                        target: object,
                        relation: relation.to_string(),
                    });
                }
            }
        }

        // Co-occurring named entities relate pairwise.
        for i in 0..entities.len() {
            for j in (i + 1)..entities.len() {
                if entities[i] != entities[j] {
                    relations.push(ExtractedRelation {
                        source: entities[i].clone(),
                        target: entities[j].clone(),
                        relation: "related_to".to_string(),
                    });
                }
            }
        }
    }

    relations
}

/// Capitalized token runs in a sentence ("Computer Science", "Rust").
fn sentence_entities(sentence: &str) -> Vec<String> {
    let tokens: Vec<&str> = sentence.split_whitespace().collect();
    let mut entities = Vec::new();
    let mut run: Vec<String> = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        let cleaned: String = token
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-')
            .collect();
        let capitalized = cleaned.chars().next().is_some_and(|c| c.is_uppercase());
        // Sentence-initial capitalization alone is not a signal.
        let informative = capitalized && (i > 0 || cleaned.chars().all(|c| !c.is_lowercase()));

        if informative && !STOPWORDS.contains(&cleaned.to_lowercase().as_str()) {
            run.push(cleaned);
        } else {
            if !run.is_empty() {
                entities.push(run.join(" ").to_lowercase());
            }
            run.clear();
        }
    }
    if !run.is_empty() {
        entities.push(run.join(" ").to_lowercase());
    }

    entities.retain(|e| e.len() > 1);
    entities.dedup();
    entities
}

fn last_phrase(text: &str) -> Option<String> {
    let words: Vec<&str> = text
        .split_whitespace()
        .rev()
        .take_while(|w| !STOPWORDS.contains(&w.to_lowercase().as_str()))
        .collect();
    if words.is_empty() {
        return None;
    }
    let phrase: Vec<&str> = words.into_iter().rev().take(4).collect();
    Some(clean_phrase(&phrase.join(" ")))
}

fn first_phrase(text: &str) -> Option<String> {
    let words: Vec<&str> = text
        .split_whitespace()
        .skip_while(|w| STOPWORDS.contains(&w.to_lowercase().as_str()))
        .take_while(|w| !STOPWORDS.contains(&w.to_lowercase().as_str()))
        .take(4)
        .collect();
    if words.is_empty() {
        return None;
    }
    Some(clean_phrase(&words.join(" ")))
}

fn clean_phrase(phrase: &str) -> String {
    phrase
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copula_relation_extracted() {
        let relations = extract_relations("AI is a branch of computer science.");
        assert!(relations.iter().any(|r| {
            r.relation == "branch_of" && r.source.contains("ai") && r.target == "computer science"
        }));
    }

    #[test]
    fn test_cooccurring_entities_relate() {
        let relations = extract_relations("Both Rust and Python support WebAssembly targets.");
        assert!(relations
            .iter()
            .any(|r| r.relation == "related_to" && r.source == "rust" && r.target == "python"));
    }

    #[test]
    fn test_sentence_initial_word_not_an_entity() {
        let relations = extract_relations("However the weather stayed mild.");
        assert!(relations.is_empty());
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(extract_relations("").is_empty());
        assert!(extract_relations("   \n\n ").is_empty());
    }
}
