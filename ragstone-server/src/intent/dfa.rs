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

//! Deterministic-automaton sensitive-word scanner.
//!
//! The word list builds once into a trie of arena-allocated nodes; text is
//! normalized (lowercase plus digit/symbol substitutions so "b0mb" hits
//! "bomb") and scanned in one pass. Word lists of ~80k entries stay cheap:
//! lookup cost is bounded by the longest word, not the list size.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

#[derive(Clone, Default)]
struct Node {
    children: HashMap<char, usize>,
    terminal: bool,
}

/// One match: char offsets into the normalized text plus the matched word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordMatch {
    pub start: usize,
    pub end: usize,
    pub word: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct DfaAnalysis {
    pub has_sensitive: bool,
    pub sensitive_count: usize,
    pub sensitive_words: Vec<String>,
    pub risk_level: RiskLevel,
    pub filtered_text: String,
}

#[derive(Clone)]
pub struct DfaFilter {
    nodes: Vec<Node>,
    word_count: usize,
    fuzzy_map: HashMap<char, char>,
}

impl DfaFilter {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            word_count: 0,
            fuzzy_map: default_fuzzy_map(),
        }
    }

    pub fn word_count(&self) -> usize {
        self.word_count
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn add_word(&mut self, word: &str) {
        let word = word.trim();
        if word.is_empty() {
            return;
        }
        let normalized = self.normalize(word);
        let mut current = 0usize;
        for c in normalized.chars() {
            current = match self.nodes[current].children.get(&c) {
                Some(&next) => next,
                None => {
                    self.nodes.push(Node::default());
                    let next = self.nodes.len() - 1;
                    self.nodes[current].children.insert(c, next);
                    next
                }
            };
        }
        if !self.nodes[current].terminal {
            self.nodes[current].terminal = true;
            self.word_count += 1;
        }
    }

    pub fn add_words<I: IntoIterator<Item = S>, S: AsRef<str>>(&mut self, words: I) {
        for word in words {
            self.add_word(word.as_ref());
        }
    }

    /// Load newline-separated words; blank lines and `#` comments skipped.
    pub fn load_from_file(&mut self, path: &Path) -> std::io::Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let before = self.word_count;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.add_word(line);
        }
        Ok(self.word_count - before)
    }

    /// Load every `.txt`/`.csv`/`.dat` file in a directory.
    pub fn load_from_dir(&mut self, dir: &Path) -> std::io::Result<usize> {
        let before = self.word_count;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase());
            if path.is_file() && matches!(ext.as_deref(), Some("txt" | "csv" | "dat")) {
                self.load_from_file(&path)?;
            }
        }
        Ok(self.word_count - before)
    }

    fn normalize(&self, text: &str) -> String {
        text.to_lowercase()
            .chars()
            .map(|c| *self.fuzzy_map.get(&c).unwrap_or(&c))
            .collect()
    }

    /// All matches in the normalized text.
    pub fn search(&self, text: &str) -> Vec<WordMatch> {
        if text.is_empty() || self.word_count == 0 {
            return Vec::new();
        }
        let normalized: Vec<char> = self.normalize(text).chars().collect();
        let mut matches = Vec::new();

        for start in 0..normalized.len() {
            let mut current = 0usize;
            let mut pos = start;
            while pos < normalized.len() {
                match self.nodes[current].children.get(&normalized[pos]) {
                    Some(&next) => {
                        current = next;
                        pos += 1;
                        if self.nodes[current].terminal {
                            matches.push(WordMatch {
                                start,
                                end: pos,
                                word: normalized[start..pos].iter().collect(),
                            });
                        }
                    }
                    None => break,
                }
            }
        }
        matches
    }

    pub fn contains_sensitive(&self, text: &str) -> bool {
        !self.search(text).is_empty()
    }

    /// Replace matched spans with `*`.
    pub fn filter_text(&self, text: &str) -> String {
        let matches = self.search(text);
        if matches.is_empty() {
            return text.to_string();
        }
        let mut chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        for m in &matches {
            for slot in chars.iter_mut().take(m.end.min(len)).skip(m.start) {
                *slot = '*';
            }
        }
        chars.into_iter().collect()
    }

    pub fn analyze(&self, text: &str) -> DfaAnalysis {
        let matches = self.search(text);
        let mut words: Vec<String> = matches.iter().map(|m| m.word.clone()).collect();
        words.sort();
        words.dedup();

        let risk_level = match matches.len() {
            0 => RiskLevel::Safe,
            1 => RiskLevel::Low,
            2 => RiskLevel::Medium,
            _ => RiskLevel::High,
        };

        DfaAnalysis {
            has_sensitive: !matches.is_empty(),
            sensitive_count: matches.len(),
            sensitive_words: words,
            risk_level,
            filtered_text: self.filter_text(text),
        }
    }
}

impl Default for DfaFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn default_fuzzy_map() -> HashMap<char, char> {
    [
        ('0', 'o'),
        ('1', 'i'),
        ('3', 'e'),
        ('4', 'a'),
        ('5', 's'),
        ('7', 't'),
        ('8', 'b'),
        ('@', 'a'),
        ('$', 's'),
        ('!', 'i'),
        ('|', 'l'),
        ('+', 't'),
    ]
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(words: &[&str]) -> DfaFilter {
        let mut f = DfaFilter::new();
        f.add_words(words);
        f
    }

    #[test]
    fn test_basic_match() {
        let f = filter(&["bomb", "fraud"]);
        let matches = f.search("how to make a bomb");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].word, "bomb");
    }

    #[test]
    fn test_fuzzy_substitution_matches() {
        let f = filter(&["bomb"]);
        assert!(f.contains_sensitive("how to make a b0mb"));
        assert!(f.contains_sensitive("B0MB"));
    }

    #[test]
    fn test_no_match_on_clean_text() {
        let f = filter(&["bomb"]);
        assert!(!f.contains_sensitive("how to bake a cake"));
    }

    #[test]
    fn test_overlapping_words() {
        let f = filter(&["drug", "drugs"]);
        let matches = f.search("drugs");
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn test_filter_text_masks_matches() {
        let f = filter(&["bomb"]);
        assert_eq!(f.filter_text("a bomb here"), "a **** here");
    }

    #[test]
    fn test_risk_level_scales_with_count() {
        let f = filter(&["bomb", "fraud", "drugs"]);
        assert_eq!(f.analyze("clean").risk_level, RiskLevel::Safe);
        assert_eq!(f.analyze("fraud").risk_level, RiskLevel::Low);
        assert_eq!(f.analyze("fraud and drugs").risk_level, RiskLevel::Medium);
        assert_eq!(
            f.analyze("fraud drugs bomb").risk_level,
            RiskLevel::High
        );
    }

    #[test]
    fn test_duplicate_words_counted_once() {
        let mut f = DfaFilter::new();
        f.add_word("bomb");
        f.add_word("bomb");
        assert_eq!(f.word_count(), 1);
    }

    #[test]
    fn test_load_from_file_skips_comments() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("words.txt");
        std::fs::write(&path, "# comment\nbomb\n\nfraud\n").unwrap();
        let mut f = DfaFilter::new();
        assert_eq!(f.load_from_file(&path).unwrap(), 2);
    }
}
