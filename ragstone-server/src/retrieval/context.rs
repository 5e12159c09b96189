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

//! Context assembly under token budgets.
//!
//! Entities and relations get their own budgets; chunks take the
//! remainder of the total. When a section overflows, its lowest-scoring
//! pieces are dropped first. Token counts are the chars/4 estimate used
//! throughout the prompt path — budgeting needs consistency, not a
//! tokenizer.

/// A candidate context fragment with its retrieval score.
#[derive(Debug, Clone)]
pub struct ContextPiece {
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub max_total_tokens: usize,
    pub max_entity_tokens: usize,
    pub max_relation_tokens: usize,
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Fill one section within `budget` tokens, best scores first.
fn fill_section(mut pieces: Vec<ContextPiece>, budget: usize) -> (Vec<String>, usize) {
    pieces.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut used = 0usize;
    let mut kept = Vec::new();
    for piece in pieces {
        let cost = estimate_tokens(&piece.text);
        if used + cost > budget {
            continue;
        }
        used += cost;
        kept.push(piece.text);
    }
    (kept, used)
}

/// Serialize entities, relations and chunks into one prompt body that
/// fits `budget.max_total_tokens`.
pub fn assemble(
    entities: Vec<ContextPiece>,
    relations: Vec<ContextPiece>,
    chunks: Vec<ContextPiece>,
    budget: ContextBudget,
) -> String {
    let entity_budget = budget.max_entity_tokens.min(budget.max_total_tokens);
    let (entity_lines, entity_used) = fill_section(entities, entity_budget);

    let relation_budget = budget
        .max_relation_tokens
        .min(budget.max_total_tokens.saturating_sub(entity_used));
    let (relation_lines, relation_used) = fill_section(relations, relation_budget);

    let chunk_budget = budget
        .max_total_tokens
        .saturating_sub(entity_used + relation_used);
    let (chunk_lines, _) = fill_section(chunks, chunk_budget);

    let mut sections = Vec::new();
    if !entity_lines.is_empty() {
        sections.push(format!("## Entities\n{}", entity_lines.join("\n")));
    }
    if !relation_lines.is_empty() {
        sections.push(format!("## Relations\n{}", relation_lines.join("\n")));
    }
    if !chunk_lines.is_empty() {
        sections.push(format!("## Passages\n{}", chunk_lines.join("\n---\n")));
    }
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(text: &str, score: f64) -> ContextPiece {
        ContextPiece {
            text: text.to_string(),
            score,
        }
    }

    fn budget(total: usize, entity: usize, relation: usize) -> ContextBudget {
        ContextBudget {
            max_total_tokens: total,
            max_entity_tokens: entity,
            max_relation_tokens: relation,
        }
    }

    #[test]
    fn test_lowest_scores_dropped_first() {
        let chunks = vec![
            piece("best passage with the answer", 0.9),
            piece("weak passage that should be dropped", 0.1),
        ];
        let body = assemble(vec![], vec![], chunks, budget(8, 0, 0));
        assert!(body.contains("best passage"));
        assert!(!body.contains("weak passage"));
    }

    #[test]
    fn test_sections_render_with_headers() {
        let body = assemble(
            vec![piece("ai: concept", 1.0)],
            vec![piece("ai -> science", 1.0)],
            vec![piece("AI is a branch of computer science", 1.0)],
            budget(1000, 100, 100),
        );
        assert!(body.contains("## Entities"));
        assert!(body.contains("## Relations"));
        assert!(body.contains("## Passages"));
    }

    #[test]
    fn test_chunks_take_the_remainder() {
        // Entities consume their section; chunks still fit in what is
        // left of the total.
        let long_entity = "e".repeat(40);
        let body = assemble(
            vec![piece(&long_entity, 1.0)],
            vec![],
            vec![piece("chunk body", 1.0)],
            budget(20, 10, 0),
        );
        assert!(body.contains("chunk body"));
    }

    #[test]
    fn test_empty_inputs_give_empty_body() {
        assert!(assemble(vec![], vec![], vec![], budget(100, 10, 10)).is_empty());
    }

    #[test]
    fn test_token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
