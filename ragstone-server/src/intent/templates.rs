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

//! Built-in patterns, enhancement templates and safety guidance text.
//! Templates live in code; runtime registrations layer on top of these.

use std::collections::HashMap;

use ragstone_core::{IntentType, SafetyLevel};

/// Signals of a protective/educational question. Checked before the
/// instructive set; an instructive hit cancels the educational reading.
pub fn educational_patterns() -> Vec<String> {
    [
        "how to prevent",
        "how to avoid",
        "how to recognize",
        "how to identify",
        "how to report",
        "how to detect",
        "how to protect",
        "protect against",
        "dangers of",
        "risks of",
        "consequences of",
        "legal consequences",
        "warning signs",
        "is it legal",
        "prevent",
        "recognize",
        "identify",
        "report",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Signals that the asker wants to carry something out.
pub fn instructive_patterns() -> Vec<String> {
    [
        "how to make",
        "how to build",
        "how to create",
        "how to carry out",
        "how to commit",
        "how to obtain",
        "how to buy",
        "where to buy",
        "where to get",
        "step by step",
        "instructions for making",
        "recipe for",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Rule-path intent patterns, first match wins. Ordered so the narrow
/// shapes (procedural, factual) come before the broad knowledge bucket.
pub fn intent_patterns() -> Vec<(IntentType, Vec<String>)> {
    vec![
        (
            IntentType::ProceduralQuestion,
            as_strings(&["how to", "how do i", "how can i", "steps to", "process of", "procedure"]),
        ),
        (
            IntentType::AnalyticalQuestion,
            as_strings(&["why", "compare", "analyze", "analyse", "evaluate", "difference between"]),
        ),
        (
            IntentType::FactualQuestion,
            as_strings(&["who ", "when ", "where ", "how many", "how much", "which year"]),
        ),
        (
            IntentType::CreativeRequest,
            as_strings(&["write a", "write me", "compose", "draft a", "design a", "generate a story", "generate a poem"]),
        ),
        (
            IntentType::KnowledgeQuery,
            as_strings(&["what is", "what are", "define", "definition of", "explain", "introduce", "tell me about"]),
        ),
    ]
}

fn as_strings(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|s| s.to_string()).collect()
}

/// Enhancement templates by intent label. `{query}` is substituted.
pub fn enhancement_templates() -> HashMap<String, String> {
    [
        (
            IntentType::KnowledgeQuery.as_str(),
            "Please provide a comprehensive, well-structured explanation of: {query}",
        ),
        (
            IntentType::FactualQuestion.as_str(),
            "Answer precisely, citing the relevant facts from the knowledge base: {query}",
        ),
        (
            IntentType::AnalyticalQuestion.as_str(),
            "Analyze the following question, covering causes, implications and trade-offs: {query}",
        ),
        (
            IntentType::ProceduralQuestion.as_str(),
            "Describe the process step by step, noting prerequisites and pitfalls: {query}",
        ),
        (
            IntentType::CreativeRequest.as_str(),
            "Complete the following creative request, grounded in the retrieved context: {query}",
        ),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn apply_template(template: &str, query: &str) -> String {
    template.replace("{query}", query)
}

/// Tips shown alongside a safety rejection.
pub fn safety_tips(level: SafetyLevel) -> Vec<String> {
    let mut tips = vec![
        "This service answers knowledge questions; it does not assist with harmful activities."
            .to_string(),
    ];
    match level {
        SafetyLevel::Illegal => tips.push(
            "Requests for guidance on illegal activities are rejected and may be logged.".to_string(),
        ),
        SafetyLevel::Unsafe | SafetyLevel::Suspicious => tips.push(
            "If you are researching this topic for protection or education, rephrase the question that way."
                .to_string(),
        ),
        SafetyLevel::Safe => {}
    }
    tips
}

/// Constructive rephrasings offered instead of a rejected query.
pub fn safe_alternatives(query: &str) -> Vec<String> {
    let topic: String = query.chars().take(60).collect();
    vec![
        format!("What are the risks and dangers related to: {topic}"),
        format!("How can I recognize and protect myself from: {topic}"),
        "What does the law say about this topic?".to_string(),
    ]
}
