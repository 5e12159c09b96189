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

//! Intent classification and safety gating.
//!
//! The rule path (DFA scan + orientation patterns) always runs and is
//! authoritative whenever the LLM path is disabled, unreachable or
//! returns something unparseable. LLM failures never fail the pipeline.
//!
//! The configuration bundle is copy-on-write: runtime registrations build
//! a new bundle and swap it in; in-flight calls keep the one they read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use ragstone_core::{IntentType, SafetyLevel};

use crate::config::IntentConfig;
use crate::intent::dfa::{DfaFilter, RiskLevel};
use crate::intent::templates;
use crate::llm::{ChatMessage, ChatProvider};

/// Confidence reported when the rule path decided with a pattern match
/// versus without one. The LLM path reports whatever the model returned.
const RULE_CONFIDENCE_MATCHED: f64 = 0.7;
const RULE_CONFIDENCE_DEFAULT: f64 = 0.5;
const RULE_CONFIDENCE_SAFETY: f64 = 0.9;

/// Seed word list used when no vocabulary path is configured. Deployments
/// point `intent_sensitive_vocabulary_path` at their curated lists.
const BUILTIN_SENSITIVE_WORDS: &[&str] = &[
    "bomb",
    "explosive",
    "detonator",
    "gambling",
    "casino rigging",
    "drugs",
    "narcotics",
    "meth",
    "fraud",
    "scam",
    "phishing",
    "counterfeit",
    "weapon",
    "firearm",
    "silencer",
    "poison",
    "malware",
    "ransomware",
    "money laundering",
    "human trafficking",
];

/// Immutable configuration snapshot the engine works from.
pub struct Bundle {
    pub filter: DfaFilter,
    pub educational: Vec<String>,
    pub instructive: Vec<String>,
    pub intent_patterns: Vec<(IntentType, Vec<String>)>,
    pub custom_intent_patterns: Vec<(String, Vec<String>)>,
    pub templates: HashMap<String, String>,
    pub generation: u64,
}

impl Bundle {
    fn builtin(vocabulary_path: Option<&std::path::Path>) -> Self {
        let mut filter = DfaFilter::new();
        match vocabulary_path {
            Some(path) if path.is_dir() => match filter.load_from_dir(path) {
                Ok(count) => tracing::info!("Loaded {} sensitive words from {:?}", count, path),
                Err(e) => tracing::warn!("Failed to load sensitive vocabulary {:?}: {}", path, e),
            },
            Some(path) if path.is_file() => match filter.load_from_file(path) {
                Ok(count) => tracing::info!("Loaded {} sensitive words from {:?}", count, path),
                Err(e) => tracing::warn!("Failed to load sensitive vocabulary {:?}: {}", path, e),
            },
            Some(path) => {
                tracing::warn!("Sensitive vocabulary path does not exist: {:?}", path);
            }
            None => {}
        }
        if filter.word_count() == 0 {
            filter.add_words(BUILTIN_SENSITIVE_WORDS);
            tracing::info!(
                "Using built-in sensitive word seed list ({} words)",
                filter.word_count()
            );
        }

        Self {
            filter,
            educational: templates::educational_patterns(),
            instructive: templates::instructive_patterns(),
            intent_patterns: templates::intent_patterns(),
            custom_intent_patterns: Vec::new(),
            templates: templates::enhancement_templates(),
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeOutcome {
    pub original_query: String,
    pub processed_query: String,
    pub intent_type: String,
    pub safety_level: SafetyLevel,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced_query: Option<String>,
    pub suggestions: Vec<String>,
    pub risk_factors: Vec<String>,
    pub should_reject: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub safety_tips: Vec<String>,
    pub safe_alternatives: Vec<String>,
    pub used_llm: bool,
    pub processing_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyOutcome {
    pub is_safe: bool,
    pub safety_level: SafetyLevel,
    pub risk_factors: Vec<String>,
    pub confidence: f64,
    pub sensitive_words: Vec<String>,
    pub filtered_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub sensitive_word_count: usize,
    pub llm_enabled: bool,
    pub llm_configured: bool,
    pub custom_intent_types: Vec<String>,
    pub config_generation: u64,
}

pub struct IntentEngine {
    bundle: RwLock<Arc<Bundle>>,
    llm: Option<Arc<dyn ChatProvider>>,
    enable_llm: bool,
    confidence_threshold: f64,
}

impl IntentEngine {
    pub fn new(config: &IntentConfig, llm: Option<Arc<dyn ChatProvider>>) -> Self {
        let bundle = Bundle::builtin(config.intent_sensitive_vocabulary_path.as_deref());
        Self {
            bundle: RwLock::new(Arc::new(bundle)),
            llm,
            enable_llm: config.intent_enable_llm,
            confidence_threshold: config.intent_confidence_threshold,
        }
    }

    fn snapshot(&self) -> Arc<Bundle> {
        self.bundle.read().clone()
    }

    /// Full analysis: safety, intent, optional enhancement.
    pub async fn analyze(&self, query: &str, enable_enhancement: bool) -> AnalyzeOutcome {
        let started = Instant::now();
        let bundle = self.snapshot();
        let processed = normalize_query(query);

        // Rule path always runs; it is the fallback truth.
        let rule = rule_analysis(&bundle, &processed);

        let (mut outcome, used_llm) = if self.enable_llm {
            match &self.llm {
                Some(llm) => match llm_analysis(llm.as_ref(), &bundle, &processed).await {
                    Some(llm_result) => (llm_result, true),
                    None => (rule, false),
                },
                None => (rule, false),
            }
        } else {
            (rule, false)
        };

        outcome.original_query = query.to_string();
        outcome.processed_query = processed.clone();
        outcome.used_llm = used_llm;

        if outcome.should_reject {
            outcome.safety_tips = templates::safety_tips(outcome.safety_level);
            outcome.safe_alternatives = templates::safe_alternatives(&processed);
            outcome.enhanced_query = None;
        } else if enable_enhancement {
            if let Some(template) = bundle.templates.get(&outcome.intent_type) {
                outcome.enhanced_query = Some(templates::apply_template(template, &processed));
            }
        }

        if outcome.confidence < self.confidence_threshold && !outcome.should_reject {
            outcome
                .suggestions
                .push("Low classification confidence; consider rephrasing the question".into());
        }

        outcome.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        outcome
    }

    /// Safety check only, rule path.
    pub fn safety_check(&self, content: &str) -> SafetyOutcome {
        let bundle = self.snapshot();
        let processed = normalize_query(content);
        safety_analysis(&bundle, &processed)
    }

    pub fn status(&self) -> EngineStatus {
        let bundle = self.snapshot();
        EngineStatus {
            sensitive_word_count: bundle.filter.word_count(),
            llm_enabled: self.enable_llm,
            llm_configured: self.llm.is_some(),
            custom_intent_types: bundle
                .custom_intent_patterns
                .iter()
                .map(|(name, _)| name.clone())
                .collect(),
            config_generation: bundle.generation,
        }
    }

    /// Register a custom intent type with its match patterns and an
    /// optional enhancement template. Takes effect atomically on the
    /// next call.
    pub fn register_intent(
        &self,
        name: String,
        patterns: Vec<String>,
        template: Option<String>,
    ) {
        self.mutate(|bundle| {
            bundle
                .custom_intent_patterns
                .retain(|(existing, _)| existing != &name);
            bundle.custom_intent_patterns.push((name.clone(), patterns));
            if let Some(template) = template {
                bundle.templates.insert(name.clone(), template);
            }
        });
    }

    /// Add sensitive words to the scanner.
    pub fn add_safety_words(&self, words: Vec<String>) {
        self.mutate(|bundle| bundle.filter.add_words(words));
    }

    /// Replace the enhancement template for an intent label.
    pub fn set_template(&self, intent: String, template: String) {
        self.mutate(|bundle| {
            bundle.templates.insert(intent.clone(), template);
        });
    }

    fn mutate<F: FnOnce(&mut Bundle)>(&self, apply: F) {
        let mut slot = self.bundle.write();
        let current = slot.as_ref();
        let mut next = Bundle {
            filter: current.filter.clone(),
            educational: current.educational.clone(),
            instructive: current.instructive.clone(),
            intent_patterns: current.intent_patterns.clone(),
            custom_intent_patterns: current.custom_intent_patterns.clone(),
            templates: current.templates.clone(),
            generation: current.generation + 1,
        };
        apply(&mut next);
        *slot = Arc::new(next);
    }
}

/// Trim and collapse whitespace; matching copies are lowercased where
/// needed, the original casing is preserved for the LLM path.
fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn safety_analysis(bundle: &Bundle, query: &str) -> SafetyOutcome {
    let analysis = bundle.filter.analyze(query);
    let lower = query.to_lowercase();

    let educational = bundle.educational.iter().any(|p| lower.contains(p.as_str()));
    let instructive = bundle.instructive.iter().any(|p| lower.contains(p.as_str()));
    // An instructive pattern cancels the educational cancellation.
    let educational_effective = educational && !instructive;

    let safety_level = if !analysis.has_sensitive {
        SafetyLevel::Safe
    } else if educational_effective {
        match analysis.risk_level {
            RiskLevel::Safe | RiskLevel::Low => SafetyLevel::Safe,
            _ => SafetyLevel::Suspicious,
        }
    } else {
        match analysis.risk_level {
            RiskLevel::High => SafetyLevel::Illegal,
            RiskLevel::Medium => SafetyLevel::Unsafe,
            _ if instructive => SafetyLevel::Illegal,
            _ => SafetyLevel::Suspicious,
        }
    };

    let mut risk_factors = Vec::new();
    if !analysis.sensitive_words.is_empty() {
        risk_factors.push(format!(
            "sensitive terms detected: {}",
            analysis.sensitive_words.join(", ")
        ));
    }
    if instructive && analysis.has_sensitive {
        risk_factors.push("instructive phrasing around sensitive terms".to_string());
    }

    SafetyOutcome {
        is_safe: safety_level == SafetyLevel::Safe,
        safety_level,
        risk_factors,
        confidence: RULE_CONFIDENCE_SAFETY,
        sensitive_words: analysis.sensitive_words,
        filtered_text: analysis.filtered_text,
    }
}

fn rule_analysis(bundle: &Bundle, query: &str) -> AnalyzeOutcome {
    let safety = safety_analysis(bundle, query);
    let lower = query.to_lowercase();

    let educational = bundle.educational.iter().any(|p| lower.contains(p.as_str()));
    let instructive = bundle.instructive.iter().any(|p| lower.contains(p.as_str()));
    let has_sensitive = !safety.sensitive_words.is_empty();

    // A sensitive match escalates the intent to illegal_content unless an
    // educational pattern cancels it (and nothing instructive cancels the
    // cancellation).
    let escalated = has_sensitive && !(educational && !instructive);

    let (intent_type, confidence, mut suggestions) = if escalated {
        (
            IntentType::IllegalContent.as_str().to_string(),
            RULE_CONFIDENCE_SAFETY,
            Vec::new(),
        )
    } else {
        classify_by_patterns(bundle, &lower)
    };

    let should_reject = !safety.safety_level.allows_retrieval();
    if !should_reject && educational && has_sensitive {
        suggestions.push("Interpreted as a protective/educational question".to_string());
    }

    AnalyzeOutcome {
        original_query: query.to_string(),
        processed_query: query.to_string(),
        intent_type,
        safety_level: safety.safety_level,
        confidence,
        enhanced_query: None,
        suggestions,
        risk_factors: safety.risk_factors.clone(),
        should_reject,
        rejection_reason: should_reject.then(|| {
            format!(
                "query classified {} by the safety gate",
                safety.safety_level.as_str()
            )
        }),
        safety_tips: Vec::new(),
        safe_alternatives: Vec::new(),
        used_llm: false,
        processing_time_ms: 0.0,
    }
}

fn classify_by_patterns(bundle: &Bundle, lower: &str) -> (String, f64, Vec<String>) {
    for (name, patterns) in &bundle.custom_intent_patterns {
        if let Some(hit) = patterns.iter().find(|p| lower.contains(p.as_str())) {
            return (name.clone(), RULE_CONFIDENCE_MATCHED, vec![hit.clone()]);
        }
    }
    for (intent, patterns) in &bundle.intent_patterns {
        if let Some(hit) = patterns.iter().find(|p| lower.contains(p.as_str())) {
            return (
                intent.as_str().to_string(),
                RULE_CONFIDENCE_MATCHED,
                vec![hit.trim().to_string()],
            );
        }
    }
    (
        IntentType::Other.as_str().to_string(),
        RULE_CONFIDENCE_DEFAULT,
        Vec::new(),
    )
}

const ANALYSIS_PROMPT: &str = r#"You are a query analysis expert. Classify the intent and content safety of the query below.

Query: "{query}"

Intent types: knowledge_query, factual_question, analytical_question, procedural_question, creative_request, illegal_content, other.
Safety levels: safe, suspicious, unsafe, illegal.

Treat protective or educational questions ("how to prevent/recognize/report ...") as safe; treat requests for carrying out harmful activity ("how to make/obtain ...") as illegal.

Reply with JSON only:
{"intent_type": "...", "safety_level": "...", "confidence": 0.95, "risk_factors": [], "keywords": []}"#;

async fn llm_analysis(
    llm: &dyn ChatProvider,
    bundle: &Bundle,
    query: &str,
) -> Option<AnalyzeOutcome> {
    let prompt = ANALYSIS_PROMPT.replace("{query}", query);
    let reply = match llm.chat(vec![ChatMessage::user(prompt)]).await {
        Ok(reply) => reply,
        Err(err) => {
            tracing::warn!("LLM intent analysis failed, falling back to rules: {}", err);
            return None;
        }
    };

    let cleaned = strip_reasoning_markup(&reply);
    let parsed: serde_json::Value = match serde_json::from_str(cleaned.trim()) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("Unparseable LLM analysis reply, falling back to rules: {}", err);
            return None;
        }
    };

    let intent_raw = parsed.get("intent_type")?.as_str()?;
    let safety_raw = parsed.get("safety_level")?.as_str()?;

    let known_custom = bundle
        .custom_intent_patterns
        .iter()
        .any(|(name, _)| name == intent_raw);
    let intent_type = if IntentType::parse(intent_raw).is_some() || known_custom {
        intent_raw.to_string()
    } else {
        tracing::warn!("LLM returned unknown intent type '{}', falling back to rules", intent_raw);
        return None;
    };
    let safety_level = SafetyLevel::parse(safety_raw)?;

    let confidence = parsed
        .get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.8)
        .clamp(0.0, 1.0);
    let string_list = |key: &str| -> Vec<String> {
        parsed
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    let should_reject = !safety_level.allows_retrieval();
    Some(AnalyzeOutcome {
        original_query: query.to_string(),
        processed_query: query.to_string(),
        intent_type,
        safety_level,
        confidence,
        enhanced_query: None,
        suggestions: string_list("keywords"),
        risk_factors: string_list("risk_factors"),
        should_reject,
        rejection_reason: should_reject
            .then(|| format!("query classified {} by the safety gate", safety_level.as_str())),
        safety_tips: Vec::new(),
        safe_alternatives: Vec::new(),
        used_llm: true,
        processing_time_ms: 0.0,
    })
}

/// Strip `<think>…</think>` blocks and Markdown code fences from a model
/// reply before JSON parsing.
fn strip_reasoning_markup(reply: &str) -> String {
    let mut text = reply.trim().to_string();
    if let (Some(start), Some(end)) = (text.find("<think>"), text.find("</think>")) {
        if start < end {
            text = format!("{}{}", &text[..start], &text[end + "</think>".len()..]);
        }
    }
    let mut trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        trimmed = rest;
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        trimmed = rest;
    }
    if let Some(rest) = trimmed.strip_suffix("```") {
        trimmed = rest;
    }
    trimmed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> IntentEngine {
        let config: IntentConfig = serde_json::from_str("{}").unwrap();
        IntentEngine::new(&config, None)
    }

    #[tokio::test]
    async fn test_instructive_sensitive_query_is_rejected() {
        let outcome = engine().analyze("how to make a bomb", true).await;
        assert_eq!(outcome.intent_type, "illegal_content");
        assert_eq!(outcome.safety_level, SafetyLevel::Illegal);
        assert!(outcome.should_reject);
        assert!(!outcome.safe_alternatives.is_empty());
        assert!(!outcome.safety_tips.is_empty());
        assert!(outcome.enhanced_query.is_none());
    }

    #[tokio::test]
    async fn test_educational_pattern_cancels_escalation() {
        let outcome = engine()
            .analyze("how to recognize and prevent fraud", true)
            .await;
        assert_ne!(outcome.intent_type, "illegal_content");
        assert!(!outcome.should_reject);
        assert!(outcome.safety_level.allows_retrieval());
    }

    #[tokio::test]
    async fn test_fuzzy_spelling_still_rejected() {
        let outcome = engine().analyze("how to make a b0mb", false).await;
        assert!(outcome.should_reject);
    }

    #[tokio::test]
    async fn test_clean_knowledge_query_enhanced() {
        let outcome = engine().analyze("what is artificial intelligence", true).await;
        assert_eq!(outcome.intent_type, "knowledge_query");
        assert_eq!(outcome.safety_level, SafetyLevel::Safe);
        let enhanced = outcome.enhanced_query.expect("should be enhanced");
        assert!(enhanced.contains("what is artificial intelligence"));
    }

    #[tokio::test]
    async fn test_enhancement_can_be_disabled() {
        let outcome = engine().analyze("what is ai", false).await;
        assert!(outcome.enhanced_query.is_none());
    }

    #[test]
    fn test_safety_check_reports_words_and_filtered_text() {
        let outcome = engine().safety_check("tell me about fraud and drugs");
        assert!(!outcome.is_safe);
        assert_eq!(outcome.safety_level, SafetyLevel::Unsafe);
        assert!(outcome.sensitive_words.contains(&"fraud".to_string()));
        assert!(outcome.filtered_text.contains('*'));
    }

    #[tokio::test]
    async fn test_custom_intent_applies_on_next_call() {
        let engine = engine();
        let before = engine.status().config_generation;
        engine.register_intent(
            "weather_query".to_string(),
            vec!["weather in".to_string()],
            Some("Report the weather for: {query}".to_string()),
        );
        assert_eq!(engine.status().config_generation, before + 1);

        let outcome = engine.analyze("weather in berlin tomorrow", true).await;
        assert_eq!(outcome.intent_type, "weather_query");
        assert!(outcome.enhanced_query.unwrap().starts_with("Report the weather"));
    }

    #[tokio::test]
    async fn test_added_safety_words_take_effect() {
        let engine = engine();
        assert!(!engine.analyze("zorbex protocol", false).await.should_reject);
        engine.add_safety_words(vec!["zorbex".to_string()]);
        let outcome = engine.analyze("how to make a zorbex", false).await;
        assert!(outcome.should_reject);
    }

    #[test]
    fn test_strip_reasoning_markup() {
        let reply = "<think>deliberating</think>```json\n{\"a\": 1}\n```";
        assert_eq!(strip_reasoning_markup(reply), "{\"a\": 1}");
    }

    #[tokio::test]
    async fn test_whitespace_is_normalized() {
        let outcome = engine().analyze("  what   is\tai  ", false).await;
        assert_eq!(outcome.processed_query, "what is ai");
    }
}
