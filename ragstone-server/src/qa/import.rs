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

//! QA import payload parsing.
//!
//! Accepts JSON (an array of records, or an object with a `pairs` array)
//! and CSV with a `question,answer,category[,confidence,keywords,source]`
//! header. Spreadsheet formats are not supported and rejected up front.

use serde::Deserialize;

use ragstone_core::{QaPairInput, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportFormat {
    Json,
    Csv,
}

impl ImportFormat {
    /// Pick a format from the uploaded filename, falling back to content
    /// sniffing for extensionless uploads.
    pub fn detect(filename: &str, body: &[u8]) -> Result<Self, ServiceError> {
        let lower = filename.to_lowercase();
        if lower.ends_with(".json") {
            return Ok(Self::Json);
        }
        if lower.ends_with(".csv") {
            return Ok(Self::Csv);
        }
        if lower.ends_with(".xlsx") || lower.ends_with(".xls") {
            return Err(ServiceError::BadInput(
                "spreadsheet import is not supported; convert to CSV or JSON".into(),
            ));
        }
        match body.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => Ok(Self::Json),
            Some(_) => Ok(Self::Csv),
            None => Err(ServiceError::BadInput("empty import payload".into())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonPayload {
    Wrapped { pairs: Vec<JsonRecord> },
    Bare(Vec<JsonRecord>),
}

#[derive(Debug, Deserialize)]
struct JsonRecord {
    #[serde(default)]
    id: Option<String>,
    question: String,
    answer: String,
    category: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CsvRecord {
    question: String,
    answer: String,
    category: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    keywords: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

fn default_confidence() -> f64 {
    0.9
}

/// Parse an import payload into pair inputs. Structural problems (bad
/// JSON, missing header) fail the whole import; per-record validation
/// happens later so one bad record cannot sink the batch.
pub fn parse_import(format: ImportFormat, body: &[u8]) -> Result<Vec<QaPairInput>, ServiceError> {
    match format {
        ImportFormat::Json => parse_json(body),
        ImportFormat::Csv => parse_csv(body),
    }
}

fn parse_json(body: &[u8]) -> Result<Vec<QaPairInput>, ServiceError> {
    let payload: JsonPayload = serde_json::from_slice(body)
        .map_err(|e| ServiceError::BadInput(format!("invalid JSON import: {e}")))?;
    let records = match payload {
        JsonPayload::Wrapped { pairs } => pairs,
        JsonPayload::Bare(records) => records,
    };
    Ok(records
        .into_iter()
        .map(|r| QaPairInput {
            id: r.id,
            question: r.question,
            answer: r.answer,
            category: r.category,
            confidence: r.confidence,
            keywords: r.keywords,
            source: r.source,
        })
        .collect())
}

fn parse_csv(body: &[u8]) -> Result<Vec<QaPairInput>, ServiceError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(body);

    let mut records = Vec::new();
    for row in reader.deserialize::<CsvRecord>() {
        let record = row.map_err(|e| ServiceError::BadInput(format!("invalid CSV import: {e}")))?;
        records.push(QaPairInput {
            id: None,
            question: record.question,
            answer: record.answer,
            category: record.category,
            confidence: record.confidence,
            keywords: record
                .keywords
                .map(|k| {
                    k.split(';')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            source: record.source,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_by_extension() {
        assert_eq!(
            ImportFormat::detect("qa.json", b"{}").unwrap(),
            ImportFormat::Json
        );
        assert_eq!(
            ImportFormat::detect("qa.csv", b"a,b").unwrap(),
            ImportFormat::Csv
        );
        assert!(ImportFormat::detect("qa.xlsx", b"PK").is_err());
    }

    #[test]
    fn test_detect_by_content() {
        assert_eq!(
            ImportFormat::detect("upload", b"  [{}]").unwrap(),
            ImportFormat::Json
        );
        assert_eq!(
            ImportFormat::detect("upload", b"question,answer").unwrap(),
            ImportFormat::Csv
        );
    }

    #[test]
    fn test_parse_json_array_and_wrapped() {
        let body = br#"[{"question":"q","answer":"a","category":"tech"}]"#;
        let records = parse_import(ImportFormat::Json, body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].confidence, 0.9);

        let body = br#"{"pairs":[{"question":"q","answer":"a","category":"tech","confidence":0.5}]}"#;
        let records = parse_import(ImportFormat::Json, body).unwrap();
        assert_eq!(records[0].confidence, 0.5);
    }

    #[test]
    fn test_parse_csv_with_all_columns() {
        let body = b"question,answer,category,confidence,keywords,source\n\
            \"What is AI?\",\"Artificial intelligence.\",tech,0.95,\"AI;ML\",doc\n";
        let records = parse_import(ImportFormat::Csv, body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].question, "What is AI?");
        assert_eq!(records[0].confidence, 0.95);
        assert_eq!(records[0].keywords, vec!["AI", "ML"]);
        assert_eq!(records[0].source.as_deref(), Some("doc"));
    }

    #[test]
    fn test_parse_csv_minimal_columns() {
        let body = b"question,answer,category\nq1,a1,general\n";
        let records = parse_import(ImportFormat::Csv, body).unwrap();
        assert_eq!(records[0].category, "general");
        assert!(records[0].keywords.is_empty());
    }

    #[test]
    fn test_bad_json_is_bad_input() {
        let err = parse_import(ImportFormat::Json, b"not json").unwrap_err();
        assert!(matches!(err, ServiceError::BadInput(_)));
    }
}
