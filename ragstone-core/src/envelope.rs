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

//! The common non-streaming response envelope.

use serde::{Deserialize, Serialize};

/// Envelope wrapped around every non-streaming response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// ISO-8601 UTC timestamp of envelope creation.
    pub timestamp: String,
}

impl ApiEnvelope {
    pub fn ok(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error_code: None,
            details: None,
            timestamp: iso8601_now(),
        }
    }

    pub fn ok_empty(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            error_code: None,
            details: None,
            timestamp: iso8601_now(),
        }
    }

    pub fn error(
        message: impl Into<String>,
        error_code: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            error_code: Some(error_code.into()),
            details,
            timestamp: iso8601_now(),
        }
    }
}

/// ISO-8601 UTC timestamp without pulling in a date-time crate: the envelope
/// only needs second precision and UTC.
pub fn iso8601_now() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format_iso8601(secs)
}

fn format_iso8601(unix_secs: u64) -> String {
    // Civil-date conversion (Howard Hinnant's algorithm), days since epoch.
    let days = (unix_secs / 86_400) as i64;
    let secs_of_day = unix_secs % 86_400;
    let (h, m, s) = (secs_of_day / 3600, (secs_of_day % 3600) / 60, secs_of_day % 60);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let mo = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if mo <= 2 { y + 1 } else { y };

    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{m:02}:{s:02}Z")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_envelope_shape() {
        let env = ApiEnvelope::ok("done", serde_json::json!({"n": 1}));
        assert!(env.success);
        assert!(env.error_code.is_none());
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["data"]["n"], 1);
        assert!(json.get("error_code").is_none());
    }

    #[test]
    fn test_error_envelope_carries_code() {
        let env = ApiEnvelope::error("nope", "bad-input", None);
        assert!(!env.success);
        assert_eq!(env.error_code.as_deref(), Some("bad-input"));
    }

    #[test]
    fn test_iso8601_known_instant() {
        // 2024-01-15T10:30:00Z
        assert_eq!(format_iso8601(1_705_314_600), "2024-01-15T10:30:00Z");
        assert_eq!(format_iso8601(0), "1970-01-01T00:00:00Z");
    }
}
