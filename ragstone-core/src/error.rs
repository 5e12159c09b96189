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

//! Service error taxonomy.
//!
//! Every failure a request can surface flows up the pipeline as one of
//! these variants. The HTTP layer maps variants onto status codes and the
//! common envelope; only programmer errors are allowed to panic, and those
//! are caught at the HTTP boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Missing required field, out-of-range parameter, unsupported mode.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Unknown knowledge base, QA pair, category or cache type.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate knowledge base name on create.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The intent engine flagged the input.
    #[error("rejected by safety check: {0}")]
    RejectedBySafety(String),

    /// Quota or minimum-interval violation.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// LLM/embedding/rerank did not answer within budget.
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// LLM/embedding/rerank responded non-2xx or produced unparseable output.
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    /// Disk write failed or a corrupted file was detected.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// A lock acquisition exceeded its budget.
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// Anything unclassified. Logs a full trace at the boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code carried in the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadInput(_) => "bad-input",
            Self::NotFound(_) => "not-found",
            Self::AlreadyExists(_) => "already-exists",
            Self::RejectedBySafety(_) => "rejected-by-safety",
            Self::RateLimited(_) => "rate-limited",
            Self::UpstreamTimeout(_) => "upstream-timeout",
            Self::UpstreamFailure(_) => "upstream-failure",
            Self::StorageFailure(_) => "storage-failure",
            Self::LockTimeout(_) => "internal",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status the variant maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadInput(_) => 400,
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) => 409,
            // Safety rejections are a handled outcome, not a transport error.
            Self::RejectedBySafety(_) => 200,
            Self::RateLimited(_) => 429,
            Self::UpstreamTimeout(_) => 504,
            Self::UpstreamFailure(_) => 502,
            Self::StorageFailure(_) => 500,
            Self::LockTimeout(_) => 500,
            Self::Internal(_) => 500,
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        Self::StorageFailure(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::StorageFailure(format!("corrupt JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ServiceError::BadInput("x".into()).code(), "bad-input");
        assert_eq!(ServiceError::NotFound("x".into()).code(), "not-found");
        assert_eq!(
            ServiceError::AlreadyExists("x".into()).code(),
            "already-exists"
        );
        assert_eq!(ServiceError::RateLimited("x".into()).code(), "rate-limited");
        assert_eq!(
            ServiceError::RejectedBySafety("x".into()).code(),
            "rejected-by-safety"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServiceError::BadInput("x".into()).http_status(), 400);
        assert_eq!(ServiceError::NotFound("x".into()).http_status(), 404);
        assert_eq!(ServiceError::AlreadyExists("x".into()).http_status(), 409);
        assert_eq!(ServiceError::RateLimited("x".into()).http_status(), 429);
        assert_eq!(ServiceError::UpstreamTimeout("x".into()).http_status(), 504);
        assert_eq!(ServiceError::UpstreamFailure("x".into()).http_status(), 502);
    }

    #[test]
    fn test_io_error_is_storage_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ServiceError = io.into();
        assert_eq!(err.code(), "storage-failure");
    }
}
