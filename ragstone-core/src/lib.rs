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

//! Shared data model for the Ragstone service.
//!
//! Everything here is plain data: the error taxonomy, the HTTP response
//! envelope, intent/safety classifications, QA pairs and knowledge-base
//! metadata. No I/O, no async.

pub mod envelope;
pub mod error;
pub mod intent;
pub mod kb;
pub mod qa;

pub use envelope::ApiEnvelope;
pub use error::ServiceError;
pub use intent::{IntentType, SafetyLevel};
pub use kb::{DocStatus, KbConfig, KbMetadata};
pub use qa::{QaPair, QaPairInput};

/// Seconds since the Unix epoch as a float, the timestamp form persisted in
/// QA pair and document records.
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
