/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Opaque external collaborators.
//!
//! The orchestrator models its LLM operations, messaging, and file staging
//! as `process(input) → output` services behind traits. Production
//! implementations call out over HTTP; mock implementations back unit
//! tests. Transport failures are classified into [`TaskError`] kinds so the
//! retry tables apply uniformly.

pub mod files;
pub mod llm;
pub mod messaging;

pub use files::{FileService, LocalFileService, MockFileService};
pub use llm::{HttpLlmService, LlmService, MockLlmService};
pub use messaging::{HttpMessagingService, MessagingService, MockMessagingService};

use crate::error::TaskError;

/// Maps a transport-level failure onto the retryable error taxonomy.
pub(crate) fn classify_transport_error(e: reqwest::Error) -> TaskError {
    if e.is_timeout() {
        TaskError::Timeout(e.to_string())
    } else if e.is_connect() {
        TaskError::Connection(e.to_string())
    } else {
        TaskError::Execution(e.to_string())
    }
}

/// Maps an HTTP response status onto the retryable error taxonomy.
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, TaskError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match status.as_u16() {
        429 => Err(TaskError::RateLimit(format!("{}: {}", status, body))),
        408 | 504 => Err(TaskError::Timeout(format!("{}: {}", status, body))),
        502 | 503 => Err(TaskError::Connection(format!("{}: {}", status, body))),
        _ => Err(TaskError::Execution(format!("{}: {}", status, body))),
    }
}
