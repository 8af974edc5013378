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

//! The language-model processing service, as seen by the orchestrator.
//!
//! Four operations: transcription, classification/summarization,
//! contact-info extraction, and translation to English. The concrete
//! prompt engineering lives behind the HTTP service; here each call is an
//! opaque `process(input) → output`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{check_response, classify_transport_error};
use crate::error::TaskError;

/// The LLM operations the pipeline depends on.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Transcribes an audio file, returning the transcript text.
    async fn transcribe(&self, file_path: &str, language_code: &str)
        -> Result<String, TaskError>;

    /// Classifies and summarizes a grievance description. Returns
    /// `{grievance_summary, grievance_categories}`.
    async fn classify_and_summarize(
        &self,
        description: &str,
        language_code: &str,
        district: Option<&str>,
        province: Option<&str>,
    ) -> Result<Value, TaskError>;

    /// Extracts complainant contact fields from free text. Returns a map
    /// of `complainant_*` fields.
    async fn extract_contact_info(
        &self,
        values: &Value,
        language_code: &str,
        district: Option<&str>,
        province: Option<&str>,
    ) -> Result<Value, TaskError>;

    /// Translates grievance fields to English. Returns
    /// `{grievance_description_en, grievance_summary_en, grievance_categories_en}`.
    async fn translate_to_english(&self, grievance: &Value) -> Result<Value, TaskError>;
}

/// HTTP-backed LLM service client.
pub struct HttpLlmService {
    http: reqwest::Client,
    base_url: String,
}

impl HttpLlmService {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, TaskError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;
        check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| TaskError::Execution(format!("invalid LLM response: {}", e)))
    }
}

#[async_trait]
impl LlmService for HttpLlmService {
    async fn transcribe(
        &self,
        file_path: &str,
        language_code: &str,
    ) -> Result<String, TaskError> {
        let result = self
            .post(
                "/transcribe",
                json!({"file_path": file_path, "language_code": language_code}),
            )
            .await?;
        result
            .get("transcript")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TaskError::Execution("transcription returned no transcript".to_string()))
    }

    async fn classify_and_summarize(
        &self,
        description: &str,
        language_code: &str,
        district: Option<&str>,
        province: Option<&str>,
    ) -> Result<Value, TaskError> {
        self.post(
            "/classify",
            json!({
                "grievance_description": description,
                "language_code": language_code,
                "complainant_district": district,
                "complainant_province": province,
            }),
        )
        .await
    }

    async fn extract_contact_info(
        &self,
        values: &Value,
        language_code: &str,
        district: Option<&str>,
        province: Option<&str>,
    ) -> Result<Value, TaskError> {
        self.post(
            "/extract-contact",
            json!({
                "values": values,
                "language_code": language_code,
                "complainant_district": district,
                "complainant_province": province,
            }),
        )
        .await
    }

    async fn translate_to_english(&self, grievance: &Value) -> Result<Value, TaskError> {
        self.post("/translate", grievance.clone()).await
    }
}

/// Scriptable mock: pops queued responses, or falls back to canned output.
/// Shared across clones so tests can inject failures mid-pipeline.
#[derive(Default)]
pub struct MockLlmService {
    scripted: Mutex<Vec<Result<Value, TaskError>>>,
}

impl MockLlmService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response; queued responses are returned first, in order.
    pub fn push_response(&self, response: Result<Value, TaskError>) {
        self.scripted.lock().push(response);
    }

    fn next_scripted(&self) -> Option<Result<Value, TaskError>> {
        let mut scripted = self.scripted.lock();
        if scripted.is_empty() {
            None
        } else {
            Some(scripted.remove(0))
        }
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn transcribe(
        &self,
        file_path: &str,
        _language_code: &str,
    ) -> Result<String, TaskError> {
        match self.next_scripted() {
            Some(Ok(value)) => Ok(value
                .get("transcript")
                .and_then(Value::as_str)
                .unwrap_or("mock transcript")
                .to_string()),
            Some(Err(e)) => Err(e),
            None => Ok(format!("transcript of {}", file_path)),
        }
    }

    async fn classify_and_summarize(
        &self,
        description: &str,
        _language_code: &str,
        _district: Option<&str>,
        _province: Option<&str>,
    ) -> Result<Value, TaskError> {
        match self.next_scripted() {
            Some(result) => result,
            None => Ok(json!({
                "grievance_summary": format!("summary: {}", description),
                "grievance_categories": ["General"],
            })),
        }
    }

    async fn extract_contact_info(
        &self,
        _values: &Value,
        _language_code: &str,
        _district: Option<&str>,
        _province: Option<&str>,
    ) -> Result<Value, TaskError> {
        match self.next_scripted() {
            Some(result) => result,
            None => Ok(json!({
                "complainant_full_name": "Mock Name",
                "complainant_phone": "+9779800000000",
            })),
        }
    }

    async fn translate_to_english(&self, _grievance: &Value) -> Result<Value, TaskError> {
        match self.next_scripted() {
            Some(result) => result,
            None => Ok(json!({
                "grievance_description_en": "mock translation",
                "grievance_summary_en": "mock summary",
                "grievance_categories_en": "General",
            })),
        }
    }
}
