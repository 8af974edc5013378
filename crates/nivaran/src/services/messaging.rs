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

//! Outbound messaging (email/SMS), as seen by the orchestrator.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{check_response, classify_transport_error};
use crate::error::TaskError;

/// Email and SMS delivery.
#[async_trait]
pub trait MessagingService: Send + Sync {
    async fn send_sms(&self, phone_number: &str, message: &str) -> Result<Value, TaskError>;

    async fn send_email(
        &self,
        to_emails: &[String],
        subject: &str,
        body: &str,
    ) -> Result<Value, TaskError>;
}

/// HTTP-backed messaging client.
pub struct HttpMessagingService {
    http: reqwest::Client,
    base_url: String,
}

impl HttpMessagingService {
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
            .map_err(|e| TaskError::Execution(format!("invalid messaging response: {}", e)))
    }
}

#[async_trait]
impl MessagingService for HttpMessagingService {
    async fn send_sms(&self, phone_number: &str, message: &str) -> Result<Value, TaskError> {
        self.post(
            "/sms",
            json!({"phone_number": phone_number, "message": message}),
        )
        .await
    }

    async fn send_email(
        &self,
        to_emails: &[String],
        subject: &str,
        body: &str,
    ) -> Result<Value, TaskError> {
        self.post(
            "/email",
            json!({"to_emails": to_emails, "subject": subject, "body": body}),
        )
        .await
    }
}

/// Recording mock for tests.
#[derive(Default)]
pub struct MockMessagingService {
    sent: Mutex<Vec<Value>>,
    fail_next: Mutex<Option<TaskError>>,
}

impl MockMessagingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: TaskError) {
        *self.fail_next.lock() = Some(error);
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    fn record(&self, entry: Value) -> Result<Value, TaskError> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        self.sent.lock().push(entry);
        Ok(json!({"delivered": true}))
    }
}

#[async_trait]
impl MessagingService for MockMessagingService {
    async fn send_sms(&self, phone_number: &str, message: &str) -> Result<Value, TaskError> {
        self.record(json!({"kind": "sms", "to": phone_number, "message": message}))
    }

    async fn send_email(
        &self,
        to_emails: &[String],
        subject: &str,
        body: &str,
    ) -> Result<Value, TaskError> {
        self.record(json!({"kind": "email", "to": to_emails, "subject": subject, "body": body}))
    }
}
