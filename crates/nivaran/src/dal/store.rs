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

//! Database Task Manager — the retroactive persistence core.
//!
//! The pipeline produces entities (a transcription, a translation) as task
//! *results*, and a task row may only reference an entity that exists. The
//! resolution: [`DatabaseTaskManager::handle_db_operation`] upserts the
//! entity first, then creates (first attempt) or updates (retry) the task
//! row and its `task_entities` link, all inside one transaction with
//! ordered statements.
//!
//! The manager never lets an error escape its boundary: failures come back
//! as `{"status": "error", "error": ...}` envelopes and are not retried at
//! this layer — a database failure here indicates a schema or connection
//! problem and surfaces as FAILED.

use serde_json::{json, Map, Value};
use tracing::{error, info};

use super::complainant::upsert_complainant;
use super::grievance::upsert_grievance;
use super::recording::upsert_recording;
use super::task::{
    append_retry, finalize_task, insert_task_row, link_task_entity, set_retry_state,
};
use super::transcription::upsert_transcription;
use super::translation::upsert_translation;
use super::DAL;
use crate::error::StorageError;
use crate::models::task::RetryAttempt;
use crate::task::{EntityKey, TaskStatus};

/// Fields every result envelope must carry to be storable.
const REQUIRED_FIELDS: [&str; 6] = [
    "status",
    "entity_key",
    "id",
    "values",
    "grievance_id",
    "complainant_id",
];

/// A validated, prepared database operation derived from a result envelope.
#[derive(Debug, Clone)]
pub(crate) struct PreparedOperation {
    pub entity_key: EntityKey,
    pub entity_id: String,
    /// Producing task's broker-assigned id; absent envelopes skip the task
    /// row entirely.
    pub task_id: Option<String>,
    pub task_name: String,
    pub operation: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    /// The field set handed to the entity upsert.
    pub values: Map<String, Value>,
    /// Producer retry state carried in the envelope.
    pub retry_count: u32,
    pub retry_history: Vec<RetryAttempt>,
    /// The raw `values` payload, stored as the task row's result.
    pub result_payload: Value,
}

/// Validates an envelope and translates it into the shape the per-entity
/// upsert expects.
///
/// Preparation rules:
/// - the entity id is injected under its own key, so downstream stages see
///   `grievance_id` / `complainant_id` survive into their input;
/// - transcription results rename `values[field_name]` to
///   `automated_transcript` and carry the recording link;
/// - translation results rename `language_code` to `source_language` and
///   fix `translation_method` to `LLM`.
pub(crate) fn prepare_task_result(input: &Value) -> Result<PreparedOperation, StorageError> {
    let envelope = input
        .as_object()
        .ok_or_else(|| StorageError::InvalidEnvelope("task result is not an object".to_string()))?;

    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .iter()
        .filter(|field| {
            !envelope.contains_key(**field) || envelope.get(**field) == Some(&Value::Null)
        })
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(StorageError::MissingFields(missing));
    }

    let raw_key = envelope["entity_key"]
        .as_str()
        .ok_or_else(|| StorageError::InvalidEnvelope("entity_key is not a string".to_string()))?;
    let entity_key: EntityKey = raw_key
        .parse()
        .map_err(|_| StorageError::InvalidEntityKey(raw_key.to_string()))?;

    let entity_id = envelope["id"]
        .as_str()
        .ok_or_else(|| StorageError::InvalidEnvelope("id is not a string".to_string()))?
        .to_string();
    let grievance_id = string_field(envelope, "grievance_id")?;
    let complainant_id = string_field(envelope, "complainant_id")?;

    let mut values = envelope["values"]
        .as_object()
        .cloned()
        .ok_or_else(|| StorageError::InvalidEnvelope("values is not an object".to_string()))?;
    let result_payload = Value::Object(values.clone());

    if let Some(language_code) = envelope.get("language_code").and_then(Value::as_str) {
        values
            .entry("language_code".to_string())
            .or_insert_with(|| Value::String(language_code.to_string()));
    }

    // The entity id travels under its own key so the upsert and the next
    // pipeline stage both see it.
    values.insert(
        entity_key.as_str().to_string(),
        Value::String(entity_id.clone()),
    );
    if !matches!(
        entity_key,
        EntityKey::ComplainantId | EntityKey::GrievanceId
    ) {
        values.insert(
            "grievance_id".to_string(),
            Value::String(grievance_id.clone()),
        );
        values.insert(
            "complainant_id".to_string(),
            Value::String(complainant_id.clone()),
        );
        if let Some(task_id) = envelope.get("task_id").and_then(Value::as_str) {
            values.insert("task_id".to_string(), Value::String(task_id.to_string()));
        }
    }

    match entity_key {
        EntityKey::TranscriptionId => {
            let field_name = envelope
                .get("field_name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    StorageError::InvalidEnvelope(
                        "transcription result missing field_name".to_string(),
                    )
                })?;
            let transcript = values.remove(field_name).ok_or_else(|| {
                StorageError::InvalidEnvelope(format!(
                    "transcription result missing values[{}]",
                    field_name
                ))
            })?;
            values.insert("automated_transcript".to_string(), transcript);
            values.insert(
                "field_name".to_string(),
                Value::String(field_name.to_string()),
            );
            if let Some(recording_id) = envelope.get("recording_id").and_then(Value::as_str) {
                values.insert(
                    "recording_id".to_string(),
                    Value::String(recording_id.to_string()),
                );
            }
        }
        EntityKey::TranslationId => {
            if let Some(source_language) = values.remove("language_code") {
                values.insert("source_language".to_string(), source_language);
            }
            values.insert(
                "translation_method".to_string(),
                Value::String("LLM".to_string()),
            );
        }
        _ => {}
    }

    let status = match envelope["status"].as_str() {
        Some("SUCCESS") => TaskStatus::Success,
        _ => TaskStatus::Failed,
    };
    let error = envelope
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string);
    let retry_count = envelope
        .get("retry_count")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let retry_history: Vec<RetryAttempt> = envelope
        .get("retry_history")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    Ok(PreparedOperation {
        task_name: format!("{}_task", entity_key.operation()),
        operation: entity_key.operation().to_string(),
        entity_key,
        entity_id,
        task_id: envelope
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        status,
        error,
        values,
        retry_count,
        retry_history,
        result_payload,
    })
}

fn string_field(
    envelope: &Map<String, Value>,
    field: &'static str,
) -> Result<String, StorageError> {
    envelope
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StorageError::InvalidEnvelope(format!("{} is not a string", field)))
}

/// The retroactive persistence layer (C5).
#[derive(Clone)]
pub struct DatabaseTaskManager {
    dal: DAL,
}

impl DatabaseTaskManager {
    pub fn new(dal: DAL) -> Self {
        Self { dal }
    }

    pub fn dal(&self) -> &DAL {
        &self.dal
    }

    /// Stores a result envelope: entity upsert, then retroactive task-row
    /// handling, in one transaction.
    ///
    /// `attempt` is the storing task's own broker attempt counter;
    /// `own_retry` the record of the retry that produced this delivery, if
    /// any. Never returns an error — failures are reported in the returned
    /// envelope.
    pub async fn handle_db_operation(
        &self,
        input: Value,
        attempt: u32,
        own_retry: Option<RetryAttempt>,
    ) -> Value {
        match self.try_handle(&input, attempt, own_retry).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Database operation failed");
                json!({"status": "error", "error": e.to_string()})
            }
        }
    }

    async fn try_handle(
        &self,
        input: &Value,
        attempt: u32,
        own_retry: Option<RetryAttempt>,
    ) -> Result<Value, StorageError> {
        let prepared = prepare_task_result(input)?;

        let operation = prepared.operation.clone();
        let entity_key = prepared.entity_key;
        let task_id = prepared.task_id.clone();
        let terminal_retry_count = if attempt > 0 {
            attempt
        } else {
            prepared.retry_count
        };

        let cipher = self.dal.cipher().clone();
        let conn = self.dal.database().get().await?;
        let p = prepared;
        let entity_id = conn
            .interact(move |conn| {
                use diesel::Connection;
                conn.transaction::<_, StorageError, _>(|conn| {
                    // STEP 1: the entity always exists before the task row.
                    let actual_id = match p.entity_key {
                        EntityKey::ComplainantId => {
                            upsert_complainant(conn, &cipher, &p.entity_id, &p.values)?
                        }
                        EntityKey::GrievanceId => {
                            upsert_grievance(conn, &cipher, &p.entity_id, &p.values)?
                        }
                        EntityKey::RecordingId => {
                            upsert_recording(conn, &p.entity_id, &p.values)?
                        }
                        EntityKey::TranscriptionId => {
                            upsert_transcription(conn, &p.entity_id, &p.values)?
                        }
                        EntityKey::TranslationId => {
                            upsert_translation(conn, &p.entity_id, &p.values)?
                        }
                    };

                    // STEP 2: retroactive task-row handling.
                    if let Some(task_id) = &p.task_id {
                        insert_task_row(conn, task_id, &p.task_name)?;
                        if attempt > 0 {
                            let entry = own_retry.clone().unwrap_or_else(|| RetryAttempt {
                                attempt: attempt - 1,
                                error_kind: "Unknown".to_string(),
                                error_message: "re-delivered attempt".to_string(),
                                timestamp: chrono::Utc::now(),
                                next_delay_s: 0.0,
                            });
                            append_retry(conn, task_id, &entry)?;
                        } else if !p.retry_history.is_empty() {
                            // Producer retries happened before this store ran;
                            // persist the accumulated history wholesale.
                            set_retry_state(conn, task_id, &p.retry_history)?;
                        }
                        link_task_entity(conn, task_id, p.entity_key, &actual_id)?;
                        finalize_task(
                            conn,
                            task_id,
                            p.status,
                            Some(&p.result_payload),
                            p.error.as_deref(),
                            terminal_retry_count as i32,
                        )?;
                    }

                    Ok(actual_id)
                })
            })
            .await??;

        info!(
            operation = %operation,
            entity_key = %entity_key,
            entity_id = %entity_id,
            task_id = task_id.as_deref().unwrap_or("-"),
            retry_count = terminal_retry_count,
            "Stored task result"
        );

        Ok(json!({
            "status": "SUCCESS",
            "operation": operation,
            "entity_key": entity_key.as_str(),
            "entity_id": entity_id,
            "task_id": task_id,
            "retry_count": terminal_retry_count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transcription_envelope() -> Value {
        json!({
            "status": "SUCCESS",
            "operation": "transcription",
            "field_name": "grievance_description",
            "values": {"grievance_description": "the road is broken"},
            "language_code": "ne",
            "task_id": "task-abc",
            "entity_key": "transcription_id",
            "id": "TR-20250101-KOJH-AB12-A",
            "grievance_id": "GR-20250101-KOJH-ABCD-A",
            "recording_id": "REC-20250101-KOJH-CD34-A",
            "complainant_id": "CM-20250101-KOJH-EF56-A"
        })
    }

    #[test]
    fn test_missing_required_fields_reported_in_order() {
        let input = json!({
            "status": "SUCCESS",
            "entity_key": "grievance_id",
            "values": {"grievance_summary": "x"}
        });
        let err = prepare_task_result(&input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Task result missing required fields: [\"id\", \"grievance_id\", \"complainant_id\"]"
        );
    }

    #[test]
    fn test_null_fields_count_as_missing() {
        let input = json!({
            "status": "SUCCESS",
            "entity_key": "grievance_id",
            "id": null,
            "values": {},
            "grievance_id": "GR-1-A",
            "complainant_id": "CM-1-A"
        });
        let err = prepare_task_result(&input).unwrap_err();
        assert!(matches!(err, StorageError::MissingFields(fields) if fields == vec!["id"]));
    }

    #[test]
    fn test_unknown_entity_key_rejected() {
        let mut input = transcription_envelope();
        input["entity_key"] = json!("ticket_id");
        let err = prepare_task_result(&input).unwrap_err();
        assert!(matches!(err, StorageError::InvalidEntityKey(k) if k == "ticket_id"));
    }

    #[test]
    fn test_transcription_preparation_renames_transcript() {
        let prepared = prepare_task_result(&transcription_envelope()).unwrap();

        assert_eq!(prepared.entity_key, EntityKey::TranscriptionId);
        assert_eq!(prepared.task_name, "transcription_task");
        assert_eq!(
            prepared.values["automated_transcript"],
            "the road is broken"
        );
        // The original field key is dropped
        assert!(!prepared.values.contains_key("grievance_description"));
        assert_eq!(prepared.values["language_code"], "ne");
        assert_eq!(prepared.values["field_name"], "grievance_description");
        assert_eq!(
            prepared.values["recording_id"],
            "REC-20250101-KOJH-CD34-A"
        );
        // Context ids survive into the next stage's input
        assert_eq!(prepared.values["grievance_id"], "GR-20250101-KOJH-ABCD-A");
        assert_eq!(prepared.values["complainant_id"], "CM-20250101-KOJH-EF56-A");
        assert_eq!(prepared.values["task_id"], "task-abc");
    }

    #[test]
    fn test_translation_preparation_sets_method_and_source() {
        let input = json!({
            "status": "SUCCESS",
            "operation": "translation",
            "values": {
                "grievance_description_en": "the road is broken",
                "grievance_summary_en": "broken road"
            },
            "language_code": "ne",
            "entity_key": "translation_id",
            "id": "TL-20250101-KOJH-AB12-A",
            "task_id": "task-tl",
            "grievance_id": "GR-20250101-KOJH-ABCD-A",
            "complainant_id": "CM-20250101-KOJH-EF56-A"
        });
        let prepared = prepare_task_result(&input).unwrap();

        assert_eq!(prepared.values["source_language"], "ne");
        assert!(!prepared.values.contains_key("language_code"));
        assert_eq!(prepared.values["translation_method"], "LLM");
        assert_eq!(prepared.values["grievance_description_en"], "the road is broken");
    }

    #[test]
    fn test_grievance_preparation_keeps_flat_fields() {
        let input = json!({
            "status": "SUCCESS",
            "operation": "classification",
            "values": {
                "grievance_summary": "broken road",
                "grievance_categories": ["Roads"],
                "grievance_description": "the road is broken",
                "complainant_phone": "+9779812345678"
            },
            "entity_key": "grievance_id",
            "id": "GR-20250101-KOJH-ABCD-A",
            "task_id": "task-cls",
            "grievance_id": "GR-20250101-KOJH-ABCD-A",
            "complainant_id": "CM-20250101-KOJH-EF56-A"
        });
        let prepared = prepare_task_result(&input).unwrap();

        assert_eq!(prepared.task_name, "grievance_task");
        assert_eq!(prepared.values["grievance_id"], "GR-20250101-KOJH-ABCD-A");
        // Grievance envelopes don't get task_id injected into values
        assert!(!prepared.values.contains_key("task_id"));
        assert_eq!(prepared.values["grievance_summary"], "broken road");
    }

    #[test]
    fn test_failed_envelope_prepares_with_error() {
        let mut input = transcription_envelope();
        input["status"] = json!("FAILED");
        input["error"] = json!("transcription service unavailable");
        let prepared = prepare_task_result(&input).unwrap();
        assert_eq!(prepared.status, TaskStatus::Failed);
        assert_eq!(
            prepared.error.as_deref(),
            Some("transcription service unavailable")
        );
    }

    #[test]
    fn test_producer_retry_state_extracted() {
        let mut input = transcription_envelope();
        input["retry_count"] = json!(2);
        input["retry_history"] = json!([
            {
                "attempt": 0,
                "error_kind": "RateLimitError",
                "error_message": "429",
                "timestamp": "2025-01-01T00:00:00Z",
                "next_delay_s": 2.1
            },
            {
                "attempt": 1,
                "error_kind": "RateLimitError",
                "error_message": "429",
                "timestamp": "2025-01-01T00:00:05Z",
                "next_delay_s": 4.4
            }
        ]);
        let prepared = prepare_task_result(&input).unwrap();
        assert_eq!(prepared.retry_count, 2);
        assert_eq!(prepared.retry_history.len(), 2);
        assert_eq!(prepared.retry_history[1].attempt, 1);
    }
}
