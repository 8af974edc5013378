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

//! The task result envelope.
//!
//! Every task body returns an envelope: the structured result consumed by
//! the persistence layer and handed to downstream pipeline stages. The
//! `values` map is the authoritative data payload; `entity_key` plus `id`
//! tell the persistence layer which table to upsert.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::task::RetryAttempt;

/// The closed set of entity keys a task result may target.
///
/// Each key names the domain table its `values` belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    #[serde(rename = "grievance_id")]
    GrievanceId,
    #[serde(rename = "complainant_id")]
    ComplainantId,
    #[serde(rename = "recording_id")]
    RecordingId,
    #[serde(rename = "transcription_id")]
    TranscriptionId,
    #[serde(rename = "translation_id")]
    TranslationId,
}

impl EntityKey {
    pub const ALL: [EntityKey; 5] = [
        EntityKey::GrievanceId,
        EntityKey::ComplainantId,
        EntityKey::RecordingId,
        EntityKey::TranscriptionId,
        EntityKey::TranslationId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKey::GrievanceId => "grievance_id",
            EntityKey::ComplainantId => "complainant_id",
            EntityKey::RecordingId => "recording_id",
            EntityKey::TranscriptionId => "transcription_id",
            EntityKey::TranslationId => "translation_id",
        }
    }

    /// The id prefix for entities of this key.
    pub fn prefix(&self) -> &'static str {
        match self {
            EntityKey::GrievanceId => "GR",
            EntityKey::ComplainantId => "CM",
            EntityKey::RecordingId => "REC",
            EntityKey::TranscriptionId => "TR",
            EntityKey::TranslationId => "TL",
        }
    }

    /// The operation label derived from the key, used for log events and
    /// specialized status channels.
    pub fn operation(&self) -> &'static str {
        match self {
            EntityKey::GrievanceId => "grievance",
            EntityKey::ComplainantId => "complainant",
            EntityKey::RecordingId => "recording",
            EntityKey::TranscriptionId => "transcription",
            EntityKey::TranslationId => "translation",
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grievance_id" => Ok(EntityKey::GrievanceId),
            "complainant_id" => Ok(EntityKey::ComplainantId),
            "recording_id" => Ok(EntityKey::RecordingId),
            "transcription_id" => Ok(EntityKey::TranscriptionId),
            "translation_id" => Ok(EntityKey::TranslationId),
            other => Err(format!("invalid entity key: {}", other)),
        }
    }
}

/// The structured result returned by a task body.
///
/// Producers build one of these and hand it both back to the worker
/// runtime and forward to `store_result_to_db_task`. Fields that don't
/// apply to an operation are simply omitted; additional operation-specific
/// fields ride in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// SUCCESS, FAILED, or "error" for persistence-layer failures.
    pub status: String,
    /// Operation label: transcription, classification, contact_info,
    /// translation, file_upload, store_result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Which domain table the values belong to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_key: Option<EntityKey>,
    /// Natural id of the target entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Broker-assigned id of the producing task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grievance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complainant_id: Option<String>,
    /// The authoritative data payload: field name → value. Always present
    /// on the wire — the persistence layer treats a missing `values` as an
    /// invalid envelope.
    #[serde(default)]
    pub values: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complainant_province: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complainant_district: Option<String>,
    /// Error descriptor when status is FAILED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The producing task's attempt counter at emission time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// The producing task's accumulated retry records, persisted into its
    /// task row by the store path.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_history: Vec<RetryAttempt>,
    /// Operation-specific extras carried through the pipeline.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskEnvelope {
    /// Serializes the envelope to the JSON value exchanged on the broker.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_key_round_trip() {
        for key in EntityKey::ALL {
            let parsed: EntityKey = key.as_str().parse().unwrap();
            assert_eq!(parsed, key);
        }
        assert!("ticket_id".parse::<EntityKey>().is_err());
    }

    #[test]
    fn test_entity_key_operation() {
        assert_eq!(EntityKey::TranscriptionId.operation(), "transcription");
        assert_eq!(EntityKey::GrievanceId.operation(), "grievance");
    }

    #[test]
    fn test_envelope_serialization() {
        let mut values = Map::new();
        values.insert("grievance_description".to_string(), json!("some text"));

        let envelope = TaskEnvelope {
            status: "SUCCESS".to_string(),
            operation: Some("transcription".to_string()),
            entity_key: Some(EntityKey::TranscriptionId),
            id: Some("TR-20250101-KOJH-AB12-A".to_string()),
            task_id: Some("abc-123".to_string()),
            grievance_id: Some("GR-20250101-KOJH-ABCD-A".to_string()),
            complainant_id: Some("CM-20250101-KOJH-EF34-A".to_string()),
            values,
            language_code: Some("ne".to_string()),
            field_name: Some("grievance_description".to_string()),
            ..Default::default()
        };

        let value = envelope.to_value();
        assert_eq!(value["entity_key"], "transcription_id");
        assert_eq!(value["values"]["grievance_description"], "some text");
        // Unset optional fields are omitted entirely
        assert!(value.get("error").is_none());

        let back: TaskEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back.entity_key, Some(EntityKey::TranscriptionId));
        assert_eq!(back.language_code.as_deref(), Some("ne"));
    }

    #[test]
    fn test_envelope_extra_fields_flatten() {
        let raw = json!({
            "status": "SUCCESS",
            "operation": "file_upload",
            "file_path": "/tmp/a.pdf",
            "chord_id": "xyz"
        });
        let envelope: TaskEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.extra["file_path"], "/tmp/a.pdf");
        assert_eq!(envelope.extra["chord_id"], "xyz");
    }
}
