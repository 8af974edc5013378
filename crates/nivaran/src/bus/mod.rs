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

//! # Status Bus
//!
//! Publish/subscribe fan-out of task status frames to connected clients,
//! keyed by a *room* identifier. The bus is backed by a shared Redis
//! message queue so that a worker in any process can reach a client
//! attached to any web server.
//!
//! Routing rule: the trailing letter of the grievance id selects the
//! intake source. Accessible sessions (`-A`) receive frames on the room
//! named by the grievance id; for bot sessions (`-B`) the conversational
//! runtime polls task state by other means and the bus call is skipped.
//!
//! Channel derivation: frames go out on `status_update`, or on the
//! specialized `status_update:{operation}` channel when the frame's data
//! names an operation (or carries a field recognizably belonging to one).
//! Exactly one channel is used per frame.
//!
//! Delivery is best-effort and at-least-once within a session; clients
//! must tolerate duplicates. Frames published to rooms nobody has joined
//! are dropped silently.

mod http;
mod redis_bus;

pub use http::{router, StatusClient, TaskStatusRequest};
pub use redis_bus::{run_subscriber, RedisStatusBus, RoomRegistry};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BusError;
use crate::task::{Source, TaskStatus};

/// Default bus channel for frames with no recognizable operation.
pub const DEFAULT_CHANNEL: &str = "status_update";

/// A single published status message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFrame {
    pub task_name: String,
    pub status: TaskStatus,
    pub grievance_id: String,
    pub session_id: String,
    /// Operation-specific payload: values produced, or an error descriptor.
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Computes the room a frame should be published to, applying the source
/// routing rule. Returns `None` for bot sessions, whose frames are skipped.
pub fn room_for(grievance_id: &str, _session_id: &str) -> Option<String> {
    match Source::of_id(grievance_id) {
        Source::Accessible => Some(grievance_id.to_string()),
        Source::Bot => None,
    }
}

/// Maps a data field name to the operation whose channel should carry it.
pub fn operation_for_field(field: &str) -> Option<&'static str> {
    match field {
        "file_data" | "file_path" | "file_name" | "success_count" | "failed_count" => {
            Some("file_upload")
        }
        "grievance_description" => Some("transcription"),
        "grievance_summary" | "grievance_categories" => Some("classification"),
        "grievance_description_en" | "grievance_summary_en" | "grievance_categories_en" => {
            Some("translation")
        }
        f if f.starts_with("complainant_") => Some("contact_info"),
        _ => None,
    }
}

/// Derives the channel for a frame: the specialized channel when the data
/// names an operation or carries a recognized field, else the default.
pub fn derive_channel(data: &Value) -> String {
    if let Some(operation) = data.get("operation").and_then(Value::as_str) {
        return format!("{}:{}", DEFAULT_CHANNEL, operation);
    }
    if let Some(object) = data.as_object() {
        for field in object.keys() {
            if let Some(operation) = operation_for_field(field) {
                return format!("{}:{}", DEFAULT_CHANNEL, operation);
            }
        }
    }
    DEFAULT_CHANNEL.to_string()
}

/// The publish side of the status bus.
#[async_trait]
pub trait StatusBus: Send + Sync {
    /// Publishes a frame to a room on a channel.
    async fn publish(
        &self,
        room: &str,
        channel: &str,
        frame: &StatusFrame,
    ) -> Result<(), BusError>;
}

/// The worker-side emission seam: how a task attempt gets its frames onto
/// the bus. Production uses the HTTP bridge ([`StatusClient`]); tests use
/// [`MemoryStatusSink`].
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Emits one status update. Best-effort: failures are logged by the
    /// implementation, never surfaced to the task.
    async fn post_status(
        &self,
        status: TaskStatus,
        data: Value,
        grievance_id: &str,
        session_id: &str,
    );
}

/// Recording sink for tests: captures everything a lifecycle emits.
#[derive(Default)]
pub struct MemoryStatusSink {
    frames: Mutex<Vec<StatusFrame>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<StatusFrame> {
        self.frames.lock().clone()
    }

    /// The emitted statuses, in order.
    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.frames.lock().iter().map(|f| f.status).collect()
    }
}

#[async_trait]
impl StatusSink for MemoryStatusSink {
    async fn post_status(
        &self,
        status: TaskStatus,
        data: Value,
        grievance_id: &str,
        session_id: &str,
    ) {
        let task_name = data
            .get("task_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.frames.lock().push(StatusFrame {
            task_name,
            status,
            grievance_id: grievance_id.to_string(),
            session_id: session_id.to_string(),
            data,
            timestamp: Utc::now(),
        });
    }
}

/// Recording bus for tests of the web-tier bridge.
#[derive(Default)]
pub struct MemoryStatusBus {
    published: Mutex<Vec<(String, String, StatusFrame)>>,
}

impl MemoryStatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, String, StatusFrame)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl StatusBus for MemoryStatusBus {
    async fn publish(
        &self,
        room: &str,
        channel: &str,
        frame: &StatusFrame,
    ) -> Result<(), BusError> {
        self.published
            .lock()
            .push((room.to_string(), channel.to_string(), frame.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_routing_by_source() {
        assert_eq!(
            room_for("GR-20250101-KOJH-ABCD-A", "sess-1"),
            Some("GR-20250101-KOJH-ABCD-A".to_string())
        );
        // Bot sessions are skipped entirely
        assert_eq!(room_for("GR-20250101-KOJH-ABCD-B", "sess-1"), None);
        assert_eq!(room_for("no-suffix", "sess-1"), None);
    }

    #[test]
    fn test_channel_from_operation() {
        let data = json!({"operation": "classification", "grievance_summary": "x"});
        assert_eq!(derive_channel(&data), "status_update:classification");
    }

    #[test]
    fn test_channel_from_recognized_field() {
        assert_eq!(
            derive_channel(&json!({"grievance_description": "text"})),
            "status_update:transcription"
        );
        assert_eq!(
            derive_channel(&json!({"complainant_phone": "+977..."})),
            "status_update:contact_info"
        );
        assert_eq!(
            derive_channel(&json!({"grievance_summary_en": "text"})),
            "status_update:translation"
        );
    }

    #[test]
    fn test_channel_defaults_when_unrecognized() {
        assert_eq!(derive_channel(&json!({"note": "hello"})), "status_update");
        assert_eq!(derive_channel(&json!("not an object")), "status_update");
    }

    #[test]
    fn test_single_channel_per_frame() {
        // Operation wins over field inference; only one channel results.
        let data = json!({"operation": "store_result", "grievance_description": "text"});
        assert_eq!(derive_channel(&data), "status_update:store_result");
    }

    #[test]
    fn test_frame_serialization_round_trip() {
        let frame = StatusFrame {
            task_name: "transcribe_audio_file_task".to_string(),
            status: TaskStatus::Success,
            grievance_id: "GR-20250101-KOJH-ABCD-A".to_string(),
            session_id: "GR-20250101-KOJH-ABCD-A".to_string(),
            data: json!({"grievance_description": "text"}),
            timestamp: Utc::now(),
        };
        let raw = serde_json::to_string(&frame).unwrap();
        assert!(raw.contains("\"SUCCESS\""));
        let back: StatusFrame = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.status, TaskStatus::Success);
        assert_eq!(back.grievance_id, frame.grievance_id);
    }
}
