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

//! HTTP bridge between workers and the status bus.
//!
//! Workers do not talk to the websocket layer directly: they POST status
//! updates to a short endpoint on the web tier, which derives room and
//! channel and publishes to the bus. This decouples the worker runtime
//! from the socket library and lets any worker process participate.
//!
//! The worker side is [`StatusClient`] (10 s timeout, non-200 logged and
//! non-fatal); the web-tier side is [`router`], an `axum` route mounted at
//! `/task-status`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{derive_channel, room_for, StatusBus, StatusFrame, StatusSink};
use crate::task::TaskStatus;

/// Body of the `POST /task-status` bridge call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusRequest {
    pub status: TaskStatus,
    pub data: Value,
    pub grievance_id: String,
    pub flask_session_id: String,
}

/// Worker-side client for the task-status bridge.
///
/// Delivery is best-effort: the worker must not block a task on frame
/// delivery beyond the short timeout, and failures only produce log lines.
#[derive(Clone)]
pub struct StatusClient {
    http: reqwest::Client,
    endpoint: String,
}

impl StatusClient {
    pub fn new(web_base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build status bridge HTTP client");
        Self {
            http,
            endpoint: format!("{}/task-status", web_base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl StatusSink for StatusClient {
    async fn post_status(
        &self,
        status: TaskStatus,
        data: Value,
        grievance_id: &str,
        session_id: &str,
    ) {
        let body = TaskStatusRequest {
            status,
            data,
            grievance_id: grievance_id.to_string(),
            flask_session_id: session_id.to_string(),
        };

        match self.http.post(&self.endpoint).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(grievance_id, %status, "Status update delivered");
            }
            Ok(response) => {
                warn!(
                    grievance_id,
                    %status,
                    code = response.status().as_u16(),
                    "Status bridge returned non-200"
                );
            }
            Err(e) => {
                warn!(grievance_id, %status, error = %e, "Status bridge call failed");
            }
        }
    }
}

/// Builds the web-tier router serving the bridge endpoint.
pub fn router(bus: Arc<dyn StatusBus>) -> Router {
    Router::new()
        .route("/task-status", post(task_status_update))
        .with_state(bus)
}

async fn task_status_update(
    State(bus): State<Arc<dyn StatusBus>>,
    Json(request): Json<TaskStatusRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(room) = room_for(&request.grievance_id, &request.flask_session_id) else {
        // Bot sessions poll task state instead of subscribing.
        return (StatusCode::OK, Json(json!({"status": "skipped"})));
    };

    let channel = derive_channel(&request.data);
    let task_name = request
        .data
        .get("task_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let frame = StatusFrame {
        task_name,
        status: request.status,
        grievance_id: request.grievance_id.clone(),
        session_id: request.flask_session_id.clone(),
        data: request.data,
        timestamp: Utc::now(),
    };

    match bus.publish(&room, &channel, &frame).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => {
            warn!(room = %room, error = %e, "Bus publish failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "error": e.to_string()})),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryStatusBus;

    #[tokio::test]
    async fn test_bridge_publishes_accessible_frames() {
        let bus = Arc::new(MemoryStatusBus::new());
        let request = TaskStatusRequest {
            status: TaskStatus::Success,
            data: json!({
                "task_name": "transcribe_audio_file_task",
                "operation": "transcription",
                "grievance_description": "text"
            }),
            grievance_id: "GR-20250101-KOJH-ABCD-A".to_string(),
            flask_session_id: "GR-20250101-KOJH-ABCD-A".to_string(),
        };

        let (code, _) = task_status_update(
            State(bus.clone() as Arc<dyn StatusBus>),
            Json(request),
        )
        .await;
        assert_eq!(code, StatusCode::OK);

        let published = bus.published();
        assert_eq!(published.len(), 1);
        let (room, channel, frame) = &published[0];
        assert_eq!(room, "GR-20250101-KOJH-ABCD-A");
        assert_eq!(channel, "status_update:transcription");
        assert_eq!(frame.task_name, "transcribe_audio_file_task");
        assert_eq!(frame.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_bridge_skips_bot_frames() {
        let bus = Arc::new(MemoryStatusBus::new());
        let request = TaskStatusRequest {
            status: TaskStatus::Started,
            data: json!({"task_name": "t"}),
            grievance_id: "GR-20250101-KOJH-ABCD-B".to_string(),
            flask_session_id: "bot-session-7".to_string(),
        };

        let (code, Json(body)) = task_status_update(
            State(bus.clone() as Arc<dyn StatusBus>),
            Json(request),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "skipped");
        assert!(bus.published().is_empty());
    }
}
