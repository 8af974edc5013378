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

//! Task Lifecycle Manager.
//!
//! Drives the per-attempt state machine: STARTED before the body runs,
//! then exactly one of SUCCESS, FAILED, or RETRYING after it resolves.
//! Lifecycle calls log the transition and publish a status frame through
//! the worker's status sink; **none of them write to the database** — the
//! target entity may not exist yet, and all terminal persistence flows
//! through the store task.
//!
//! Frame addressing requires a grievance id and session id. `start_task`
//! retains them, so failure and retry paths triggered by the runtime can
//! still address their frames after the body bailed out early.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::bus::StatusSink;
use crate::error::TaskError;
use crate::models::task::RetryAttempt;
use crate::task::{EntityKey, TaskStatus};

#[derive(Default)]
struct LifecycleState {
    addressing: Option<(String, String)>,
    started: bool,
    resolution: Option<TaskStatus>,
}

/// Per-attempt lifecycle manager.
pub struct TaskLifecycle {
    task_id: String,
    task_name: String,
    service: &'static str,
    attempt: u32,
    emit_frames: bool,
    sink: Arc<dyn StatusSink>,
    state: Mutex<LifecycleState>,
}

impl TaskLifecycle {
    pub fn new(
        task_id: String,
        task_name: String,
        service: &'static str,
        attempt: u32,
        emit_frames: bool,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            task_id,
            task_name,
            service,
            attempt,
            emit_frames,
            sink,
            state: Mutex::new(LifecycleState::default()),
        }
    }

    /// The terminal resolution of this attempt, once one was recorded.
    pub fn resolution(&self) -> Option<TaskStatus> {
        self.state.lock().resolution
    }

    /// The frame addressing captured by `start_task`.
    pub fn addressing(&self) -> Option<(String, String)> {
        self.state.lock().addressing.clone()
    }

    /// Marks the attempt started: logs and publishes a STARTED frame.
    /// Performs no database writes — the entity may not exist yet.
    pub async fn start_task(
        &self,
        entity_key: EntityKey,
        entity_id: &str,
        grievance_id: &str,
        session_id: &str,
        extra: Option<Value>,
    ) {
        if grievance_id.is_empty() {
            error!(
                service = self.service,
                task = %self.task_name,
                "grievance_id is required for all tasks"
            );
            return;
        }

        {
            let mut state = self.state.lock();
            state.addressing = Some((grievance_id.to_string(), session_id.to_string()));
            state.started = true;
        }

        let is_retry = self.attempt > 0;
        info!(
            service = self.service,
            task = %self.task_name,
            task_id = %self.task_id,
            attempt = self.attempt,
            entity_key = %entity_key,
            entity_id,
            grievance_id,
            "Task state change: -> STARTED{}",
            if is_retry { " (retry)" } else { "" }
        );
        metrics::counter!("nivaran_tasks_started", "service" => self.service).increment(1);

        if self.emit_frames {
            let mut data = Map::new();
            data.insert("task_name".to_string(), json!(self.task_name));
            if is_retry {
                data.insert("retry_count".to_string(), json!(self.attempt));
            }
            if let Some(Value::Object(extra)) = extra {
                data.extend(extra);
            }
            self.sink
                .post_status(TaskStatus::Started, Value::Object(data), grievance_id, session_id)
                .await;
        }
    }

    /// Marks the attempt succeeded: logs and publishes a SUCCESS frame
    /// carrying the produced values.
    pub async fn complete_task(&self, result: &Value, grievance_id: &str, session_id: &str) {
        if !self.resolve(TaskStatus::Success) {
            return;
        }

        info!(
            service = self.service,
            task = %self.task_name,
            task_id = %self.task_id,
            attempt = self.attempt,
            grievance_id,
            "Task state change: STARTED -> SUCCESS"
        );
        metrics::counter!("nivaran_tasks_succeeded", "service" => self.service).increment(1);

        if self.emit_frames {
            let data = Self::frame_data(&self.task_name, result.clone());
            self.sink
                .post_status(TaskStatus::Success, data, grievance_id, session_id)
                .await;
        }
    }

    /// Marks the attempt failed: logs and publishes a FAILED frame. Falls
    /// back to the addressing captured at start when none is given.
    pub async fn fail_task(
        &self,
        error_message: &str,
        grievance_id: Option<&str>,
        session_id: Option<&str>,
    ) {
        if !self.resolve(TaskStatus::Failed) {
            return;
        }

        error!(
            service = self.service,
            task = %self.task_name,
            task_id = %self.task_id,
            attempt = self.attempt,
            error = error_message,
            "Task state change: STARTED -> FAILED"
        );
        metrics::counter!("nivaran_tasks_failed", "service" => self.service).increment(1);

        if !self.emit_frames {
            return;
        }
        let stored = self.addressing();
        let (grievance_id, session_id) = match (grievance_id, session_id, &stored) {
            (Some(g), Some(s), _) => (g.to_string(), s.to_string()),
            (_, _, Some((g, s))) => (g.clone(), s.clone()),
            _ => {
                warn!(task = %self.task_name, "FAILED frame dropped: no addressing");
                return;
            }
        };

        let data = json!({"task_name": self.task_name, "error": error_message});
        self.sink
            .post_status(TaskStatus::Failed, data, &grievance_id, &session_id)
            .await;
    }

    /// Records a retry decision: logs, publishes a RETRYING frame when the
    /// attempt was addressed, and returns the history record for the
    /// re-enqueued message.
    pub async fn retry_task(&self, error: &TaskError, delay: Duration) -> RetryAttempt {
        self.resolve(TaskStatus::Retrying);

        let record = RetryAttempt {
            attempt: self.attempt,
            error_kind: error.kind().as_str().to_string(),
            error_message: error.to_string(),
            timestamp: Utc::now(),
            next_delay_s: delay.as_secs_f64(),
        };

        warn!(
            service = self.service,
            task = %self.task_name,
            task_id = %self.task_id,
            attempt = self.attempt,
            error_kind = %error.kind(),
            next_delay_s = record.next_delay_s,
            "Task state change: STARTED -> RETRYING"
        );
        metrics::counter!("nivaran_tasks_retried", "service" => self.service).increment(1);

        if self.emit_frames {
            if let Some((grievance_id, session_id)) = self.addressing() {
                let data = json!({
                    "task_name": self.task_name,
                    "error": error.to_string(),
                    "retry_count": self.attempt + 1,
                    "next_delay_s": record.next_delay_s,
                });
                self.sink
                    .post_status(TaskStatus::Retrying, data, &grievance_id, &session_id)
                    .await;
            }
        }

        record
    }

    /// Records a resolution, enforcing at most one terminal emission per
    /// attempt. Returns false when the attempt already resolved.
    fn resolve(&self, status: TaskStatus) -> bool {
        let mut state = self.state.lock();
        if let Some(existing) = state.resolution {
            warn!(
                task = %self.task_name,
                task_id = %self.task_id,
                existing = %existing,
                attempted = %status,
                "Duplicate lifecycle resolution suppressed"
            );
            return false;
        }
        state.resolution = Some(status);
        true
    }

    fn frame_data(task_name: &str, result: Value) -> Value {
        match result {
            Value::Object(mut map) => {
                map.entry("task_name".to_string())
                    .or_insert_with(|| json!(task_name));
                Value::Object(map)
            }
            other => json!({"task_name": task_name, "value": other}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryStatusSink;
    use tracing_test::traced_test;

    fn lifecycle(sink: Arc<MemoryStatusSink>, attempt: u32, emit: bool) -> TaskLifecycle {
        TaskLifecycle::new(
            "task-1".to_string(),
            "transcribe_audio_file_task".to_string(),
            "llm_processor",
            attempt,
            emit,
            sink,
        )
    }

    const GRIEVANCE: &str = "GR-20250101-KOJH-ABCD-A";

    #[traced_test]
    #[tokio::test]
    async fn test_started_then_success_frame_order() {
        let sink = Arc::new(MemoryStatusSink::new());
        let lc = lifecycle(sink.clone(), 0, true);

        lc.start_task(
            EntityKey::TranscriptionId,
            "TR-1",
            GRIEVANCE,
            GRIEVANCE,
            None,
        )
        .await;
        lc.complete_task(&json!({"grievance_description": "text"}), GRIEVANCE, GRIEVANCE)
            .await;

        assert_eq!(
            sink.statuses(),
            vec![TaskStatus::Started, TaskStatus::Success]
        );
        let frames = sink.frames();
        assert_eq!(frames[1].data["grievance_description"], "text");
        assert_eq!(frames[1].data["task_name"], "transcribe_audio_file_task");
        assert!(logs_contain("Task state change"));
    }

    #[tokio::test]
    async fn test_at_most_one_terminal_emission() {
        let sink = Arc::new(MemoryStatusSink::new());
        let lc = lifecycle(sink.clone(), 0, true);

        lc.start_task(EntityKey::GrievanceId, "GR-1", GRIEVANCE, GRIEVANCE, None)
            .await;
        lc.complete_task(&json!({}), GRIEVANCE, GRIEVANCE).await;
        lc.fail_task("late failure", Some(GRIEVANCE), Some(GRIEVANCE))
            .await;

        assert_eq!(
            sink.statuses(),
            vec![TaskStatus::Started, TaskStatus::Success]
        );
        assert_eq!(lc.resolution(), Some(TaskStatus::Success));
    }

    #[tokio::test]
    async fn test_fail_uses_addressing_from_start() {
        let sink = Arc::new(MemoryStatusSink::new());
        let lc = lifecycle(sink.clone(), 0, true);

        lc.start_task(EntityKey::GrievanceId, "GR-1", GRIEVANCE, "sess-9", None)
            .await;
        lc.fail_task("llm exploded", None, None).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].status, TaskStatus::Failed);
        assert_eq!(frames[1].grievance_id, GRIEVANCE);
        assert_eq!(frames[1].session_id, "sess-9");
        assert_eq!(frames[1].data["error"], "llm exploded");
    }

    #[tokio::test]
    async fn test_retry_returns_history_record() {
        let sink = Arc::new(MemoryStatusSink::new());
        let lc = lifecycle(sink.clone(), 1, true);

        lc.start_task(EntityKey::GrievanceId, "GR-1", GRIEVANCE, GRIEVANCE, None)
            .await;
        let record = lc
            .retry_task(
                &TaskError::RateLimit("429".to_string()),
                Duration::from_secs_f64(4.2),
            )
            .await;

        assert_eq!(record.attempt, 1);
        assert_eq!(record.error_kind, "RateLimitError");
        assert!((record.next_delay_s - 4.2).abs() < f64::EPSILON);

        let frames = sink.frames();
        assert_eq!(frames[1].status, TaskStatus::Retrying);
        assert_eq!(frames[1].data["retry_count"], 2);
    }

    #[tokio::test]
    async fn test_frames_suppressed_when_disabled() {
        let sink = Arc::new(MemoryStatusSink::new());
        let lc = lifecycle(sink.clone(), 0, false);

        lc.start_task(EntityKey::GrievanceId, "GR-1", GRIEVANCE, GRIEVANCE, None)
            .await;
        lc.complete_task(&json!({}), GRIEVANCE, GRIEVANCE).await;

        assert!(sink.frames().is_empty());
        assert_eq!(lc.resolution(), Some(TaskStatus::Success));
    }

    #[tokio::test]
    async fn test_start_requires_grievance_id() {
        let sink = Arc::new(MemoryStatusSink::new());
        let lc = lifecycle(sink.clone(), 0, true);

        lc.start_task(EntityKey::GrievanceId, "GR-1", "", "sess", None)
            .await;
        assert!(sink.frames().is_empty());
        assert!(lc.addressing().is_none());
    }

    #[tokio::test]
    async fn test_started_frame_carries_retry_count_on_retry() {
        let sink = Arc::new(MemoryStatusSink::new());
        let lc = lifecycle(sink.clone(), 2, true);

        lc.start_task(EntityKey::GrievanceId, "GR-1", GRIEVANCE, GRIEVANCE, None)
            .await;
        let frames = sink.frames();
        assert_eq!(frames[0].data["retry_count"], 2);
    }
}
