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

//! Core task abstractions.
//!
//! A task is an async body registered under a unique name and a fixed
//! [`TaskKind`]. The kind determines queue routing, priority, the retry
//! policy, and the service label attached to every log line the task
//! produces. Bodies receive a [`TaskContext`] carrying their identity,
//! attempt counter, and the shared services handle, and return a result
//! envelope consumed by the persistence layer and by downstream tasks.

pub mod envelope;
pub mod identity;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::runner::Services;
use crate::worker::TaskLifecycle;

pub use envelope::{EntityKey, TaskEnvelope};
pub use identity::Source;

/// The closed set of task categories.
///
/// Every registered task belongs to exactly one kind; the kind fixes the
/// target queue, the queue priority, the retry policy, and the service
/// label used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// Language-model processing (transcription, classification,
    /// extraction, translation).
    Llm,
    /// File staging and validation.
    FileUpload,
    /// Outbound email and SMS.
    Messaging,
    /// Persistence operations.
    Database,
    /// Everything else.
    Default,
}

impl TaskKind {
    /// All kinds, in declaration order.
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Llm,
        TaskKind::FileUpload,
        TaskKind::Messaging,
        TaskKind::Database,
        TaskKind::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Llm => "LLM",
            TaskKind::FileUpload => "FileUpload",
            TaskKind::Messaging => "Messaging",
            TaskKind::Database => "Database",
            TaskKind::Default => "Default",
        }
    }

    /// The opaque service label attached to logs and metrics for this kind.
    pub fn service(&self) -> &'static str {
        match self {
            TaskKind::Llm => "llm_processor",
            TaskKind::FileUpload => "file_processor",
            TaskKind::Messaging => "messaging_service",
            TaskKind::Database => "db_operations",
            TaskKind::Default => "queue_system",
        }
    }

    /// The queue priority for this kind.
    pub fn priority(&self) -> Priority {
        match self {
            TaskKind::Llm => Priority::High,
            TaskKind::FileUpload => Priority::Medium,
            TaskKind::Messaging => Priority::High,
            TaskKind::Database => Priority::High,
            TaskKind::Default => Priority::Medium,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue priority. The broker delivers higher priorities first within a
/// queue; the numeric values match the 0-9 scale the platform exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_u8(&self) -> u8 {
        match self {
            Priority::Low => 3,
            Priority::Medium => 5,
            Priority::High => 7,
            Priority::Critical => 9,
        }
    }
}

/// Lifecycle status of a task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "RETRYING")]
    Retrying,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Retrying => "RETRYING",
            TaskStatus::InProgress => "IN_PROGRESS",
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(TaskStatus::Started),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILED" => Ok(TaskStatus::Failed),
            "RETRYING" => Ok(TaskStatus::Retrying),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// A registered task body.
///
/// Implementations focus on business logic; queue routing, priorities,
/// retries, and the service label all come from the declared kind. The
/// returned JSON value is the task's result envelope (see
/// [`TaskEnvelope`]); raising a [`TaskError`] defers the retry-or-fail
/// decision to the lifecycle manager.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Unique task name; the registry key and the broker message name.
    fn name(&self) -> &'static str;

    /// The kind governing queue, priority, and retry policy.
    fn kind(&self) -> TaskKind;

    /// Executes one attempt of the task.
    async fn run(
        &self,
        ctx: &TaskContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError>;
}

/// Per-attempt execution context handed to task bodies.
///
/// Carries the broker-assigned task id, the attempt counter (0 on first
/// run), the kind's service label, the soft deadline, the shared services
/// handle, and the lifecycle manager for status emission.
pub struct TaskContext {
    /// Broker-assigned globally unique task id.
    pub task_id: String,
    /// Registry name of the running task.
    pub task_name: String,
    /// Attempt number, 0 on first delivery. The broker counter is the
    /// authoritative retry count.
    pub attempt: u32,
    /// Service label from the task's kind, for logs and metrics.
    pub service: &'static str,
    /// Instant after which the body should wind down voluntarily. The hard
    /// limit is enforced by the runtime.
    pub soft_deadline: tokio::time::Instant,
    /// Shared services: broker, status bridge, persistence, external
    /// collaborators.
    pub services: Arc<Services>,
    /// Accumulated retry records for this logical task, one per retried
    /// delivery.
    pub retry_history: Vec<crate::models::task::RetryAttempt>,
    lifecycle: TaskLifecycle,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: String,
        task_name: String,
        attempt: u32,
        service: &'static str,
        soft_deadline: tokio::time::Instant,
        services: Arc<Services>,
        retry_history: Vec<crate::models::task::RetryAttempt>,
        lifecycle: TaskLifecycle,
    ) -> Self {
        Self {
            task_id,
            task_name,
            attempt,
            service,
            soft_deadline,
            services,
            retry_history,
            lifecycle,
        }
    }

    /// The lifecycle manager for this attempt.
    pub fn lifecycle(&self) -> &TaskLifecycle {
        &self.lifecycle
    }

    /// Marks the task started: logs the transition and publishes a STARTED
    /// frame. Performs no database writes — the target entity may not
    /// exist yet.
    pub async fn start_task(
        &self,
        entity_key: EntityKey,
        entity_id: &str,
        grievance_id: &str,
        session_id: &str,
        extra: Option<serde_json::Value>,
    ) {
        self.lifecycle
            .start_task(entity_key, entity_id, grievance_id, session_id, extra)
            .await;
    }

    /// Marks the task succeeded: logs and publishes a SUCCESS frame.
    pub async fn complete_task(
        &self,
        result: &serde_json::Value,
        grievance_id: &str,
        session_id: &str,
    ) {
        self.lifecycle
            .complete_task(result, grievance_id, session_id)
            .await;
    }

    /// Marks the task failed: logs and publishes a FAILED frame.
    pub async fn fail_task(
        &self,
        error: &str,
        grievance_id: Option<&str>,
        session_id: Option<&str>,
    ) {
        self.lifecycle
            .fail_task(error, grievance_id, session_id)
            .await;
    }
}
