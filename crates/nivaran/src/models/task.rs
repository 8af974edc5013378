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

//! Task Record Model
//!
//! This module defines the data structures for the persisted task records
//! and their entity links. Task rows are created *retroactively*: the row
//! is inserted only once the entity referenced by the producing task's
//! result exists (see the database task manager).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// A persisted task record.
///
/// Maps to the `tasks` table. The `task_id` is the broker-assigned id and
/// is stable across retries; `retry_count` always equals the length of
/// `retry_history`.
#[derive(Debug, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::tasks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TaskRow {
    /// Broker-assigned globally unique task id
    pub task_id: String,
    /// Registry name of the task
    pub task_name: String,
    /// Lifecycle status code (STARTED, SUCCESS, FAILED, RETRYING, IN_PROGRESS)
    pub status_code: String,
    /// When the first attempt started
    pub started_at: DateTime<Utc>,
    /// Set only on terminal states
    pub completed_at: Option<DateTime<Utc>>,
    /// Last error message, if any
    pub error_message: Option<String>,
    /// Opaque task result payload
    pub result: Option<serde_json::Value>,
    /// Authoritative retry count (the broker attempt counter at terminal time)
    pub retry_count: i32,
    /// Ordered list of retry attempt records
    pub retry_history: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A new task record, inserted with status IN_PROGRESS on the first
/// attempt of the storing task.
#[derive(Debug, Insertable)]
#[diesel(table_name = crate::database::schema::tasks)]
pub struct NewTaskRow {
    pub task_id: String,
    pub task_name: String,
    pub status_code: String,
}

/// One entry of a task's retry history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// The attempt that failed (0-based)
    pub attempt: u32,
    /// Classified error kind name
    pub error_kind: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    /// Delay scheduled before the next attempt, in seconds
    pub next_delay_s: f64,
}

/// A task ↔ entity link row.
#[derive(Debug, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::task_entities)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TaskEntityRow {
    pub task_id: String,
    pub entity_key: String,
    pub entity_id: String,
    pub created_at: DateTime<Utc>,
}

/// A new task ↔ entity link.
#[derive(Debug, Insertable)]
#[diesel(table_name = crate::database::schema::task_entities)]
pub struct NewTaskEntity {
    pub task_id: String,
    pub entity_key: String,
    pub entity_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_attempt_serialization() {
        let attempt = RetryAttempt {
            attempt: 1,
            error_kind: "RateLimitError".to_string(),
            error_message: "429 from provider".to_string(),
            timestamp: Utc::now(),
            next_delay_s: 4.2,
        };
        let value = serde_json::to_value(&attempt).unwrap();
        assert_eq!(value["error_kind"], "RateLimitError");
        let back: RetryAttempt = serde_json::from_value(value).unwrap();
        assert_eq!(back, attempt);
    }
}
