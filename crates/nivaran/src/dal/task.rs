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

//! Task record Data Access Layer.
//!
//! Task rows are created retroactively by the store path once their entity
//! exists, so the synchronous helpers here are written to run inside the
//! store transaction after the entity upsert. Inserts are idempotent under
//! at-least-once delivery (conflict on the primary key is a no-op), and
//! `retry_count` is kept equal to the length of `retry_history`.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::Value;

use super::DAL;
use crate::error::StorageError;
use crate::models::task::{NewTaskEntity, NewTaskRow, RetryAttempt, TaskEntityRow, TaskRow};
use crate::task::{EntityKey, TaskStatus};

/// Data Access Layer for task record operations.
pub struct TaskDal<'a> {
    pub(crate) dal: &'a DAL,
}

/// Inserts a new task row with status IN_PROGRESS. A redelivered first
/// attempt finds the row already present and leaves it untouched.
pub(crate) fn insert_task_row(
    conn: &mut PgConnection,
    task_id: &str,
    task_name: &str,
) -> Result<(), StorageError> {
    use crate::database::schema::tasks::dsl as t;

    diesel::insert_into(t::tasks)
        .values(&NewTaskRow {
            task_id: task_id.to_string(),
            task_name: task_name.to_string(),
            status_code: TaskStatus::InProgress.as_str().to_string(),
        })
        .on_conflict(t::task_id)
        .do_nothing()
        .execute(conn)?;
    Ok(())
}

/// Links a task row to an entity. The composite primary key makes double
/// links a no-op.
pub(crate) fn link_task_entity(
    conn: &mut PgConnection,
    task_id: &str,
    entity_key: EntityKey,
    entity_id: &str,
) -> Result<(), StorageError> {
    use crate::database::schema::task_entities::dsl as te;

    diesel::insert_into(te::task_entities)
        .values(&NewTaskEntity {
            task_id: task_id.to_string(),
            entity_key: entity_key.as_str().to_string(),
            entity_id: entity_id.to_string(),
        })
        .on_conflict((te::task_id, te::entity_key, te::entity_id))
        .do_nothing()
        .execute(conn)?;
    Ok(())
}

/// Appends a retry record and bumps `retry_count` to match the history
/// length. Called on retried deliveries, once the task row exists.
pub(crate) fn append_retry(
    conn: &mut PgConnection,
    task_id: &str,
    entry: &RetryAttempt,
) -> Result<(), StorageError> {
    use crate::database::schema::tasks::dsl as t;

    let history: Option<Value> = t::tasks
        .find(task_id)
        .select(t::retry_history)
        .first(conn)
        .optional()?;
    let mut entries = history
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    entries.push(serde_json::to_value(entry)?);
    let count = entries.len() as i32;

    diesel::update(t::tasks.find(task_id))
        .set((
            t::status_code.eq(TaskStatus::Retrying.as_str()),
            t::retry_count.eq(count),
            t::retry_history.eq(Value::Array(entries)),
            t::error_message.eq(&entry.error_message),
            t::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Overwrites a task row's retry state with the producer-accumulated
/// history, keeping `retry_count` equal to its length.
pub(crate) fn set_retry_state(
    conn: &mut PgConnection,
    task_id: &str,
    history: &[RetryAttempt],
) -> Result<(), StorageError> {
    use crate::database::schema::tasks::dsl as t;

    diesel::update(t::tasks.find(task_id))
        .set((
            t::retry_count.eq(history.len() as i32),
            t::retry_history.eq(serde_json::to_value(history)?),
            t::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Sets a task row's terminal status, attaching the result or the error
/// message and stamping `completed_at`.
pub(crate) fn finalize_task(
    conn: &mut PgConnection,
    task_id: &str,
    status: TaskStatus,
    result: Option<&Value>,
    error_message: Option<&str>,
    retry_count: i32,
) -> Result<(), StorageError> {
    use crate::database::schema::tasks::dsl as t;

    let now = Utc::now();
    diesel::update(t::tasks.find(task_id))
        .set((
            t::status_code.eq(status.as_str()),
            t::result.eq(result.cloned()),
            t::error_message.eq(error_message),
            t::retry_count.eq(retry_count),
            t::completed_at.eq(status.is_terminal().then_some(now)),
            t::updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(())
}

impl<'a> TaskDal<'a> {
    /// Fetches a task row by its broker-assigned id.
    pub async fn get_by_id(&self, task_id: &str) -> Result<Option<TaskRow>, StorageError> {
        use crate::database::schema::tasks::dsl as t;

        let conn = self.dal.database().get().await?;
        let id = task_id.to_string();
        let row = conn
            .interact(move |conn| {
                t::tasks
                    .find(&id)
                    .select(TaskRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await?
            .map_err(StorageError::from)?;
        Ok(row)
    }

    /// The entity links of a task.
    pub async fn entities(&self, task_id: &str) -> Result<Vec<TaskEntityRow>, StorageError> {
        use crate::database::schema::task_entities::dsl as te;

        let conn = self.dal.database().get().await?;
        let id = task_id.to_string();
        let rows = conn
            .interact(move |conn| {
                te::task_entities
                    .filter(te::task_id.eq(&id))
                    .select(TaskEntityRow::as_select())
                    .load(conn)
            })
            .await?
            .map_err(StorageError::from)?;
        Ok(rows)
    }

    /// All tasks linked to an entity, newest first.
    pub async fn list_for_entity(
        &self,
        entity_key: EntityKey,
        entity_id: &str,
    ) -> Result<Vec<TaskRow>, StorageError> {
        use crate::database::schema::task_entities::dsl as te;
        use crate::database::schema::tasks::dsl as t;

        let conn = self.dal.database().get().await?;
        let key = entity_key.as_str().to_string();
        let id = entity_id.to_string();
        let rows = conn
            .interact(move |conn| {
                t::tasks
                    .inner_join(te::task_entities.on(te::task_id.eq(t::task_id)))
                    .filter(te::entity_key.eq(&key))
                    .filter(te::entity_id.eq(&id))
                    .order(t::created_at.desc())
                    .select(TaskRow::as_select())
                    .load(conn)
            })
            .await?
            .map_err(StorageError::from)?;
        Ok(rows)
    }
}
