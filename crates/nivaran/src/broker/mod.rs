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

//! # Queue Broker Adapter
//!
//! Abstracts the message broker behind the [`Broker`] trait. The production
//! backend is Redis ([`RedisBroker`]); an in-memory [`MockBroker`] backs
//! unit tests and local development.
//!
//! Delivery semantics are **at-least-once**: a reserved message becomes
//! invisible for a visibility window and is redelivered if the worker never
//! acknowledges it. Task bodies must therefore tolerate re-execution; the
//! persistence layer's idempotent upserts make that safe.
//!
//! Two composition primitives are provided on top of plain enqueue:
//! groups (parallel fan-out) and chords (fan-out plus a single aggregating
//! callback invoked with all member results, in submission order, once
//! every member has terminated).

mod mock;
mod redis_broker;

pub use mock::MockBroker;
pub use redis_broker::RedisBroker;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::models::task::RetryAttempt;
use crate::task::Priority;

/// The application-level payload carried by a broker message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Broker-assigned globally unique id. Stable across retries of the
    /// same logical task.
    pub task_id: String,
    /// Registry name of the task to run.
    pub task_name: String,
    /// Task arguments, as a JSON object.
    pub args: Value,
    /// Attempt counter; 0 on first delivery. This counter is the
    /// authoritative retry count.
    #[serde(default)]
    pub attempt: u32,
    /// Chord bookkeeping when this message is a chord member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chord: Option<ChordMembership>,
    /// Accumulated retry records for this logical task, one per retried
    /// delivery. Carried through to the persistence layer so the task row's
    /// history matches the broker's attempt counter.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_history: Vec<RetryAttempt>,
}

impl TaskMessage {
    /// Builds a fresh message with no id; the broker assigns one at
    /// enqueue time.
    pub fn new(task_name: impl Into<String>, args: Value) -> Self {
        Self {
            task_id: String::new(),
            task_name: task_name.into(),
            args,
            attempt: 0,
            chord: None,
            retry_history: Vec::new(),
        }
    }
}

/// Identifies a message as one member of a chord.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChordMembership {
    pub chord_id: String,
    /// Submission-order index of this member.
    pub position: usize,
    /// Total number of members.
    pub size: usize,
    /// The callback fired once all members have terminated.
    pub callback: ChordCallback,
}

/// The aggregating callback of a chord.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChordCallback {
    /// Registry name of the callback task.
    pub name: String,
    /// Queue the callback is enqueued on.
    pub queue: String,
    /// Priority of the callback message.
    pub priority: Priority,
    /// Extra fields merged into the callback's input object alongside
    /// `results`.
    pub extra: Value,
}

/// A message handed to a worker, with the receipt needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the message was reserved from.
    pub queue: String,
    pub message: TaskMessage,
    /// Opaque receipt passed back to [`Broker::ack`].
    pub receipt: String,
}

/// Handle to a launched group.
#[derive(Debug, Clone)]
pub struct GroupHandle {
    pub group_id: String,
    /// Task ids of the members, in submission order.
    pub task_ids: Vec<String>,
}

/// Handle to a launched chord.
#[derive(Debug, Clone)]
pub struct ChordHandle {
    pub chord_id: String,
    /// Task ids of the members, in submission order.
    pub task_ids: Vec<String>,
}

/// The broker abstraction.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueues a message on a queue, optionally after a delay. Assigns a
    /// task id when the message has none, and returns the id.
    async fn enqueue_message(
        &self,
        queue: &str,
        priority: Priority,
        message: TaskMessage,
        delay: Option<Duration>,
    ) -> Result<String, BrokerError>;

    /// Reserves the next message from any of the given queues, waiting up
    /// to `timeout`. Higher priorities are delivered first within a queue.
    /// Reserved messages are redelivered if not acknowledged within the
    /// visibility window.
    async fn reserve(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledges a reserved message, removing it permanently.
    async fn ack(&self, receipt: &str) -> Result<(), BrokerError>;

    /// Records a chord member's terminal result. When this completes the
    /// chord, the callback is enqueued with all member results in
    /// submission order and `true` is returned.
    async fn complete_chord_member(
        &self,
        membership: &ChordMembership,
        result: Value,
    ) -> Result<bool, BrokerError>;

    /// Enqueues a task by name with fresh identity.
    async fn enqueue(
        &self,
        queue: &str,
        priority: Priority,
        task_name: &str,
        args: Value,
    ) -> Result<String, BrokerError> {
        self.enqueue_message(queue, priority, TaskMessage::new(task_name, args), None)
            .await
    }

    /// Enqueues a task to run after a delay.
    async fn enqueue_in(
        &self,
        queue: &str,
        priority: Priority,
        task_name: &str,
        args: Value,
        delay: Duration,
    ) -> Result<String, BrokerError> {
        self.enqueue_message(
            queue,
            priority,
            TaskMessage::new(task_name, args),
            Some(delay),
        )
        .await
    }

    /// Launches N parallel invocations of a task, one per argument object.
    async fn enqueue_group(
        &self,
        queue: &str,
        priority: Priority,
        task_name: &str,
        arg_list: Vec<Value>,
    ) -> Result<GroupHandle, BrokerError> {
        let group_id = Uuid::new_v4().to_string();
        let mut task_ids = Vec::with_capacity(arg_list.len());
        for args in arg_list {
            task_ids.push(self.enqueue(queue, priority, task_name, args).await?);
        }
        Ok(GroupHandle { group_id, task_ids })
    }

    /// Launches a chord: N parallel members plus a callback invoked with
    /// the list of member results after all members terminate. An empty
    /// member list fires the callback immediately with no results.
    async fn enqueue_chord(
        &self,
        queue: &str,
        priority: Priority,
        task_name: &str,
        arg_list: Vec<Value>,
        callback: ChordCallback,
    ) -> Result<ChordHandle, BrokerError> {
        let chord_id = Uuid::new_v4().to_string();
        let size = arg_list.len();

        if size == 0 {
            let message = chord_callback_message(&callback, Vec::new());
            self.enqueue_message(&callback.queue.clone(), callback.priority, message, None)
                .await?;
            return Ok(ChordHandle {
                chord_id,
                task_ids: Vec::new(),
            });
        }

        let mut task_ids = Vec::with_capacity(size);
        for (position, args) in arg_list.into_iter().enumerate() {
            let mut message = TaskMessage::new(task_name, args);
            message.chord = Some(ChordMembership {
                chord_id: chord_id.clone(),
                position,
                size,
                callback: callback.clone(),
            });
            task_ids.push(
                self.enqueue_message(queue, priority, message, None)
                    .await?,
            );
        }

        Ok(ChordHandle { chord_id, task_ids })
    }
}

/// Builds the callback invocation message for a completed chord.
pub(crate) fn chord_callback_message(callback: &ChordCallback, results: Vec<Value>) -> TaskMessage {
    let mut args = match &callback.extra {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    args.insert("results".to_string(), Value::Array(results));
    TaskMessage::new(callback.name.clone(), Value::Object(args))
}

/// Internal wire entry: a message plus its routing, so delayed and
/// redelivered entries know where they belong.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct QueueEntry {
    pub queue: String,
    pub priority: u8,
    pub message: TaskMessage,
}
