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

//! Redis-backed broker.
//!
//! Layout (all keys under a configurable namespace, default `nivaran`):
//!
//! - `{ns}:queue:{name}` — sorted set of ready messages. The score encodes
//!   inverted priority in the high digits and enqueue time in the low ones,
//!   so `BZPOPMIN` yields highest-priority-first, FIFO within a priority.
//! - `{ns}:scheduled` — sorted set of delayed entries scored by their due
//!   time; drained into the ready queues by the pollers.
//! - `{ns}:processing` — sorted set of reserved entries scored by their
//!   visibility deadline. Unacknowledged entries past the deadline are
//!   redelivered, giving at-least-once semantics.
//! - `{ns}:chord:{id}` — hash of member results keyed by submission
//!   position; `{ns}:chord:{id}:fired` guards single callback dispatch.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{chord_callback_message, Broker, ChordMembership, Delivery, QueueEntry, TaskMessage};
use crate::error::BrokerError;
use crate::task::Priority;

/// Weight separating the priority digits from the millisecond timestamp in
/// queue scores. Timestamps stay below this for the foreseeable future.
const PRIORITY_WEIGHT: f64 = 1e13;

/// How many due entries a single drain pass moves.
const DRAIN_BATCH: isize = 100;

/// Redis implementation of the [`Broker`] trait.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    namespace: String,
    visibility_timeout: Duration,
}

impl RedisBroker {
    /// Connects to the broker.
    pub async fn connect(url: &str, visibility_timeout: Duration) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            namespace: "nivaran".to_string(),
            visibility_timeout,
        })
    }

    /// Overrides the key namespace (used by tests sharing one instance).
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.namespace, queue)
    }

    fn scheduled_key(&self) -> String {
        format!("{}:scheduled", self.namespace)
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.namespace)
    }

    fn chord_key(&self, chord_id: &str) -> String {
        format!("{}:chord:{}", self.namespace, chord_id)
    }

    fn ready_score(priority: u8) -> f64 {
        let inverted = f64::from(9 - priority);
        inverted * PRIORITY_WEIGHT + Utc::now().timestamp_millis() as f64
    }

    async fn push_ready(&self, entry: &QueueEntry) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let member = serde_json::to_string(entry)?;
        let score = Self::ready_score(entry.priority);
        let _: () = conn.zadd(self.queue_key(&entry.queue), member, score).await?;
        Ok(())
    }

    /// Moves due scheduled entries and expired processing entries back to
    /// their ready queues.
    async fn drain_due(&self) -> Result<(), BrokerError> {
        let now = Utc::now().timestamp_millis() as f64;
        for key in [self.scheduled_key(), self.processing_key()] {
            let mut conn = self.conn.clone();
            let due: Vec<String> = conn
                .zrangebyscore_limit(&key, 0f64, now, 0, DRAIN_BATCH)
                .await?;
            for member in due {
                // Only the poller that wins the removal requeues the entry.
                let removed: i32 = conn.zrem(&key, &member).await?;
                if removed == 0 {
                    continue;
                }
                match serde_json::from_str::<QueueEntry>(&member) {
                    Ok(entry) => {
                        debug!(queue = %entry.queue, task = %entry.message.task_name, "Requeuing due entry");
                        self.push_ready(&entry).await?;
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable broker entry"),
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue_message(
        &self,
        queue: &str,
        priority: Priority,
        mut message: TaskMessage,
        delay: Option<Duration>,
    ) -> Result<String, BrokerError> {
        if message.task_id.is_empty() {
            message.task_id = Uuid::new_v4().to_string();
        }
        let task_id = message.task_id.clone();

        let entry = QueueEntry {
            queue: queue.to_string(),
            priority: priority.as_u8(),
            message,
        };

        match delay {
            Some(delay) if !delay.is_zero() => {
                let mut conn = self.conn.clone();
                let member = serde_json::to_string(&entry)?;
                let due = Utc::now().timestamp_millis() as f64 + delay.as_millis() as f64;
                let _: () = conn.zadd(self.scheduled_key(), member, due).await?;
            }
            _ => self.push_ready(&entry).await?,
        }

        metrics::counter!("nivaran_tasks_enqueued", "queue" => queue.to_string()).increment(1);
        Ok(task_id)
    }

    async fn reserve(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let keys: Vec<String> = queues.iter().map(|q| self.queue_key(q)).collect();

        loop {
            self.drain_due().await?;

            let mut conn = self.conn.clone();
            // Short blocking pop so the scheduled drain keeps running.
            let popped: Option<(String, String, f64)> =
                conn.bzpopmin(keys.clone(), 1.0).await?;

            if let Some((_key, member, _score)) = popped {
                let entry: QueueEntry = serde_json::from_str(&member)?;
                let visibility_deadline = Utc::now().timestamp_millis() as f64
                    + self.visibility_timeout.as_millis() as f64;
                let _: () = conn
                    .zadd(self.processing_key(), &member, visibility_deadline)
                    .await?;

                return Ok(Some(Delivery {
                    queue: entry.queue.clone(),
                    message: entry.message,
                    receipt: member,
                }));
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(self.processing_key(), receipt).await?;
        Ok(())
    }

    async fn complete_chord_member(
        &self,
        membership: &ChordMembership,
        result: Value,
    ) -> Result<bool, BrokerError> {
        let key = self.chord_key(&membership.chord_id);
        let fired_key = format!("{}:fired", key);
        let mut conn = self.conn.clone();

        let _: bool = conn
            .hset_nx(
                &key,
                membership.position,
                serde_json::to_string(&result)?,
            )
            .await?;
        let _: () = conn.expire(&key, 3600).await?;

        let recorded: usize = conn.hlen(&key).await?;
        if recorded < membership.size {
            return Ok(false);
        }

        // Exactly one completer dispatches the callback.
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&fired_key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(3600)
            .query_async(&mut conn)
            .await?;
        if claimed.is_none() {
            return Ok(false);
        }

        let raw: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;
        let mut results = vec![Value::Null; membership.size];
        for (position, payload) in raw {
            if let (Ok(index), Ok(value)) =
                (position.parse::<usize>(), serde_json::from_str(&payload))
            {
                if index < membership.size {
                    results[index] = value;
                }
            }
        }

        let callback = &membership.callback;
        let message = chord_callback_message(callback, results);
        self.enqueue_message(&callback.queue, callback.priority, message, None)
            .await?;
        let _: () = conn.del(&key).await?;

        debug!(chord = %membership.chord_id, callback = %callback.name, "Chord complete, callback enqueued");
        Ok(true)
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("namespace", &self.namespace)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish()
    }
}
