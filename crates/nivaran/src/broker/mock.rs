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

//! In-memory broker for tests and local development.
//!
//! Deterministic and lock-based: priority ordering, delayed delivery (on
//! the tokio clock, so paused-time tests can advance it), visibility-based
//! redelivery, and chord accounting all behave like the Redis backend.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    chord_callback_message, Broker, ChordCallback, ChordMembership, Delivery, QueueEntry,
    TaskMessage,
};
use crate::error::BrokerError;
use crate::task::Priority;

struct ChordState {
    results: BTreeMap<usize, Value>,
    fired: bool,
}

#[derive(Default)]
struct MockState {
    /// Ready messages per queue, keyed by (inverted priority, sequence).
    queues: HashMap<String, BTreeMap<(u8, u64), QueueEntry>>,
    /// Delayed entries with their due instant.
    scheduled: Vec<(Instant, QueueEntry)>,
    /// Reserved entries by receipt, with their visibility deadline.
    processing: HashMap<String, (Instant, QueueEntry)>,
    chords: HashMap<String, ChordState>,
    /// Every enqueue ever made, for test assertions.
    log: Vec<(String, TaskMessage)>,
    seq: u64,
}

/// In-memory [`Broker`] implementation.
pub struct MockBroker {
    state: Mutex<MockState>,
    visibility_timeout: Duration,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            visibility_timeout: Duration::from_secs(600),
        }
    }

    /// Number of ready messages on a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// True when no ready or scheduled messages remain.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.queues.values().all(BTreeMap::is_empty) && state.scheduled.is_empty()
    }

    /// Every message ever enqueued, as `(queue, message)` pairs in order.
    pub fn enqueue_log(&self) -> Vec<(String, TaskMessage)> {
        self.state.lock().log.clone()
    }

    /// Messages enqueued under a given task name.
    pub fn enqueued_for(&self, task_name: &str) -> Vec<TaskMessage> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(_, m)| m.task_name == task_name)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn push_ready(state: &mut MockState, entry: QueueEntry) {
        state.seq += 1;
        let key = (9 - entry.priority, state.seq);
        state
            .queues
            .entry(entry.queue.clone())
            .or_default()
            .insert(key, entry);
    }

    fn drain_due(state: &mut MockState) {
        let now = Instant::now();

        let due: Vec<QueueEntry> = {
            let (ready, pending): (Vec<_>, Vec<_>) = state
                .scheduled
                .drain(..)
                .partition(|(due, _)| *due <= now);
            state.scheduled = pending;
            ready.into_iter().map(|(_, e)| e).collect()
        };
        for entry in due {
            Self::push_ready(state, entry);
        }

        let expired: Vec<String> = state
            .processing
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((_, entry)) = state.processing.remove(&receipt) {
                Self::push_ready(state, entry);
            }
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
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
            message: message.clone(),
        };

        let mut state = self.state.lock();
        state.log.push((queue.to_string(), message));
        match delay {
            Some(delay) if !delay.is_zero() => {
                state.scheduled.push((Instant::now() + delay, entry));
            }
            _ => Self::push_ready(&mut state, entry),
        }

        Ok(task_id)
    }

    async fn reserve(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut state = self.state.lock();
                Self::drain_due(&mut state);

                // Highest priority across all requested queues, FIFO within.
                let best = queues
                    .iter()
                    .filter_map(|queue| {
                        state
                            .queues
                            .get(queue)
                            .and_then(|q| q.keys().next().cloned())
                            .map(|key| (key, queue.clone()))
                    })
                    .min();

                if let Some((key, queue)) = best {
                    let entry = state
                        .queues
                        .get_mut(&queue)
                        .and_then(|q| q.remove(&key))
                        .expect("entry vanished under lock");
                    let receipt = Uuid::new_v4().to_string();
                    state.processing.insert(
                        receipt.clone(),
                        (Instant::now() + self.visibility_timeout, entry.clone()),
                    );
                    return Ok(Some(Delivery {
                        queue: entry.queue.clone(),
                        message: entry.message,
                        receipt,
                    }));
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), BrokerError> {
        self.state.lock().processing.remove(receipt);
        Ok(())
    }

    async fn complete_chord_member(
        &self,
        membership: &ChordMembership,
        result: Value,
    ) -> Result<bool, BrokerError> {
        let callback_entry = {
            let mut state = self.state.lock();
            let chord = state
                .chords
                .entry(membership.chord_id.clone())
                .or_insert_with(|| ChordState {
                    results: BTreeMap::new(),
                    fired: false,
                });

            chord.results.entry(membership.position).or_insert(result);
            if chord.results.len() < membership.size || chord.fired {
                return Ok(false);
            }
            chord.fired = true;

            let mut results = vec![Value::Null; membership.size];
            for (position, value) in &chord.results {
                if *position < membership.size {
                    results[*position] = value.clone();
                }
            }
            chord_callback_message(&membership.callback, results)
        };

        let callback = &membership.callback;
        self.enqueue_message(&callback.queue, callback.priority, callback_entry, None)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queues() -> Vec<String> {
        vec!["default".to_string(), "llm_queue".to_string()]
    }

    #[tokio::test]
    async fn test_enqueue_assigns_task_id() {
        let broker = MockBroker::new();
        let id = broker
            .enqueue("default", Priority::Medium, "some_task", json!({}))
            .await
            .unwrap();
        assert!(!id.is_empty());
        assert_eq!(broker.queue_depth("default"), 1);
    }

    #[tokio::test]
    async fn test_priority_ordering_within_queue() {
        let broker = MockBroker::new();
        broker
            .enqueue("default", Priority::Low, "low_task", json!({}))
            .await
            .unwrap();
        broker
            .enqueue("default", Priority::Critical, "critical_task", json!({}))
            .await
            .unwrap();
        broker
            .enqueue("default", Priority::Medium, "medium_task", json!({}))
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(delivery) = broker
            .reserve(&queues(), Duration::from_millis(10))
            .await
            .unwrap()
        {
            order.push(delivery.message.task_name.clone());
            broker.ack(&delivery.receipt).await.unwrap();
        }
        assert_eq!(order, vec!["critical_task", "medium_task", "low_task"]);
    }

    #[tokio::test]
    async fn test_fifo_within_same_priority() {
        let broker = MockBroker::new();
        for name in ["first", "second", "third"] {
            broker
                .enqueue("default", Priority::High, name, json!({}))
                .await
                .unwrap();
        }

        for expected in ["first", "second", "third"] {
            let delivery = broker
                .reserve(&queues(), Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(delivery.message.task_name, expected);
            broker.ack(&delivery.receipt).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_delivery() {
        let broker = MockBroker::new();
        broker
            .enqueue_in(
                "default",
                Priority::Medium,
                "later_task",
                json!({}),
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("default"), 0);
        let none = broker
            .reserve(&queues(), Duration::from_millis(1))
            .await
            .unwrap();
        assert!(none.is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let delivery = broker
            .reserve(&queues(), Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.task_name, "later_task");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered() {
        let mut broker = MockBroker::new();
        broker.visibility_timeout = Duration::from_secs(5);

        broker
            .enqueue("default", Priority::Medium, "flaky", json!({}))
            .await
            .unwrap();
        let first = broker
            .reserve(&queues(), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        // Never acked; past the visibility window it comes back.
        tokio::time::advance(Duration::from_secs(6)).await;
        let second = broker
            .reserve(&queues(), Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.message.task_id, first.message.task_id);
    }

    #[tokio::test]
    async fn test_chord_fires_callback_once_with_ordered_results() {
        let broker = MockBroker::new();
        let callback = ChordCallback {
            name: "aggregate".to_string(),
            queue: "default".to_string(),
            priority: Priority::Medium,
            extra: json!({"grievance_id": "GR-1"}),
        };
        let handle = broker
            .enqueue_chord(
                "default",
                Priority::Medium,
                "member",
                vec![json!({"i": 0}), json!({"i": 1}), json!({"i": 2})],
                callback,
            )
            .await
            .unwrap();
        assert_eq!(handle.task_ids.len(), 3);

        let memberships: Vec<ChordMembership> = broker
            .enqueued_for("member")
            .into_iter()
            .map(|m| m.chord.unwrap())
            .collect();

        // Complete out of submission order
        assert!(!broker
            .complete_chord_member(&memberships[2], json!({"status": "SUCCESS", "i": 2}))
            .await
            .unwrap());
        assert!(!broker
            .complete_chord_member(&memberships[0], json!({"status": "SUCCESS", "i": 0}))
            .await
            .unwrap());
        assert!(broker
            .complete_chord_member(&memberships[1], json!({"status": "FAILED", "i": 1}))
            .await
            .unwrap());

        let callbacks = broker.enqueued_for("aggregate");
        assert_eq!(callbacks.len(), 1);
        let results = callbacks[0].args["results"].as_array().unwrap();
        // Submission order, not completion order
        assert_eq!(results[0]["i"], 0);
        assert_eq!(results[1]["i"], 1);
        assert_eq!(results[2]["i"], 2);
        assert_eq!(callbacks[0].args["grievance_id"], "GR-1");

        // Redelivered member completion must not refire
        assert!(!broker
            .complete_chord_member(&memberships[1], json!({"status": "FAILED", "i": 1}))
            .await
            .unwrap());
        assert_eq!(broker.enqueued_for("aggregate").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_chord_fires_immediately() {
        let broker = MockBroker::new();
        let callback = ChordCallback {
            name: "aggregate".to_string(),
            queue: "default".to_string(),
            priority: Priority::Medium,
            extra: json!({}),
        };
        broker
            .enqueue_chord("default", Priority::Medium, "member", vec![], callback)
            .await
            .unwrap();

        let callbacks = broker.enqueued_for("aggregate");
        assert_eq!(callbacks.len(), 1);
        assert!(callbacks[0].args["results"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_launches_one_task_per_element() {
        let broker = MockBroker::new();
        let handle = broker
            .enqueue_group(
                "default",
                Priority::Medium,
                "per_file",
                vec![json!({"f": "a"}), json!({"f": "b"})],
            )
            .await
            .unwrap();
        assert_eq!(handle.task_ids.len(), 2);
        assert_eq!(broker.queue_depth("default"), 2);
    }
}
