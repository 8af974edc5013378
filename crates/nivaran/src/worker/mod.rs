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

//! # Worker Runtime
//!
//! Consumes deliveries from the broker for the queues the registry
//! declares, runs one task attempt per delivery, and resolves exactly one
//! lifecycle outcome per attempt:
//!
//! - the body returns → SUCCESS (the body emitted its own frame);
//! - the body raises → the retry classifier decides RETRYING (re-enqueue
//!   with backoff, same task id, attempt+1) or FAILED;
//! - the hard time limit fires → the attempt is killed and recorded as a
//!   retryable timeout.
//!
//! Chord members report their result slot on any terminal outcome, so the
//! aggregating callback always fires once every member has terminated —
//! success or failure.

pub mod lifecycle;

pub use lifecycle::TaskLifecycle;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::error::{TaskError, WorkerError};
use crate::registry::TaskRegistry;
use crate::runner::Services;
use crate::task::{TaskContext, TaskKind};

/// How long a single reserve call blocks before re-polling.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// The worker pool: one reserve loop feeding a bounded set of concurrent
/// task attempts.
pub struct WorkerPool {
    services: Arc<Services>,
    registry: Arc<TaskRegistry>,
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        Self {
            services: Arc::clone(&self.services),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl WorkerPool {
    pub fn new(services: Arc<Services>, registry: Arc<TaskRegistry>) -> Self {
        Self { services, registry }
    }

    /// Runs the consume loop until the process is stopped.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let queues = self.registry.queues();
        let concurrency = self.services.config.worker_concurrency;
        let semaphore = Arc::new(Semaphore::new(concurrency));

        info!(?queues, concurrency, "Starting worker pool");

        loop {
            let permit = Arc::clone(&semaphore).acquire_owned().await?;
            match self.services.broker.reserve(&queues, POLL_TIMEOUT).await {
                Ok(Some(delivery)) => {
                    let pool = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = pool.process_delivery(delivery).await {
                            error!(error = %e, "Task processing failed");
                        }
                    });
                }
                Ok(None) => {
                    debug!("No ready tasks found");
                }
                Err(e) => {
                    error!(error = %e, "Failed to reserve from broker");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Drives one poll cycle: reserves at most one message and processes
    /// it. Returns whether a message was processed. Useful for embedding
    /// the worker in another loop and for tests.
    pub async fn run_once(&self, timeout: Duration) -> Result<bool, WorkerError> {
        let queues = self.registry.queues();
        match self.services.broker.reserve(&queues, timeout).await? {
            Some(delivery) => {
                self.process_delivery(delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs one delivered attempt through its full lifecycle.
    pub(crate) async fn process_delivery(&self, delivery: Delivery) -> Result<(), WorkerError> {
        let message = &delivery.message;

        let Some((handler, config)) = self.registry.entry(&message.task_name) else {
            error!(task = %message.task_name, "Received unregistered task");
            self.services.broker.ack(&delivery.receipt).await?;
            return Err(WorkerError::UnregisteredTask(message.task_name.clone()));
        };
        let handler = Arc::clone(handler);
        let config = config.clone();

        // Database and messaging tasks stay quiet on the bus unless asked.
        let default_emit = !matches!(config.kind, TaskKind::Database | TaskKind::Messaging);
        let emit_frames = message
            .args
            .get("emit_websocket")
            .and_then(Value::as_bool)
            .unwrap_or(default_emit);

        let lifecycle = TaskLifecycle::new(
            message.task_id.clone(),
            message.task_name.clone(),
            config.service,
            message.attempt,
            emit_frames,
            Arc::clone(&self.services.status),
        );
        let ctx = TaskContext::new(
            message.task_id.clone(),
            message.task_name.clone(),
            message.attempt,
            config.service,
            tokio::time::Instant::now() + self.services.config.task_soft_time_limit,
            Arc::clone(&self.services),
            message.retry_history.clone(),
            lifecycle,
        );

        info!(
            service = config.service,
            task = %message.task_name,
            task_id = %message.task_id,
            attempt = message.attempt,
            queue = %delivery.queue,
            "Executing task"
        );

        let hard_limit = self.services.config.task_time_limit;
        let outcome =
            match tokio::time::timeout(hard_limit, handler.run(&ctx, message.args.clone())).await
            {
                Ok(result) => result,
                Err(_) => Err(TaskError::Timeout(format!(
                    "hard time limit of {}s exceeded",
                    hard_limit.as_secs()
                ))),
            };

        match outcome {
            Ok(result) => {
                debug!(task = %message.task_name, task_id = %message.task_id, "Task body returned");
                if let Some(membership) = &message.chord {
                    self.services
                        .broker
                        .complete_chord_member(membership, result)
                        .await?;
                }
            }
            Err(task_error) => {
                if config.retry.should_retry(&task_error, message.attempt) {
                    let delay = config.retry.delay_for_attempt(message.attempt);
                    let record = ctx.lifecycle().retry_task(&task_error, delay).await;

                    let mut next = delivery.message.clone();
                    next.attempt += 1;
                    next.retry_history.push(record);
                    self.services
                        .broker
                        .enqueue_message(&delivery.queue, config.priority, next, Some(delay))
                        .await?;

                    warn!(
                        task = %message.task_name,
                        task_id = %message.task_id,
                        attempt = message.attempt,
                        delay_s = delay.as_secs_f64(),
                        "Task failed, scheduled for retry"
                    );
                } else {
                    if ctx.lifecycle().resolution().is_none() {
                        ctx.lifecycle()
                            .fail_task(&task_error.to_string(), None, None)
                            .await;
                    }
                    error!(
                        task = %message.task_name,
                        task_id = %message.task_id,
                        attempt = message.attempt,
                        error = %task_error,
                        "Task failed permanently"
                    );

                    // The chord callback still needs this member's slot.
                    if let Some(membership) = &message.chord {
                        let failure = json!({
                            "status": "FAILED",
                            "task_id": message.task_id,
                            "error": task_error.to_string(),
                        });
                        self.services
                            .broker
                            .complete_chord_member(membership, failure)
                            .await?;
                    }
                }
            }
        }

        self.services.broker.ack(&delivery.receipt).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MockBroker};
    use crate::bus::MemoryStatusSink;
    use crate::config::{OrchestratorConfig, QueueNames};
    use crate::error::TaskError;
    use crate::registry::TaskRegistry;
    use crate::services::{MockFileService, MockLlmService, MockMessagingService};
    use crate::task::{EntityKey, Priority, TaskHandler, TaskStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    const GRIEVANCE: &str = "GR-20250101-KOJH-ABCD-A";

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            broker_url: "redis://unused".to_string(),
            status_redis_url: "redis://unused".to_string(),
            database_url: "postgres://unused".to_string(),
            db_pool_size: 1,
            encryption_key: None,
            log_dir: PathBuf::from("logs"),
            default_timezone: chrono_tz::UTC,
            default_province: "KO".to_string(),
            default_district: "JH".to_string(),
            default_language: "ne".to_string(),
            web_base_url: "http://localhost:5001".to_string(),
            llm_base_url: "http://localhost:8100".to_string(),
            messaging_base_url: "http://localhost:8200".to_string(),
            upload_dir: PathBuf::from("uploads"),
            allowed_extensions: vec!["wav".to_string()],
            task_time_limit: Duration::from_secs(300),
            task_soft_time_limit: Duration::from_secs(240),
            worker_concurrency: 2,
            visibility_timeout: Duration::from_secs(600),
            queues: QueueNames::default(),
        }
    }

    fn test_services(broker: Arc<MockBroker>, sink: Arc<MemoryStatusSink>) -> Arc<Services> {
        Arc::new(Services {
            config: test_config(),
            broker,
            status: sink,
            store: None,
            llm: Arc::new(MockLlmService::new()),
            messaging: Arc::new(MockMessagingService::new()),
            files: Arc::new(MockFileService::new()),
        })
    }

    fn pool_with(
        handlers: Vec<Arc<dyn TaskHandler>>,
        broker: Arc<MockBroker>,
        sink: Arc<MemoryStatusSink>,
    ) -> WorkerPool {
        let mut registry = TaskRegistry::new(QueueNames::default());
        for handler in handlers {
            registry.register(handler).unwrap();
        }
        WorkerPool::new(test_services(broker, sink), Arc::new(registry))
    }

    /// Processes deliveries until the broker is drained, advancing the
    /// paused clock through retry delays.
    async fn drain(pool: &WorkerPool, broker: &MockBroker) {
        let queues = vec!["default".to_string(), "llm_queue".to_string()];
        loop {
            match broker.reserve(&queues, Duration::from_millis(200)).await.unwrap() {
                Some(delivery) => {
                    let _ = pool.process_delivery(delivery).await;
                }
                None => {
                    if broker.is_idle() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    /// Fails with a rate limit until the configured attempt, then succeeds.
    struct FlakyLlmTask {
        succeed_from: u32,
        attempts_seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl TaskHandler for FlakyLlmTask {
        fn name(&self) -> &'static str {
            "flaky_llm_task"
        }

        fn kind(&self) -> TaskKind {
            TaskKind::Llm
        }

        async fn run(&self, ctx: &TaskContext, _input: Value) -> Result<Value, TaskError> {
            self.attempts_seen.lock().push(ctx.attempt);
            ctx.start_task(EntityKey::GrievanceId, GRIEVANCE, GRIEVANCE, GRIEVANCE, None)
                .await;
            if ctx.attempt < self.succeed_from {
                return Err(TaskError::RateLimit("429 from provider".to_string()));
            }
            let values = json!({"grievance_summary": "done"});
            ctx.complete_task(&values, GRIEVANCE, GRIEVANCE).await;
            Ok(json!({"status": "SUCCESS", "values": values, "retry_count": ctx.attempt}))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_task_retries_then_succeeds() {
        let broker = Arc::new(MockBroker::new());
        let sink = Arc::new(MemoryStatusSink::new());
        let handler = Arc::new(FlakyLlmTask {
            succeed_from: 2,
            attempts_seen: Mutex::new(Vec::new()),
        });
        let pool = pool_with(vec![handler.clone()], broker.clone(), sink.clone());

        broker
            .enqueue("llm_queue", Priority::High, "flaky_llm_task", json!({}))
            .await
            .unwrap();
        drain(&pool, &broker).await;

        // Attempts 0 and 1 rate-limited, attempt 2 succeeded
        assert_eq!(*handler.attempts_seen.lock(), vec![0, 1, 2]);

        let statuses = sink.statuses();
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == TaskStatus::Retrying)
                .count(),
            2
        );
        assert_eq!(statuses.last(), Some(&TaskStatus::Success));
        // Per-attempt ordering: STARTED always precedes the resolution
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Started,
                TaskStatus::Retrying,
                TaskStatus::Started,
                TaskStatus::Retrying,
                TaskStatus::Started,
                TaskStatus::Success,
            ]
        );

        // All deliveries shared one logical task id
        let messages = broker.enqueued_for("flaky_llm_task");
        assert_eq!(messages.len(), 3);
        let first_id = &messages[0].task_id;
        assert!(messages.iter().all(|m| &m.task_id == first_id));
        // The final delivery carried the accumulated retry history
        assert_eq!(messages[2].retry_history.len(), 2);
        assert_eq!(messages[2].retry_history[0].error_kind, "RateLimitError");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_fails_terminally() {
        let broker = Arc::new(MockBroker::new());
        let sink = Arc::new(MemoryStatusSink::new());
        let handler = Arc::new(FlakyLlmTask {
            succeed_from: u32::MAX,
            attempts_seen: Mutex::new(Vec::new()),
        });
        let pool = pool_with(vec![handler.clone()], broker.clone(), sink.clone());

        broker
            .enqueue("llm_queue", Priority::High, "flaky_llm_task", json!({}))
            .await
            .unwrap();
        drain(&pool, &broker).await;

        // LLM policy: 3 retries, so attempts 0..=3 ran
        assert_eq!(*handler.attempts_seen.lock(), vec![0, 1, 2, 3]);
        let statuses = sink.statuses();
        assert_eq!(statuses.last(), Some(&TaskStatus::Failed));
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == TaskStatus::Retrying)
                .count(),
            3
        );
        // No further frames after the terminal failure
        assert_eq!(statuses.len(), 4 * 2);
    }

    struct BadInputTask;

    #[async_trait]
    impl TaskHandler for BadInputTask {
        fn name(&self) -> &'static str {
            "bad_input_task"
        }

        fn kind(&self) -> TaskKind {
            TaskKind::Llm
        }

        async fn run(&self, ctx: &TaskContext, _input: Value) -> Result<Value, TaskError> {
            ctx.start_task(EntityKey::GrievanceId, GRIEVANCE, GRIEVANCE, GRIEVANCE, None)
                .await;
            Err(TaskError::Input("missing field_name".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_error_never_retried() {
        let broker = Arc::new(MockBroker::new());
        let sink = Arc::new(MemoryStatusSink::new());
        let pool = pool_with(vec![Arc::new(BadInputTask)], broker.clone(), sink.clone());

        broker
            .enqueue("llm_queue", Priority::High, "bad_input_task", json!({}))
            .await
            .unwrap();
        drain(&pool, &broker).await;

        assert_eq!(
            sink.statuses(),
            vec![TaskStatus::Started, TaskStatus::Failed]
        );
        assert_eq!(broker.enqueued_for("bad_input_task").len(), 1);
    }

    struct SlowTask;

    #[async_trait]
    impl TaskHandler for SlowTask {
        fn name(&self) -> &'static str {
            "slow_task"
        }

        fn kind(&self) -> TaskKind {
            TaskKind::Llm
        }

        async fn run(&self, ctx: &TaskContext, _input: Value) -> Result<Value, TaskError> {
            ctx.start_task(EntityKey::GrievanceId, GRIEVANCE, GRIEVANCE, GRIEVANCE, None)
                .await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!({}))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_time_limit_records_retryable_timeout() {
        let broker = Arc::new(MockBroker::new());
        let sink = Arc::new(MemoryStatusSink::new());
        let pool = pool_with(vec![Arc::new(SlowTask)], broker.clone(), sink.clone());

        broker
            .enqueue("llm_queue", Priority::High, "slow_task", json!({}))
            .await
            .unwrap();
        drain(&pool, &broker).await;

        // Timeout is retryable for LLM: 1 + 3 retried attempts, then FAILED
        let statuses = sink.statuses();
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == TaskStatus::Retrying)
                .count(),
            3
        );
        assert_eq!(statuses.last(), Some(&TaskStatus::Failed));
        let messages = broker.enqueued_for("slow_task");
        assert!(messages
            .last()
            .unwrap()
            .retry_history
            .iter()
            .all(|r| r.error_kind == "TimeoutError"));
    }

    struct EchoTask;

    #[async_trait]
    impl TaskHandler for EchoTask {
        fn name(&self) -> &'static str {
            "echo_task"
        }

        fn kind(&self) -> TaskKind {
            TaskKind::FileUpload
        }

        async fn run(&self, _ctx: &TaskContext, input: Value) -> Result<Value, TaskError> {
            Ok(json!({"status": "SUCCESS", "echo": input}))
        }
    }

    struct CollectTask {
        collected: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl TaskHandler for CollectTask {
        fn name(&self) -> &'static str {
            "collect_task"
        }

        fn kind(&self) -> TaskKind {
            TaskKind::FileUpload
        }

        async fn run(&self, _ctx: &TaskContext, input: Value) -> Result<Value, TaskError> {
            self.collected.lock().push(input);
            Ok(json!({"status": "SUCCESS"}))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_chord_members_feed_callback_through_worker() {
        let broker = Arc::new(MockBroker::new());
        let sink = Arc::new(MemoryStatusSink::new());
        let collector = Arc::new(CollectTask {
            collected: Mutex::new(Vec::new()),
        });
        let pool = pool_with(
            vec![Arc::new(EchoTask), collector.clone()],
            broker.clone(),
            sink.clone(),
        );

        broker
            .enqueue_chord(
                "default",
                Priority::Medium,
                "echo_task",
                vec![json!({"i": 0}), json!({"i": 1})],
                crate::broker::ChordCallback {
                    name: "collect_task".to_string(),
                    queue: "default".to_string(),
                    priority: Priority::Medium,
                    extra: json!({"grievance_id": GRIEVANCE}),
                },
            )
            .await
            .unwrap();
        drain(&pool, &broker).await;

        let collected = collector.collected.lock();
        assert_eq!(collected.len(), 1);
        let results = collected[0]["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["echo"]["i"], 0);
        assert_eq!(results[1]["echo"]["i"], 1);
        assert_eq!(collected[0]["grievance_id"], GRIEVANCE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_task_is_acked_not_looped() {
        let broker = Arc::new(MockBroker::new());
        let sink = Arc::new(MemoryStatusSink::new());
        let pool = pool_with(vec![], broker.clone(), sink.clone());

        broker
            .enqueue("default", Priority::Medium, "ghost_task", json!({}))
            .await
            .unwrap();

        let queues = vec!["default".to_string()];
        let delivery = broker
            .reserve(&queues, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let err = pool.process_delivery(delivery).await.unwrap_err();
        assert!(matches!(err, WorkerError::UnregisteredTask(name) if name == "ghost_task"));
        assert!(broker.is_idle());
    }
}
