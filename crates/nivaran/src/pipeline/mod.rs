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

//! # Pipeline Composer
//!
//! Two primitives compose task graphs on top of the broker:
//!
//! - **group**: N parallel invocations, one per input element;
//! - **chord**: a group plus one aggregating callback invoked with all
//!   member results, in submission order, after every member terminates.
//!
//! The canonical chains — transcription → classification → translation →
//! persistence — are built by the task bodies themselves: each enqueues
//! its follow-ons with its result envelope as input, and hands a copy to
//! `store_result_to_db_task` (fire-and-forget, delay 0) so persistence and
//! downstream LLM work proceed concurrently.

use serde_json::{json, Value};

use crate::broker::{Broker, ChordCallback, ChordHandle, GroupHandle};
use crate::error::BrokerError;
use crate::runner::Services;
use crate::task::TaskEnvelope;

/// Launches the per-file chord for a batch upload: one
/// `process_file_upload_task` per file, aggregated by
/// `aggregate_batch_results`.
pub async fn spawn_batch_upload(
    services: &Services,
    grievance_id: &str,
    files_data: Vec<Value>,
    session_id: &str,
) -> Result<ChordHandle, BrokerError> {
    let member_config = services.task_config("process_file_upload_task");
    let callback_config = services.task_config("aggregate_batch_results");

    let args: Vec<Value> = files_data
        .into_iter()
        .map(|file_data| {
            json!({
                "grievance_id": grievance_id,
                "file_data": file_data,
                "emit_websocket": false,
                "session_id": session_id,
            })
        })
        .collect();

    services
        .broker
        .enqueue_chord(
            &member_config.queue,
            member_config.priority,
            "process_file_upload_task",
            args,
            ChordCallback {
                name: "aggregate_batch_results".to_string(),
                queue: callback_config.queue,
                priority: callback_config.priority,
                extra: json!({
                    "grievance_id": grievance_id,
                    "session_id": session_id,
                }),
            },
        )
        .await
}

/// Launches a parallel group of one task over many inputs.
pub async fn spawn_group(
    services: &Services,
    task_name: &str,
    arg_list: Vec<Value>,
) -> Result<GroupHandle, BrokerError> {
    let config = services.task_config(task_name);
    services
        .broker
        .enqueue_group(&config.queue, config.priority, task_name, arg_list)
        .await
}

/// Hands a result envelope to the store task, fire-and-forget.
pub async fn enqueue_store(
    services: &Services,
    envelope: &TaskEnvelope,
) -> Result<String, BrokerError> {
    services
        .enqueue_task("store_result_to_db_task", envelope.to_value())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::bus::MemoryStatusSink;
    use crate::config::{OrchestratorConfig, QueueNames};
    use crate::services::{MockFileService, MockLlmService, MockMessagingService};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn services(broker: Arc<MockBroker>) -> Services {
        Services {
            config: OrchestratorConfig {
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
                allowed_extensions: vec!["pdf".to_string()],
                task_time_limit: Duration::from_secs(300),
                task_soft_time_limit: Duration::from_secs(240),
                worker_concurrency: 2,
                visibility_timeout: Duration::from_secs(600),
                queues: QueueNames::default(),
            },
            broker,
            status: Arc::new(MemoryStatusSink::new()),
            store: None,
            llm: Arc::new(MockLlmService::new()),
            messaging: Arc::new(MockMessagingService::new()),
            files: Arc::new(MockFileService::new()),
        }
    }

    #[tokio::test]
    async fn test_batch_upload_chord_layout() {
        let broker = Arc::new(MockBroker::new());
        let services = services(broker.clone());

        let handle = spawn_batch_upload(
            &services,
            "GR-20250101-KOJH-ABCD-A",
            vec![serde_json::json!({"file_name": "a.pdf"}), serde_json::json!({"file_name": "b.pdf"})],
            "GR-20250101-KOJH-ABCD-A",
        )
        .await
        .unwrap();

        assert_eq!(handle.task_ids.len(), 2);
        let members = broker.enqueued_for("process_file_upload_task");
        assert_eq!(members.len(), 2);
        // Members suppress their own frames; the aggregate emits one
        assert_eq!(members[0].args["emit_websocket"], false);
        let chord = members[0].chord.as_ref().unwrap();
        assert_eq!(chord.size, 2);
        assert_eq!(chord.callback.name, "aggregate_batch_results");
        assert_eq!(chord.callback.extra["grievance_id"], "GR-20250101-KOJH-ABCD-A");
    }

    #[tokio::test]
    async fn test_store_envelope_routed_to_default_queue() {
        let broker = Arc::new(MockBroker::new());
        let services = services(broker.clone());

        let envelope = TaskEnvelope {
            status: "SUCCESS".to_string(),
            ..Default::default()
        };
        enqueue_store(&services, &envelope).await.unwrap();

        let log = broker.enqueue_log();
        assert_eq!(log.len(), 1);
        // Database kind rides the default queue at high priority
        assert_eq!(log[0].0, "default");
        assert_eq!(log[0].1.task_name, "store_result_to_db_task");
    }
}
