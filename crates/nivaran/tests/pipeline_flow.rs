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

//! End-to-end pipeline flow over the public API, using the in-memory
//! broker and bus. Exercises the voice chain and the ordering guarantees a
//! subscribed client observes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use nivaran::broker::Broker;
use nivaran::bus::MemoryStatusSink;
use nivaran::config::{OrchestratorConfig, QueueNames};
use nivaran::services::{MockFileService, MockLlmService, MockMessagingService};
use nivaran::tasks::register_builtin_tasks;
use nivaran::{MockBroker, Priority, Services, TaskRegistry, TaskStatus, WorkerPool};

const GRIEVANCE: &str = "GR-20250101-KOJH-ABCD-A";
const COMPLAINANT: &str = "CM-20250101-KOJH-EF56-A";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .try_init();
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        broker_url: "redis://unused".to_string(),
        status_redis_url: "redis://unused".to_string(),
        database_url: "postgres://unused".to_string(),
        db_pool_size: 1,
        encryption_key: None,
        log_dir: PathBuf::from("logs"),
        default_timezone: chrono_tz::Tz::UTC,
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

struct World {
    broker: Arc<MockBroker>,
    sink: Arc<MemoryStatusSink>,
    pool: WorkerPool,
}

fn world() -> World {
    let broker = Arc::new(MockBroker::new());
    let sink = Arc::new(MemoryStatusSink::new());

    let services = Arc::new(Services {
        config: config(),
        broker: broker.clone(),
        status: sink.clone(),
        store: None,
        llm: Arc::new(MockLlmService::new()),
        messaging: Arc::new(MockMessagingService::new()),
        files: Arc::new(MockFileService::new()),
    });

    let mut registry = TaskRegistry::new(QueueNames::default());
    register_builtin_tasks(&mut registry).unwrap();

    World {
        broker,
        sink,
        pool: WorkerPool::new(services, Arc::new(registry)),
    }
}

async fn drain(world: &World) {
    loop {
        let processed = world
            .pool
            .run_once(Duration::from_millis(200))
            .await
            .unwrap_or(false);
        if !processed && world.broker.is_idle() {
            break;
        }
        if !processed {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn voice_pipeline_happy_path_emits_ordered_frames() {
    init_tracing();
    let world = world();

    world
        .broker
        .enqueue(
            "llm_queue",
            Priority::High,
            "transcribe_audio_file_task",
            json!({
                "grievance_id": GRIEVANCE,
                "complainant_id": COMPLAINANT,
                "field_name": "grievance_description",
                "file_path": "/tmp/a.wav",
                "language_code": "ne",
            }),
        )
        .await
        .unwrap();

    drain(&world).await;

    // Every frame is addressed to the grievance room, and within each task
    // attempt STARTED strictly precedes the terminal status.
    let frames = world.sink.frames();
    assert!(!frames.is_empty());
    assert!(frames.iter().all(|f| f.grievance_id == GRIEVANCE));

    let statuses: Vec<TaskStatus> = frames.iter().map(|f| f.status).collect();
    for pair in statuses.chunks(2) {
        assert_eq!(pair[0], TaskStatus::Started);
        assert!(pair[1].is_terminal());
    }

    // Three producing stages, each handing its envelope to the store task.
    let stores = world.broker.enqueued_for("store_result_to_db_task");
    assert_eq!(stores.len(), 3);
    let entity_keys: Vec<&str> = stores
        .iter()
        .map(|m| m.args["entity_key"].as_str().unwrap())
        .collect();
    assert_eq!(
        entity_keys,
        vec!["transcription_id", "grievance_id", "translation_id"]
    );
}

#[tokio::test(start_paused = true)]
async fn batch_chord_aggregates_all_members() {
    init_tracing();
    let world = world();

    world
        .broker
        .enqueue(
            "default",
            Priority::Medium,
            "process_batch_files_task",
            json!({
                "grievance_id": GRIEVANCE,
                "files_data": [
                    {"file_name": "one.pdf", "file_path": "/tmp/one.pdf"},
                    {"file_name": "two.pdf", "file_path": "/tmp/two.pdf"},
                ],
            }),
        )
        .await
        .unwrap();

    drain(&world).await;

    let aggregates = world.broker.enqueued_for("aggregate_batch_results");
    assert_eq!(aggregates.len(), 1);
    let results = aggregates[0].args["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);

    let batch_frame = world
        .sink
        .frames()
        .into_iter()
        .find(|f| f.data.get("success_count").is_some())
        .expect("aggregate frame emitted");
    assert_eq!(batch_frame.status, TaskStatus::Success);
    assert_eq!(batch_frame.data["success_count"], 2);
    assert_eq!(batch_frame.data["failed_count"], 0);
}
