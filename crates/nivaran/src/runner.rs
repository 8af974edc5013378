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

//! Process wiring.
//!
//! A [`Services`] context is constructed once at process start — database
//! handle, broker client, status bridge, opaque collaborators — and passed
//! explicitly into every task invocation. There are no process-wide
//! singletons; tests assemble a `Services` from mocks the same way
//! production assembles one from the environment.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::broker::{Broker, RedisBroker};
use crate::bus::{StatusClient, StatusSink};
use crate::config::OrchestratorConfig;
use crate::crypto::FieldCipher;
use crate::dal::store::DatabaseTaskManager;
use crate::dal::DAL;
use crate::database::Database;
use crate::error::{BrokerError, ConfigError, RegistrationError, StorageError, WorkerError};
use crate::registry::{self, TaskConfig, TaskRegistry};
use crate::services::{
    FileService, HttpLlmService, HttpMessagingService, LlmService, LocalFileService,
    MessagingService,
};
use crate::tasks::register_builtin_tasks;
use crate::worker::WorkerPool;

/// Errors raised while assembling or running a process.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// The shared services handed to every task invocation.
pub struct Services {
    pub config: OrchestratorConfig,
    pub broker: Arc<dyn Broker>,
    pub status: Arc<dyn StatusSink>,
    /// The retroactive persistence layer. Absent in processes that only
    /// enqueue (the store task fails its envelope when missing).
    pub store: Option<Arc<DatabaseTaskManager>>,
    pub llm: Arc<dyn LlmService>,
    pub messaging: Arc<dyn MessagingService>,
    pub files: Arc<dyn FileService>,
}

impl Services {
    /// Enqueues a task by name on its kind's queue and priority.
    pub async fn enqueue_task(&self, task_name: &str, args: Value) -> Result<String, BrokerError> {
        let kind = registry::kind_of_task(task_name);
        let config = TaskConfig::for_kind(kind, &self.config.queues);
        self.broker
            .enqueue(&config.queue, config.priority, task_name, args)
            .await
    }

    /// The dispatch configuration a task name resolves to.
    pub fn task_config(&self, task_name: &str) -> TaskConfig {
        TaskConfig::for_kind(registry::kind_of_task(task_name), &self.config.queues)
    }
}

/// Assembles the production services and runs worker pools.
pub struct Runner {
    services: Arc<Services>,
    registry: Arc<TaskRegistry>,
}

impl Runner {
    /// Builds a runner from configuration: Redis broker, HTTP status
    /// bridge, Postgres persistence, HTTP-backed collaborators, and the
    /// builtin task registry.
    pub async fn new(config: OrchestratorConfig) -> Result<Self, RunnerError> {
        let cipher = Arc::new(FieldCipher::from_key(config.encryption_key.as_deref())?);
        let database = Database::new(&config.database_url, config.db_pool_size);
        let dal = DAL::new(database, cipher);
        let store = Arc::new(DatabaseTaskManager::new(dal));

        let broker = RedisBroker::connect(&config.broker_url, config.visibility_timeout).await?;
        let status = StatusClient::new(&config.web_base_url);
        let llm = HttpLlmService::new(&config.llm_base_url);
        let messaging = HttpMessagingService::new(&config.messaging_base_url);
        let files = LocalFileService::new(
            config.upload_dir.clone(),
            config.allowed_extensions.clone(),
        );

        let mut registry = TaskRegistry::new(config.queues.clone());
        register_builtin_tasks(&mut registry)?;

        let services = Arc::new(Services {
            config,
            broker: Arc::new(broker),
            status: Arc::new(status),
            store: Some(store),
            llm: Arc::new(llm),
            messaging: Arc::new(messaging),
            files: Arc::new(files),
        });

        info!(
            tasks = registry.names().len(),
            queues = ?registry.queues(),
            "Runner assembled"
        );

        Ok(Self {
            services,
            registry: Arc::new(registry),
        })
    }

    pub fn services(&self) -> Arc<Services> {
        Arc::clone(&self.services)
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&self.registry)
    }

    /// Runs the worker pool until the process is stopped.
    pub async fn run_workers(&self) -> Result<(), RunnerError> {
        let pool = WorkerPool::new(Arc::clone(&self.services), Arc::clone(&self.registry));
        pool.run().await?;
        Ok(())
    }
}
