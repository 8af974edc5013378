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

//! # Task Registry
//!
//! Startup-time mapping from task name to configuration and body. Each
//! registered handler declares its [`TaskKind`]; the registry derives the
//! target queue, priority, retry policy, and service label from the kind
//! and makes them available to the broker adapter and the worker runtime.
//!
//! Registration is explicit and happens once at startup. Re-registering a
//! name is a programmer error that aborts boot; after startup the registry
//! never mutates.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::info;

use crate::config::QueueNames;
use crate::error::RegistrationError;
use crate::retry::RetryPolicy;
use crate::task::{Priority, TaskHandler, TaskKind};

/// Dispatch configuration derived from a task's kind.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub kind: TaskKind,
    /// Opaque service label used in logs and metrics.
    pub service: &'static str,
    /// Target queue name.
    pub queue: String,
    /// Queue priority.
    pub priority: Priority,
    /// Retry policy consulted by the lifecycle manager.
    pub retry: RetryPolicy,
}

impl TaskConfig {
    /// Builds the configuration for a kind under the given queue names.
    pub fn for_kind(kind: TaskKind, queues: &QueueNames) -> Self {
        let queue = match kind {
            TaskKind::Llm => queues.llm.clone(),
            _ => queues.default.clone(),
        };
        Self {
            kind,
            service: kind.service(),
            queue,
            priority: kind.priority(),
            retry: RetryPolicy::for_kind(kind),
        }
    }
}

struct RegisteredTask {
    handler: Arc<dyn TaskHandler>,
    config: TaskConfig,
}

/// The task registry: source of truth for dispatch.
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
    queues: QueueNames,
}

impl TaskRegistry {
    pub fn new(queues: QueueNames) -> Self {
        Self {
            tasks: HashMap::new(),
            queues,
        }
    }

    /// Registers a handler under its declared name and kind.
    ///
    /// Fails with [`RegistrationError::DuplicateTask`] when the name is
    /// already taken.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), RegistrationError> {
        let name = handler.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(RegistrationError::DuplicateTask(name));
        }

        let config = TaskConfig::for_kind(handler.kind(), &self.queues);
        info!(
            task = %name,
            kind = %config.kind,
            queue = %config.queue,
            priority = config.priority.as_u8(),
            service = config.service,
            "Task registered"
        );

        self.tasks.insert(name, RegisteredTask { handler, config });
        Ok(())
    }

    /// Looks up a handler by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.tasks.get(name).map(|t| &t.handler)
    }

    /// Looks up the dispatch configuration for a name.
    pub fn config_for(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.get(name).map(|t| &t.config)
    }

    /// Looks up a handler together with its configuration.
    pub fn entry(&self, name: &str) -> Option<(&Arc<dyn TaskHandler>, &TaskConfig)> {
        self.tasks.get(name).map(|t| (&t.handler, &t.config))
    }

    /// Like [`TaskRegistry::config_for`] but failing loudly, for callers
    /// that already validated the name.
    pub fn require_config(&self, name: &str) -> Result<&TaskConfig, RegistrationError> {
        self.config_for(name)
            .ok_or_else(|| RegistrationError::UnknownTask(name.to_string()))
    }

    /// Names of every task targeting the given queue. Used by worker pools
    /// to declare queue consumption.
    pub fn list_by_queue(&self, queue: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.config.queue == queue)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// The distinct queues declared by registered tasks.
    pub fn queues(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .tasks
            .values()
            .map(|t| t.config.queue.clone())
            .collect();
        set.into_iter().collect()
    }

    /// All registered task names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// The kind each production task belongs to. Used when a task needs to
/// enqueue a follow-on without holding a registry reference.
pub fn kind_of_task(name: &str) -> TaskKind {
    match name {
        "process_file_upload_task" | "process_batch_files_task" | "aggregate_batch_results" => {
            TaskKind::FileUpload
        }
        "send_sms_task" | "send_email_task" => TaskKind::Messaging,
        "transcribe_audio_file_task"
        | "classify_and_summarize_grievance_task"
        | "extract_contact_info_task"
        | "translate_grievance_to_english_task" => TaskKind::Llm,
        "store_result_to_db_task" => TaskKind::Database,
        _ => TaskKind::Default,
    }
}
