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

//! # Nivaran
//!
//! Nivaran is the asynchronous task orchestration core of a multilingual
//! grievance-intake platform. Citizen complaints (text, voice, file
//! attachments) flow through a pipeline of language-model operations —
//! transcription, classification and summarization, contact-info
//! extraction, translation — followed by persistence, notification, and
//! realtime status push to connected clients.
//!
//! ## Architecture
//!
//! The crate is organized around a small set of cooperating subsystems:
//!
//! - [`registry`]: typed task registry mapping each task name to its kind,
//!   queue, priority, retry policy, and service identity
//! - [`broker`]: queue broker adapter (Redis-backed, with an in-memory mock)
//!   providing at-least-once delivery, delayed enqueue, and group/chord
//!   composition
//! - [`worker`]: the worker runtime and per-attempt task lifecycle state
//!   machine (*enqueued → started → (retrying) → success|failed*)
//! - [`dal`]: the retroactive persistence layer — entities are upserted
//!   before their task rows are created, resolving the task ↔ entity
//!   ordering cycle
//! - [`bus`]: the status bus publishing per-room status frames to clients,
//!   backed by Redis pub/sub and bridged from workers over HTTP
//! - [`pipeline`]: fan-out/fan-in (group/chord) and chained follow-on
//!   composition of task graphs
//! - [`retry`]: per-kind retry policies with exponential backoff and jitter
//!
//! External collaborators — LLM operations, messaging, file staging — are
//! modeled as opaque services behind traits in [`services`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use nivaran::config::OrchestratorConfig;
//! use nivaran::runner::Runner;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrchestratorConfig::from_env()?;
//! let runner = Runner::new(config).await?;
//! runner.run_workers().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod bus;
pub mod config;
pub mod crypto;
pub mod dal;
pub mod database;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod services;
pub mod task;
pub mod tasks;
pub mod worker;

// Re-export commonly used types
pub use broker::{Broker, Delivery, MockBroker, RedisBroker, TaskMessage};
pub use bus::{StatusBus, StatusFrame};
pub use config::OrchestratorConfig;
pub use dal::store::DatabaseTaskManager;
pub use dal::DAL;
pub use database::Database;
pub use error::{
    BrokerError, BusError, ConfigError, ErrorKind, RegistrationError, StorageError, TaskError,
    WorkerError,
};
pub use registry::{TaskConfig, TaskRegistry};
pub use retry::RetryPolicy;
pub use runner::{Runner, Services};
pub use task::{
    EntityKey, Priority, Source, TaskContext, TaskEnvelope, TaskHandler, TaskKind, TaskStatus,
};
pub use worker::{TaskLifecycle, WorkerPool};
