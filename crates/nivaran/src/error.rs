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

//! Error types for the orchestration core.
//!
//! Each subsystem has its own error enum; task bodies speak [`TaskError`],
//! whose [`ErrorKind`] classification drives the retry decision. Input and
//! integrity errors are terminal by construction — the classifier refuses to
//! retry them regardless of the per-kind retry table.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a task error, used by the retry tables.
///
/// The kind is derived from the error variant, mirroring the exception-name
/// matching the retry configuration is written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A connection to an external collaborator could not be established.
    Connection,
    /// An operation ran over its time budget.
    Timeout,
    /// An upstream service applied rate limiting.
    RateLimit,
    /// The database detected a deadlock.
    Deadlock,
    /// A filesystem or network I/O failure.
    Io,
    /// A referenced file does not exist.
    FileNotFound,
    /// The input to a task was missing or malformed. Never retried.
    Input,
    /// A database constraint or foreign key was violated. Never retried.
    Integrity,
    /// Anything else.
    Other,
}

impl ErrorKind {
    /// Stable string form used in logs and persisted retry history.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::RateLimit => "RateLimitError",
            ErrorKind::Deadlock => "DeadlockError",
            ErrorKind::Io => "IOError",
            ErrorKind::FileNotFound => "FileNotFoundError",
            ErrorKind::Input => "InputError",
            ErrorKind::Integrity => "IntegrityError",
            ErrorKind::Other => "Error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by task bodies and the services they call.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Transient connectivity failure against an external service.
    #[error("connection error: {0}")]
    Connection(String),

    /// The operation exceeded its time budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The upstream service asked us to back off.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// The database reported a deadlock.
    #[error("deadlock: {0}")]
    Deadlock(String),

    /// Generic I/O failure.
    #[error("i/o error: {0}")]
    Io(String),

    /// A referenced file is missing.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Missing or malformed task input. Terminal.
    #[error("{0}")]
    Input(String),

    /// Database constraint violation. Terminal.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Any other execution failure.
    #[error("task execution failed: {0}")]
    Execution(String),
}

impl TaskError {
    /// The classification used by the retry tables.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Connection(_) => ErrorKind::Connection,
            TaskError::Timeout(_) => ErrorKind::Timeout,
            TaskError::RateLimit(_) => ErrorKind::RateLimit,
            TaskError::Deadlock(_) => ErrorKind::Deadlock,
            TaskError::Io(_) => ErrorKind::Io,
            TaskError::FileNotFound(_) => ErrorKind::FileNotFound,
            TaskError::Input(_) => ErrorKind::Input,
            TaskError::Integrity(_) => ErrorKind::Integrity,
            TaskError::Execution(_) => ErrorKind::Other,
        }
    }

    /// Input and integrity errors must never be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Input | ErrorKind::Integrity)
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => TaskError::FileNotFound(e.to_string()),
            _ => TaskError::Io(e.to_string()),
        }
    }
}

/// Errors raised while registering tasks at startup.
///
/// Registration problems are programmer errors and abort boot.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Two handlers were registered under the same name.
    #[error("there is already a task registered as '{0}'")]
    DuplicateTask(String),

    /// A task name was requested that no handler was registered for.
    #[error("task '{0}' not found in registry")]
    UnknownTask(String),
}

/// Errors from the queue broker adapter.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker connection failed.
    #[error("broker connection error: {0}")]
    Connection(#[from] redis::RedisError),

    /// A message could not be encoded or decoded.
    #[error("message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Chord bookkeeping was inconsistent (missing or duplicate member slot).
    #[error("chord state error: {0}")]
    ChordState(String),
}

/// Errors from the status bus and its HTTP bridge.
#[derive(Debug, Error)]
pub enum BusError {
    /// Publishing to the shared message queue failed.
    #[error("bus connection error: {0}")]
    Connection(#[from] redis::RedisError),

    /// The HTTP bridge call failed.
    #[error("status bridge error: {0}")]
    Http(#[from] reqwest::Error),

    /// A frame could not be encoded or decoded.
    #[error("frame serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A pooled connection could not be acquired.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// The database rejected a statement.
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// The pooled connection's interact closure panicked or was aborted.
    #[error("database interaction error: {0}")]
    Interact(String),

    /// A result envelope was missing required fields.
    #[error("Task result missing required fields: {0:?}")]
    MissingFields(Vec<&'static str>),

    /// The envelope named an entity key outside the closed set.
    #[error("invalid entity key: {0}")]
    InvalidEntityKey(String),

    /// The envelope was structurally invalid beyond missing fields.
    #[error("invalid task result: {0}")]
    InvalidEnvelope(String),

    /// An entity upsert did not produce a row.
    #[error("failed to create or update entity for {entity_key}={entity_id}")]
    EntityUpsert {
        entity_key: String,
        entity_id: String,
    },

    /// Field-level encryption failed.
    #[error("field encryption error: {0}")]
    Encryption(String),

    /// A stored or prepared payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<deadpool_diesel::InteractError> for StorageError {
    fn from(e: deadpool_diesel::InteractError) -> Self {
        StorageError::Interact(e.to_string())
    }
}

/// Errors raised while loading configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable was not set.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable was set to an unusable value.
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Errors from the worker runtime itself (not from task bodies).
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The broker adapter failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A delivered message named a task the registry does not know.
    #[error("received unregistered task '{0}'")]
    UnregisteredTask(String),

    /// The concurrency semaphore was closed.
    #[error("worker semaphore closed")]
    SemaphoreClosed(#[from] tokio::sync::AcquireError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(
            TaskError::Connection("refused".into()).kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            TaskError::RateLimit("429".into()).kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(TaskError::Input("bad".into()).kind(), ErrorKind::Input);
    }

    #[test]
    fn test_terminal_errors() {
        assert!(TaskError::Input("missing field".into()).is_terminal());
        assert!(TaskError::Integrity("fk violation".into()).is_terminal());
        assert!(!TaskError::Timeout("slow".into()).is_terminal());
        assert!(!TaskError::Execution("boom".into()).is_terminal());
    }

    #[test]
    fn test_io_error_conversion() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        assert_eq!(TaskError::from(not_found).kind(), ErrorKind::FileNotFound);

        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(TaskError::from(broken).kind(), ErrorKind::Io);
    }

    #[test]
    fn test_missing_fields_message() {
        let err = StorageError::MissingFields(vec!["id", "grievance_id", "complainant_id"]);
        assert_eq!(
            err.to_string(),
            "Task result missing required fields: [\"id\", \"grievance_id\", \"complainant_id\"]"
        );
    }
}
