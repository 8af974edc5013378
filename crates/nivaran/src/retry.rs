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

//! Retry policies and the retry-or-fail decision.
//!
//! Each task kind carries a fixed policy: maximum retries, exponential
//! backoff bounds, and the set of error kinds worth retrying. The delay for
//! attempt `n` is `min(initial · backoff^n, max)` plus up to 10% random
//! jitter to avoid thundering herds. Input and integrity errors are never
//! retried regardless of the table.

use std::time::Duration;

use rand::Rng;

use crate::error::{ErrorKind, TaskError};
use crate::task::TaskKind;

/// Which error kinds a policy retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOn {
    /// Retry every non-terminal error.
    Any,
    /// Retry only the listed kinds.
    Kinds(&'static [ErrorKind]),
}

/// Retry policy attached to a task kind.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any computed delay, before jitter.
    pub max_delay: Duration,
    /// Exponential backoff multiplier.
    pub backoff_factor: u32,
    /// The error kinds this policy retries.
    pub retry_on: RetryOn,
}

impl RetryPolicy {
    /// The fixed policy table, by task kind.
    pub fn for_kind(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Llm => Self {
                max_retries: 3,
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                backoff_factor: 2,
                retry_on: RetryOn::Kinds(&[
                    ErrorKind::Connection,
                    ErrorKind::Timeout,
                    ErrorKind::RateLimit,
                ]),
            },
            TaskKind::FileUpload => Self {
                max_retries: 2,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                backoff_factor: 2,
                retry_on: RetryOn::Kinds(&[ErrorKind::Io, ErrorKind::FileNotFound]),
            },
            TaskKind::Database => Self {
                max_retries: 3,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(20),
                backoff_factor: 2,
                retry_on: RetryOn::Kinds(&[
                    ErrorKind::Connection,
                    ErrorKind::Timeout,
                    ErrorKind::Deadlock,
                ]),
            },
            TaskKind::Messaging => Self {
                max_retries: 2,
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(15),
                backoff_factor: 2,
                retry_on: RetryOn::Kinds(&[ErrorKind::Connection, ErrorKind::Timeout]),
            },
            TaskKind::Default => Self {
                max_retries: 2,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                backoff_factor: 2,
                retry_on: RetryOn::Any,
            },
        }
    }

    /// Decides whether a failed attempt should be retried.
    ///
    /// `attempt` is the broker's attempt counter for the execution that
    /// just failed (0 on first run). Terminal error kinds (input,
    /// integrity) are never retried.
    pub fn should_retry(&self, error: &TaskError, attempt: u32) -> bool {
        if error.is_terminal() {
            return false;
        }
        if attempt >= self.max_retries {
            return false;
        }
        match &self.retry_on {
            RetryOn::Any => true,
            RetryOn::Kinds(kinds) => kinds.contains(&error.kind()),
        }
    }

    /// Computes the delay before the next attempt: exponential backoff
    /// capped at `max_delay`, plus up to 10% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = if attempt == 0 {
            self.initial_delay.as_secs_f64()
        } else {
            let exp = self.initial_delay.as_secs_f64()
                * f64::from(self.backoff_factor).powi(attempt as i32);
            exp.min(self.max_delay.as_secs_f64())
        };

        let jitter = rand::thread_rng().gen_range(0.0..(0.1 * base).max(f64::EPSILON));
        Duration::from_secs_f64(base + jitter)
    }
}
