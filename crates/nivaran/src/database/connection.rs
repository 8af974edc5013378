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

//! Database connection management for PostgreSQL using Diesel ORM.
//!
//! This module provides an async connection pool implementation using
//! `deadpool-diesel` for managing PostgreSQL connections efficiently.
//! Queries run on the pool's blocking executor via `interact` closures;
//! multi-statement updates wrap a single Diesel transaction inside one
//! closure so they commit or roll back atomically.
//!
//! # Error Handling
//!
//! Pool construction panics on invalid configuration, as this is a fatal
//! startup error. Connection acquisition and query failures surface as
//! [`StorageError`].

use deadpool_diesel::postgres::{Manager, Object, Pool, Runtime};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use crate::error::StorageError;

/// Embedded schema migrations, applied by `nivaran-ctl schema init`.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// A pool of PostgreSQL database connections.
///
/// `Database` is `Clone`; each clone references the same underlying pool
/// and can be safely shared between tasks.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
}

impl Database {
    /// Creates a new connection pool.
    ///
    /// # Panics
    ///
    /// Panics when the pool cannot be constructed — a fatal error handled
    /// at application startup.
    pub fn new(database_url: &str, max_size: usize) -> Self {
        let manager = Manager::new(database_url, Runtime::Tokio1);
        let pool = Pool::builder(manager)
            .max_size(max_size)
            .build()
            .expect("Failed to create database connection pool");

        info!(max_size, "Database connection pool initialized");
        Self { pool }
    }

    /// Acquires a pooled connection.
    pub async fn get(&self) -> Result<Object, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Pool(e.to_string()))
    }

    /// Applies any pending embedded migrations.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.get().await?;
        conn.interact(|conn| {
            conn.run_pending_migrations(MIGRATIONS)
                .map(|applied| applied.len())
                .map_err(|e| StorageError::Interact(e.to_string()))
        })
        .await?
        .map(|applied| {
            if applied > 0 {
                info!(applied, "Applied pending migrations");
            }
        })
    }

    /// Reverts every applied migration, then reapplies them all. Used by
    /// the schema-recreate operator command; destroys all data.
    pub async fn recreate_schema(&self) -> Result<(), StorageError> {
        let conn = self.get().await?;
        conn.interact(|conn| {
            conn.revert_all_migrations(MIGRATIONS)
                .map_err(|e| StorageError::Interact(e.to_string()))?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| StorageError::Interact(e.to_string()))?;
            Ok::<(), StorageError>(())
        })
        .await??;
        info!("Schema recreated from embedded migrations");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("status", &self.pool.status())
            .finish()
    }
}
