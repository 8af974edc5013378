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

//! Schema init and recreate commands.

use anyhow::{bail, Result};
use nivaran::Database;

/// Applies pending migrations.
pub async fn init(database_url: &str) -> Result<()> {
    let database = Database::new(database_url, 2);
    database.run_migrations().await?;
    println!("Schema is up to date.");
    Ok(())
}

/// Reverts every migration and reapplies them. Destroys all data.
pub async fn recreate(database_url: &str, confirmed: bool) -> Result<()> {
    if !confirmed {
        bail!("schema recreate destroys all data; re-run with --yes to confirm");
    }
    let database = Database::new(database_url, 2);
    database.recreate_schema().await?;
    println!("Schema recreated.");
    Ok(())
}
