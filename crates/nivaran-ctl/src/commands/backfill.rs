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

//! Status-history backfill.

use std::sync::Arc;

use anyhow::Result;
use nivaran::crypto::FieldCipher;
use nivaran::{Database, DAL};

/// Appends SUBMITTED history entries for submitted grievances lacking one.
pub async fn submitted_history(database_url: &str) -> Result<()> {
    let cipher = Arc::new(FieldCipher::from_key(
        std::env::var("DB_ENCRYPTION_KEY").ok().as_deref(),
    )?);
    let database = Database::new(database_url, 2);
    let dal = DAL::new(database, cipher);

    let appended = dal.grievances().backfill_submitted_history().await?;
    println!("Backfilled {} SUBMITTED history entries.", appended);
    Ok(())
}
