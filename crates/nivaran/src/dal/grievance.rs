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

//! Grievance Data Access Layer.
//!
//! A grievance upsert receives the flat field set of a result envelope and
//! splits it: `complainant_`-prefixed fields go to the complainant upsert,
//! the rest lands on the grievance row. The first upsert carrying a full
//! submission (a grievance description) clears the temporary flag and
//! appends a SUBMITTED entry to the status history. History rows are
//! append-only.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::{Map, Value};

use super::complainant::upsert_complainant;
use super::{coerce_scalars, DAL};
use crate::crypto::FieldCipher;
use crate::error::StorageError;
use crate::models::grievance::{GrievanceChanges, GrievanceRow, NewStatusHistory, StatusHistoryRow};
use crate::task::Source;

/// Status code recorded on the first full submission.
pub const STATUS_SUBMITTED: &str = "SUBMITTED";

/// Data Access Layer for grievance operations.
pub struct GrievanceDal<'a> {
    pub(crate) dal: &'a DAL,
}

/// Creates or updates a grievance (and, when complainant fields ride
/// along, its complainant) keyed on the natural ids. Returns the
/// grievance id.
pub(crate) fn upsert_grievance(
    conn: &mut PgConnection,
    cipher: &FieldCipher,
    grievance_id: &str,
    values: &Map<String, Value>,
) -> Result<String, StorageError> {
    use crate::database::schema::grievance_status_history::dsl as h;
    use crate::database::schema::grievances::dsl as g;

    let complainant_id = values
        .get("complainant_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    // Split the flat field set: complainant fields vs grievance fields.
    let mut complainant_fields = Map::new();
    let mut grievance_fields = Map::new();
    for (key, value) in values {
        if key == "grievance_id" || key == "task_id" {
            continue;
        }
        if key.starts_with("complainant_") && key != "complainant_id" {
            complainant_fields.insert(key.clone(), value.clone());
        } else {
            grievance_fields.insert(key.clone(), value.clone());
        }
    }

    if !complainant_fields.is_empty() {
        if let Some(cid) = &complainant_id {
            upsert_complainant(conn, cipher, cid, &complainant_fields)?;
        }
    }

    coerce_scalars(&mut grievance_fields);
    let mut changes: GrievanceChanges = serde_json::from_value(Value::Object(grievance_fields))?;
    changes.complainant_id = complainant_id;
    if changes.source.is_none() {
        changes.source = Some(Source::of_id(grievance_id).as_str().to_string());
    }

    let was_temporary: Option<bool> = g::grievances
        .find(grievance_id)
        .select(g::is_temporary)
        .first(conn)
        .optional()?;
    let full_submission = changes
        .grievance_description
        .as_deref()
        .is_some_and(|d| !d.is_empty());

    diesel::insert_into(g::grievances)
        .values((g::grievance_id.eq(grievance_id), &changes))
        .on_conflict(g::grievance_id)
        .do_update()
        .set((&changes, g::grievance_modification_date.eq(Utc::now())))
        .execute(conn)?;

    if full_submission && was_temporary.unwrap_or(true) {
        diesel::update(g::grievances.find(grievance_id))
            .set(g::is_temporary.eq(false))
            .execute(conn)?;
        diesel::insert_into(h::grievance_status_history)
            .values(&NewStatusHistory {
                grievance_id: grievance_id.to_string(),
                status_code: STATUS_SUBMITTED.to_string(),
                assigned_to: None,
                notes: Some("Initial grievance creation (first submission)".to_string()),
                created_by: "system".to_string(),
            })
            .execute(conn)?;
    }

    Ok(grievance_id.to_string())
}

impl<'a> GrievanceDal<'a> {
    /// Creates or updates a grievance from an envelope's `values` map.
    pub async fn upsert(
        &self,
        grievance_id: &str,
        values: Map<String, Value>,
    ) -> Result<String, StorageError> {
        let conn = self.dal.database().get().await?;
        let cipher = self.dal.cipher().clone();
        let id = grievance_id.to_string();
        conn.interact(move |conn| upsert_grievance(conn, &cipher, &id, &values))
            .await?
    }

    pub async fn get_by_id(&self, grievance_id: &str) -> Result<Option<GrievanceRow>, StorageError> {
        use crate::database::schema::grievances::dsl as g;

        let conn = self.dal.database().get().await?;
        let id = grievance_id.to_string();
        let row = conn
            .interact(move |conn| {
                g::grievances
                    .find(&id)
                    .select(GrievanceRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await?
            .map_err(StorageError::from)?;
        Ok(row)
    }

    /// The status history of a grievance, oldest first.
    pub async fn status_history(
        &self,
        grievance_id: &str,
    ) -> Result<Vec<StatusHistoryRow>, StorageError> {
        use crate::database::schema::grievance_status_history::dsl as h;

        let conn = self.dal.database().get().await?;
        let id = grievance_id.to_string();
        let rows = conn
            .interact(move |conn| {
                h::grievance_status_history
                    .filter(h::grievance_id.eq(&id))
                    .order(h::created_at.asc())
                    .select(StatusHistoryRow::as_select())
                    .load(conn)
            })
            .await?
            .map_err(StorageError::from)?;
        Ok(rows)
    }

    /// Appends SUBMITTED history entries for every non-temporary grievance
    /// that lacks one. Operator backfill; returns the number appended.
    pub async fn backfill_submitted_history(&self) -> Result<usize, StorageError> {
        use crate::database::schema::grievance_status_history::dsl as h;
        use crate::database::schema::grievances::dsl as g;

        let conn = self.dal.database().get().await?;
        conn.interact(|conn| {
            conn.transaction::<usize, StorageError, _>(|conn| {
                let submitted: Vec<String> = h::grievance_status_history
                    .filter(h::status_code.eq(STATUS_SUBMITTED))
                    .select(h::grievance_id)
                    .load(conn)?;
                let missing: Vec<String> = g::grievances
                    .filter(g::is_temporary.eq(false))
                    .filter(g::grievance_id.ne_all(&submitted))
                    .select(g::grievance_id)
                    .load(conn)?;

                let entries: Vec<NewStatusHistory> = missing
                    .iter()
                    .map(|grievance_id| NewStatusHistory {
                        grievance_id: grievance_id.clone(),
                        status_code: STATUS_SUBMITTED.to_string(),
                        assigned_to: None,
                        notes: Some("Backfilled submission entry".to_string()),
                        created_by: "system".to_string(),
                    })
                    .collect();
                diesel::insert_into(h::grievance_status_history)
                    .values(&entries)
                    .execute(conn)?;
                Ok(entries.len())
            })
        })
        .await?
    }
}
