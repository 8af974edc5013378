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

//! Transcription Data Access Layer.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::{Map, Value};

use super::{coerce_scalars, DAL};
use crate::error::StorageError;
use crate::models::transcription::{TranscriptionChanges, TranscriptionRow};

/// Data Access Layer for transcription operations.
pub struct TranscriptionDal<'a> {
    pub(crate) dal: &'a DAL,
}

/// Creates or updates a transcription keyed on its natural id.
pub(crate) fn upsert_transcription(
    conn: &mut PgConnection,
    transcription_id: &str,
    values: &Map<String, Value>,
) -> Result<String, StorageError> {
    use crate::database::schema::grievance_transcriptions::dsl as t;

    let mut data = values.clone();
    data.remove("transcription_id");
    coerce_scalars(&mut data);
    let changes: TranscriptionChanges = serde_json::from_value(Value::Object(data))?;

    diesel::insert_into(t::grievance_transcriptions)
        .values((t::transcription_id.eq(transcription_id), &changes))
        .on_conflict(t::transcription_id)
        .do_update()
        .set((&changes, t::updated_at.eq(Utc::now())))
        .execute(conn)?;

    Ok(transcription_id.to_string())
}

impl<'a> TranscriptionDal<'a> {
    /// Creates or updates a transcription from an envelope's `values` map.
    pub async fn upsert(
        &self,
        transcription_id: &str,
        values: Map<String, Value>,
    ) -> Result<String, StorageError> {
        let conn = self.dal.database().get().await?;
        let id = transcription_id.to_string();
        conn.interact(move |conn| upsert_transcription(conn, &id, &values))
            .await?
    }

    pub async fn get_by_id(
        &self,
        transcription_id: &str,
    ) -> Result<Option<TranscriptionRow>, StorageError> {
        use crate::database::schema::grievance_transcriptions::dsl as t;

        let conn = self.dal.database().get().await?;
        let id = transcription_id.to_string();
        let row = conn
            .interact(move |conn| {
                t::grievance_transcriptions
                    .find(&id)
                    .select(TranscriptionRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await?
            .map_err(StorageError::from)?;
        Ok(row)
    }

    /// All transcriptions attached to a grievance, newest first.
    pub async fn list_for_grievance(
        &self,
        grievance_id: &str,
    ) -> Result<Vec<TranscriptionRow>, StorageError> {
        use crate::database::schema::grievance_transcriptions::dsl as t;

        let conn = self.dal.database().get().await?;
        let gid = grievance_id.to_string();
        let rows = conn
            .interact(move |conn| {
                t::grievance_transcriptions
                    .filter(t::grievance_id.eq(&gid))
                    .order(t::created_at.desc())
                    .select(TranscriptionRow::as_select())
                    .load(conn)
            })
            .await?
            .map_err(StorageError::from)?;
        Ok(rows)
    }
}
