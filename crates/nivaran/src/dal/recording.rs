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

//! Voice recording Data Access Layer.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::{Map, Value};

use super::{coerce_scalars, DAL};
use crate::error::StorageError;
use crate::models::recording::{RecordingChanges, RecordingRow};

/// Data Access Layer for voice recording operations.
pub struct RecordingDal<'a> {
    pub(crate) dal: &'a DAL,
}

/// Creates or updates a recording keyed on its natural id.
pub(crate) fn upsert_recording(
    conn: &mut PgConnection,
    recording_id: &str,
    values: &Map<String, Value>,
) -> Result<String, StorageError> {
    use crate::database::schema::grievance_voice_recordings::dsl as r;

    let mut data = values.clone();
    data.remove("recording_id");
    coerce_scalars(&mut data);
    let changes: RecordingChanges = serde_json::from_value(Value::Object(data))?;

    diesel::insert_into(r::grievance_voice_recordings)
        .values((r::recording_id.eq(recording_id), &changes))
        .on_conflict(r::recording_id)
        .do_update()
        .set((&changes, r::updated_at.eq(Utc::now())))
        .execute(conn)?;

    Ok(recording_id.to_string())
}

impl<'a> RecordingDal<'a> {
    /// Creates or updates a recording from an envelope's `values` map.
    pub async fn upsert(
        &self,
        recording_id: &str,
        values: Map<String, Value>,
    ) -> Result<String, StorageError> {
        let conn = self.dal.database().get().await?;
        let id = recording_id.to_string();
        conn.interact(move |conn| upsert_recording(conn, &id, &values))
            .await?
    }

    pub async fn get_by_id(&self, recording_id: &str) -> Result<Option<RecordingRow>, StorageError> {
        use crate::database::schema::grievance_voice_recordings::dsl as r;

        let conn = self.dal.database().get().await?;
        let id = recording_id.to_string();
        let row = conn
            .interact(move |conn| {
                r::grievance_voice_recordings
                    .find(&id)
                    .select(RecordingRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await?
            .map_err(StorageError::from)?;
        Ok(row)
    }

    /// The most recent recording for a grievance and form field, used by
    /// the transcription task to resolve its recording when the caller
    /// didn't pass one.
    pub async fn find_for_grievance_field(
        &self,
        grievance_id: &str,
        field_name: &str,
    ) -> Result<Option<RecordingRow>, StorageError> {
        use crate::database::schema::grievance_voice_recordings::dsl as r;

        let conn = self.dal.database().get().await?;
        let gid = grievance_id.to_string();
        let field = field_name.to_string();
        let row = conn
            .interact(move |conn| {
                r::grievance_voice_recordings
                    .filter(r::grievance_id.eq(&gid))
                    .filter(r::field_name.eq(&field))
                    .order(r::created_at.desc())
                    .select(RecordingRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await?
            .map_err(StorageError::from)?;
        Ok(row)
    }
}
