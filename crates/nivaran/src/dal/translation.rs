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

//! Translation Data Access Layer.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::{Map, Value};

use super::{coerce_scalars, DAL};
use crate::error::StorageError;
use crate::models::translation::{TranslationChanges, TranslationRow};

/// Data Access Layer for translation operations.
pub struct TranslationDal<'a> {
    pub(crate) dal: &'a DAL,
}

/// Creates or updates a translation keyed on its natural id.
pub(crate) fn upsert_translation(
    conn: &mut PgConnection,
    translation_id: &str,
    values: &Map<String, Value>,
) -> Result<String, StorageError> {
    use crate::database::schema::grievance_translations::dsl as t;

    let mut data = values.clone();
    data.remove("translation_id");
    coerce_scalars(&mut data);
    let changes: TranslationChanges = serde_json::from_value(Value::Object(data))?;

    diesel::insert_into(t::grievance_translations)
        .values((t::translation_id.eq(translation_id), &changes))
        .on_conflict(t::translation_id)
        .do_update()
        .set((&changes, t::updated_at.eq(Utc::now())))
        .execute(conn)?;

    Ok(translation_id.to_string())
}

impl<'a> TranslationDal<'a> {
    /// Creates or updates a translation from an envelope's `values` map.
    pub async fn upsert(
        &self,
        translation_id: &str,
        values: Map<String, Value>,
    ) -> Result<String, StorageError> {
        let conn = self.dal.database().get().await?;
        let id = translation_id.to_string();
        conn.interact(move |conn| upsert_translation(conn, &id, &values))
            .await?
    }

    pub async fn get_by_id(
        &self,
        translation_id: &str,
    ) -> Result<Option<TranslationRow>, StorageError> {
        use crate::database::schema::grievance_translations::dsl as t;

        let conn = self.dal.database().get().await?;
        let id = translation_id.to_string();
        let row = conn
            .interact(move |conn| {
                t::grievance_translations
                    .find(&id)
                    .select(TranslationRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await?
            .map_err(StorageError::from)?;
        Ok(row)
    }
}
