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

//! Complainant Data Access Layer.
//!
//! Sensitive fields (name, phone, email, address) are encrypted inside the
//! upsert path; keyed lookup hashes are computed alongside so equality
//! search works without decryption. Reads decrypt before returning.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::{Map, Value};

use super::{coerce_scalars, DAL};
use crate::crypto::{FieldCipher, HASHED_FIELDS, SENSITIVE_FIELDS};
use crate::error::StorageError;
use crate::models::complainant::{ComplainantChanges, ComplainantRow};
use crate::task::Source;

/// Data Access Layer for complainant operations.
pub struct ComplainantDal<'a> {
    pub(crate) dal: &'a DAL,
}

/// Creates or updates a complainant keyed on its natural id.
///
/// Runs on a borrowed connection so the store path can call it inside its
/// transaction. Returns the complainant id.
pub(crate) fn upsert_complainant(
    conn: &mut PgConnection,
    cipher: &FieldCipher,
    complainant_id: &str,
    values: &Map<String, Value>,
) -> Result<String, StorageError> {
    use crate::database::schema::complainants::dsl as c;

    let mut data = values.clone();
    data.remove("complainant_id");
    coerce_scalars(&mut data);

    // Cleartext only lives in memory: encrypt and hash before the row forms.
    for field in SENSITIVE_FIELDS {
        if let Some(Value::String(plain)) = data.get(field).cloned() {
            if HASHED_FIELDS.contains(&field) {
                data.insert(
                    format!("{}_hash", field),
                    Value::String(cipher.lookup_hash(&plain)),
                );
            }
            data.insert(field.to_string(), Value::String(cipher.encrypt(&plain)?));
        }
    }

    let mut changes: ComplainantChanges = serde_json::from_value(Value::Object(data))?;
    if changes.source.is_none() {
        changes.source = Some(Source::of_id(complainant_id).as_str().to_string());
    }

    diesel::insert_into(c::complainants)
        .values((c::complainant_id.eq(complainant_id), &changes))
        .on_conflict(c::complainant_id)
        .do_update()
        .set((&changes, c::updated_at.eq(Utc::now())))
        .execute(conn)?;

    Ok(complainant_id.to_string())
}

impl<'a> ComplainantDal<'a> {
    /// Creates or updates a complainant from an envelope's `values` map.
    pub async fn upsert(
        &self,
        complainant_id: &str,
        values: Map<String, Value>,
    ) -> Result<String, StorageError> {
        let conn = self.dal.database().get().await?;
        let cipher = self.dal.cipher().clone();
        let id = complainant_id.to_string();
        conn.interact(move |conn| upsert_complainant(conn, &cipher, &id, &values))
            .await?
    }

    /// Fetches a complainant by id, decrypting sensitive fields.
    pub async fn get_by_id(
        &self,
        complainant_id: &str,
    ) -> Result<Option<ComplainantRow>, StorageError> {
        use crate::database::schema::complainants::dsl as c;

        let conn = self.dal.database().get().await?;
        let id = complainant_id.to_string();
        let row: Option<ComplainantRow> = conn
            .interact(move |conn| {
                c::complainants
                    .find(&id)
                    .select(ComplainantRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await?
            .map_err(StorageError::from)?;

        let cipher = self.dal.cipher();
        Ok(row.map(|mut row| {
            for field in [
                &mut row.complainant_full_name,
                &mut row.complainant_phone,
                &mut row.complainant_email,
                &mut row.complainant_address,
            ] {
                if let Some(stored) = field.take() {
                    *field = cipher.decrypt(&stored).ok();
                }
            }
            row
        }))
    }

    /// Finds complainants by phone number using the keyed lookup hash, so
    /// no stored value is decrypted during the search.
    pub async fn find_by_phone(&self, phone: &str) -> Result<Vec<ComplainantRow>, StorageError> {
        use crate::database::schema::complainants::dsl as c;

        let hash = self.dal.cipher().lookup_hash(phone);
        let conn = self.dal.database().get().await?;
        let rows = conn
            .interact(move |conn| {
                c::complainants
                    .filter(c::complainant_phone_hash.eq(&hash))
                    .select(ComplainantRow::as_select())
                    .load(conn)
            })
            .await?
            .map_err(StorageError::from)?;
        Ok(rows)
    }
}
