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

//! Complainant model. Name, phone, email, and address are stored
//! encrypted; the `*_hash` columns carry keyed lookup hashes computed in
//! the upsert path.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::complainants)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ComplainantRow {
    pub complainant_id: String,
    pub complainant_unique_id: Option<String>,
    pub complainant_full_name: Option<String>,
    pub complainant_phone: Option<String>,
    pub complainant_email: Option<String>,
    pub complainant_province: Option<String>,
    pub complainant_district: Option<String>,
    pub complainant_municipality: Option<String>,
    pub complainant_ward: Option<String>,
    pub complainant_village: Option<String>,
    pub complainant_address: Option<String>,
    pub complainant_phone_hash: Option<String>,
    pub complainant_email_hash: Option<String>,
    pub complainant_full_name_hash: Option<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial complainant fields, deserialized from an envelope's `values`
/// map after encryption. Absent fields are left untouched on update.
#[derive(Debug, Clone, Default, Deserialize, Insertable, AsChangeset)]
#[diesel(table_name = crate::database::schema::complainants)]
pub struct ComplainantChanges {
    pub complainant_unique_id: Option<String>,
    pub complainant_full_name: Option<String>,
    pub complainant_phone: Option<String>,
    pub complainant_email: Option<String>,
    pub complainant_province: Option<String>,
    pub complainant_district: Option<String>,
    pub complainant_municipality: Option<String>,
    pub complainant_ward: Option<String>,
    pub complainant_village: Option<String>,
    pub complainant_address: Option<String>,
    pub complainant_phone_hash: Option<String>,
    pub complainant_email_hash: Option<String>,
    pub complainant_full_name_hash: Option<String>,
    pub source: Option<String>,
}
