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

//! Grievance model and status history.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::grievances)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct GrievanceRow {
    pub grievance_id: String,
    pub complainant_id: Option<String>,
    pub grievance_categories: Option<String>,
    pub grievance_summary: Option<String>,
    pub grievance_description: Option<String>,
    pub grievance_claimed_amount: Option<f64>,
    pub grievance_location: Option<String>,
    pub language_code: String,
    pub classification_status: String,
    pub grievance_creation_date: DateTime<Utc>,
    pub grievance_modification_date: DateTime<Utc>,
    /// True until the first full submission lands
    pub is_temporary: bool,
    pub source: String,
}

/// Partial grievance fields from an envelope's `values` map.
#[derive(Debug, Clone, Default, Deserialize, Insertable, AsChangeset)]
#[diesel(table_name = crate::database::schema::grievances)]
pub struct GrievanceChanges {
    pub complainant_id: Option<String>,
    pub grievance_categories: Option<String>,
    pub grievance_summary: Option<String>,
    pub grievance_description: Option<String>,
    pub grievance_claimed_amount: Option<f64>,
    pub grievance_location: Option<String>,
    pub language_code: Option<String>,
    pub classification_status: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::grievance_status_history)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StatusHistoryRow {
    pub id: i32,
    pub grievance_id: String,
    pub status_code: String,
    pub assigned_to: Option<String>,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A new status history entry. History rows are appended, never updated.
#[derive(Debug, Insertable)]
#[diesel(table_name = crate::database::schema::grievance_status_history)]
pub struct NewStatusHistory {
    pub grievance_id: String,
    pub status_code: String,
    pub assigned_to: Option<String>,
    pub notes: Option<String>,
    pub created_by: String,
}
