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

//! English translation model.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::grievance_translations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TranslationRow {
    pub translation_id: String,
    pub grievance_id: Option<String>,
    pub task_id: Option<String>,
    pub grievance_description_en: Option<String>,
    pub grievance_summary_en: Option<String>,
    pub grievance_categories_en: Option<String>,
    pub source_language: String,
    pub translation_method: String,
    pub confidence_score: Option<f64>,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial translation fields from an envelope's `values` map.
#[derive(Debug, Clone, Default, Deserialize, Insertable, AsChangeset)]
#[diesel(table_name = crate::database::schema::grievance_translations)]
pub struct TranslationChanges {
    pub grievance_id: Option<String>,
    pub task_id: Option<String>,
    pub grievance_description_en: Option<String>,
    pub grievance_summary_en: Option<String>,
    pub grievance_categories_en: Option<String>,
    pub source_language: Option<String>,
    pub translation_method: Option<String>,
    pub confidence_score: Option<f64>,
}
