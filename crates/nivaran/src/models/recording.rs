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

//! Voice recording model.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::grievance_voice_recordings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct RecordingRow {
    pub recording_id: String,
    pub complainant_id: Option<String>,
    pub grievance_id: Option<String>,
    pub task_id: Option<String>,
    pub file_path: String,
    pub field_name: String,
    pub duration_seconds: Option<i32>,
    pub file_size: Option<i32>,
    pub processing_status: String,
    pub language_code: Option<String>,
    pub language_code_detect: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial recording fields from an envelope's `values` map.
#[derive(Debug, Clone, Default, Deserialize, Insertable, AsChangeset)]
#[diesel(table_name = crate::database::schema::grievance_voice_recordings)]
pub struct RecordingChanges {
    pub complainant_id: Option<String>,
    pub grievance_id: Option<String>,
    pub task_id: Option<String>,
    pub file_path: Option<String>,
    pub field_name: Option<String>,
    pub duration_seconds: Option<i32>,
    pub file_size: Option<i32>,
    pub processing_status: Option<String>,
    pub language_code: Option<String>,
    pub language_code_detect: Option<String>,
}
