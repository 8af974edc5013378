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

//! Transcription model. The automated transcript lands here from the
//! transcription task's result envelope; verification fields are filled by
//! reviewers later.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::grievance_transcriptions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TranscriptionRow {
    pub transcription_id: String,
    pub recording_id: Option<String>,
    pub grievance_id: Option<String>,
    pub field_name: Option<String>,
    pub automated_transcript: Option<String>,
    pub verified_transcript: Option<String>,
    pub verification_status: String,
    pub confidence_score: Option<f64>,
    pub verification_notes: Option<String>,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub language_code: Option<String>,
    pub language_code_detect: Option<String>,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial transcription fields from an envelope's `values` map.
#[derive(Debug, Clone, Default, Deserialize, Insertable, AsChangeset)]
#[diesel(table_name = crate::database::schema::grievance_transcriptions)]
pub struct TranscriptionChanges {
    pub recording_id: Option<String>,
    pub grievance_id: Option<String>,
    pub field_name: Option<String>,
    pub automated_transcript: Option<String>,
    pub confidence_score: Option<f64>,
    pub language_code: Option<String>,
    pub language_code_detect: Option<String>,
    pub task_id: Option<String>,
}
