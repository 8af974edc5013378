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

//! Data Access Layer.
//!
//! Each entity gets a small DAL handle borrowed from the central [`DAL`];
//! the per-entity upserts are also exposed as synchronous functions over a
//! borrowed connection so the database task manager can compose several of
//! them inside a single transaction (entity upsert before task-row insert,
//! always).
//!
//! Upserts are keyed on the entity's natural id and are idempotent:
//! re-running one with the same values yields the same row. Partial
//! updates only touch the fields present in the incoming `values` map.

pub mod complainant;
pub mod grievance;
pub mod recording;
pub mod store;
pub mod task;
pub mod transcription;
pub mod translation;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::crypto::FieldCipher;
use crate::database::Database;

pub use complainant::ComplainantDal;
pub use grievance::GrievanceDal;
pub use recording::RecordingDal;
pub use task::TaskDal;
pub use transcription::TranscriptionDal;
pub use translation::TranslationDal;

/// Central data access handle: the pool plus the field cipher.
#[derive(Clone)]
pub struct DAL {
    database: Database,
    cipher: Arc<FieldCipher>,
}

impl DAL {
    pub fn new(database: Database, cipher: Arc<FieldCipher>) -> Self {
        Self { database, cipher }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn cipher(&self) -> &Arc<FieldCipher> {
        &self.cipher
    }

    pub fn complainants(&self) -> ComplainantDal<'_> {
        ComplainantDal { dal: self }
    }

    pub fn grievances(&self) -> GrievanceDal<'_> {
        GrievanceDal { dal: self }
    }

    pub fn recordings(&self) -> RecordingDal<'_> {
        RecordingDal { dal: self }
    }

    pub fn transcriptions(&self) -> TranscriptionDal<'_> {
        TranscriptionDal { dal: self }
    }

    pub fn translations(&self) -> TranslationDal<'_> {
        TranslationDal { dal: self }
    }

    pub fn tasks(&self) -> TaskDal<'_> {
        TaskDal { dal: self }
    }
}

/// Columns that stay numeric through envelope coercion.
const NUMERIC_FIELDS: [&str; 4] = [
    "grievance_claimed_amount",
    "confidence_score",
    "duration_seconds",
    "file_size",
];

/// Normalizes scalar JSON values from an envelope into the shapes the
/// text columns expect: numbers and booleans become strings, arrays (e.g.
/// grievance categories) join into a comma-separated string. Known numeric
/// columns are left untouched.
pub(crate) fn coerce_scalars(map: &mut Map<String, Value>) {
    for (key, value) in map.iter_mut() {
        if NUMERIC_FIELDS.contains(&key.as_str()) {
            continue;
        }
        match value {
            Value::Number(n) => *value = Value::String(n.to_string()),
            Value::Bool(b) => *value = Value::String(b.to_string()),
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                *value = Value::String(joined);
            }
            _ => {}
        }
    }
}
