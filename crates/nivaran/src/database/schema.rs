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

//! Diesel schema definitions for the orchestrator's tables.
//!
//! Entity primary keys are composite text ids (`PREFIX-YYYYMMDD-OFF-RRRR-S`);
//! task ids are broker-assigned strings. All timestamps are stored in UTC.

diesel::table! {
    complainants (complainant_id) {
        complainant_id -> Text,
        complainant_unique_id -> Nullable<Text>,
        complainant_full_name -> Nullable<Text>,
        complainant_phone -> Nullable<Text>,
        complainant_email -> Nullable<Text>,
        complainant_province -> Nullable<Text>,
        complainant_district -> Nullable<Text>,
        complainant_municipality -> Nullable<Text>,
        complainant_ward -> Nullable<Text>,
        complainant_village -> Nullable<Text>,
        complainant_address -> Nullable<Text>,
        complainant_phone_hash -> Nullable<Text>,
        complainant_email_hash -> Nullable<Text>,
        complainant_full_name_hash -> Nullable<Text>,
        source -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    grievances (grievance_id) {
        grievance_id -> Text,
        complainant_id -> Nullable<Text>,
        grievance_categories -> Nullable<Text>,
        grievance_summary -> Nullable<Text>,
        grievance_description -> Nullable<Text>,
        grievance_claimed_amount -> Nullable<Double>,
        grievance_location -> Nullable<Text>,
        language_code -> Text,
        classification_status -> Text,
        grievance_creation_date -> Timestamptz,
        grievance_modification_date -> Timestamptz,
        is_temporary -> Bool,
        source -> Text,
    }
}

diesel::table! {
    grievance_status_history (id) {
        id -> Int4,
        grievance_id -> Text,
        status_code -> Text,
        assigned_to -> Nullable<Text>,
        notes -> Nullable<Text>,
        created_by -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    grievance_voice_recordings (recording_id) {
        recording_id -> Text,
        complainant_id -> Nullable<Text>,
        grievance_id -> Nullable<Text>,
        task_id -> Nullable<Text>,
        file_path -> Text,
        field_name -> Text,
        duration_seconds -> Nullable<Int4>,
        file_size -> Nullable<Int4>,
        processing_status -> Text,
        language_code -> Nullable<Text>,
        language_code_detect -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    grievance_transcriptions (transcription_id) {
        transcription_id -> Text,
        recording_id -> Nullable<Text>,
        grievance_id -> Nullable<Text>,
        field_name -> Nullable<Text>,
        automated_transcript -> Nullable<Text>,
        verified_transcript -> Nullable<Text>,
        verification_status -> Text,
        confidence_score -> Nullable<Double>,
        verification_notes -> Nullable<Text>,
        verified_by -> Nullable<Text>,
        verified_at -> Nullable<Timestamptz>,
        language_code -> Nullable<Text>,
        language_code_detect -> Nullable<Text>,
        task_id -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    grievance_translations (translation_id) {
        translation_id -> Text,
        grievance_id -> Nullable<Text>,
        task_id -> Nullable<Text>,
        grievance_description_en -> Nullable<Text>,
        grievance_summary_en -> Nullable<Text>,
        grievance_categories_en -> Nullable<Text>,
        source_language -> Text,
        translation_method -> Text,
        confidence_score -> Nullable<Double>,
        verified_by -> Nullable<Text>,
        verified_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    tasks (task_id) {
        task_id -> Text,
        task_name -> Text,
        status_code -> Text,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
        error_message -> Nullable<Text>,
        result -> Nullable<Jsonb>,
        retry_count -> Int4,
        retry_history -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    task_entities (task_id, entity_key, entity_id) {
        task_id -> Text,
        entity_key -> Text,
        entity_id -> Text,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(grievances -> complainants (complainant_id));
diesel::joinable!(grievance_status_history -> grievances (grievance_id));
diesel::joinable!(task_entities -> tasks (task_id));

diesel::allow_tables_to_appear_in_same_query!(
    complainants,
    grievances,
    grievance_status_history,
    grievance_voice_recordings,
    grievance_transcriptions,
    grievance_translations,
    tasks,
    task_entities,
);
