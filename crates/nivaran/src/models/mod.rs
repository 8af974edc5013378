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

//! Database models for the orchestrator's tables.
//!
//! Each entity has a row struct for queries and a `*Changes` struct used
//! for both inserts and partial updates: `Changes` fields are `Option`s
//! deserialized straight from a result envelope's `values` map, so absent
//! fields are left untouched by upserts.

pub mod complainant;
pub mod grievance;
pub mod recording;
pub mod task;
pub mod transcription;
pub mod translation;
