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

//! Composite entity identity.
//!
//! Entity ids are human-readable composite strings:
//! `PREFIX-YYYYMMDD-OFF-RRRR-S`, where PREFIX names the entity table
//! (GR, CM, REC, TR, TL), OFF is two province + two district letters (or an
//! office code), RRRR is four random alphanumeric characters, and S encodes
//! the intake source (`B` = bot, `A` = accessible). The trailing letter
//! governs status routing: only accessible ids emit frames to subscribers.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::envelope::EntityKey;

static ENTITY_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(GR|CM|REC|TR|TL)-(\d{8})-([A-Z0-9]{2,4})-([A-Z0-9]{4})-([AB])$")
        .expect("entity id regex is valid")
});

/// Intake source of a grievance or complainant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    /// Conversational chatbot intake.
    Bot,
    /// Accessible (voice-first) intake.
    Accessible,
}

impl Source {
    /// The trailing id letter for this source.
    pub fn suffix(&self) -> char {
        match self {
            Source::Bot => 'B',
            Source::Accessible => 'A',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Bot => "bot",
            Source::Accessible => "accessible",
        }
    }

    /// Infers the source from an id's trailing letter. Ids without a
    /// recognizable suffix are treated as bot intake.
    pub fn of_id(id: &str) -> Source {
        if id.ends_with("-A") {
            Source::Accessible
        } else {
            Source::Bot
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decomposed form of a composite entity id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntityId {
    pub key: EntityKey,
    pub date: String,
    pub office: String,
    pub random: String,
    pub source: Source,
}

/// Generates a composite entity id.
///
/// The office segment is either the given office code (up to four letters,
/// underscores stripped) or the first two letters of the province followed
/// by the first two of the district.
pub fn generate_entity_id(
    key: EntityKey,
    province: &str,
    district: &str,
    office: Option<&str>,
    source: Source,
) -> String {
    let office_segment = match office {
        Some(code) => code.to_uppercase().replace('_', "").chars().take(4).collect(),
        None => format!(
            "{}{}",
            province.to_uppercase().chars().take(2).collect::<String>(),
            district.to_uppercase().chars().take(2).collect::<String>()
        ),
    };

    let date = generate_date_segment(Utc::now());
    let random: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(4)
        .collect::<String>()
        .to_uppercase();

    format!(
        "{}-{}-{}-{}-{}",
        key.prefix(),
        date,
        office_segment,
        random,
        source.suffix()
    )
}

fn generate_date_segment(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d").to_string()
}

/// Parses a composite entity id, returning `None` when the string does not
/// match the expected shape.
pub fn parse_entity_id(id: &str) -> Option<ParsedEntityId> {
    let caps = ENTITY_ID_RE.captures(id)?;

    let key = match caps.get(1)?.as_str() {
        "GR" => EntityKey::GrievanceId,
        "CM" => EntityKey::ComplainantId,
        "REC" => EntityKey::RecordingId,
        "TR" => EntityKey::TranscriptionId,
        "TL" => EntityKey::TranslationId,
        _ => return None,
    };
    let source = match caps.get(5)?.as_str() {
        "A" => Source::Accessible,
        _ => Source::Bot,
    };

    Some(ParsedEntityId {
        key,
        date: caps.get(2)?.as_str().to_string(),
        office: caps.get(3)?.as_str().to_string(),
        random: caps.get(4)?.as_str().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_parse_round_trip() {
        for key in EntityKey::ALL {
            let id = generate_entity_id(key, "KO", "JH", None, Source::Accessible);
            let parsed = parse_entity_id(&id).unwrap_or_else(|| panic!("unparseable id: {}", id));
            assert_eq!(parsed.key, key);
            assert_eq!(parsed.office, "KOJH");
            assert_eq!(parsed.source, Source::Accessible);
            assert_eq!(parsed.random.len(), 4);
        }
    }

    #[test]
    fn test_office_code_overrides_province_district() {
        let id = generate_entity_id(
            EntityKey::GrievanceId,
            "KO",
            "JH",
            Some("head_office"),
            Source::Bot,
        );
        let parsed = parse_entity_id(&id).unwrap();
        assert_eq!(parsed.office, "HEAD");
        assert_eq!(parsed.source, Source::Bot);
    }

    #[test]
    fn test_source_inference() {
        assert_eq!(Source::of_id("GR-20250101-KOJH-ABCD-A"), Source::Accessible);
        assert_eq!(Source::of_id("GR-20250101-KOJH-ABCD-B"), Source::Bot);
        // Unknown suffixes default to bot
        assert_eq!(Source::of_id("legacy-id-123"), Source::Bot);
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        assert!(parse_entity_id("GR-2025-KOJH-ABCD-A").is_none());
        assert!(parse_entity_id("XX-20250101-KOJH-ABCD-A").is_none());
        assert!(parse_entity_id("GR-20250101-KOJH-ABCD-C").is_none());
        assert!(parse_entity_id("").is_none());
    }

    #[test]
    fn test_date_segment_format() {
        let ts = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(generate_date_segment(ts), "20250101");
    }
}
