//! Lineage mapping record (sink schema v1)
//!
//! The field set and order are shared by every sink and are STABLE.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Sink column names, in sink order
pub const MAPPING_FIELDS: [&str; 6] = [
    "source_model",
    "target_model",
    "source_trace_id",
    "target_trace_id",
    "compiled_sql",
    "executed_at",
];

/// A row trace identifier (UUID-shaped text)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for TraceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.hyphenated().to_string())
    }
}

impl From<String> for TraceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TraceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TraceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One captured upstream-row to downstream-row edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageMapping {
    pub source_model: String,
    pub target_model: String,
    pub source_trace_id: TraceId,
    pub target_trace_id: TraceId,

    /// Instrumented SQL executed for the target model
    pub compiled_sql: String,

    /// UTC capture time, shared by every record of one capture call
    #[serde(with = "executed_at_format")]
    pub executed_at: DateTime<Utc>,
}

impl LineageMapping {
    /// `executed_at` as ISO-8601 text with microsecond precision
    pub fn executed_at_iso(&self) -> String {
        format_timestamp(&self.executed_at)
    }
}

/// ISO-8601 rendering used by every sink (`2024-05-01T12:00:00.123456Z`)
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

mod executed_at_format {
    use super::format_timestamp;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> LineageMapping {
        LineageMapping {
            source_model: "stg_customers".to_string(),
            target_model: "customers".to_string(),
            source_trace_id: TraceId::new("a"),
            target_trace_id: TraceId::new("b"),
            compiled_sql: "select 1".to_string(),
            executed_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn json_field_order_matches_sink_schema() {
        let json = serde_json::to_string(&sample()).unwrap();
        let positions: Vec<usize> = MAPPING_FIELDS
            .iter()
            .map(|field| json.find(&format!("\"{}\"", field)).unwrap())
            .collect();

        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
        assert!(json.contains("\"2024-05-01T12:00:00.000000Z\""));
    }

    #[test]
    fn trace_id_from_uuid_is_hyphenated() {
        let id = TraceId::from(Uuid::nil());
        assert_eq!(id.as_str(), "00000000-0000-0000-0000-000000000000");
    }
}
