use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One telemetry data point submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub source_name: String,
    pub metric_name: String,
    pub value: i64,
    /// Caller-supplied time. `None` when the caller sent nothing usable; the
    /// writer substitutes the write time.
    pub timestamp: Option<DateTime<Utc>>,
}

impl MetricRecord {
    pub fn new(
        source_name: impl Into<String>,
        metric_name: impl Into<String>,
        value: i64,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            metric_name: metric_name.into(),
            value,
            timestamp,
        }
    }
}

/// Parse an RFC 3339 timestamp. Empty or unparsable input yields `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
