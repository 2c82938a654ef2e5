//! Lenient timestamp decoding
//!
//! Remote executors report `finished_at` either as an RFC 3339 string or as
//! milliseconds since the Unix epoch (shell scripts have no easy way to emit
//! the former).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Text(String),
}

pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawTimestamp>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawTimestamp::Millis(ms)) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", ms))),
        Some(RawTimestamp::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom),
    }
}
