//! Timestamp (de)serialisation for persisted documents.
//!
//! Documents are written as naive UTC `YYYY-MM-DDTHH:MM:SS.ffffff`. Both that
//! form and RFC 3339 with an offset are accepted on read.

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{de, Deserialize, Deserializer, Serializer};

const NAIVE_WRITE: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const NAIVE_READ: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Current time truncated to the precision documents are stored with, so a
/// value survives a store round trip unchanged.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn format(ts: &DateTime<Utc>) -> String {
    ts.naive_utc().format(NAIVE_WRITE).to_string()
}

pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, NAIVE_READ)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(ts))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp '{raw}'")))
}
