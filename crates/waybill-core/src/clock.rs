//! Timestamp and business-date codec.
//!
//! Timestamps are stored as fixed-width UTC text with microsecond precision
//! (`2026-03-01T09:15:02.123456Z`) so lexical order in the store equals
//! chronological order.

use crate::error::{Error, Result};
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Current UTC time truncated to the stored precision.
pub fn now_utc() -> OffsetDateTime {
    truncate_micros(OffsetDateTime::now_utc())
}

/// Drop sub-microsecond precision so a value survives a store round trip.
pub fn truncate_micros(ts: OffsetDateTime) -> OffsetDateTime {
    let ts = ts.to_offset(UtcOffset::UTC);
    ts.replace_microsecond(ts.microsecond()).unwrap_or(ts)
}

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .expect("timestamp formatting should not fail")
}

pub fn parse_timestamp(s: &str) -> Result<OffsetDateTime> {
    PrimitiveDateTime::parse(
        s,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"),
    )
    .map(PrimitiveDateTime::assume_utc)
    .map_err(|e| Error::Invalid(format!("bad timestamp {s:?}: {e}")))
}

/// Parse a user-supplied RFC 3339 timestamp (any offset, any precision).
pub fn parse_rfc3339(s: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
        .map(truncate_micros)
        .map_err(|e| Error::Invalid(format!("bad RFC 3339 timestamp {s:?}: {e}")))
}

pub fn format_date(date: Date) -> String {
    date.format(format_description!("[year]-[month]-[day]"))
        .expect("date formatting should not fail")
}

pub fn parse_date(s: &str) -> Result<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .map_err(|e| Error::Invalid(format!("bad date {s:?}: {e}")))
}

/// Calendar date of `ts` as seen from the business offset.
pub fn business_date(ts: OffsetDateTime, offset: UtcOffset) -> Date {
    ts.to_offset(offset).date()
}

pub fn offset_from_minutes(minutes: i32) -> Result<UtcOffset> {
    UtcOffset::from_whole_seconds(minutes.saturating_mul(60))
        .map_err(|e| Error::Invalid(format!("bad business offset {minutes} min: {e}")))
}

/// Serde adapters that use the stored text format.
pub mod serde_ts {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(ts: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        pub fn serialize<S: Serializer>(
            ts: &Option<OffsetDateTime>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_some(&crate::clock::format_timestamp(*ts)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) => crate::clock::parse_timestamp(&raw)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

pub mod serde_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(date: &Date, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_date(*date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }
}
