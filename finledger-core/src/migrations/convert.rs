//! Backfill conversions between stored date representations
//!
//! Timestamps are stored as text: naive values as `YYYY-MM-DD HH:MM:SS[.f]`,
//! zoned values as RFC 3339 with an explicit offset, dates as `YYYY-MM-DD`.
//! Every conversion maps NULL to NULL and rejects anything it cannot parse.
//! `naive_to_utc` only takes the canonical naive layout, so that `utc_to_naive`
//! restores each value byte for byte.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Value;

use crate::domain::Conversion;

const NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const ZONED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%:z";
const DATE_FORMAT: &str = "%Y-%m-%d";

pub const NAIVE_TO_UTC: Conversion = Conversion {
    name: "naive_to_utc",
    convert: naive_to_utc,
};

pub const UTC_TO_NAIVE: Conversion = Conversion {
    name: "utc_to_naive",
    convert: utc_to_naive,
};

pub const TIMESTAMP_TO_DATE: Conversion = Conversion {
    name: "timestamp_to_date",
    convert: timestamp_to_date,
};

pub const DATE_TO_UTC: Conversion = Conversion {
    name: "date_to_utc",
    convert: date_to_utc,
};

fn text(value: &Value) -> Result<Option<&str>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s.as_str())),
        other => Err(format!("expected text, found {:?}", other)),
    }
}

/// A naive timestamp exactly as `NAIVE_FORMAT` renders it
fn parse_canonical_naive(s: &str) -> Result<NaiveDateTime, String> {
    let naive = NaiveDateTime::parse_from_str(s, NAIVE_FORMAT)
        .map_err(|e| format!("not a naive timestamp: {}", e))?;
    if naive.format(NAIVE_FORMAT).to_string() != s {
        return Err(format!(
            "not in canonical form '{}'",
            naive.format(NAIVE_FORMAT)
        ));
    }
    Ok(naive)
}

fn parse_naive(s: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(s, NAIVE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| format!("not a naive timestamp: {}", e))
}

fn parse_zoned(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("not a zoned timestamp: {}", e))
}

fn format_zoned(dt: DateTime<Utc>) -> Value {
    Value::Text(dt.format(ZONED_FORMAT).to_string())
}

/// Naive timestamp, read as UTC, to a zoned timestamp
pub fn naive_to_utc(value: &Value) -> Result<Value, String> {
    match text(value)? {
        None => Ok(Value::Null),
        Some(s) => Ok(format_zoned(parse_canonical_naive(s)?.and_utc())),
    }
}

/// Zoned timestamp to a naive UTC timestamp
pub fn utc_to_naive(value: &Value) -> Result<Value, String> {
    match text(value)? {
        None => Ok(Value::Null),
        Some(s) => Ok(Value::Text(
            parse_zoned(s)?.naive_utc().format(NAIVE_FORMAT).to_string(),
        )),
    }
}

/// Naive or zoned timestamp to its (UTC) calendar date
pub fn timestamp_to_date(value: &Value) -> Result<Value, String> {
    match text(value)? {
        None => Ok(Value::Null),
        Some(s) => {
            let naive = parse_zoned(s)
                .map(|dt| dt.naive_utc())
                .or_else(|_| parse_naive(s))
                .map_err(|_| format!("not a timestamp: '{}'", s))?;
            Ok(Value::Text(naive.date().format(DATE_FORMAT).to_string()))
        }
    }
}

/// Date to midnight UTC
pub fn date_to_utc(value: &Value) -> Result<Value, String> {
    match text(value)? {
        None => Ok(Value::Null),
        Some(s) => {
            let date = NaiveDate::parse_from_str(s, DATE_FORMAT)
                .map_err(|e| format!("not a date: {}", e))?;
            Ok(format_zoned(date.and_time(chrono::NaiveTime::MIN).and_utc()))
        }
    }
}
