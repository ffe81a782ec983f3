// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row equality used by the pull merge.
//!
//! Equality is typed. Numbers compare numerically, everything else exactly;
//! a string never equals a number even when it spells one. Values are put
//! in canonical form before they get here, by
//! [`crate::definition::FlowDefinition::to_row`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::storage::traits::RowMap;

/// Column compared by [`compare_last_modified`].
pub const LAST_MODIFIED: &str = "lastModified";

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

/// True when every key of `a` has an equal value in `b`. A key missing
/// from `b` compares as `Null`.
#[must_use]
pub fn compare_rows(a: &RowMap, b: &RowMap) -> bool {
    a.iter()
        .all(|(key, value)| values_equal(value, b.get(key).unwrap_or(&Value::Null)))
}

/// Parse RFC 3339 or a zone-less `YYYY-MM-DD HH:MM:SS[.f]` (taken as UTC).
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|naive| naive.and_utc())
}

fn last_modified(row: &RowMap) -> Result<Option<DateTime<Utc>>, ()> {
    match row.get(LAST_MODIFIED) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_timestamp(s).map(Some).ok_or(()),
        Some(_) => Err(()),
    }
}

/// True when both rows carry the same `lastModified` instant.
/// An unparseable timestamp on either side is never equal.
#[must_use]
pub fn compare_last_modified(a: &RowMap, b: &RowMap) -> bool {
    match (last_modified(a), last_modified(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

/// True when `a` was modified strictly after `b`.
#[must_use]
pub fn which_last_modified(a: &RowMap, b: &RowMap) -> bool {
    match (last_modified(a), last_modified(b)) {
        (Ok(Some(x)), Ok(Some(y))) => x > y,
        (Ok(Some(_)), Ok(None)) => true,
        _ => false,
    }
}
