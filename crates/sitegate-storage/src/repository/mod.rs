//! Database repositories for each table.

pub mod domains;
pub mod groups;
pub mod intercepts;
pub mod rules;
pub mod schedules;

pub use domains::DomainsRepo;
pub use groups::GroupsRepo;
pub use intercepts::InterceptsRepo;
pub use rules::RulesRepo;
pub use schedules::SchedulesRepo;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

/// A stored value that does not map back to a domain type.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub(crate) struct UnknownValue {
    kind: &'static str,
    value: String,
}

/// Builds the conversion error rusqlite expects from a row mapper.
pub(crate) fn unknown_value(column: usize, kind: &'static str, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(UnknownValue { kind, value }))
}

/// Decodes a JSON text column inside a row mapper.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    column: usize,
    text: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_date(column: usize, s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}
