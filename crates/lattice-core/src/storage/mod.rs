//! Storage layer: SQLite connection pool and schema migrations

pub mod database;
pub mod migrations;

pub use database::{Database, DatabaseConfig};

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp for storage.
///
/// Fixed-width microsecond RFC 3339 so that lexicographic order in SQL
/// matches chronological order (pagination cursors depend on this).
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp back into `DateTime<Utc>`
pub(crate) fn parse_ts(s: &str) -> crate::error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::error::Error::Other(format!("Invalid stored timestamp '{s}': {e}")))
}
