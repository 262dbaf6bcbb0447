//! Postgres repositories for the flowdeck server.
//!
//! This module provides data access for:
//! - Projects, flow definitions and snapshots
//! - Flow runs
//! - The append-only run log
//!
//! Each repository implements the matching store trait of `flowdeck-workflow`.

pub mod flow;
pub mod run;
pub mod run_log;

pub use flow::PgFlowStore;
pub use run::PgRunStore;
pub use run_log::PgRunLog;

use flowdeck_workflow::StoreError;
use std::fmt::Display;
use std::str::FromStr;

/// Builds a decode error for a column holding an unexpected value.
fn invalid_column(column: &str, value: &str, reason: impl Display) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("invalid {column} '{value}': {reason}"),
    )))
}

/// Parses a text column into a typed value.
fn parse_column<T>(column: &str, value: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: Display,
{
    T::from_str(value).map_err(|e| invalid_column(column, value, e))
}

/// Decodes a JSON column into a typed value.
fn json_column<T: serde::de::DeserializeOwned>(
    column: &str,
    value: serde_json::Value,
) -> Result<T, sqlx::Error> {
    serde_json::from_value(value).map_err(|e| invalid_column(column, "<json>", e))
}

/// Encodes a value for a JSON column.
fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Backend {
        message: format!("failed to encode column: {e}"),
    })
}

/// Maps a database error to a store error; unique violations become conflicts.
fn store_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e
        && db.is_unique_violation()
    {
        return StoreError::Conflict {
            message: db.message().to_string(),
        };
    }
    StoreError::Backend {
        message: e.to_string(),
    }
}
