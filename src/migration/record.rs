//! Rows of the `migrations` and `functions` tables

use crate::executor::StrataError;
use chrono::{DateTime, Utc};
use may_postgres::Row;

/// An applied schema migration
///
/// A record exists only while its forward script is applied; rolling the
/// script back deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Path of the `.up.sql` file relative to the migrations directory
    pub filename: String,

    /// Forward SQL as it was executed
    pub up: String,

    /// Backward SQL to run on rollback (the down file or a refusal stub)
    pub down: String,

    /// Run version shared by every record written in the same run
    pub version: i64,

    pub applied_at: DateTime<Utc>,
}

impl MigrationRecord {
    /// Build a record from a `findAll` row
    ///
    /// Expected columns: `filename`, `up`, `down`, `version`, `applied_at`
    ///
    /// # Errors
    ///
    /// Returns `StrataError::ParseError` when a column is missing or has an
    /// unexpected type.
    pub fn from_row(row: &Row) -> Result<Self, StrataError> {
        Ok(Self {
            filename: column(row, "filename")?,
            up: column(row, "up")?,
            down: column(row, "down")?,
            version: column(row, "version")?,
            applied_at: column(row, "applied_at")?,
        })
    }
}

/// An applied function or procedure file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRecord {
    /// Path relative to the functions directory (`<entity>/<name>.sql`)
    pub filename: String,

    /// `name (params) RETURNS type`, compared to detect signature changes
    pub definition: String,

    /// Raw file content as it was executed
    pub up: String,

    /// Generated `DROP ... IF EXISTS` for the applied signature
    pub down: String,

    pub version: i64,
}

impl FunctionRecord {
    /// Build a record from a `findAllFunctions` row
    ///
    /// # Errors
    ///
    /// Returns `StrataError::ParseError` when a column is missing or has an
    /// unexpected type.
    pub fn from_row(row: &Row) -> Result<Self, StrataError> {
        Ok(Self {
            filename: column(row, "filename")?,
            definition: column(row, "definition")?,
            up: column(row, "up")?,
            down: column(row, "down")?,
            version: column(row, "version")?,
        })
    }
}

fn column<'a, T>(row: &'a Row, name: &str) -> Result<T, StrataError>
where
    T: may_postgres::types::FromSql<'a>,
{
    row.try_get(name)
        .map_err(|e| StrataError::ParseError(format!("column {name}: {e}")))
}
