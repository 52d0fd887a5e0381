//! Migration-specific error types

use crate::executor::StrataError;
use crate::transaction::TransactionError;
use std::path::PathBuf;

/// Migration-specific errors
///
/// The first four variants are per-file failures: the engines turn them into a
/// `Failed` outcome plus an error string. The rest are infrastructure failures
/// that escape the engine as `Err`.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A forward/backward script failed, was empty, or broke a structural rule
    #[error("{message} for: {filename}")]
    BrokenMigration {
        filename: String,
        message: String,
        #[source]
        source: Option<StrataError>,
    },

    /// The old definition of a changed function could not be dropped
    #[error("Remove for recreate function IMPOSSIBLE: {definition} for: {filename}")]
    DropForRecreate {
        filename: String,
        definition: String,
        #[source]
        source: StrataError,
    },

    /// A full retry pass made no progress
    #[error("Unresolved function dependencies after {passes} pass(es): {}", .filenames.join(", "))]
    UnresolvedDependencies { filenames: Vec<String>, passes: usize },

    /// The `CREATE FUNCTION` header could not be parsed
    #[error("Invalid function definition in {filename}: {message}")]
    InvalidDefinition { filename: String, message: String },

    /// Database execution error outside any single file
    #[error("Database error: {0}")]
    Database(#[from] StrataError),

    /// Could not open, release or roll back a transaction level
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// Reading or writing a migration file failed
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid file name, date format or directory layout
    #[error("Invalid migration format: {0}")]
    InvalidFormat(String),

    /// Another process holds the migration lock
    #[error("Migration lock timeout: {0}")]
    LockTimeout(String),
}

impl MigrationError {
    pub(crate) fn broken(filename: &str, message: impl Into<String>) -> Self {
        MigrationError::BrokenMigration {
            filename: filename.to_string(),
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn statement(filename: &str, error: StrataError) -> Self {
        MigrationError::BrokenMigration {
            filename: filename.to_string(),
            message: error.to_string(),
            source: Some(error),
        }
    }

    /// Attribute a store failure to the file being processed.
    pub(crate) fn for_file(self, filename: &str) -> Self {
        match self {
            MigrationError::Database(error) => MigrationError::statement(filename, error),
            other => other,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MigrationError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures attributable to a single migration or function file.
    pub fn is_file_failure(&self) -> bool {
        matches!(
            self,
            MigrationError::BrokenMigration { .. }
                | MigrationError::DropForRecreate { .. }
                | MigrationError::UnresolvedDependencies { .. }
                | MigrationError::InvalidDefinition { .. }
        )
    }

    /// True when the driver reported an undefined function; the only failure
    /// the function engine defers to its next pass.
    pub fn is_undefined_function(&self) -> bool {
        match self {
            MigrationError::BrokenMigration {
                source: Some(source),
                ..
            }
            | MigrationError::DropForRecreate { source, .. } => source.is_undefined_function(),
            MigrationError::Database(source) => source.is_undefined_function(),
            _ => false,
        }
    }
}
