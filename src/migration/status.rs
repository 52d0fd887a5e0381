//! Read-only view of pending schema and function changes
//!
//! Nothing here inspects the database directly: both engines run their real
//! apply logic inside a transaction that is always rolled back, and the
//! outcomes are translated into per-file checks.

use crate::migration::functions::FunctionMigrator;
use crate::migration::schema::SchemaMigrator;
use crate::migration::MigrationError;
use crate::transaction::TransactionalConnection;
use serde::Serialize;

/// Exit code when nothing is pending.
pub const EXIT_UP_TO_DATE: i32 = 0;
/// Exit code when changes are pending.
pub const EXIT_PENDING: i32 = 1;
/// Exit code when a simulated step failed.
pub const EXIT_ERROR: i32 = 2;

/// Forward script check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpCheck {
    /// Already executed, or not reached
    Skip,
    Valid,
    Failed,
}

/// Backward script check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownCheck {
    /// Executed successfully in the simulation
    Valid,
    /// Present but not tested
    Skip,
    Missing,
    /// Present but SQL-empty
    Empty,
    Failed,
    /// Record without forward file; `migrate` will roll it back
    NeedsRollback,
    /// Record of the first run without forward file; only `rollback --to 1`
    /// removes it
    Kept,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaStatusEntry {
    pub filename: String,
    /// A record exists for the file
    pub executed: bool,
    /// The forward file exists
    pub on_disk: bool,
    pub up: UpCheck,
    pub down: DownCheck,
    pub version: Option<i64>,
}

impl SchemaStatusEntry {
    pub fn is_pending(&self) -> bool {
        self.executed != self.on_disk && self.down != DownCheck::Kept
    }

    pub fn has_error(&self) -> bool {
        self.up == UpCheck::Failed || self.down == DownCheck::Failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaStatus {
    pub entries: Vec<SchemaStatusEntry>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCheck {
    UpToDate,
    CreatePending,
    UpdatePending,
    RemovePending,
    Failed,
    /// Not attempted because an earlier file aborted the simulation
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionStatusEntry {
    pub filename: String,
    pub check: FunctionCheck,
    pub version: Option<i64>,
}

impl FunctionStatusEntry {
    pub fn is_pending(&self) -> bool {
        matches!(
            self.check,
            FunctionCheck::CreatePending | FunctionCheck::UpdatePending | FunctionCheck::RemovePending
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FunctionStatus {
    pub entries: Vec<FunctionStatusEntry>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub schema: SchemaStatus,
    pub functions: FunctionStatus,
}

impl StatusReport {
    pub fn has_errors(&self) -> bool {
        self.schema.error.is_some()
            || self.functions.error.is_some()
            || self.schema.entries.iter().any(SchemaStatusEntry::has_error)
            || self
                .functions
                .entries
                .iter()
                .any(|e| e.check == FunctionCheck::Failed)
    }

    pub fn has_pending(&self) -> bool {
        self.schema.entries.iter().any(SchemaStatusEntry::is_pending)
            || self.functions.entries.iter().any(FunctionStatusEntry::is_pending)
    }

    /// `0` up to date, `1` changes pending, `2` error
    pub fn exit_code(&self) -> i32 {
        if self.has_errors() {
            EXIT_ERROR
        } else if self.has_pending() {
            EXIT_PENDING
        } else {
            EXIT_UP_TO_DATE
        }
    }
}

/// Runs both engines in simulation
pub struct StatusReporter<'a> {
    schema: &'a SchemaMigrator,
    functions: &'a FunctionMigrator,
}

impl<'a> StatusReporter<'a> {
    pub fn new(schema: &'a SchemaMigrator, functions: &'a FunctionMigrator) -> Self {
        Self { schema, functions }
    }

    /// Schema status, then function status against the migrated schema
    ///
    /// Pending schema migrations are applied (inside the outer transaction)
    /// before the function status is computed, so functions that depend on a
    /// pending table are reported correctly. Everything is rolled back.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures are returned; script failures are part of
    /// the report.
    pub fn report(&self, conn: &TransactionalConnection) -> Result<StatusReport, MigrationError> {
        conn.begin()?;
        let result = self.collect(conn);
        crate::migration::run::discard(conn, result)
    }

    fn collect(&self, conn: &TransactionalConnection) -> Result<StatusReport, MigrationError> {
        let schema = self.schema.status(conn)?;

        let applied = self.schema.execute(conn, false)?;
        if let Some(error) = &applied.error {
            log::debug!("Function status computed without pending schema: {error}");
        }

        let functions = self.functions.status(conn)?;
        Ok(StatusReport { schema, functions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn schema_entry(executed: bool, on_disk: bool, up: UpCheck, down: DownCheck) -> SchemaStatusEntry {
        SchemaStatusEntry {
            filename: "2024-01/2024-01-01_00-00-00.up.sql".to_string(),
            executed,
            on_disk,
            up,
            down,
            version: executed.then_some(1),
        }
    }

    fn function_entry(check: FunctionCheck) -> FunctionStatusEntry {
        FunctionStatusEntry {
            filename: "user/getById.sql".to_string(),
            check,
            version: None,
        }
    }

    #[test]
    fn test_empty_report_is_up_to_date() {
        assert_eq!(StatusReport::default().exit_code(), EXIT_UP_TO_DATE);
    }

    #[test]
    fn test_executed_files_are_up_to_date() {
        let report = StatusReport {
            schema: SchemaStatus {
                entries: vec![schema_entry(true, true, UpCheck::Skip, DownCheck::Skip)],
                error: None,
            },
            functions: FunctionStatus {
                entries: vec![function_entry(FunctionCheck::UpToDate)],
                error: None,
            },
        };
        assert_eq!(report.exit_code(), EXIT_UP_TO_DATE);
    }

    #[test]
    fn test_pending_changes() {
        let new_file = StatusReport {
            schema: SchemaStatus {
                entries: vec![schema_entry(false, true, UpCheck::Valid, DownCheck::Missing)],
                error: None,
            },
            ..StatusReport::default()
        };
        assert_eq!(new_file.exit_code(), EXIT_PENDING);

        let orphan = StatusReport {
            schema: SchemaStatus {
                entries: vec![schema_entry(true, false, UpCheck::Skip, DownCheck::NeedsRollback)],
                error: None,
            },
            ..StatusReport::default()
        };
        assert_eq!(orphan.exit_code(), EXIT_PENDING);

        for check in [
            FunctionCheck::CreatePending,
            FunctionCheck::UpdatePending,
            FunctionCheck::RemovePending,
        ] {
            let report = StatusReport {
                functions: FunctionStatus {
                    entries: vec![function_entry(check)],
                    error: None,
                },
                ..StatusReport::default()
            };
            assert_eq!(report.exit_code(), EXIT_PENDING, "{check:?}");
        }
    }

    #[test]
    fn test_errors_win_over_pending() {
        let failed_down = StatusReport {
            schema: SchemaStatus {
                entries: vec![
                    schema_entry(false, true, UpCheck::Valid, DownCheck::Failed),
                    schema_entry(false, true, UpCheck::Valid, DownCheck::Skip),
                ],
                error: Some("relation \"a\" does not exist for: a.up.sql".to_string()),
            },
            ..StatusReport::default()
        };
        assert_eq!(failed_down.exit_code(), EXIT_ERROR);

        let unresolved = StatusReport {
            functions: FunctionStatus {
                entries: vec![function_entry(FunctionCheck::Failed)],
                error: None,
            },
            ..StatusReport::default()
        };
        assert_eq!(unresolved.exit_code(), EXIT_ERROR);
    }

    #[test]
    fn test_kept_first_run_record_is_not_pending() {
        let report = StatusReport {
            schema: SchemaStatus {
                entries: vec![schema_entry(true, false, UpCheck::Skip, DownCheck::Kept)],
                error: None,
            },
            ..StatusReport::default()
        };
        assert_eq!(report.exit_code(), EXIT_UP_TO_DATE);
    }

    #[test]
    fn test_not_run_function_is_neither_pending_nor_failed() {
        let entry = function_entry(FunctionCheck::NotRun);
        assert!(!entry.is_pending());
        let report = StatusReport {
            functions: FunctionStatus {
                entries: vec![entry, function_entry(FunctionCheck::Failed)],
                error: Some("broken for: user/other.sql".to_string()),
            },
            ..StatusReport::default()
        };
        assert_eq!(report.exit_code(), EXIT_ERROR);
    }

    #[test]
    fn test_missing_down_is_not_an_error() {
        let entry = schema_entry(true, true, UpCheck::Skip, DownCheck::Missing);
        assert!(!entry.has_error());
        assert!(!entry.is_pending());
    }
}
