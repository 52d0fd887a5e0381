//! Stored function and procedure migrations
//!
//! Each file under `<functions_dir>/<entity>/` holds one `CREATE OR REPLACE`
//! routine. Files are applied in a fixed-point loop: a file calling a routine
//! that does not exist yet fails with SQLSTATE `42883` and is retried on the
//! next pass, inside its own savepoint so the failure does not poison the run.

use crate::config::StrataConfig;
use crate::executor::SqlExecutor;
use crate::migration::definition::{count_routines, has_or_replace, parse_header};
use crate::migration::file::{discover_functions, FunctionFile};
use crate::migration::fixed_point::{self, Attempt};
use crate::migration::queries::Queries;
use crate::migration::record::FunctionRecord;
use crate::migration::run::{discard, file_failure, finish, EngineRun};
use crate::migration::status::{FunctionCheck, FunctionStatus, FunctionStatusEntry};
use crate::migration::version_store::VersionStore;
use crate::migration::MigrationError;
use crate::transaction::TransactionalConnection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionOutcome {
    /// Same content as the stored record, or not reached
    Unchanged,
    Created,
    Updated,
    Removed,
    Failed,
}

impl FunctionOutcome {
    /// `None`, `+1`, `+2`, `-1`, `0`
    pub fn code(&self) -> Option<i8> {
        match self {
            FunctionOutcome::Unchanged => None,
            FunctionOutcome::Created => Some(1),
            FunctionOutcome::Updated => Some(2),
            FunctionOutcome::Removed => Some(-1),
            FunctionOutcome::Failed => Some(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionRun {
    pub outcomes: BTreeMap<String, FunctionOutcome>,
    pub error: Option<String>,
    pub version: i64,
}

impl EngineRun for FunctionRun {
    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

impl FunctionRun {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn count(&self, outcome: FunctionOutcome) -> usize {
        self.outcomes.values().filter(|o| **o == outcome).count()
    }
}

pub struct FunctionMigrator {
    functions_dir: PathBuf,
    queries: Queries,
}

impl FunctionMigrator {
    pub fn new(functions_dir: impl Into<PathBuf>) -> Self {
        Self {
            functions_dir: functions_dir.into(),
            queries: Queries::postgres(),
        }
    }

    pub fn from_config(config: &StrataConfig) -> Result<Self, MigrationError> {
        let queries = match &config.queries_dir {
            Some(dir) => Queries::from_dir(dir)?,
            None => Queries::postgres(),
        };
        Ok(Self::new(&config.functions_dir).with_queries(queries))
    }

    pub fn with_queries(mut self, queries: Queries) -> Self {
        self.queries = queries;
        self
    }

    pub fn functions_dir(&self) -> &Path {
        &self.functions_dir
    }

    pub fn discover(&self) -> Result<Vec<FunctionFile>, MigrationError> {
        discover_functions(&self.functions_dir)
    }

    /// Create or replace changed routines, then drop those whose file is gone
    ///
    /// Committed only when `dry_run` is false and every file resolved.
    pub fn execute(&self, conn: &TransactionalConnection, dry_run: bool) -> Result<FunctionRun, MigrationError> {
        log::info!(
            "Running function migrations from {}{}",
            self.functions_dir.display(),
            if dry_run { " (dry run)" } else { "" }
        );
        conn.begin()?;
        let result = self.run(conn);
        finish(conn, result, dry_run)
    }

    /// Per-file pending action, computed by running `execute` and rolling back.
    pub fn status(&self, conn: &TransactionalConnection) -> Result<FunctionStatus, MigrationError> {
        conn.begin()?;
        let result = self.simulate(conn);
        discard(conn, result)
    }

    fn simulate(&self, conn: &TransactionalConnection) -> Result<FunctionStatus, MigrationError> {
        let store = VersionStore::new(conn, &self.queries);
        store.ensure_tables()?;
        let records = store.find_all_functions()?;
        let contents: HashMap<String, String> = self
            .discover()?
            .into_iter()
            .map(|f| (f.name, f.content))
            .collect();

        let run = self.run(conn)?;
        let aborted = run.error.is_some();
        let entries = run
            .outcomes
            .iter()
            .map(|(filename, outcome)| {
                let record = records.get(filename);
                FunctionStatusEntry {
                    filename: filename.clone(),
                    check: function_check(*outcome, record, contents.get(filename).map(String::as_str), aborted),
                    version: record.map(|r| r.version),
                }
            })
            .collect();

        Ok(FunctionStatus {
            entries,
            error: run.error,
        })
    }

    fn run(&self, conn: &TransactionalConnection) -> Result<FunctionRun, MigrationError> {
        let store = VersionStore::new(conn, &self.queries);
        store.ensure_tables()?;

        let files = self.discover()?;
        let records = store.find_all_functions()?;
        let version = store.next_version()?;

        let mut run = FunctionRun {
            outcomes: files
                .iter()
                .map(|f| f.name.clone())
                .chain(records.keys().cloned())
                .map(|name| (name, FunctionOutcome::Unchanged))
                .collect(),
            error: None,
            version,
        };

        let result = self.up_phase(conn, &store, &files, &records, version, &mut run.outcomes);
        run.error = file_failure(result)?;
        if run.error.is_none() {
            let result = self.down_phase(conn, &store, &files, &records, &mut run.outcomes);
            run.error = file_failure(result)?;
        }
        Ok(run)
    }

    fn up_phase(
        &self,
        conn: &TransactionalConnection,
        store: &VersionStore<'_>,
        files: &[FunctionFile],
        records: &BTreeMap<String, FunctionRecord>,
        version: i64,
        outcomes: &mut BTreeMap<String, FunctionOutcome>,
    ) -> Result<(), MigrationError> {
        let mut last_errors: HashMap<&str, String> = HashMap::new();

        let resolution = fixed_point::resolve(files.iter(), |file| {
            let file = *file;
            log::debug!("{} : Try to execute", file.name);
            if let Err(e) = conn.begin() {
                return Attempt::Abort(e.into());
            }

            match self.function_up(conn, store, file, records.get(&file.name), version) {
                Ok(outcome) => {
                    if let Err(e) = conn.commit() {
                        return Attempt::Abort(e.into());
                    }
                    log::debug!("{} : passed", file.name);
                    outcomes.insert(file.name.clone(), outcome);
                    Attempt::Done
                }
                Err(e) if e.is_undefined_function() => {
                    if let Err(rollback) = conn.rollback() {
                        return Attempt::Abort(rollback.into());
                    }
                    log::debug!("{} : is marked to retry for the next pass ({e})", file.name);
                    #[cfg(feature = "metrics")]
                    METRICS.record_function_retry();
                    last_errors.insert(file.name.as_str(), e.to_string());
                    Attempt::Retry
                }
                Err(e) => {
                    if let Err(rollback) = conn.rollback() {
                        log::error!("Failed to roll back attempt of {}: {rollback}", file.name);
                    }
                    log::error!("{e}");
                    outcomes.insert(file.name.clone(), FunctionOutcome::Failed);
                    Attempt::Abort(e)
                }
            }
        })?;

        if resolution.is_complete() {
            return Ok(());
        }

        let filenames: Vec<String> = resolution.unresolved.iter().map(|f| f.name.clone()).collect();
        for filename in &filenames {
            if let Some(error) = last_errors.get(filename.as_str()) {
                log::error!("{filename} never resolved: {error}");
            }
            outcomes.insert(filename.clone(), FunctionOutcome::Failed);
        }
        Err(MigrationError::UnresolvedDependencies {
            filenames,
            passes: resolution.passes,
        })
    }

    /// Apply one file; an `Err` leaves the caller's savepoint to roll back.
    fn function_up(
        &self,
        conn: &dyn SqlExecutor,
        store: &VersionStore<'_>,
        file: &FunctionFile,
        existing: Option<&FunctionRecord>,
        version: i64,
    ) -> Result<FunctionOutcome, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_span("function", &file.name).entered();

        let content = file.content.as_str();
        if !has_or_replace(content) {
            return Err(MigrationError::broken(
                &file.name,
                "The function must be declared with 'OR REPLACE'",
            ));
        }
        if count_routines(content) > 1 {
            return Err(MigrationError::broken(
                &file.name,
                "Only one function per file must be declared",
            ));
        }

        let header = parse_header(content).map_err(|e| MigrationError::InvalidDefinition {
            filename: file.name.clone(),
            message: e.to_string(),
        })?;
        let definition = header.definition();

        if let Some(record) = existing {
            if record.up == content {
                return Ok(FunctionOutcome::Unchanged);
            }
            if record.definition != definition {
                log::warn!(
                    "Remove and recreate:\n    {}\n    {}",
                    record.definition,
                    definition
                );
                conn.batch_execute(&record.down)
                    .map_err(|source| MigrationError::DropForRecreate {
                        filename: file.name.clone(),
                        definition: record.definition.clone(),
                        source,
                    })?;
            }
        }

        log::info!("Create or replace {definition}");
        conn.batch_execute(content)
            .map_err(|source| MigrationError::BrokenMigration {
                filename: file.name.clone(),
                message: format!("The function {definition} cant be created or replaced: {source}"),
                source: Some(source),
            })?;
        store
            .upsert_function(&file.name, &definition, content, &header.drop_statement(), version)
            .map_err(|e| e.for_file(&file.name))?;

        Ok(if existing.is_some() {
            FunctionOutcome::Updated
        } else {
            FunctionOutcome::Created
        })
    }

    fn down_phase(
        &self,
        conn: &dyn SqlExecutor,
        store: &VersionStore<'_>,
        files: &[FunctionFile],
        records: &BTreeMap<String, FunctionRecord>,
        outcomes: &mut BTreeMap<String, FunctionOutcome>,
    ) -> Result<(), MigrationError> {
        let on_disk: BTreeSet<&str> = files.iter().map(|f| f.name.as_str()).collect();

        for record in records.values() {
            if on_disk.contains(record.filename.as_str()) {
                continue;
            }

            log::info!("Remove old function: {}", record.definition);
            let removed = conn
                .batch_execute(&record.down)
                .map_err(|source| MigrationError::BrokenMigration {
                    filename: record.filename.clone(),
                    message: format!("Remove function IMPOSSIBLE: {}: {source}", record.definition),
                    source: Some(source),
                })
                .and_then(|()| {
                    store
                        .delete_function(&record.filename)
                        .map_err(|e| e.for_file(&record.filename))
                });

            if let Err(e) = removed {
                log::error!("{e}");
                outcomes.insert(record.filename.clone(), FunctionOutcome::Failed);
                return Err(e);
            }
            outcomes.insert(record.filename.clone(), FunctionOutcome::Removed);
        }
        Ok(())
    }
}

/// `Unchanged` after an aborted run only proves something for files whose
/// content matches their record; the rest were never reached.
fn function_check(
    outcome: FunctionOutcome,
    record: Option<&FunctionRecord>,
    content: Option<&str>,
    aborted: bool,
) -> FunctionCheck {
    match outcome {
        FunctionOutcome::Created => FunctionCheck::CreatePending,
        FunctionOutcome::Updated => FunctionCheck::UpdatePending,
        FunctionOutcome::Removed => FunctionCheck::RemovePending,
        FunctionOutcome::Failed => FunctionCheck::Failed,
        FunctionOutcome::Unchanged => match (record, content) {
            (Some(r), Some(content)) if r.up == content => FunctionCheck::UpToDate,
            _ if aborted => FunctionCheck::NotRun,
            (None, _) => FunctionCheck::CreatePending,
            (Some(_), None) => FunctionCheck::RemovePending,
            (Some(_), Some(_)) => FunctionCheck::UpdatePending,
        },
    }
}
