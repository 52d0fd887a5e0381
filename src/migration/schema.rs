//! Schema migrations: paired `.up.sql` / `.down.sql` scripts
//!
//! A run works on the union of the forward files on disk and the records in the
//! store. Forward scripts without a record are applied in filename order;
//! records whose forward file disappeared are rolled back newest first using
//! the backward text stored when they were applied. The whole run is one
//! transaction level, so a failure anywhere leaves the database untouched.

use crate::config::{StrataConfig, DEFAULT_DATE_FORMAT};
use crate::executor::SqlExecutor;
use crate::migration::file::{discover_migrations, down_filename, is_refusal_stub, sql_is_empty, MigrationFile};
use crate::migration::queries::Queries;
use crate::migration::record::MigrationRecord;
use crate::migration::run::{discard, file_failure, finish, EngineRun};
use crate::migration::status::{DownCheck, SchemaStatus, SchemaStatusEntry, UpCheck};
use crate::migration::version_store::VersionStore;
use crate::migration::MigrationError;
use crate::transaction::TransactionalConnection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Version of the records written by the very first run. Those are rolled
/// back only when a version bound asks for them.
const FIRST_RUN_VERSION: i64 = 1;

/// Lowest version tested by the backward simulation of `status`; records of
/// the very first run are left alone.
const STATUS_DOWN_BOUND: i64 = FIRST_RUN_VERSION + 1;

/// Terminal state of one migration file in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Nothing to do, or not reached
    Skipped,
    Applied,
    Failed,
    /// Backward script run, down file still on disk
    RolledBack,
    /// Backward script run from the stored text only
    RolledBackWithoutDown,
}

impl MigrationOutcome {
    /// `None`, `1`, `0`, `-1`, `-2`
    pub fn code(&self) -> Option<i8> {
        match self {
            MigrationOutcome::Skipped => None,
            MigrationOutcome::Applied => Some(1),
            MigrationOutcome::Failed => Some(0),
            MigrationOutcome::RolledBack => Some(-1),
            MigrationOutcome::RolledBackWithoutDown => Some(-2),
        }
    }

    pub fn is_rollback(&self) -> bool {
        matches!(
            self,
            MigrationOutcome::RolledBack | MigrationOutcome::RolledBackWithoutDown
        )
    }
}

/// Partial or complete result of `execute` / `rollback_to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaRun {
    /// Every known file, in filename order
    pub outcomes: BTreeMap<String, MigrationOutcome>,
    /// First failure, `"<message> for: <filename>"`
    pub error: Option<String>,
    /// Version stamped on every record written by this run
    pub version: i64,
}

impl EngineRun for SchemaRun {
    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

impl SchemaRun {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn count(&self, outcome: MigrationOutcome) -> usize {
        self.outcomes.values().filter(|o| **o == outcome).count()
    }
}

pub struct SchemaMigrator {
    migrations_dir: PathBuf,
    date_format: String,
    queries: Queries,
}

impl SchemaMigrator {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            queries: Queries::postgres(),
        }
    }

    /// Build a migrator from the `[migration]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` when a query override cannot be read.
    pub fn from_config(config: &StrataConfig) -> Result<Self, MigrationError> {
        let queries = match &config.queries_dir {
            Some(dir) => Queries::from_dir(dir)?,
            None => Queries::postgres(),
        };
        Ok(Self::new(&config.migrations_dir)
            .with_date_format(&config.date_format)
            .with_queries(queries))
    }

    /// chrono format of generated paths; its `/` count sets the discovery depth.
    pub fn with_date_format(mut self, date_format: impl Into<String>) -> Self {
        self.date_format = date_format.into();
        self
    }

    pub fn with_queries(mut self, queries: Queries) -> Self {
        self.queries = queries;
        self
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    pub fn date_format(&self) -> &str {
        &self.date_format
    }

    pub fn queries(&self) -> &Queries {
        &self.queries
    }

    /// Forward files on disk, sorted by name.
    pub fn discover(&self) -> Result<Vec<MigrationFile>, MigrationError> {
        discover_migrations(&self.migrations_dir, &self.date_format)
    }

    /// Apply pending forward scripts then roll back orphaned records
    ///
    /// The run is committed only when `dry_run` is false and nothing failed.
    /// Per-file failures are reported in [`SchemaRun::error`]; only failures
    /// to open or close the transaction, read the files or prepare the tables
    /// are returned as `Err`.
    pub fn execute(&self, conn: &TransactionalConnection, dry_run: bool) -> Result<SchemaRun, MigrationError> {
        log::info!(
            "Running schema migrations from {}{}",
            self.migrations_dir.display(),
            if dry_run { " (dry run)" } else { "" }
        );
        conn.begin()?;
        let result = self.run(conn, true, None);
        finish(conn, result, dry_run)
    }

    /// Roll back every record whose version is at least `version`, newest
    /// filename first, along with any later-run record whose forward file is
    /// gone. `rollback_to(1)` is the only way to reach the first run.
    pub fn rollback_to(
        &self,
        conn: &TransactionalConnection,
        version: i64,
        dry_run: bool,
    ) -> Result<SchemaRun, MigrationError> {
        log::info!("Rolling back schema migrations to version {version}");
        conn.begin()?;
        let result = self.run(conn, false, Some(version));
        finish(conn, result, dry_run)
    }

    /// What `execute` would do, computed by running it and rolling back
    ///
    /// The backward script of every record except those of the first run is
    /// executed too, so a broken down file is reported before it is needed.
    pub fn status(&self, conn: &TransactionalConnection) -> Result<SchemaStatus, MigrationError> {
        conn.begin()?;
        let result = self.simulate(conn);
        discard(conn, result)
    }

    fn run(
        &self,
        conn: &TransactionalConnection,
        apply_up: bool,
        bound: Option<i64>,
    ) -> Result<SchemaRun, MigrationError> {
        let store = VersionStore::new(conn, &self.queries);
        store.ensure_tables()?;

        let files = self.discover()?;
        let executed = store.find_all_migrations()?;
        let version = store.next_version()?;
        let first_run = executed.is_empty();

        let mut run = SchemaRun {
            outcomes: known_files(&files, &executed),
            error: None,
            version,
        };

        if apply_up {
            let result = self.up_phase(conn, &store, &files, &executed, version, first_run, &mut run.outcomes);
            if let Some(error) = file_failure(result)? {
                run.error = Some(error);
                return Ok(run);
            }
        }

        let executed = store.find_all_migrations()?;
        let result = self.down_phase(conn, &store, &files, &executed, bound, false, &mut run.outcomes);
        run.error = file_failure(result)?;
        Ok(run)
    }

    fn simulate(&self, conn: &TransactionalConnection) -> Result<SchemaStatus, MigrationError> {
        let store = VersionStore::new(conn, &self.queries);
        store.ensure_tables()?;

        let files = self.discover()?;
        let executed = store.find_all_migrations()?;
        let version = store.next_version()?;

        let mut up = BTreeMap::new();
        let mut down = BTreeMap::new();
        let result = self.up_phase(conn, &store, &files, &executed, version, executed.is_empty(), &mut up);
        let mut error = file_failure(result)?;
        if error.is_none() {
            let applied = store.find_all_migrations()?;
            let result = self.down_phase(
                conn,
                &store,
                &files,
                &applied,
                Some(STATUS_DOWN_BOUND),
                true,
                &mut down,
            );
            error = file_failure(result)?;
        }

        let on_disk: BTreeMap<&str, &MigrationFile> = files.iter().map(|f| (f.name.as_str(), f)).collect();
        let entries = known_files(&files, &executed)
            .into_keys()
            .map(|filename| {
                let record = executed.get(&filename);
                let file = on_disk.get(filename.as_str()).copied();
                SchemaStatusEntry {
                    up: up_check(record.is_some(), up.get(&filename)),
                    down: down_check(file, record, down.get(&filename)),
                    executed: record.is_some(),
                    on_disk: file.is_some(),
                    version: record.map(|r| r.version),
                    filename,
                }
            })
            .collect();

        Ok(SchemaStatus { entries, error })
    }

    #[allow(clippy::too_many_arguments)]
    fn up_phase(
        &self,
        conn: &dyn SqlExecutor,
        store: &VersionStore<'_>,
        files: &[MigrationFile],
        executed: &BTreeMap<String, MigrationRecord>,
        version: i64,
        first_run: bool,
        outcomes: &mut BTreeMap<String, MigrationOutcome>,
    ) -> Result<(), MigrationError> {
        for file in files {
            if executed.contains_key(&file.name) {
                log::info!("Skip migration, already executed: '{}'", file.name);
                outcomes.insert(file.name.clone(), MigrationOutcome::Skipped);
                continue;
            }

            #[cfg(feature = "tracing")]
            let _span = tracing_helpers::migration_span("schema", &file.name).entered();

            if sql_is_empty(&file.up_sql) {
                outcomes.insert(file.name.clone(), MigrationOutcome::Failed);
                log::error!("Migration '{}' is empty", file.name);
                return Err(MigrationError::broken(&file.name, "Migration is empty"));
            }

            log::info!("Execute migration '{}'", file.name);
            log::debug!("{}", file.up_sql);
            let applied = conn
                .batch_execute(&file.up_sql)
                .map_err(|e| MigrationError::statement(&file.name, e))
                .and_then(|()| {
                    store
                        .insert_migration(&file.name, &file.up_sql, file.stored_down(first_run), version)
                        .map_err(|e| e.for_file(&file.name))
                });

            if let Err(e) = applied {
                outcomes.insert(file.name.clone(), MigrationOutcome::Failed);
                log::error!("Migration '{}' failed: {}", file.name, e);
                return Err(e);
            }

            outcomes.insert(file.name.clone(), MigrationOutcome::Applied);
            #[cfg(feature = "metrics")]
            METRICS.record_migration_applied();
        }
        Ok(())
    }

    /// Orphans of the first run stay unless `bound` reaches them.
    /// `skip_refusals` leaves alone records still on disk whose stored backward
    /// text is a refusal stub; they could only fail.
    #[allow(clippy::too_many_arguments)]
    fn down_phase(
        &self,
        conn: &dyn SqlExecutor,
        store: &VersionStore<'_>,
        files: &[MigrationFile],
        executed: &BTreeMap<String, MigrationRecord>,
        bound: Option<i64>,
        skip_refusals: bool,
        outcomes: &mut BTreeMap<String, MigrationOutcome>,
    ) -> Result<(), MigrationError> {
        let on_disk: BTreeSet<&str> = files.iter().map(|f| f.name.as_str()).collect();

        for record in executed.values().rev() {
            let present = on_disk.contains(record.filename.as_str());
            let forced = bound.is_some_and(|b| record.version >= b);
            if present && !forced {
                continue;
            }
            if !present && !forced && record.version <= FIRST_RUN_VERSION {
                log::warn!(
                    "Migration '{}' of the first run is gone from disk, keeping it",
                    record.filename
                );
                continue;
            }
            if present && skip_refusals && is_refusal_stub(&record.down) {
                continue;
            }

            #[cfg(feature = "tracing")]
            let _span = tracing_helpers::migration_span("schema_down", &record.filename).entered();

            log::info!("Rollback migration '{}'", record.filename);
            log::debug!("{}", record.down);
            let rolled_back = conn
                .batch_execute(&record.down)
                .map_err(|e| MigrationError::statement(&record.filename, e))
                .and_then(|()| {
                    store
                        .delete_migration(&record.filename)
                        .map_err(|e| e.for_file(&record.filename))
                });

            if let Err(e) = rolled_back {
                outcomes.insert(record.filename.clone(), MigrationOutcome::Failed);
                log::error!("Rollback of '{}' failed: {}", record.filename, e);
                return Err(e);
            }

            let outcome = if self.down_file_exists(&record.filename) {
                MigrationOutcome::RolledBack
            } else {
                MigrationOutcome::RolledBackWithoutDown
            };
            outcomes.insert(record.filename.clone(), outcome);
        }
        Ok(())
    }

    fn down_file_exists(&self, up_name: &str) -> bool {
        self.migrations_dir.join(down_filename(up_name)).is_file()
    }
}

fn known_files(
    files: &[MigrationFile],
    executed: &BTreeMap<String, MigrationRecord>,
) -> BTreeMap<String, MigrationOutcome> {
    files
        .iter()
        .map(|f| f.name.clone())
        .chain(executed.keys().cloned())
        .map(|name| (name, MigrationOutcome::Skipped))
        .collect()
}

fn up_check(executed: bool, tested: Option<&MigrationOutcome>) -> UpCheck {
    match tested {
        _ if executed => UpCheck::Skip,
        Some(MigrationOutcome::Applied) => UpCheck::Valid,
        Some(MigrationOutcome::Failed) => UpCheck::Failed,
        _ => UpCheck::Skip,
    }
}

fn down_check(
    file: Option<&MigrationFile>,
    record: Option<&MigrationRecord>,
    tested: Option<&MigrationOutcome>,
) -> DownCheck {
    match (file, tested) {
        (_, Some(MigrationOutcome::Failed)) => DownCheck::Failed,
        (None, None) if record.is_some_and(|r| r.version <= FIRST_RUN_VERSION) => DownCheck::Kept,
        (None, _) => DownCheck::NeedsRollback,
        (Some(_), Some(outcome)) if outcome.is_rollback() => DownCheck::Valid,
        (Some(file), _) => match file.down_sql.as_deref() {
            None => DownCheck::Missing,
            Some(sql) if sql_is_empty(sql) => DownCheck::Empty,
            Some(_) => DownCheck::Skip,
        },
    }
}
