//! Integration tests for schema migrations
//!
//! Each test writes `.up.sql` / `.down.sql` files into a temporary directory,
//! runs the engine against its own PostgreSQL schema and checks the committed
//! state from a second session.

mod support;

use pretty_assertions::assert_eq;
use strata::migration::file::{FIRST_MIGRATION_REFUSAL, MISSING_DOWN_REFUSAL};
use strata::migration::status::{DownCheck, UpCheck, EXIT_ERROR, EXIT_PENDING, EXIT_UP_TO_DATE};
use strata::migration::{FunctionMigrator, MigrationOutcome, Queries, SchemaMigrator, StatusReporter, VersionStore};
use support::TestDb;

const FIRST: &str = "2024-01/2024-01-01_00-00-00.up.sql";

fn migrator(db: &TestDb) -> SchemaMigrator {
    SchemaMigrator::new(db.migrations_dir())
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_single_file_is_applied_then_reported_up_to_date() {
    let db = TestDb::new("single");
    db.write_migration(FIRST, "CREATE TABLE t(x int);");
    db.write_migration("2024-01/2024-01-01_00-00-00.down.sql", "DROP TABLE t;");

    let run = migrator(&db).execute(&db.conn, false).unwrap();
    assert_eq!(run.error, None);
    assert_eq!(run.outcomes.len(), 1);
    assert_eq!(run.outcomes[FIRST], MigrationOutcome::Applied);

    let status = migrator(&db).status(&db.conn).unwrap();
    assert_eq!(status.error, None);
    assert_eq!(status.entries.len(), 1);
    let entry = &status.entries[0];
    assert_eq!(entry.filename, FIRST);
    assert!(entry.executed);
    assert_eq!(entry.up, UpCheck::Skip);
    assert_eq!(entry.down, DownCheck::Skip);

    assert!(db.table_exists(&db.fresh_connection(), "t"));
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_batch_shares_one_version_and_second_run_skips() {
    let db = TestDb::new("batch");
    db.write_migration("2024-01/2024-01-02_00-00-00.up.sql", "INSERT INTO a VALUES (1);");
    db.write_migration("2024-01/2024-01-01_00-00-00.up.sql", "CREATE TABLE a(x int);");
    db.write_migration("2024-02/2024-02-01_00-00-00-b.up.sql", "CREATE TABLE b(x int);");

    let run = migrator(&db).execute(&db.conn, false).unwrap();
    assert_eq!(run.error, None);
    assert_eq!(run.version, 1);
    assert_eq!(run.count(MigrationOutcome::Applied), 3);

    let queries = Queries::postgres();
    let records = VersionStore::new(&db.conn, &queries).find_all_migrations().unwrap();
    let versions: Vec<i64> = records.values().map(|r| r.version).collect();
    assert_eq!(versions, vec![1, 1, 1]);

    let again = migrator(&db).execute(&db.conn, false).unwrap();
    assert_eq!(again.error, None);
    assert_eq!(again.version, 2);
    assert_eq!(again.count(MigrationOutcome::Skipped), 3);
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_failure_rolls_back_the_whole_batch() {
    let db = TestDb::new("integrity");
    db.write_migration("2024-01/2024-01-01_00-00-00.up.sql", "CREATE TABLE kept_out(x int);");
    db.write_migration("2024-01/2024-01-02_00-00-00.up.sql", "CREATE TABLE broken(x no_such_type);");
    db.write_migration("2024-01/2024-01-03_00-00-00.up.sql", "CREATE TABLE never(x int);");

    let run = migrator(&db).execute(&db.conn, false).unwrap();
    let error = run.error.clone().unwrap();
    assert!(error.ends_with("for: 2024-01/2024-01-02_00-00-00.up.sql"), "{error}");
    assert_eq!(run.outcomes["2024-01/2024-01-02_00-00-00.up.sql"], MigrationOutcome::Failed);
    assert_eq!(run.outcomes["2024-01/2024-01-03_00-00-00.up.sql"], MigrationOutcome::Skipped);

    let fresh = db.fresh_connection();
    assert!(!db.table_exists(&fresh, "kept_out"));
    assert!(!db.table_exists(&fresh, "never"));
    assert!(!db.table_exists(&fresh, "migrations"));
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_empty_forward_script_is_a_failure() {
    let db = TestDb::new("empty");
    db.write_migration(FIRST, "-- nothing yet\n");

    let run = migrator(&db).execute(&db.conn, false).unwrap();
    assert_eq!(run.error.as_deref(), Some(format!("Migration is empty for: {FIRST}").as_str()));
    assert_eq!(run.outcomes[FIRST], MigrationOutcome::Failed);
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_dry_run_persists_nothing() {
    let db = TestDb::new("dry");
    db.write_migration(FIRST, "CREATE TABLE t(x int);");

    let run = migrator(&db).execute(&db.conn, true).unwrap();
    assert_eq!(run.error, None);
    assert_eq!(run.outcomes[FIRST], MigrationOutcome::Applied);

    let fresh = db.fresh_connection();
    assert!(!db.table_exists(&fresh, "t"));
    assert!(!db.table_exists(&fresh, "migrations"));
    assert_eq!(db.conn.depth(), 0);
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_only_the_deleted_middle_file_is_rolled_back() {
    let db = TestDb::new("ordering");
    let a = "2024-01/2024-01-01_00-00-00-a.up.sql";
    let b = "2024-02/2024-02-01_00-00-00-b.up.sql";
    let c = "2024-03/2024-03-01_00-00-00-c.up.sql";

    db.write_migration(a, "CREATE TABLE a(x int);");
    assert_eq!(migrator(&db).execute(&db.conn, false).unwrap().error, None);

    db.write_migration(b, "CREATE TABLE b(x int);");
    db.write_migration("2024-02/2024-02-01_00-00-00-b.down.sql", "DROP TABLE b;");
    db.write_migration(c, "CREATE TABLE c(x int);");
    db.write_migration("2024-03/2024-03-01_00-00-00-c.down.sql", "DROP TABLE c;");
    assert_eq!(migrator(&db).execute(&db.conn, false).unwrap().error, None);

    db.remove_migration(b);
    db.remove_migration("2024-02/2024-02-01_00-00-00-b.down.sql");

    let run = migrator(&db).execute(&db.conn, false).unwrap();
    assert_eq!(run.error, None);
    assert_eq!(run.outcomes[a], MigrationOutcome::Skipped);
    assert_eq!(run.outcomes[b], MigrationOutcome::RolledBackWithoutDown);
    assert_eq!(run.outcomes[c], MigrationOutcome::Skipped);

    let fresh = db.fresh_connection();
    assert!(db.table_exists(&fresh, "a"));
    assert!(!db.table_exists(&fresh, "b"));
    assert!(db.table_exists(&fresh, "c"));
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_deleted_first_run_file_is_kept() {
    let db = TestDb::new("first_kept");
    db.write_migration(FIRST, "CREATE TABLE t(x int);");
    db.write_migration("2024-01/2024-01-01_00-00-00.down.sql", "DROP TABLE t;");
    assert_eq!(migrator(&db).execute(&db.conn, false).unwrap().error, None);

    db.remove_migration(FIRST);
    let run = migrator(&db).execute(&db.conn, false).unwrap();
    assert_eq!(run.error, None);
    assert_eq!(run.outcomes[FIRST], MigrationOutcome::Skipped);
    assert!(db.table_exists(&db.fresh_connection(), "t"));

    let status = migrator(&db).status(&db.conn).unwrap();
    assert_eq!(status.error, None);
    let entry = &status.entries[0];
    assert_eq!(entry.filename, FIRST);
    assert_eq!(entry.down, DownCheck::Kept);
    assert!(!entry.is_pending());
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_first_run_without_down_refuses_rollback() {
    let db = TestDb::new("first_refusal");
    db.write_migration(FIRST, "CREATE TABLE t(x int);");
    assert_eq!(migrator(&db).execute(&db.conn, false).unwrap().error, None);

    let queries = Queries::postgres();
    let records = VersionStore::new(&db.conn, &queries).find_all_migrations().unwrap();
    assert_eq!(records[FIRST].down, FIRST_MIGRATION_REFUSAL);

    let run = migrator(&db).rollback_to(&db.conn, 1, false).unwrap();
    let error = run.error.unwrap();
    assert!(error.contains("You cannot rollback the first migration"), "{error}");
    assert_eq!(run.outcomes[FIRST], MigrationOutcome::Failed);
    assert!(db.table_exists(&db.fresh_connection(), "t"));
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_status_leaves_refusal_stubs_untested() {
    let db = TestDb::new("refusals");
    let second = "2024-02/2024-02-01_00-00-00.up.sql";
    db.write_migration(FIRST, "CREATE TABLE a(x int);");
    assert_eq!(migrator(&db).execute(&db.conn, false).unwrap().error, None);
    db.write_migration(second, "CREATE TABLE b(x int);");
    assert_eq!(migrator(&db).execute(&db.conn, false).unwrap().error, None);

    let queries = Queries::postgres();
    let records = VersionStore::new(&db.conn, &queries).find_all_migrations().unwrap();
    assert_eq!(records[second].down, MISSING_DOWN_REFUSAL);
    assert_eq!(records[second].version, 2);

    let status = migrator(&db).status(&db.conn).unwrap();
    assert_eq!(status.error, None);
    let downs: Vec<DownCheck> = status.entries.iter().map(|e| e.down).collect();
    assert_eq!(downs, vec![DownCheck::Missing, DownCheck::Missing]);
    assert!(status.entries.iter().all(|e| !e.is_pending()));

    let functions = FunctionMigrator::new(db.functions_dir());
    let report = StatusReporter::new(&migrator(&db), &functions).report(&db.conn).unwrap();
    assert_eq!(report.exit_code(), EXIT_UP_TO_DATE);
    assert!(db.table_exists(&db.fresh_connection(), "b"));
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_rollback_to_version() {
    let db = TestDb::new("rollback");
    db.write_migration(FIRST, "CREATE TABLE a(x int);");
    assert_eq!(migrator(&db).execute(&db.conn, false).unwrap().error, None);

    let second = "2024-02/2024-02-01_00-00-00.up.sql";
    db.write_migration(second, "CREATE TABLE b(x int);");
    db.write_migration("2024-02/2024-02-01_00-00-00.down.sql", "DROP TABLE b;");
    assert_eq!(migrator(&db).execute(&db.conn, false).unwrap().version, 2);

    let dry = migrator(&db).rollback_to(&db.conn, 2, true).unwrap();
    assert_eq!(dry.outcomes[second], MigrationOutcome::RolledBack);
    assert!(db.table_exists(&db.fresh_connection(), "b"));

    let run = migrator(&db).rollback_to(&db.conn, 2, false).unwrap();
    assert_eq!(run.error, None);
    assert_eq!(run.outcomes[FIRST], MigrationOutcome::Skipped);
    assert_eq!(run.outcomes[second], MigrationOutcome::RolledBack);

    let fresh = db.fresh_connection();
    assert!(db.table_exists(&fresh, "a"));
    assert!(!db.table_exists(&fresh, "b"));
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_status_reports_broken_down_script() {
    let db = TestDb::new("broken_down");
    db.write_migration(FIRST, "CREATE TABLE a(x int);");
    assert_eq!(migrator(&db).execute(&db.conn, false).unwrap().error, None);

    let second = "2024-02/2024-02-01_00-00-00.up.sql";
    db.write_migration(second, "CREATE TABLE b(x int);");
    db.write_migration("2024-02/2024-02-01_00-00-00.down.sql", "DROP TABLE not_b;");

    let status = migrator(&db).status(&db.conn).unwrap();
    let entry = status.entries.iter().find(|e| e.filename == second).unwrap();
    assert_eq!(entry.up, UpCheck::Valid);
    assert_eq!(entry.down, DownCheck::Failed);
    assert!(status.error.is_some());

    assert!(!db.table_exists(&db.fresh_connection(), "b"));
}

#[test]
#[ignore = "requires STRATA_TEST_DATABASE_URL"]
fn test_status_exit_codes() {
    let db = TestDb::new("exit_codes");
    let schema = migrator(&db);
    let functions = FunctionMigrator::new(db.functions_dir());
    let reporter = StatusReporter::new(&schema, &functions);

    assert_eq!(reporter.report(&db.conn).unwrap().exit_code(), EXIT_UP_TO_DATE);

    db.write_migration(FIRST, "CREATE TABLE t(x int);");
    db.write_function(
        "t/count.sql",
        "CREATE OR REPLACE FUNCTION t_count() RETURNS bigint LANGUAGE sql AS $$ SELECT count(*) FROM t $$;",
    );
    let pending = reporter.report(&db.conn).unwrap();
    assert_eq!(pending.exit_code(), EXIT_PENDING);
    assert!(!db.table_exists(&db.fresh_connection(), "migrations"));

    schema.execute(&db.conn, false).unwrap();
    functions.execute(&db.conn, false).unwrap();
    assert_eq!(reporter.report(&db.conn).unwrap().exit_code(), EXIT_UP_TO_DATE);

    db.write_migration("2024-02/2024-02-01_00-00-00.up.sql", "ALTER TABLE missing ADD y int;");
    assert_eq!(reporter.report(&db.conn).unwrap().exit_code(), EXIT_ERROR);
    assert_eq!(db.conn.depth(), 0);
}
