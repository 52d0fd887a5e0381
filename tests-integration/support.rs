//! Shared fixture: one PostgreSQL schema and one temporary directory per test.
//!
//! The tests are `#[ignore]`d by default. Run them with
//! `STRATA_TEST_DATABASE_URL=... cargo test -p strata-integration-tests -- --ignored`.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use strata::connection;
use strata::{SqlExecutor, TransactionalConnection};
use tempfile::TempDir;

static SCHEMA_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub struct TestDb {
    pub conn: TransactionalConnection,
    pub schema: String,
    url: String,
    dir: TempDir,
}

impl TestDb {
    /// Panics when no test database is configured; an ignored test that was
    /// asked for must not pass without one.
    pub fn new(label: &str) -> Self {
        let url = std::env::var("STRATA_TEST_DATABASE_URL")
            .unwrap_or_else(|_| panic!("{label}: STRATA_TEST_DATABASE_URL is not set"));

        let schema = format!(
            "strata_{}_{}_{}",
            label,
            std::process::id(),
            SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        let conn = open(&url);
        conn.batch_execute(&format!(
            "DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema}"
        ))
        .expect("create test schema");
        use_schema(&conn, &schema);

        Self {
            conn,
            schema,
            url,
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    /// A second session on the same schema, to observe committed state only.
    pub fn fresh_connection(&self) -> TransactionalConnection {
        let conn = open(&self.url);
        use_schema(&conn, &self.schema);
        conn
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.dir.path().join("migrations")
    }

    pub fn functions_dir(&self) -> PathBuf {
        self.dir.path().join("functions")
    }

    pub fn write_migration(&self, name: &str, sql: &str) {
        write(self.migrations_dir().join(name), sql);
    }

    pub fn remove_migration(&self, name: &str) {
        fs::remove_file(self.migrations_dir().join(name)).expect("remove migration file");
    }

    pub fn write_function(&self, name: &str, sql: &str) {
        write(self.functions_dir().join(name), sql);
    }

    pub fn remove_function(&self, name: &str) {
        fs::remove_file(self.functions_dir().join(name)).expect("remove function file");
    }

    pub fn table_exists(&self, conn: &TransactionalConnection, table: &str) -> bool {
        let row = conn
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = $2)",
                &[&self.schema, &table],
            )
            .expect("query information_schema");
        row.get(0)
    }

    /// Number of overloads and argument count of each, for `name` in the test schema.
    pub fn routine_arg_counts(&self, conn: &TransactionalConnection, name: &str) -> Vec<i16> {
        conn.query_all(
            "SELECT p.pronargs FROM pg_proc p JOIN pg_namespace n ON n.oid = p.pronamespace \
             WHERE n.nspname = $1 AND p.proname = $2 ORDER BY p.pronargs",
            &[&self.schema, &name],
        )
        .expect("query pg_proc")
        .iter()
        .map(|row| row.get(0))
        .collect()
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let _ = self
            .conn
            .batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema));
    }
}

fn open(url: &str) -> TransactionalConnection {
    connection::open(url).expect("connect to STRATA_TEST_DATABASE_URL")
}

fn use_schema(conn: &TransactionalConnection, schema: &str) {
    conn.batch_execute(&format!("SET search_path TO {schema}"))
        .expect("set search_path");
}

fn write(path: PathBuf, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent directory");
    }
    fs::write(path, content).expect("write fixture file");
}
