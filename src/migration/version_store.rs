//! Persistence of applied migrations and functions
//!
//! All SQL comes from [`Queries`]; the store only binds parameters and maps
//! rows. Records are keyed by filename, so the maps returned by the `find_all`
//! methods iterate in filename order.

use crate::executor::{SqlExecutor, StrataError};
use crate::migration::queries::{Queries, QueryName};
use crate::migration::record::{FunctionRecord, MigrationRecord};
use crate::migration::MigrationError;
use std::collections::BTreeMap;

pub struct VersionStore<'a> {
    executor: &'a dyn SqlExecutor,
    queries: &'a Queries,
}

impl<'a> VersionStore<'a> {
    pub fn new(executor: &'a dyn SqlExecutor, queries: &'a Queries) -> Self {
        Self { executor, queries }
    }

    /// Create both tables when they do not exist yet.
    pub fn ensure_tables(&self) -> Result<(), MigrationError> {
        log::debug!("Init table migrations");
        self.executor
            .batch_execute(self.queries.get(QueryName::CreateTable))?;
        log::debug!("Init table functions");
        self.executor
            .batch_execute(self.queries.get(QueryName::CreateTableFunctions))?;
        Ok(())
    }

    /// `max(version)` over both tables plus one; `1` on an empty database.
    pub fn next_version(&self) -> Result<i64, MigrationError> {
        let row = self
            .executor
            .query_one(self.queries.get(QueryName::GetNextVersion), &[])?;
        let version: i64 = row
            .try_get(0)
            .map_err(|e| StrataError::ParseError(format!("next version: {e}")))?;
        Ok(version)
    }

    pub fn find_all_migrations(&self) -> Result<BTreeMap<String, MigrationRecord>, MigrationError> {
        let rows = self
            .executor
            .query_all(self.queries.get(QueryName::FindAll), &[])?;
        let mut records = BTreeMap::new();
        for row in &rows {
            let record = MigrationRecord::from_row(row)?;
            records.insert(record.filename.clone(), record);
        }
        Ok(records)
    }

    pub fn find_all_functions(&self) -> Result<BTreeMap<String, FunctionRecord>, MigrationError> {
        let rows = self
            .executor
            .query_all(self.queries.get(QueryName::FindAllFunctions), &[])?;
        let mut records = BTreeMap::new();
        for row in &rows {
            let record = FunctionRecord::from_row(row)?;
            records.insert(record.filename.clone(), record);
        }
        Ok(records)
    }

    pub fn insert_migration(
        &self,
        filename: &str,
        up: &str,
        down: &str,
        version: i64,
    ) -> Result<(), MigrationError> {
        self.executor.execute(
            self.queries.get(QueryName::Insert),
            &[&filename, &up, &down, &version],
        )?;
        Ok(())
    }

    pub fn delete_migration(&self, filename: &str) -> Result<(), MigrationError> {
        self.executor
            .execute(self.queries.get(QueryName::Delete), &[&filename])?;
        Ok(())
    }

    /// Insert or replace the record of a function file.
    pub fn upsert_function(
        &self,
        filename: &str,
        definition: &str,
        up: &str,
        down: &str,
        version: i64,
    ) -> Result<(), MigrationError> {
        self.executor.execute(
            self.queries.get(QueryName::UpsertFunctions),
            &[&filename, &definition, &up, &down, &version],
        )?;
        Ok(())
    }

    pub fn delete_function(&self, filename: &str) -> Result<(), MigrationError> {
        self.executor
            .execute(self.queries.get(QueryName::DeleteFunctions), &[&filename])?;
        Ok(())
    }
}
