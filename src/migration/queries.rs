//! Store queries by logical name
//!
//! The version store never embeds SQL of its own; it asks for a query by name.
//! Built-in PostgreSQL defaults cover every name, and any of them can be
//! replaced by a `<name>.sql` file in an override directory (for a different
//! table layout or schema). Overrides must keep the positional parameters:
//!
//! | name                   | parameters                                           |
//! |------------------------|------------------------------------------------------|
//! | `createTable`          | none                                                 |
//! | `insert`               | `$1` filename, `$2` up, `$3` down, `$4` version      |
//! | `delete`               | `$1` filename                                        |
//! | `findAll`              | none, returns filename, up, down, version, applied_at |
//! | `getNextVersion`       | none, returns one `bigint`                           |
//! | `createTableFunctions` | none                                                 |
//! | `upsertFunctions`      | `$1` filename, `$2` definition, `$3` up, `$4` down, `$5` version |
//! | `deleteFunctions`      | `$1` filename                                        |
//! | `findAllFunctions`     | none, returns filename, definition, up, down, version |

use crate::migration::MigrationError;
use sea_query::{ColumnDef, Expr, PostgresQueryBuilder, Table};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const MIGRATIONS_TABLE: &str = "migrations";
pub const FUNCTIONS_TABLE: &str = "functions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryName {
    CreateTable,
    Insert,
    Delete,
    FindAll,
    GetNextVersion,
    CreateTableFunctions,
    UpsertFunctions,
    DeleteFunctions,
    FindAllFunctions,
}

impl QueryName {
    pub const ALL: [QueryName; 9] = [
        QueryName::CreateTable,
        QueryName::Insert,
        QueryName::Delete,
        QueryName::FindAll,
        QueryName::GetNextVersion,
        QueryName::CreateTableFunctions,
        QueryName::UpsertFunctions,
        QueryName::DeleteFunctions,
        QueryName::FindAllFunctions,
    ];

    /// Logical name, also the stem of the override file.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryName::CreateTable => "createTable",
            QueryName::Insert => "insert",
            QueryName::Delete => "delete",
            QueryName::FindAll => "findAll",
            QueryName::GetNextVersion => "getNextVersion",
            QueryName::CreateTableFunctions => "createTableFunctions",
            QueryName::UpsertFunctions => "upsertFunctions",
            QueryName::DeleteFunctions => "deleteFunctions",
            QueryName::FindAllFunctions => "findAllFunctions",
        }
    }

    fn default_sql(&self) -> String {
        match self {
            QueryName::CreateTable => create_migrations_table(),
            QueryName::Insert => format!(
                "INSERT INTO {MIGRATIONS_TABLE} (filename, up, down, version) VALUES ($1, $2, $3, $4)"
            ),
            QueryName::Delete => format!("DELETE FROM {MIGRATIONS_TABLE} WHERE filename = $1"),
            QueryName::FindAll => format!(
                "SELECT filename, up, down, version, applied_at FROM {MIGRATIONS_TABLE} ORDER BY filename"
            ),
            QueryName::GetNextVersion => format!(
                "SELECT COALESCE(MAX(version), 0)::bigint + 1 FROM \
                 (SELECT version FROM {MIGRATIONS_TABLE} UNION ALL SELECT version FROM {FUNCTIONS_TABLE}) AS versions"
            ),
            QueryName::CreateTableFunctions => create_functions_table(),
            QueryName::UpsertFunctions => format!(
                "INSERT INTO {FUNCTIONS_TABLE} (filename, definition, up, down, version) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (filename) DO UPDATE SET \
                 definition = EXCLUDED.definition, up = EXCLUDED.up, \
                 down = EXCLUDED.down, version = EXCLUDED.version"
            ),
            QueryName::DeleteFunctions => format!("DELETE FROM {FUNCTIONS_TABLE} WHERE filename = $1"),
            QueryName::FindAllFunctions => format!(
                "SELECT filename, definition, up, down, version FROM {FUNCTIONS_TABLE} ORDER BY filename"
            ),
        }
    }
}

/// `migrations(filename PK, up, down, version, applied_at)`
fn create_migrations_table() -> String {
    Table::create()
        .table(MIGRATIONS_TABLE)
        .if_not_exists()
        .col(ColumnDef::new("filename").text().not_null().primary_key())
        .col(ColumnDef::new("up").text().not_null())
        .col(ColumnDef::new("down").text().not_null())
        .col(ColumnDef::new("version").big_integer().not_null())
        .col(
            ColumnDef::new("applied_at")
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_owned()
        .build(PostgresQueryBuilder)
}

/// `functions(filename PK, definition, up, down, version)`
fn create_functions_table() -> String {
    Table::create()
        .table(FUNCTIONS_TABLE)
        .if_not_exists()
        .col(ColumnDef::new("filename").text().not_null().primary_key())
        .col(ColumnDef::new("definition").text().not_null())
        .col(ColumnDef::new("up").text().not_null())
        .col(ColumnDef::new("down").text().not_null())
        .col(ColumnDef::new("version").big_integer().not_null())
        .to_owned()
        .build(PostgresQueryBuilder)
}

/// The SQL-template collaborator used by the version store
#[derive(Debug, Clone)]
pub struct Queries {
    templates: HashMap<QueryName, String>,
}

impl Default for Queries {
    fn default() -> Self {
        Self::postgres()
    }
}

impl Queries {
    /// Built-in PostgreSQL templates.
    pub fn postgres() -> Self {
        let templates = QueryName::ALL
            .iter()
            .map(|name| (*name, name.default_sql()))
            .collect();
        Self { templates }
    }

    /// Built-in templates, replaced by every `<name>.sql` present in `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, MigrationError> {
        let mut queries = Self::postgres();
        for name in QueryName::ALL {
            let path = dir.join(format!("{}.sql", name.as_str()));
            if !path.is_file() {
                continue;
            }
            let sql = fs::read_to_string(&path).map_err(|e| MigrationError::io(&path, e))?;
            log::debug!("Using query override {} from {}", name.as_str(), path.display());
            queries.templates.insert(name, sql);
        }
        Ok(queries)
    }

    /// Replace one template.
    pub fn with(mut self, name: QueryName, sql: impl Into<String>) -> Self {
        self.templates.insert(name, sql.into());
        self
    }

    pub fn get(&self, name: QueryName) -> &str {
        self.templates
            .get(&name)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_every_name_has_a_default() {
        let queries = Queries::postgres();
        for name in QueryName::ALL {
            assert!(!queries.get(name).is_empty(), "missing {}", name.as_str());
        }
    }

    #[test]
    fn test_create_tables_are_idempotent() {
        let queries = Queries::postgres();
        for name in [QueryName::CreateTable, QueryName::CreateTableFunctions] {
            let sql = queries.get(name);
            assert!(sql.contains("IF NOT EXISTS"), "{sql}");
            assert!(sql.contains("filename"), "{sql}");
        }
        assert!(queries.get(QueryName::CreateTable).contains("applied_at"));
        assert!(queries.get(QueryName::CreateTableFunctions).contains("definition"));
    }

    #[test]
    fn test_next_version_covers_both_tables() {
        let sql = Queries::postgres().get(QueryName::GetNextVersion).to_string();
        assert!(sql.contains(MIGRATIONS_TABLE));
        assert!(sql.contains(FUNCTIONS_TABLE));
    }

    #[test]
    fn test_directory_overrides_only_present_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("findAll.sql"), "SELECT * FROM app.migrations").unwrap();

        let queries = Queries::from_dir(dir.path()).unwrap();
        assert_eq!(queries.get(QueryName::FindAll), "SELECT * FROM app.migrations");
        assert_eq!(
            queries.get(QueryName::Delete),
            Queries::postgres().get(QueryName::Delete)
        );
    }
}
