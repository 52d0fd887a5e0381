//! Migration and function file discovery

use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const UP_SUFFIX: &str = ".up.sql";
pub const DOWN_SUFFIX: &str = ".down.sql";

/// Backward script stored when the very first migration run has no down file.
pub const FIRST_MIGRATION_REFUSAL: &str = "DO $$BEGIN RAISE EXCEPTION 'You cannot rollback the first migration' USING ERRCODE = 'MI001'; END;$$";

/// Backward script stored for later runs without a usable down file.
pub const MISSING_DOWN_REFUSAL: &str = "DO $$BEGIN RAISE EXCEPTION 'No migration down is defined, you cannot rollback' USING ERRCODE = 'MI002'; END;$$";

static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)--.*$").expect("valid regex"));

/// True when nothing but `--` comments and whitespace is left in `sql`.
pub fn sql_is_empty(sql: &str) -> bool {
    LINE_COMMENT
        .replace_all(sql, "")
        .chars()
        .all(char::is_whitespace)
}

/// True for the stubs stored in place of a missing or empty down file.
pub fn is_refusal_stub(sql: &str) -> bool {
    sql == FIRST_MIGRATION_REFUSAL || sql == MISSING_DOWN_REFUSAL
}

/// A forward script on disk and its optional backward script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// Path relative to the migrations directory, `/`-separated
    pub name: String,

    pub path: PathBuf,

    pub up_sql: String,

    /// `None` when the `.down.sql` file does not exist
    pub down_sql: Option<String>,
}

impl MigrationFile {
    /// Backward text to persist: the down file, or a refusal stub when it is
    /// missing or SQL-empty.
    pub fn stored_down(&self, first_run: bool) -> &str {
        match self.down_sql.as_deref() {
            Some(sql) if !sql_is_empty(sql) => sql,
            _ if first_run => FIRST_MIGRATION_REFUSAL,
            _ => MISSING_DOWN_REFUSAL,
        }
    }
}

/// `2024-01/2024-01-01_00-00-00.up.sql` → `2024-01/2024-01-01_00-00-00.down.sql`
pub fn down_filename(up_name: &str) -> String {
    match up_name.strip_suffix(UP_SUFFIX) {
        Some(stem) => format!("{stem}{DOWN_SUFFIX}"),
        None => up_name.replacen(".up.", ".down.", 1),
    }
}

/// Directory levels below the migrations directory implied by `date_format`.
pub fn directory_depth(date_format: &str) -> usize {
    date_format.matches('/').count()
}

/// Discover every `*.up.sql` exactly `directory_depth(date_format)` levels deep
///
/// Files are returned sorted by name. A missing directory yields no files.
///
/// # Errors
///
/// Returns `MigrationError::Io` when a directory or file cannot be read.
pub fn discover_migrations(dir: &Path, date_format: &str) -> Result<Vec<MigrationFile>, MigrationError> {
    let depth = directory_depth(date_format) + 1;
    let mut files = Vec::new();

    for path in sql_files(dir, depth)? {
        let name = relative_name(dir, &path);
        if !name.ends_with(UP_SUFFIX) {
            continue;
        }

        let up_sql = fs::read_to_string(&path).map_err(|e| MigrationError::io(&path, e))?;
        let down_path = dir.join(down_filename(&name));
        let down_sql = if down_path.is_file() {
            Some(fs::read_to_string(&down_path).map_err(|e| MigrationError::io(&down_path, e))?)
        } else {
            None
        };

        files.push(MigrationFile {
            name,
            path,
            up_sql,
            down_sql,
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// A stored function or procedure file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionFile {
    /// `<entity>/<name>.sql`
    pub name: String,
    pub path: PathBuf,
    pub content: String,
}

/// Discover every `<entity>/<name>.sql` below `dir`, sorted by name.
pub fn discover_functions(dir: &Path) -> Result<Vec<FunctionFile>, MigrationError> {
    let mut files = Vec::new();
    for path in sql_files(dir, 2)? {
        let content = fs::read_to_string(&path).map_err(|e| MigrationError::io(&path, e))?;
        files.push(FunctionFile {
            name: relative_name(dir, &path),
            path,
            content,
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn sql_files(dir: &Path, depth: usize) -> Result<Vec<PathBuf>, MigrationError> {
    if !dir.exists() {
        log::warn!("Directory {} does not exist, nothing to discover", dir.display());
        return Ok(Vec::new());
    }
    if !dir.is_dir() {
        return Err(MigrationError::InvalidFormat(format!(
            "Path is not a directory: {}",
            dir.display()
        )));
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).min_depth(depth).max_depth(depth) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
            MigrationError::io(path, e.into())
        })?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().and_then(|s| s.to_str()) == Some("sql") {
            paths.push(path.to_path_buf());
        }
    }
    Ok(paths)
}

fn relative_name(dir: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(dir).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DATE_FORMAT;
    use pretty_assertions::assert_eq;

    fn write(root: &Path, name: &str, content: &str) {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_sql_is_empty() {
        assert!(sql_is_empty(""));
        assert!(sql_is_empty("  \n\t"));
        assert!(sql_is_empty("-- nothing here\n   -- still nothing\n"));
        assert!(!sql_is_empty("-- comment\nSELECT 1;"));
        assert!(!sql_is_empty("SELECT 1; -- trailing"));
    }

    #[test]
    fn test_down_filename() {
        assert_eq!(
            down_filename("2024-01/2024-01-01_00-00-00.up.sql"),
            "2024-01/2024-01-01_00-00-00.down.sql"
        );
        assert_eq!(down_filename("a-init.up.sql"), "a-init.down.sql");
    }

    #[test]
    fn test_stored_down_prefers_file_then_stub() {
        let mut file = MigrationFile {
            name: "a.up.sql".to_string(),
            path: PathBuf::from("a.up.sql"),
            up_sql: "CREATE TABLE a ()".to_string(),
            down_sql: Some("DROP TABLE a".to_string()),
        };
        assert_eq!(file.stored_down(true), "DROP TABLE a");

        file.down_sql = Some("-- empty\n".to_string());
        assert_eq!(file.stored_down(true), FIRST_MIGRATION_REFUSAL);

        file.down_sql = None;
        assert_eq!(file.stored_down(false), MISSING_DOWN_REFUSAL);
        assert!(is_refusal_stub(file.stored_down(false)));
    }

    #[test]
    fn test_discover_migrations_at_date_depth() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "2024-02/2024-02-01_00-00-00.up.sql", "SELECT 2;");
        write(root, "2024-01/2024-01-01_00-00-00-init.up.sql", "SELECT 1;");
        write(root, "2024-01/2024-01-01_00-00-00-init.down.sql", "SELECT -1;");
        write(root, "stray.up.sql", "SELECT 0;");
        write(root, "2024-01/deeper/2024-01-02.up.sql", "SELECT 3;");

        let files = discover_migrations(root, DEFAULT_DATE_FORMAT).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "2024-01/2024-01-01_00-00-00-init.up.sql",
                "2024-02/2024-02-01_00-00-00.up.sql",
            ]
        );
        assert_eq!(files[0].down_sql.as_deref(), Some("SELECT -1;"));
        assert_eq!(files[1].down_sql, None);
    }

    #[test]
    fn test_flat_date_format_reads_top_level() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "20240101000000.up.sql", "SELECT 1;");
        let files = discover_migrations(dir.path(), "%Y%m%d%H%M%S").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "20240101000000.up.sql");
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent");
        assert!(discover_migrations(&absent, DEFAULT_DATE_FORMAT).unwrap().is_empty());
        assert!(discover_functions(&absent).unwrap().is_empty());
    }

    #[test]
    fn test_discover_functions_by_entity() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "user/getById.sql", "CREATE OR REPLACE FUNCTION a() ...");
        write(dir.path(), "account/list.sql", "CREATE OR REPLACE FUNCTION b() ...");
        write(dir.path(), "loose.sql", "ignored");
        write(dir.path(), "user/notes.txt", "ignored");

        let names: Vec<String> = discover_functions(dir.path())
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["account/list.sql", "user/getById.sql"]);
    }
}
