//! Blank migration and function file generation

use crate::migration::MigrationError;
use chrono::{DateTime, TimeZone};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

const UP_TEMPLATE: &str = "-- Your SQL script for UP migration here\n";
const DOWN_TEMPLATE: &str = "-- Your SQL script for DOWN migration here\n";

/// Write an empty `.up.sql` / `.down.sql` pair named after `now`
///
/// `date_format` is a chrono format; each `/` in it becomes a directory. An
/// optional `name` is appended as `-<name>`. The bodies are comments only, so
/// an unedited pair is reported as an empty migration.
///
/// # Errors
///
/// Returns `MigrationError::InvalidFormat` for an unusable date format and
/// `MigrationError::Io` when a file already exists or cannot be written.
pub fn generate_migration<Tz>(
    migrations_dir: &Path,
    date_format: &str,
    name: Option<&str>,
    now: &DateTime<Tz>,
) -> Result<(PathBuf, PathBuf), MigrationError>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let mut stem = String::new();
    write!(stem, "{}", now.format(date_format))
        .map_err(|_| MigrationError::InvalidFormat(format!("Invalid date format: {date_format}")))?;

    match name.map(str::trim) {
        Some(name) if !name.is_empty() && !name.starts_with('-') => {
            stem.push('-');
            stem.push_str(name);
        }
        Some(name) => stem.push_str(name),
        None => {}
    }

    let up = migrations_dir.join(format!("{stem}.up.sql"));
    let down = migrations_dir.join(format!("{stem}.down.sql"));
    create_file(&up, UP_TEMPLATE)?;
    create_file(&down, DOWN_TEMPLATE)?;
    log::info!("Created {} and {}", up.display(), down.display());
    Ok((up, down))
}

/// Files written by [`generate_function`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFunction {
    pub function_name: String,
    pub function_file: PathBuf,
    pub request_file: Option<PathBuf>,
}

/// Write a `CREATE OR REPLACE FUNCTION` skeleton for `<entity>/<name>`
///
/// The function is named `<entity>_<snake name>` and returns the row of the
/// snake-cased `entity` table matching `_uuid` as json. With a requests
/// directory, a `SELECT * FROM <function>(:uuid)` file is written next to it.
pub fn generate_function(
    functions_dir: &Path,
    requests_dir: Option<&Path>,
    entity: &str,
    name: &str,
) -> Result<GeneratedFunction, MigrationError> {
    if entity.trim().is_empty() || name.trim().is_empty() {
        return Err(MigrationError::InvalidFormat(
            "Entity and function name are required".to_string(),
        ));
    }

    let table = camel_to_snake(entity);
    let function_name = format!("{}_{}", entity, camel_to_snake(name))
        .replace('/', "_")
        .to_lowercase();

    let function_file = functions_dir.join(entity).join(format!("{name}.sql"));
    create_file(&function_file, &function_skeleton(&function_name, &table))?;
    log::info!("Created {}", function_file.display());

    let request_file = match requests_dir {
        Some(dir) => {
            let path = dir.join(entity).join(format!("{name}.sql"));
            create_file(&path, &format!("SELECT * FROM {function_name}(:uuid)\n"))?;
            log::info!("Created {}", path.display());
            Some(path)
        }
        None => None,
    };

    Ok(GeneratedFunction {
        function_name,
        function_file,
        request_file,
    })
}

fn function_skeleton(function_name: &str, table: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {function_name} (_uuid uuid) RETURNS json
  LANGUAGE plpgsql
  PARALLEL SAFE
AS $$
DECLARE
  result json;
BEGIN
  SELECT to_json(t) INTO result
    FROM
    (
      SELECT
        *
      FROM {table}
      WHERE uuid = _uuid
    ) t;
    RETURN result;
END;
$$;
"#
    )
}

/// `getById` → `get_by_id`, `UserAccount` → `user_account`
pub fn camel_to_snake(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    for (i, c) in input.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 && !out.ends_with(&['_', '/'][..]) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Create `path` and its parent directories; never overwrites.
fn create_file(path: &Path, content: &str) -> Result<(), MigrationError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| MigrationError::io(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| MigrationError::io(path, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| MigrationError::io(path, e))
}
