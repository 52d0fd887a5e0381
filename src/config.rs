//! Configuration for the migration engines.
//!
//! Settings live in the `[migration]` section of `config/config.toml` and can be
//! overridden by environment variables such as `STRATA__MIGRATION__MIGRATIONS_DIR`.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// chrono format used for generated migration paths; every `/` becomes a directory level.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m/%Y-%m-%d_%H-%M-%S";

const DEFAULT_CONFIG_FILE: &str = "config/config.toml";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StrataConfig {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_functions_dir")]
    pub functions_dir: PathBuf,
    /// Where `generate-function` writes the companion `SELECT` request file.
    #[serde(default)]
    pub function_requests_dir: Option<PathBuf>,
    /// Directory of `<queryName>.sql` files overriding the built-in store queries.
    #[serde(default)]
    pub queries_dir: Option<PathBuf>,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_functions_dir() -> PathBuf {
    PathBuf::from("functions")
}

fn default_date_format() -> String {
    DEFAULT_DATE_FORMAT.to_string()
}

fn default_lock_timeout_seconds() -> u64 {
    60
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            migrations_dir: default_migrations_dir(),
            functions_dir: default_functions_dir(),
            function_requests_dir: None,
            queries_dir: None,
            date_format: default_date_format(),
            lock_timeout_seconds: default_lock_timeout_seconds(),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix("STRATA").separator("__")
}

impl StrataConfig {
    /// Load the configuration from `config/config.toml`, falling back to env vars.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load the configuration from `path` (optional) and the environment.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(environment());

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                // unreadable or malformed file: keep going with the environment only
                if path.exists() {
                    log::warn!(
                        "failed to load config file {}, falling back to env. Error: {}",
                        path.display(),
                        err
                    );
                }
                Config::builder()
                    .add_source(environment())
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {}, then env-only error: {}",
                            err, env_err
                        ))
                    })?
            }
        };

        match settings.get::<StrataConfig>("migration") {
            Ok(config) => Ok(config),
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StrataConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.migrations_dir, PathBuf::from("migrations"));
        assert_eq!(config.functions_dir, PathBuf::from("functions"));
        assert_eq!(config.date_format, DEFAULT_DATE_FORMAT);
        assert_eq!(config.lock_timeout_seconds, 60);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[migration]
migrations_dir = "db/migrations"
date_format = "%Y/%Y-%m-%d_%H%M%S"
lock_timeout_seconds = 5
"#,
        )
        .unwrap();

        let config = StrataConfig::load_from(&path).unwrap();
        assert_eq!(config.migrations_dir, PathBuf::from("db/migrations"));
        assert_eq!(config.date_format, "%Y/%Y-%m-%d_%H%M%S");
        assert_eq!(config.lock_timeout_seconds, 5);
        assert_eq!(config.functions_dir, PathBuf::from("functions"));
        assert_eq!(config.queries_dir, None);
    }
}
