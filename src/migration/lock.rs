//! Cross-process migration lock
//!
//! The engines hold a single connection and never lock anything themselves.
//! Callers that may run concurrently (deploy jobs, several replicas starting at
//! once) take a session-level PostgreSQL advisory lock around `migrate`.

use crate::executor::{SqlExecutor, StrataError};
use crate::migration::MigrationError;
use std::time::{Duration, Instant};

/// Advisory lock key shared by every `strata` process.
pub const MIGRATION_LOCK_KEY: i64 = 0x5354_5241_5441;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Holds the advisory lock until dropped
pub struct MigrationLockGuard<'a> {
    executor: &'a dyn SqlExecutor,
    key: i64,
}

impl<'a> MigrationLockGuard<'a> {
    /// Acquire the migration lock, polling until `timeout_seconds` elapse
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockTimeout` when another session keeps the
    /// lock for longer than the timeout, or `MigrationError::Database` if the
    /// lock query itself fails.
    pub fn acquire(executor: &'a dyn SqlExecutor, timeout_seconds: u64) -> Result<Self, MigrationError> {
        Self::acquire_key(executor, MIGRATION_LOCK_KEY, timeout_seconds)
    }

    pub fn acquire_key(
        executor: &'a dyn SqlExecutor,
        key: i64,
        timeout_seconds: u64,
    ) -> Result<Self, MigrationError> {
        let start = Instant::now();
        let timeout = Duration::from_secs(timeout_seconds);

        loop {
            if try_lock(executor, key)? {
                log::debug!("Migration lock {key} acquired");
                return Ok(Self { executor, key });
            }
            if start.elapsed() >= timeout {
                return Err(MigrationError::LockTimeout(format!(
                    "Failed to acquire migration lock within {timeout_seconds} seconds. \
                     Another process may be running migrations; check pg_locks for advisory lock {key}"
                )));
            }
            log::debug!("Migration lock {key} is held by another session, waiting");
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        // nothing can be propagated from drop
        if let Err(e) = self
            .executor
            .query_one("SELECT pg_advisory_unlock($1)", &[&self.key])
        {
            log::warn!("Failed to release migration lock {}: {e}", self.key);
        }
    }
}

fn try_lock(executor: &dyn SqlExecutor, key: i64) -> Result<bool, MigrationError> {
    let row = executor.query_one("SELECT pg_try_advisory_lock($1)", &[&key])?;
    let acquired: bool = row
        .try_get(0)
        .map_err(|e| StrataError::ParseError(format!("pg_try_advisory_lock: {e}")))?;
    Ok(acquired)
}
