//! Transaction boundary shared by both engines

use crate::migration::MigrationError;
use crate::transaction::TransactionalConnection;

/// Result of one engine run
pub trait EngineRun {
    /// First per-file failure of the run, if any.
    fn error(&self) -> Option<&str>;
}

/// Commit or roll back the level opened for a run
///
/// Commits only when `dry_run` is false and the run reported no error.
pub(crate) fn finish<R: EngineRun>(
    conn: &TransactionalConnection,
    result: Result<R, MigrationError>,
    dry_run: bool,
) -> Result<R, MigrationError> {
    match result {
        Ok(run) if !dry_run && run.error().is_none() => {
            conn.commit()?;
            Ok(run)
        }
        Ok(run) => {
            if let Some(error) = run.error() {
                log::warn!("Rolled back: {error}");
            }
            conn.rollback()?;
            Ok(run)
        }
        Err(e) => {
            if let Err(rollback) = conn.rollback() {
                log::error!("Failed to roll back after error: {rollback}");
            }
            Err(e)
        }
    }
}

/// Split per-file failures, reported as a string, from infrastructure errors.
pub(crate) fn file_failure(result: Result<(), MigrationError>) -> Result<Option<String>, MigrationError> {
    match result {
        Ok(()) => Ok(None),
        Err(e) if e.is_file_failure() => Ok(Some(e.to_string())),
        Err(e) => Err(e),
    }
}

/// Roll back a level opened only to look, keeping the first error.
pub(crate) fn discard<T>(
    conn: &TransactionalConnection,
    result: Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    match conn.rollback() {
        Ok(()) => result,
        Err(e) => {
            log::error!("Failed to roll back simulation: {e}");
            match result {
                Ok(_) => Err(e.into()),
                Err(first) => Err(first),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::tests::RecordingExecutor;
    use pretty_assertions::assert_eq;

    struct Outcome(Option<String>);

    impl EngineRun for Outcome {
        fn error(&self) -> Option<&str> {
            self.0.as_deref()
        }
    }

    fn opened() -> (TransactionalConnection, std::rc::Rc<std::cell::RefCell<Vec<String>>>) {
        let (executor, log) = RecordingExecutor::new(true);
        let conn = TransactionalConnection::new(Box::new(executor));
        conn.begin().unwrap();
        (conn, log)
    }

    #[test]
    fn test_successful_run_commits() {
        let (conn, log) = opened();
        finish(&conn, Ok(Outcome(None)), false).unwrap();
        assert_eq!(log.borrow().clone(), vec!["BEGIN", "COMMIT"]);
    }

    #[test]
    fn test_dry_run_and_failures_roll_back() {
        let (conn, log) = opened();
        finish(&conn, Ok(Outcome(None)), true).unwrap();
        conn.begin().unwrap();
        let run = finish(&conn, Ok(Outcome(Some("boom".to_string()))), false).unwrap();
        assert_eq!(run.error(), Some("boom"));
        conn.begin().unwrap();
        let err = finish::<Outcome>(&conn, Err(MigrationError::InvalidFormat("x".to_string())), false);
        assert!(err.is_err());
        assert_eq!(
            log.borrow().clone(),
            vec!["BEGIN", "ROLLBACK", "BEGIN", "ROLLBACK", "BEGIN", "ROLLBACK"]
        );
        assert_eq!(conn.depth(), 0);
    }

    #[test]
    fn test_file_failures_become_error_strings() {
        let failure = file_failure(Err(MigrationError::broken("a.up.sql", "Migration is empty"))).unwrap();
        assert_eq!(failure.as_deref(), Some("Migration is empty for: a.up.sql"));

        let infrastructure = file_failure(Err(MigrationError::InvalidFormat("x".to_string())));
        assert!(infrastructure.is_err());
    }

    #[test]
    fn test_discard_always_rolls_back() {
        let (conn, log) = opened();
        assert_eq!(discard(&conn, Ok(3)).unwrap(), 3);
        assert_eq!(log.borrow().clone(), vec!["BEGIN", "ROLLBACK"]);
        assert!(matches!(discard(&conn, Ok(4)), Err(MigrationError::Transaction(_))));
    }
}
