//! # Strata
//!
//! Transactional PostgreSQL migrations for plain SQL scripts and stored
//! functions, on top of `may_postgres`.
//!
//! - [`TransactionalConnection`] nests transactions with savepoints;
//! - [`migration::SchemaMigrator`] applies `.up.sql` files and rolls back
//!   removed ones with their stored `.down.sql` text;
//! - [`migration::FunctionMigrator`] keeps one function per file in sync,
//!   retrying forward references until nothing changes;
//! - [`migration::StatusReporter`] simulates both and always rolls back.

pub mod config;
pub mod connection;
pub mod executor;
pub mod metrics;
pub mod migration;
pub mod transaction;

pub use config::StrataConfig;
pub use connection::{connect, ConnectionError};
pub use executor::{MayPostgresExecutor, SqlExecutor, StrataError};
pub use transaction::{TransactionError, TransactionalConnection};
