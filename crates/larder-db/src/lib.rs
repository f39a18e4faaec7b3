//! Idempotent migration runner.
//!
//! A [`MigrationRunner`] applies an ordered list of
//! [`MigrationDefinition`](larder_common::MigrationDefinition)s through a
//! [`StatementExecutor`], consulting and updating a [`MigrationStore`] so that
//! repeated runs converge on the same state. Two backends are provided:
//! [`SqliteDatabase`] (rusqlite) and [`PsqlClient`] (the `psql` client).

pub mod builtin;
pub mod executor;
pub mod psql;
pub mod runner;
pub mod source;
pub mod sqlite;
pub mod store;

pub use executor::{ExecutionError, StatementExecutor};
pub use psql::PsqlClient;
pub use runner::{MigrationError, MigrationRunner, RunOptions, RunReport};
pub use source::{load_dir, split_statements};
pub use sqlite::SqliteDatabase;
pub use store::MigrationStore;

/// A backend that is both record store and statement executor.
pub trait MigrationBackend: MigrationStore + StatementExecutor {}

impl<T: MigrationStore + StatementExecutor + ?Sized> MigrationBackend for T {}
