use std::collections::HashSet;

use larder_common::MigrationDefinition;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::executor::{ExecutionError, StatementExecutor};
use crate::store::MigrationStore;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// The record store could not be reached, initialized, read or written.
    #[error("migration store unavailable: {0}")]
    StoreUnavailable(larder_common::Error),

    /// `index` is 1-based. The definition stays unapplied.
    #[error("migration '{identifier}' failed at statement {index}: {error}")]
    StatementFailed {
        identifier: String,
        index: usize,
        error: ExecutionError,
    },

    #[error("migration '{identifier}' could not control its transaction: {error}")]
    TransactionFailed {
        identifier: String,
        error: ExecutionError,
    },

    #[error("migration '{0}' is listed more than once")]
    DuplicateDefinition(String),

    #[error("migration #{0} has an empty identifier")]
    EmptyIdentifier(usize),
}

impl From<MigrationError> for larder_common::Error {
    fn from(err: MigrationError) -> Self {
        larder_common::Error::Migration(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Bracket each definition and its record insert with `begin`/`commit`
    /// on the executor.
    pub atomic: bool,
    /// Report what would run without executing or recording anything.
    pub dry_run: bool,
}

/// Outcome of a successful [`MigrationRunner::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    /// Filled instead of `applied` on a dry run.
    pub pending: Vec<String>,
    pub statements_executed: usize,
}

impl RunReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.pending.is_empty()
    }
}

/// Applies not-yet-applied definitions in input order, fail-fast.
///
/// Success is remembered, failure is not: a definition that failed part way
/// is never recorded and runs again, from its first statement, next time.
pub struct MigrationRunner<'a, S: ?Sized, E: ?Sized> {
    store: &'a S,
    executor: &'a E,
    options: RunOptions,
}

impl<'a, B> MigrationRunner<'a, B, B>
where
    B: MigrationStore + StatementExecutor + ?Sized,
{
    /// Runner over a backend that is both store and executor.
    pub fn on(backend: &'a B) -> Self {
        Self::new(backend, backend)
    }
}

impl<'a, S, E> MigrationRunner<'a, S, E>
where
    S: MigrationStore + ?Sized,
    E: StatementExecutor + ?Sized,
{
    pub fn new(store: &'a S, executor: &'a E) -> Self {
        Self {
            store,
            executor,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> RunOptions {
        self.options
    }

    pub fn run(&self, definitions: &[MigrationDefinition]) -> Result<RunReport, MigrationError> {
        validate(definitions)?;
        self.store
            .ensure_initialized()
            .map_err(MigrationError::StoreUnavailable)?;

        let mut report = RunReport::default();
        for definition in definitions {
            let identifier = definition.identifier.as_str();

            if self.has_applied(identifier)? {
                debug!(identifier, "migration already applied, skipping");
                report.skipped.push(identifier.to_string());
                continue;
            }

            if self.options.dry_run {
                info!(
                    identifier,
                    statements = definition.statement_count(),
                    "migration pending (dry run)"
                );
                report.pending.push(identifier.to_string());
                continue;
            }

            info!(
                identifier,
                statements = definition.statement_count(),
                "applying migration"
            );
            if self.options.atomic {
                report.statements_executed += self.apply_atomic(definition)?;
            } else {
                report.statements_executed += self.apply(definition)?;
                self.record(identifier)?;
            }

            info!(identifier, "migration applied");
            report.applied.push(identifier.to_string());
        }

        Ok(report)
    }

    /// Definitions without a record, in input order.
    pub fn pending<'d>(
        &self,
        definitions: &'d [MigrationDefinition],
    ) -> Result<Vec<&'d MigrationDefinition>, MigrationError> {
        validate(definitions)?;
        self.store
            .ensure_initialized()
            .map_err(MigrationError::StoreUnavailable)?;

        let mut pending = Vec::new();
        for definition in definitions {
            if !self.has_applied(&definition.identifier)? {
                pending.push(definition);
            }
        }
        Ok(pending)
    }

    fn has_applied(&self, identifier: &str) -> Result<bool, MigrationError> {
        self.store
            .has_applied(identifier)
            .map_err(MigrationError::StoreUnavailable)
    }

    fn apply(&self, definition: &MigrationDefinition) -> Result<usize, MigrationError> {
        for (idx, statement) in definition.statements.iter().enumerate() {
            debug!(
                identifier = %definition.identifier,
                statement = idx + 1,
                "executing statement"
            );
            self.executor
                .execute(statement)
                .map_err(|error| MigrationError::StatementFailed {
                    identifier: definition.identifier.clone(),
                    index: idx + 1,
                    error,
                })?;
        }
        Ok(definition.statements.len())
    }

    fn record(&self, identifier: &str) -> Result<(), MigrationError> {
        let inserted = self
            .store
            .mark_applied(identifier)
            .map_err(MigrationError::StoreUnavailable)?;
        if !inserted {
            warn!(identifier, "migration was recorded concurrently by another runner");
        }
        Ok(())
    }

    /// Statements and record insert inside one `begin`/`commit` pair. The
    /// record only shares the transaction when store and executor share a
    /// connection, as [`crate::SqliteDatabase`] does.
    fn apply_atomic(&self, definition: &MigrationDefinition) -> Result<usize, MigrationError> {
        let tx_failed = |error: ExecutionError| MigrationError::TransactionFailed {
            identifier: definition.identifier.clone(),
            error,
        };

        self.executor.begin().map_err(tx_failed)?;

        let executed = match self
            .apply(definition)
            .and_then(|executed| self.record(&definition.identifier).map(|()| executed))
        {
            Ok(executed) => executed,
            Err(err) => {
                self.rollback(&definition.identifier);
                return Err(err);
            }
        };

        if let Err(error) = self.executor.commit() {
            self.rollback(&definition.identifier);
            return Err(tx_failed(error));
        }
        Ok(executed)
    }

    fn rollback(&self, identifier: &str) {
        match self.executor.rollback() {
            Ok(()) => warn!(identifier, "migration rolled back"),
            Err(e) => warn!(identifier, "rollback failed: {e}"),
        }
    }
}

fn validate(definitions: &[MigrationDefinition]) -> Result<(), MigrationError> {
    let mut seen = HashSet::with_capacity(definitions.len());
    for (idx, definition) in definitions.iter().enumerate() {
        if definition.identifier.trim().is_empty() {
            return Err(MigrationError::EmptyIdentifier(idx + 1));
        }
        if !seen.insert(definition.identifier.as_str()) {
            return Err(MigrationError::DuplicateDefinition(
                definition.identifier.clone(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use chrono::Utc;
    use larder_common::{Error, MigrationRecord, Result};

    use super::*;

    /// In-process store; `unavailable` makes every call fail and
    /// `failing_marks` fails that many `mark_applied` calls.
    #[derive(Default)]
    struct MemoryStore {
        records: RefCell<Vec<String>>,
        unavailable: bool,
        failing_marks: Cell<usize>,
    }

    impl MemoryStore {
        fn with(ids: &[&str]) -> Self {
            Self {
                records: RefCell::new(ids.iter().map(|s| s.to_string()).collect()),
                ..Self::default()
            }
        }

        fn ids(&self) -> Vec<String> {
            self.records.borrow().clone()
        }

        fn check(&self) -> Result<()> {
            if self.unavailable {
                return Err(Error::Database("connection refused".into()));
            }
            Ok(())
        }
    }

    impl MigrationStore for MemoryStore {
        fn ensure_initialized(&self) -> Result<()> {
            self.check()
        }

        fn has_applied(&self, identifier: &str) -> Result<bool> {
            self.check()?;
            Ok(self.records.borrow().iter().any(|r| r == identifier))
        }

        fn mark_applied(&self, identifier: &str) -> Result<bool> {
            self.check()?;
            if self.failing_marks.get() > 0 {
                self.failing_marks.set(self.failing_marks.get() - 1);
                return Err(Error::Database("disk I/O error".into()));
            }
            let mut records = self.records.borrow_mut();
            if records.iter().any(|r| r == identifier) {
                return Ok(false);
            }
            records.push(identifier.to_string());
            Ok(true)
        }

        fn applied(&self) -> Result<Vec<MigrationRecord>> {
            self.check()?;
            Ok(self
                .records
                .borrow()
                .iter()
                .map(|id| MigrationRecord {
                    identifier: id.clone(),
                    applied_at: Utc::now(),
                })
                .collect())
        }
    }

    /// Records every call; statements containing `fail_on` are rejected.
    #[derive(Default)]
    struct RecordingExecutor {
        calls: RefCell<Vec<String>>,
        fail_on: Option<&'static str>,
        transactional: bool,
    }

    impl RecordingExecutor {
        fn failing_on(marker: &'static str) -> Self {
            Self {
                fail_on: Some(marker),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        fn control(&self, word: &str) -> std::result::Result<(), ExecutionError> {
            if !self.transactional {
                return Err(ExecutionError::new("no transactions here"));
            }
            self.calls.borrow_mut().push(word.to_string());
            Ok(())
        }
    }

    impl StatementExecutor for RecordingExecutor {
        fn execute(&self, statement: &str) -> std::result::Result<(), ExecutionError> {
            self.calls.borrow_mut().push(statement.to_string());
            match self.fail_on {
                Some(marker) if statement.contains(marker) => Err(ExecutionError::new(
                    format!("ERROR:  syntax error at or near \"{marker}\""),
                )),
                _ => Ok(()),
            }
        }

        fn begin(&self) -> std::result::Result<(), ExecutionError> {
            self.control("BEGIN")
        }

        fn commit(&self) -> std::result::Result<(), ExecutionError> {
            self.control("COMMIT")
        }

        fn rollback(&self) -> std::result::Result<(), ExecutionError> {
            self.control("ROLLBACK")
        }
    }

    fn init_and_seed() -> Vec<MigrationDefinition> {
        vec![
            MigrationDefinition::new("init", ["CREATE TABLE t (id INT)"]),
            MigrationDefinition::new("seed", ["INSERT INTO t VALUES (1)"]),
        ]
    }

    #[test]
    fn applies_everything_on_empty_store() {
        let store = MemoryStore::default();
        let exec = RecordingExecutor::default();

        let report = MigrationRunner::new(&store, &exec)
            .run(&init_and_seed())
            .unwrap();

        assert_eq!(report.applied, vec!["init", "seed"]);
        assert!(report.skipped.is_empty());
        assert_eq!(report.statements_executed, 2);
        assert_eq!(store.ids(), vec!["init", "seed"]);
        assert_eq!(
            exec.calls(),
            vec!["CREATE TABLE t (id INT)", "INSERT INTO t VALUES (1)"]
        );
    }

    #[test]
    fn second_run_executes_nothing() {
        let store = MemoryStore::default();
        let exec = RecordingExecutor::default();
        let runner = MigrationRunner::new(&store, &exec);

        runner.run(&init_and_seed()).unwrap();
        let calls_after_first = exec.calls().len();

        let report = runner.run(&init_and_seed()).unwrap();
        assert!(report.is_noop());
        assert_eq!(report.skipped, vec!["init", "seed"]);
        assert_eq!(report.statements_executed, 0);
        assert_eq!(exec.calls().len(), calls_after_first);
        assert_eq!(store.ids(), vec!["init", "seed"]);
    }

    #[test]
    fn skips_identifier_already_in_store() {
        let store = MemoryStore::with(&["X"]);
        let exec = RecordingExecutor::default();

        let report = MigrationRunner::new(&store, &exec)
            .run(&[MigrationDefinition::new("X", ["DROP TABLE orders"])])
            .unwrap();

        assert_eq!(report.skipped, vec!["X"]);
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn only_unapplied_definitions_run() {
        let store = MemoryStore::with(&["init"]);
        let exec = RecordingExecutor::default();

        let report = MigrationRunner::new(&store, &exec)
            .run(&init_and_seed())
            .unwrap();

        assert_eq!(report.applied, vec!["seed"]);
        assert_eq!(exec.calls(), vec!["INSERT INTO t VALUES (1)"]);
    }

    #[test]
    fn failure_stops_the_definition_and_the_run() {
        let store = MemoryStore::default();
        let exec = RecordingExecutor::failing_on("s2");
        let definitions = vec![
            MigrationDefinition::new("multi", ["s1", "s2", "s3"]),
            MigrationDefinition::new("later", ["s4"]),
        ];

        let err = MigrationRunner::new(&store, &exec)
            .run(&definitions)
            .unwrap_err();

        match &err {
            MigrationError::StatementFailed {
                identifier,
                index,
                error,
            } => {
                assert_eq!(identifier, "multi");
                assert_eq!(*index, 2);
                assert_eq!(error.message(), "ERROR:  syntax error at or near \"s2\"");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "migration 'multi' failed at statement 2: ERROR:  syntax error at or near \"s2\""
        );
        // s1 ran, s3 and the later definition never did.
        assert_eq!(exec.calls(), vec!["s1", "s2"]);
        assert!(store.ids().is_empty());
    }

    #[test]
    fn failed_definition_is_retried_on_next_run() {
        let store = MemoryStore::default();
        let broken = vec![
            MigrationDefinition::new("init", ["CREATE TABLE t (id INT)"]),
            MigrationDefinition::new("seed", ["INSERT INTO t VALUES (oops)"]),
        ];

        let exec = RecordingExecutor::failing_on("oops");
        let err = MigrationRunner::new(&store, &exec).run(&broken).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::StatementFailed { ref identifier, index: 1, .. } if identifier == "seed"
        ));
        assert_eq!(store.ids(), vec!["init"]);

        let fixed_exec = RecordingExecutor::default();
        let report = MigrationRunner::new(&store, &fixed_exec)
            .run(&init_and_seed())
            .unwrap();
        assert_eq!(report.applied, vec!["seed"]);
        assert_eq!(report.skipped, vec!["init"]);
        assert_eq!(store.ids(), vec!["init", "seed"]);
    }

    #[test]
    fn unavailable_store_aborts_before_any_statement() {
        let store = MemoryStore {
            unavailable: true,
            ..MemoryStore::default()
        };
        let exec = RecordingExecutor::default();

        let err = MigrationRunner::new(&store, &exec)
            .run(&init_and_seed())
            .unwrap_err();

        assert!(matches!(err, MigrationError::StoreUnavailable(_)));
        assert!(err.to_string().contains("connection refused"));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn record_failure_stops_the_run_after_statements_ran() {
        let store = MemoryStore {
            failing_marks: Cell::new(1),
            ..MemoryStore::default()
        };
        let exec = RecordingExecutor::default();
        let runner = MigrationRunner::new(&store, &exec);

        let err = runner.run(&init_and_seed()).unwrap_err();
        assert!(matches!(err, MigrationError::StoreUnavailable(_)));
        assert!(err.to_string().contains("disk I/O error"), "{err}");
        // init's statement ran but was not recorded; seed never started.
        assert_eq!(exec.calls(), vec!["CREATE TABLE t (id INT)"]);
        assert!(store.ids().is_empty());

        let report = runner.run(&init_and_seed()).unwrap();
        assert_eq!(report.applied, vec!["init", "seed"]);
    }

    #[test]
    fn duplicate_identifiers_are_rejected_up_front() {
        let store = MemoryStore::default();
        let exec = RecordingExecutor::default();
        let definitions = vec![
            MigrationDefinition::new("init", ["a"]),
            MigrationDefinition::new("init", ["b"]),
        ];

        let err = MigrationRunner::new(&store, &exec)
            .run(&definitions)
            .unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateDefinition(ref id) if id == "init"));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn empty_identifier_is_rejected() {
        let store = MemoryStore::default();
        let exec = RecordingExecutor::default();
        let definitions = vec![
            MigrationDefinition::new("init", ["a"]),
            MigrationDefinition::new(" ", ["b"]),
        ];

        let err = MigrationRunner::new(&store, &exec)
            .run(&definitions)
            .unwrap_err();
        assert!(matches!(err, MigrationError::EmptyIdentifier(2)));
    }

    #[test]
    fn dry_run_executes_and_records_nothing() {
        let store = MemoryStore::with(&["init"]);
        let exec = RecordingExecutor::default();

        let report = MigrationRunner::new(&store, &exec)
            .with_options(RunOptions {
                dry_run: true,
                ..RunOptions::default()
            })
            .run(&init_and_seed())
            .unwrap();

        assert_eq!(report.pending, vec!["seed"]);
        assert_eq!(report.skipped, vec!["init"]);
        assert!(report.applied.is_empty());
        assert!(exec.calls().is_empty());
        assert_eq!(store.ids(), vec!["init"]);
    }

    #[test]
    fn pending_lists_unapplied_in_input_order() {
        let store = MemoryStore::with(&["b"]);
        let exec = RecordingExecutor::default();
        let definitions = vec![
            MigrationDefinition::new("a", ["1"]),
            MigrationDefinition::new("b", ["2"]),
            MigrationDefinition::new("c", ["3"]),
        ];

        let pending = MigrationRunner::new(&store, &exec)
            .pending(&definitions)
            .unwrap();
        let ids: Vec<_> = pending.iter().map(|d| d.identifier.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn atomic_mode_brackets_each_definition() {
        let store = MemoryStore::default();
        let exec = RecordingExecutor {
            transactional: true,
            ..RecordingExecutor::default()
        };

        MigrationRunner::new(&store, &exec)
            .with_options(RunOptions {
                atomic: true,
                ..RunOptions::default()
            })
            .run(&init_and_seed())
            .unwrap();

        assert_eq!(
            exec.calls(),
            vec![
                "BEGIN",
                "CREATE TABLE t (id INT)",
                "COMMIT",
                "BEGIN",
                "INSERT INTO t VALUES (1)",
                "COMMIT",
            ]
        );
    }

    #[test]
    fn atomic_failure_rolls_back_and_reports_statement() {
        let store = MemoryStore::default();
        let exec = RecordingExecutor {
            transactional: true,
            fail_on: Some("s2"),
            ..RecordingExecutor::default()
        };

        let err = MigrationRunner::new(&store, &exec)
            .with_options(RunOptions {
                atomic: true,
                ..RunOptions::default()
            })
            .run(&[MigrationDefinition::new("multi", ["s1", "s2", "s3"])])
            .unwrap_err();

        assert!(matches!(err, MigrationError::StatementFailed { index: 2, .. }));
        assert_eq!(exec.calls(), vec!["BEGIN", "s1", "s2", "ROLLBACK"]);
        assert!(store.ids().is_empty());
    }

    #[test]
    fn atomic_record_failure_rolls_back_instead_of_committing() {
        let store = MemoryStore {
            failing_marks: Cell::new(1),
            ..MemoryStore::default()
        };
        let exec = RecordingExecutor {
            transactional: true,
            ..RecordingExecutor::default()
        };

        let err = MigrationRunner::new(&store, &exec)
            .with_options(RunOptions {
                atomic: true,
                ..RunOptions::default()
            })
            .run(&init_and_seed())
            .unwrap_err();

        assert!(matches!(err, MigrationError::StoreUnavailable(_)));
        assert_eq!(
            exec.calls(),
            vec!["BEGIN", "CREATE TABLE t (id INT)", "ROLLBACK"]
        );
        assert!(store.ids().is_empty());
    }

    #[test]
    fn atomic_mode_without_transaction_support_fails_cleanly() {
        let store = MemoryStore::default();
        let exec = RecordingExecutor::default();

        let err = MigrationRunner::new(&store, &exec)
            .with_options(RunOptions {
                atomic: true,
                ..RunOptions::default()
            })
            .run(&init_and_seed())
            .unwrap_err();

        assert!(matches!(
            err,
            MigrationError::TransactionFailed { ref identifier, .. } if identifier == "init"
        ));
        assert!(exec.calls().is_empty());
        assert!(store.ids().is_empty());
    }

    #[test]
    fn migration_errors_convert_to_common_error() {
        let err: Error = MigrationError::DuplicateDefinition("x".into()).into();
        assert_eq!(
            err.to_string(),
            "migration error: migration 'x' is listed more than once"
        );
    }
}
