use thiserror::Error;

/// Failure reported by the database engine for a single statement.
///
/// The message is the engine's diagnostic text, passed through as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Executes one statement body against the target database.
///
/// Connection setup and authentication belong to the implementor. Methods
/// take `&self` so a single backend can serve as both executor and
/// [`MigrationStore`](crate::MigrationStore); implementors must not hold a
/// lock past the end of a call.
pub trait StatementExecutor {
    fn execute(&self, statement: &str) -> Result<(), ExecutionError>;

    /// Open a transaction spanning the following `execute` calls.
    ///
    /// Executors without session state (one process per statement, for
    /// example) keep the default, which refuses.
    fn begin(&self) -> Result<(), ExecutionError> {
        Err(ExecutionError::new(
            "this executor does not support transactions",
        ))
    }

    fn commit(&self) -> Result<(), ExecutionError> {
        Err(ExecutionError::new(
            "this executor does not support transactions",
        ))
    }

    fn rollback(&self) -> Result<(), ExecutionError> {
        Err(ExecutionError::new(
            "this executor does not support transactions",
        ))
    }
}
