use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named, ordered list of statements applied at most once to a database.
///
/// Definitions are built by the caller and never persisted; only the
/// identifier survives, as a [`MigrationRecord`], once every statement
/// has succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDefinition {
    pub identifier: String,
    pub statements: Vec<String>,
}

impl MigrationDefinition {
    pub fn new<I, S>(identifier: impl Into<String>, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identifier: identifier.into(),
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }
}

/// Durable proof that a migration identifier has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub identifier: String,
    pub applied_at: DateTime<Utc>,
}
