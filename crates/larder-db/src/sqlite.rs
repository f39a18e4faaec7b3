use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use larder_common::validation::validate_table_name;
use larder_common::{Error, MigrationRecord, Result};
use rusqlite::{Connection, params};
use tracing::info;

use crate::executor::{ExecutionError, StatementExecutor};
use crate::store::MigrationStore;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database acting as both migration store and statement executor.
///
/// The connection sits behind a mutex that is held for one call at a time,
/// so the record insert shares the connection (and any open transaction)
/// with the statements it records.
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteDatabase {
    pub fn open(db_path: &Path, table: &str) -> Result<Self> {
        info!("opening sqlite database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        // Switching to WAL needs a lock another process may be holding.
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::from_connection(conn, table)
    }

    pub fn in_memory(table: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::from_connection(conn, table)
    }

    fn from_connection(conn: Connection, table: &str) -> Result<Self> {
        validate_table_name(table)?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("sqlite connection lock poisoned".into()))
    }

    /// Row count of `table`, which must be a plain identifier.
    pub fn count_rows(&self, table: &str) -> Result<i64> {
        validate_table_name(table)?;
        let conn = self.connection()?;
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .map_err(|e| Error::Database(format!("failed to count rows in {table}: {e}")))
    }

    fn control(&self, sql: &str) -> std::result::Result<(), ExecutionError> {
        let conn = self
            .connection()
            .map_err(|e| ExecutionError::new(e.to_string()))?;
        conn.execute_batch(sql)
            .map_err(|e| ExecutionError::new(e.to_string()))
    }
}

impl MigrationStore for SqliteDatabase {
    fn ensure_initialized(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                identifier TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
            self.table
        ))
        .map_err(|e| Error::Database(format!("failed to create {}: {e}", self.table)))?;
        Ok(())
    }

    fn has_applied(&self, identifier: &str) -> Result<bool> {
        let conn = self.connection()?;
        conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE identifier = ?1)",
                self.table
            ),
            params![identifier],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to look up {identifier}: {e}")))
    }

    fn mark_applied(&self, identifier: &str) -> Result<bool> {
        let applied_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.connection()?;
        let inserted = conn
            .execute(
                &format!(
                    "INSERT INTO {} (identifier, applied_at) VALUES (?1, ?2)
                     ON CONFLICT(identifier) DO NOTHING",
                    self.table
                ),
                params![identifier, applied_at],
            )
            .map_err(|e| Error::Database(format!("failed to record {identifier}: {e}")))?;
        Ok(inserted == 1)
    }

    fn applied(&self) -> Result<Vec<MigrationRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT identifier, applied_at FROM {} ORDER BY applied_at, rowid",
                self.table
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| Error::Database(format!("failed to query records: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let (identifier, applied_at) =
                row.map_err(|e| Error::Database(format!("failed to read record row: {e}")))?;
            records.push(MigrationRecord {
                applied_at: parse_datetime(&applied_at)?,
                identifier,
            });
        }
        Ok(records)
    }
}

impl StatementExecutor for SqliteDatabase {
    fn execute(&self, statement: &str) -> std::result::Result<(), ExecutionError> {
        self.control(statement)
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

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // datetime('now') format, for rows written by hand
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .map_err(|e| Error::Database(format!("invalid applied_at {s:?}: {e}")))
}
