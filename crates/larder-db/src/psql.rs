//! PostgreSQL backend that drives the `psql` command line client.
//!
//! Every call is a fresh `psql` process, so there is no session state to
//! share between calls and transactions are not supported. Statements are
//! passed with `-c`, which bypasses psql variable interpolation and sends the
//! body to the server unchanged. Record-table queries are fed on stdin so the
//! identifier can travel as a psql variable and be quoted by psql itself.
//!
//! A password embedded in a `postgres://` URL is taken out of the URL and
//! handed to psql as `PGPASSWORD`, so it never appears in the process
//! arguments. Keyword/value connection strings (`host=... password=...`) are
//! passed through as given; use `~/.pgpass` or `PGPASSWORD` with those.

use std::io::Write;
use std::process::{Command, Output, Stdio};

use chrono::{DateTime, Utc};
use larder_common::validation::validate_table_name;
use larder_common::{Error, MigrationRecord, Result};
use tracing::{debug, warn};
use url::Url;

use crate::executor::{ExecutionError, StatementExecutor};
use crate::store::MigrationStore;

/// Field separator for record listings (ASCII unit separator).
const FIELD_SEP: &str = "\u{1f}";

pub struct PsqlClient {
    program: String,
    /// Connection target with any password removed.
    target: String,
    password: Option<String>,
    table: String,
}

impl PsqlClient {
    pub fn new(program: impl Into<String>, url: impl Into<String>, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let url = url.into();
        if url.trim().is_empty() {
            return Err(Error::Config("postgres connection string is empty".into()));
        }
        let (target, password) = split_password(&url)?;
        Ok(Self {
            program: program.into(),
            target,
            password,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-X".into(),
            "-q".into(),
            "-v".into(),
            "ON_ERROR_STOP=1".into(),
            "-d".into(),
            self.target.clone(),
        ]
    }

    fn statement_args(&self, statement: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.push("-c".into());
        args.push(statement.to_string());
        args
    }

    fn query_args(&self, identifier: Option<&str>) -> Vec<String> {
        let mut args = self.base_args();
        for arg in ["-A", "-t", "-F", FIELD_SEP] {
            args.push(arg.to_string());
        }
        if let Some(identifier) = identifier {
            args.push("-v".into());
            args.push(format!("identifier={identifier}"));
        }
        args.push("-f".into());
        args.push("-".into());
        args
    }

    fn invoke(
        &self,
        args: &[String],
        stdin: Option<&str>,
    ) -> std::result::Result<String, ExecutionError> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(password) = &self.password {
            command.env("PGPASSWORD", password);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExecutionError::new(format!("failed to run {}: {e}", self.program)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).map_err(|e| {
                ExecutionError::new(format!("failed to write to {}: {e}", self.program))
            })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ExecutionError::new(format!("failed to wait for {}: {e}", self.program)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ExecutionError::new(failure_message(&output)))
        }
    }

    fn query(&self, sql: &str, identifier: Option<&str>) -> Result<String> {
        self.invoke(&self.query_args(identifier), Some(sql))
            .map_err(|e| Error::Database(e.message().to_string()))
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                identifier TEXT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );",
            self.table
        )
    }

    fn has_applied_sql(&self) -> String {
        format!(
            "SELECT 1 FROM {} WHERE identifier = :'identifier';",
            self.table
        )
    }

    fn mark_applied_sql(&self) -> String {
        format!(
            "INSERT INTO {} (identifier) VALUES (:'identifier')
             ON CONFLICT (identifier) DO NOTHING
             RETURNING 1;",
            self.table
        )
    }

    fn applied_sql(&self) -> String {
        format!(
            "SELECT identifier,
                    to_char(applied_at AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.US\"Z\"')
             FROM {}
             ORDER BY applied_at, identifier;",
            self.table
        )
    }
}

impl StatementExecutor for PsqlClient {
    fn execute(&self, statement: &str) -> std::result::Result<(), ExecutionError> {
        debug!(bytes = statement.len(), "running statement through psql");
        self.invoke(&self.statement_args(statement), None)
            .map(|_| ())
    }
}

impl MigrationStore for PsqlClient {
    fn ensure_initialized(&self) -> Result<()> {
        self.query(&self.create_table_sql(), None).map(|_| ())
    }

    fn has_applied(&self, identifier: &str) -> Result<bool> {
        let out = self.query(&self.has_applied_sql(), Some(identifier))?;
        Ok(returned_one(&out))
    }

    fn mark_applied(&self, identifier: &str) -> Result<bool> {
        let out = self.query(&self.mark_applied_sql(), Some(identifier))?;
        Ok(returned_one(&out))
    }

    fn applied(&self) -> Result<Vec<MigrationRecord>> {
        let out = self.query(&self.applied_sql(), None)?;
        parse_records(&out)
    }
}

/// Moves the password of a `postgres://` or `postgresql://` URL out of it.
/// Anything else, or a URL the `url` crate cannot parse, is returned as is.
fn split_password(url: &str) -> Result<(String, Option<String>)> {
    if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
        return Ok((url.to_string(), None));
    }
    let mut parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("postgres url not parsed ({e}), passing it to psql unchanged");
            return Ok((url.to_string(), None));
        }
    };
    let Some(encoded) = parsed.password().map(str::to_string) else {
        return Ok((url.to_string(), None));
    };
    let password = percent_decode(&encoded)?;
    parsed
        .set_password(None)
        .map_err(|()| Error::Config("cannot remove password from postgres url".into()))?;
    Ok((parsed.to_string(), Some(password)))
}

/// Decodes `%XX` escapes as libpq does for URL components.
fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(byte) = s
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out)
        .map_err(|_| Error::Config("postgres url password is not valid UTF-8".into()))
}

fn returned_one(stdout: &str) -> bool {
    stdout.lines().any(|line| line.trim() == "1")
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        format!("psql exited with {}", output.status)
    } else {
        stderr.to_string()
    }
}

fn parse_records(stdout: &str) -> Result<Vec<MigrationRecord>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (identifier, applied_at) = line
                .split_once(FIELD_SEP)
                .ok_or_else(|| Error::Database(format!("malformed record row: {line:?}")))?;
            let applied_at = DateTime::parse_from_rfc3339(applied_at.trim())
                .map_err(|e| Error::Database(format!("invalid applied_at {applied_at:?}: {e}")))?
                .with_timezone(&Utc);
            Ok(MigrationRecord {
                identifier: identifier.to_string(),
                applied_at,
            })
        })
        .collect()
}
