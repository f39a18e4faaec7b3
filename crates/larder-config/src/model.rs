use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use larder_common::validation::validate_table_name;
use larder_common::{Error, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost:5432/fooddelivery";
pub const DEFAULT_TABLE: &str = "schema_migrations";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    pub log: LogConfig,
}

/// Which engine the migrations are applied to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Postgres,
    Sqlite,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            other => Err(Error::Config(format!("unknown database backend: {other}"))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => f.write_str("postgres"),
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: Backend,
    /// Connection string handed to psql.
    pub url: String,
    /// Database file for the sqlite backend.
    pub path: PathBuf,
    /// psql binary, looked up on `PATH` unless absolute.
    pub psql: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            url: DEFAULT_DATABASE_URL.to_string(),
            path: PathBuf::from("larder.db"),
            psql: "psql".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    pub table: String,
    /// Directory of `*.sql` files. `None` selects the built-in food-delivery set.
    pub dir: Option<PathBuf>,
    pub atomic: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            dir: None,
            atomic: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        match self.database.backend {
            Backend::Postgres if self.database.url.trim().is_empty() => {
                return Err(Error::Config(
                    "database.url is required for the postgres backend".into(),
                ));
            }
            Backend::Sqlite if self.database.path.as_os_str().is_empty() => {
                return Err(Error::Config(
                    "database.path is required for the sqlite backend".into(),
                ));
            }
            _ => {}
        }

        if self.database.psql.trim().is_empty() {
            return Err(Error::Config("database.psql cannot be empty".into()));
        }

        validate_table_name(&self.migrations.table)
    }
}
