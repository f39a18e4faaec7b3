mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use larder_config::{AppConfig, Backend, ConfigLoader};
use larder_db::RunOptions;

#[derive(Debug, Parser)]
#[command(
    name = "larder",
    version,
    about = "Apply the food-delivery schema and seed data, idempotently"
)]
struct Cli {
    /// Config file (YAML or TOML). Defaults to ./larder.yml and friends.
    #[arg(long, global = true, env = "LARDER_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection string passed to psql.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Database backend: postgres or sqlite.
    #[arg(long, global = true)]
    backend: Option<Backend>,

    /// Database file for the sqlite backend.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Directory of *.sql migrations instead of the built-in set.
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Table that records applied migrations.
    #[arg(long, global = true)]
    table: Option<String>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply every migration that has not been applied yet.
    Migrate {
        /// Wrap each migration in a transaction (sqlite backend only).
        #[arg(long)]
        atomic: bool,
        /// Show what would be applied without touching the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show applied and pending migrations.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List the configured migrations without connecting.
    List,
}

impl Cli {
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }
        if let Some(backend) = self.backend {
            config.database.backend = backend;
        }
        if let Some(path) = &self.db_path {
            config.database.path = path.clone();
        }
        if let Some(dir) = &self.migrations_dir {
            config.migrations.dir = Some(dir.clone());
        }
        if let Some(table) = &self.table {
            config.migrations.table = table.clone();
        }
        if let Command::Migrate { atomic: true, .. } = self.command {
            config.migrations.atomic = true;
        }
    }

    fn load_config(&self) -> Result<AppConfig> {
        let loader = match &self.config {
            Some(path) => ConfigLoader::with_path(path),
            None => ConfigLoader::new(),
        };
        let mut config = loader.load().context("failed to load configuration")?;
        self.apply_overrides(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    logging::init(&config.log, cli.verbose)?;

    let definitions = commands::definitions(&config)?;

    match cli.command {
        Command::Migrate { dry_run, .. } => {
            let backend = commands::open_backend(&config)?;
            let options = RunOptions {
                atomic: config.migrations.atomic,
                dry_run,
            };
            commands::migrate(backend.as_ref(), &definitions, options)?;
        }
        Command::Status { json } => {
            let backend = commands::open_backend(&config)?;
            let status = commands::status(backend.as_ref(), &definitions)?;
            commands::print_status(&status, json)?;
        }
        Command::List => commands::list(&definitions),
    }

    Ok(())
}
