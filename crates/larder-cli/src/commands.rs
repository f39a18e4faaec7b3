use anyhow::{Context, Result};
use larder_common::{MigrationDefinition, MigrationRecord};
use larder_config::{AppConfig, Backend};
use larder_db::{
    MigrationBackend, MigrationRunner, MigrationStore, PsqlClient, RunOptions, RunReport,
    SqliteDatabase, builtin, load_dir,
};
use serde::Serialize;
use tracing::info;

/// The configured migration set: a directory of `*.sql` files, or the
/// built-in food-delivery schema and seed.
pub fn definitions(config: &AppConfig) -> Result<Vec<MigrationDefinition>> {
    match &config.migrations.dir {
        Some(dir) => load_dir(dir)
            .with_context(|| format!("failed to load migrations from {}", dir.display())),
        None => Ok(builtin::food_delivery()),
    }
}

pub fn open_backend(config: &AppConfig) -> Result<Box<dyn MigrationBackend>> {
    let table = &config.migrations.table;
    let backend: Box<dyn MigrationBackend> = match config.database.backend {
        Backend::Sqlite => {
            let path = &config.database.path;
            Box::new(
                SqliteDatabase::open(path, table)
                    .with_context(|| format!("failed to open {}", path.display()))?,
            )
        }
        Backend::Postgres => Box::new(PsqlClient::new(
            config.database.psql.clone(),
            config.database.url.clone(),
            table,
        )?),
    };
    info!(backend = %config.database.backend, table = %table, "migration backend ready");
    Ok(backend)
}

pub fn migrate(
    backend: &dyn MigrationBackend,
    definitions: &[MigrationDefinition],
    options: RunOptions,
) -> Result<RunReport> {
    let report = MigrationRunner::on(backend)
        .with_options(options)
        .run(definitions)?;

    for id in &report.skipped {
        println!("  already applied  {id}");
    }
    for id in &report.applied {
        println!("  applied          {id}");
    }
    for id in &report.pending {
        println!("  pending          {id}");
    }

    if options.dry_run {
        println!(
            "dry run: {} pending, {} already applied",
            report.pending.len(),
            report.skipped.len()
        );
    } else {
        println!(
            "{} applied, {} already applied, {} statements executed",
            report.applied.len(),
            report.skipped.len(),
            report.statements_executed
        );
    }
    Ok(report)
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<String>,
}

pub fn status(
    backend: &dyn MigrationBackend,
    definitions: &[MigrationDefinition],
) -> Result<Status> {
    let runner = MigrationRunner::on(backend);
    let pending = runner
        .pending(definitions)?
        .into_iter()
        .map(|d| d.identifier.clone())
        .collect();
    let applied = backend
        .applied()
        .context("failed to read migration records")?;
    Ok(Status { applied, pending })
}

pub fn print_status(status: &Status, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    if status.applied.is_empty() {
        println!("no migrations applied");
    }
    for record in &status.applied {
        println!(
            "  applied  {}  {}",
            record.applied_at.format("%Y-%m-%d %H:%M:%S UTC"),
            record.identifier
        );
    }
    for id in &status.pending {
        println!("  pending  {id}");
    }
    Ok(())
}

pub fn list(definitions: &[MigrationDefinition]) {
    if definitions.is_empty() {
        println!("no migrations configured");
        return;
    }
    let width = definitions
        .iter()
        .map(|d| d.identifier.len())
        .max()
        .unwrap_or(0);
    for definition in definitions {
        let count = definition.statement_count();
        println!(
            "  {:<width$}  {count} statement{}",
            definition.identifier,
            if count == 1 { "" } else { "s" }
        );
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn sqlite_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.backend = Backend::Sqlite;
        config.database.path = dir.join("food.db");
        config
    }

    #[test]
    fn builtin_set_is_the_default() {
        let defs = definitions(&AppConfig::default()).unwrap();
        assert_eq!(defs, builtin::food_delivery());
    }

    #[test]
    fn missing_migrations_dir_is_reported() {
        let mut config = AppConfig::default();
        config.migrations.dir = Some(PathBuf::from("/no/such/larder/migrations"));
        let err = definitions(&config).unwrap_err();
        assert!(format!("{err:#}").contains("failed to load migrations"));
    }

    #[test]
    fn migrate_then_status_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = sqlite_config(dir.path());
        let defs = definitions(&config).unwrap();
        let backend = open_backend(&config).unwrap();

        let before = status(backend.as_ref(), &defs).unwrap();
        assert!(before.applied.is_empty());
        assert_eq!(before.pending, vec![builtin::SCHEMA_ID, builtin::SEED_ID]);

        let report = migrate(backend.as_ref(), &defs, RunOptions::default()).unwrap();
        assert_eq!(report.applied.len(), 2);

        let after = status(backend.as_ref(), &defs).unwrap();
        assert!(after.pending.is_empty());
        assert_eq!(after.applied.len(), 2);

        let json = serde_json::to_value(&after).unwrap();
        assert_eq!(json["applied"][0]["identifier"], builtin::SCHEMA_ID);
    }

    #[test]
    fn dry_run_leaves_database_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config = sqlite_config(dir.path());
        let defs = definitions(&config).unwrap();
        let backend = open_backend(&config).unwrap();

        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let report = migrate(backend.as_ref(), &defs, options).unwrap();
        assert_eq!(report.pending.len(), 2);
        assert!(backend.applied().unwrap().is_empty());
    }

    #[test]
    fn failure_message_names_identifier_and_statement() {
        let dir = tempfile::tempdir().unwrap();
        let config = sqlite_config(dir.path());
        let backend = open_backend(&config).unwrap();
        let defs = vec![MigrationDefinition::new(
            "2024-05-01_broken",
            ["CREATE TABLE ok (id INTEGER)", "INSERT INTO nowhere VALUES (1)"],
        )];

        let err = migrate(backend.as_ref(), &defs, RunOptions::default()).unwrap_err();
        let message = format!("{err:#}");
        assert!(
            message.starts_with("migration '2024-05-01_broken' failed at statement 2: "),
            "{message}"
        );
    }
}
