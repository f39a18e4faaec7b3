use std::path::{Path, PathBuf};

use larder_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const FILE_NAMES: &[&str] = &["larder.yml", "larder.yaml", "larder.toml"];

/// Locates and parses the larder config file, then layers environment
/// overrides on top.
///
/// Precedence, lowest first: built-in defaults, config file, environment
/// (including a `.env` file in the working directory). Command line flags are
/// applied by the caller after `load` returns.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    explicit: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use exactly this file. A missing file is an error rather than a
    /// fallback to defaults.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            explicit: Some(path.into()),
        }
    }

    /// Files considered when no explicit path was given, in search order.
    pub fn candidates(&self) -> Vec<PathBuf> {
        if let Some(path) = &self.explicit {
            return vec![path.clone()];
        }

        let mut paths: Vec<PathBuf> = FILE_NAMES.iter().map(PathBuf::from).collect();
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("larder").join("config.yml"));
        }
        paths
    }

    pub fn load(&self) -> Result<AppConfig> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("loaded environment from {}", path.display());
        }

        let mut config = self.load_file_or_default()?;
        apply_env(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn load_file_or_default(&self) -> Result<AppConfig> {
        if let Some(path) = &self.explicit {
            if !path.exists() {
                return Err(Error::NotFound(format!(
                    "config file {}",
                    path.display()
                )));
            }
            return load_file(path);
        }

        match self.candidates().into_iter().find(|p| p.is_file()) {
            Some(path) => load_file(&path),
            None => {
                debug!("no config file found, using defaults");
                Ok(AppConfig::default())
            }
        }
    }
}

/// Parse a config file, choosing the format by extension.
pub fn load_file(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let config = match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display())))?,
        "toml" => toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display())))?,
        other => {
            return Err(Error::Config(format!(
                "unsupported config extension: {other}"
            )));
        }
    };

    info!("config loaded from {}", path.display());
    Ok(config)
}

/// Apply environment overrides. `lookup` is `std::env::var` in production.
pub fn apply_env<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = get("DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(backend) = get("LARDER_DB_BACKEND") {
        config.database.backend = backend.parse()?;
    }
    if let Some(path) = get("LARDER_DB_PATH") {
        config.database.path = PathBuf::from(path);
    }
    if let Some(dir) = get("LARDER_MIGRATIONS_DIR") {
        config.migrations.dir = Some(PathBuf::from(dir));
    }
    if let Some(level) = get("LARDER_LOG_LEVEL") {
        config.log.level = level;
    }
    Ok(())
}
