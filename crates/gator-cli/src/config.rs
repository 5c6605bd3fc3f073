use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use gator::{ConfigurationError, Repolist, RepositoryEntry};
use serde::{Deserialize, Serialize};

pub const ENV_STORAGE_BACKEND: &str = "GATOR_STORAGE_BACKEND";
pub const ENV_STORAGE_ROOT: &str = "GATOR_STORAGE_ROOT";
pub const ENV_CANONICAL_PATH: &str = "GATOR_CANONICAL_PATH";

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub canonical: CanonicalConfig,
    #[serde(default)]
    pub repositories: Vec<RepositoryEntry>,
}

/// Where pulled records are kept.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Disk,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disk" => Ok(Self::Disk),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown storage backend `{other}` (expected disk or memory)"),
        }
    }
}

/// Where the canonical document store lives.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CanonicalConfig {
    pub path: Option<PathBuf>,
}

impl AppConfig {
    /// Override settings from environment variables, looked up via `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(backend) = var(ENV_STORAGE_BACKEND) {
            self.storage.backend = backend
                .parse()
                .with_context(|| format!("invalid {ENV_STORAGE_BACKEND}"))?;
        }
        if let Some(root) = var(ENV_STORAGE_ROOT) {
            self.storage.root = Some(PathBuf::from(root));
        }
        if let Some(path) = var(ENV_CANONICAL_PATH) {
            self.canonical.path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// The validated repolist.
    pub fn repolist(&self) -> Result<Repolist, ConfigurationError> {
        Repolist::from_entries(self.repositories.clone())
    }

    pub fn storage_root(&self) -> Result<PathBuf> {
        match &self.storage.root {
            Some(root) => Ok(root.clone()),
            None => Ok(data_dir()?.join("records")),
        }
    }

    pub fn canonical_path(&self) -> Result<PathBuf> {
        match &self.canonical.path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("canonical.db")),
        }
    }
}

fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("could not determine data directory")?;
    Ok(base.join("gator"))
}

/// Config file path: `~/.config/gator/gator.toml`
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("gator").join("gator.toml"))
}

/// Parse a config file's contents.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigurationError> {
    toml::from_str(contents).map_err(|e| ConfigurationError::Parse(e.to_string()))
}

/// Load config from `explicit` or the default location.
///
/// A missing default file yields defaults. A missing explicit file, or any
/// file that does not parse, is an error.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(AppConfig::default()),
        },
    };

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Disk);
        assert!(config.storage.root.is_none());
        assert!(config.canonical.path.is_none());
        assert!(config.repolist().unwrap().is_empty());
    }

    #[test]
    fn parse_full_config_from_toml() {
        let toml_str = r#"
[storage]
backend = "memory"
root = "/data/records"

[canonical]
path = "/data/canonical.db"

[[repositories]]
id = "ttb-2023"
type = "timetable"
source = "https://api.easi.utoronto.ca/ttb/getPageableCourses"
[repositories.params]
sessions = ["20239", "20241"]

[[repositories]]
type = "json-file"
source = "buildings.json"
enabled = false
"#;
        let config = parse_config(toml_str).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage_root().unwrap(), PathBuf::from("/data/records"));
        assert_eq!(
            config.canonical_path().unwrap(),
            PathBuf::from("/data/canonical.db")
        );

        let repolist = config.repolist().unwrap();
        assert_eq!(repolist.len(), 2);
        assert_eq!(repolist.repositories()[0].id, "ttb-2023");
        assert_eq!(repolist.repositories()[1].id, "json-file:buildings.json");
        assert_eq!(repolist.enabled().count(), 1);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let result = parse_config(
            r#"
[storage]
backend = "s3"
"#,
        );
        assert!(matches!(result, Err(ConfigurationError::Parse(_))));
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(parse_config("[[repositories]\ntype =").is_err());
    }

    #[test]
    fn duplicate_repository_ids_fail_repolist() {
        let config = parse_config(
            r#"
[[repositories]]
type = "timetable"
source = "a"

[[repositories]]
type = "timetable"
source = "a"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.repolist(),
            Err(ConfigurationError::DuplicateId(_))
        ));
    }

    #[test]
    fn env_overrides_file_settings() {
        let mut config = parse_config(
            r#"
[storage]
root = "/from/file"
"#,
        )
        .unwrap();
        let env = HashMap::from([
            (ENV_STORAGE_BACKEND, "MEMORY"),
            (ENV_STORAGE_ROOT, "/from/env"),
            (ENV_CANONICAL_PATH, "/env/canonical.db"),
        ]);

        config
            .apply_env(|name| env.get(name).map(|v| (*v).to_owned()))
            .unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage_root().unwrap(), PathBuf::from("/from/env"));
        assert_eq!(
            config.canonical_path().unwrap(),
            PathBuf::from("/env/canonical.db")
        );
    }

    #[test]
    fn invalid_env_backend_is_an_error() {
        let mut config = AppConfig::default();
        let result = config.apply_env(|name| {
            (name == ENV_STORAGE_BACKEND).then(|| "tape".to_owned())
        });
        assert!(result.is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gator.toml");
        std::fs::write(&path, "[canonical]\npath = \"x.db\"\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.canonical.path, Some(PathBuf::from("x.db")));
    }
}
