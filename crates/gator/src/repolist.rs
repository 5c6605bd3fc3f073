use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::record::KEY_SEPARATOR;
use crate::registry::{FetcherRegistry, ResolveError};

/// Errors that make a repolist unusable. Loading is all-or-nothing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse repolist: {0}")]
    Parse(String),

    #[error("repository #{index} has an empty `{field}`")]
    EmptyField { index: usize, field: &'static str },

    #[error("duplicate repository id: {0}")]
    DuplicateId(String),

    #[error("repository id `{0}` contains `__`, which separates ids from record keys; set an explicit `id`")]
    SeparatorInId(String),
}

/// A repository entry as written in configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepositoryEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub dataset_type: String,
    pub source: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// One monitored data source, validated and immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryDescriptor {
    pub id: String,
    pub dataset_type: String,
    pub source: String,
    pub enabled: bool,
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl RepositoryDescriptor {
    /// Build an enabled descriptor with no params and the default id.
    pub fn new(dataset_type: impl Into<String>, source: impl Into<String>) -> Self {
        let dataset_type = dataset_type.into();
        let source = source.into();
        Self {
            id: default_id(&dataset_type, &source),
            dataset_type,
            source,
            enabled: true,
            params: serde_json::Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn param(&self, name: &str) -> Option<&serde_json::Value> {
        self.params.get(name)
    }

    /// A string param. Present-but-wrong-typed values are an error.
    pub fn param_str(&self, name: &str) -> Result<Option<&str>, ResolveError> {
        match self.params.get(name) {
            None => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(ResolveError::invalid_params(
                self,
                format!("`{name}` must be a string"),
            )),
        }
    }

    /// A non-negative integer param.
    pub fn param_u64(&self, name: &str) -> Result<Option<u64>, ResolveError> {
        match self.params.get(name) {
            None => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| {
                ResolveError::invalid_params(self, format!("`{name}` must be a positive integer"))
            }),
        }
    }

    /// A list-of-strings param.
    pub fn param_str_list(&self, name: &str) -> Result<Option<Vec<String>>, ResolveError> {
        let Some(value) = self.params.get(name) else {
            return Ok(None);
        };
        let invalid =
            || ResolveError::invalid_params(self, format!("`{name}` must be a list of strings"));

        value
            .as_array()
            .ok_or_else(invalid)?
            .iter()
            .map(|item| item.as_str().map(str::to_owned).ok_or_else(invalid))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

fn default_id(dataset_type: &str, source: &str) -> String {
    format!("{dataset_type}:{source}")
}

/// Record keys are stored as `{id}__{key}`, so an id containing the
/// separator could alias another repository's keys.
fn check_id(id: &str) -> Result<(), ConfigurationError> {
    if id.contains(KEY_SEPARATOR) {
        return Err(ConfigurationError::SeparatorInId(id.to_owned()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RepolistFile {
    #[serde(default)]
    repositories: Vec<RepositoryEntry>,
}

/// The ordered list of monitored repositories.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Repolist {
    repositories: Vec<RepositoryDescriptor>,
}

impl Repolist {
    /// Parse a TOML repolist (`[[repositories]]` tables).
    pub fn load(source: &str) -> Result<Self, ConfigurationError> {
        let file: RepolistFile =
            toml::from_str(source).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        Self::from_entries(file.repositories)
    }

    /// Read and parse a TOML repolist file.
    pub fn load_path(path: &Path) -> Result<Self, ConfigurationError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::load(&contents)
    }

    /// Validate configured entries, in order.
    pub fn from_entries(entries: Vec<RepositoryEntry>) -> Result<Self, ConfigurationError> {
        let mut seen = HashSet::new();
        let mut repositories = Vec::with_capacity(entries.len());

        for (index, entry) in entries.into_iter().enumerate() {
            if entry.dataset_type.trim().is_empty() {
                return Err(ConfigurationError::EmptyField {
                    index,
                    field: "type",
                });
            }
            if entry.source.trim().is_empty() {
                return Err(ConfigurationError::EmptyField {
                    index,
                    field: "source",
                });
            }

            let id = match entry.id {
                Some(id) if id.trim().is_empty() => {
                    return Err(ConfigurationError::EmptyField { index, field: "id" });
                }
                Some(id) => id,
                None => default_id(&entry.dataset_type, &entry.source),
            };

            check_id(&id)?;
            if !seen.insert(id.clone()) {
                return Err(ConfigurationError::DuplicateId(id));
            }

            repositories.push(RepositoryDescriptor {
                id,
                dataset_type: entry.dataset_type,
                source: entry.source,
                enabled: entry.enabled,
                params: entry.params,
            });
        }

        Ok(Self { repositories })
    }

    pub fn from_descriptors(
        descriptors: Vec<RepositoryDescriptor>,
    ) -> Result<Self, ConfigurationError> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            check_id(&descriptor.id)?;
            if !seen.insert(descriptor.id.as_str()) {
                return Err(ConfigurationError::DuplicateId(descriptor.id.clone()));
            }
        }
        Ok(Self {
            repositories: descriptors,
        })
    }

    /// All descriptors, including disabled ones, in configuration order.
    pub fn repositories(&self) -> &[RepositoryDescriptor] {
        &self.repositories
    }

    pub fn enabled(&self) -> impl Iterator<Item = &RepositoryDescriptor> {
        self.repositories.iter().filter(|r| r.enabled)
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    /// Enabled descriptors that cannot be resolved against the registry.
    pub fn unresolved(&self, registry: &FetcherRegistry) -> Vec<(String, ResolveError)> {
        self.enabled()
            .filter_map(|descriptor| {
                registry
                    .resolve(descriptor)
                    .err()
                    .map(|e| (descriptor.id.clone(), e))
            })
            .collect()
    }
}
