//! On-disk configuration: the repository list and the default
//! directories.
//!
//! Repositories live in a small YAML file under the user's config
//! directory; a missing file means the default configuration. The
//! inventory root and backend cache get standard per-user data and
//! cache directories unless overridden.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONFIG_FILE: &str = "repositories.yaml";

/// One configured repository backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryEntry {
    /// Short human name, e.g. "corporate".
    pub name: String,

    /// Manifest uri, the backend's identity.
    pub uri: String,
}

/// The repository configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub repositories: Vec<RepositoryEntry>,
}

/// Loads, mutates and saves the repository configuration.
pub struct ConfigStore {
    config: RepositoryConfig,
    config_path: PathBuf,
}

impl ConfigStore {
    /// Load from the default per-user location.
    pub fn load() -> Result<Self> {
        Self::load_from_path(config_dir()?.join(CONFIG_FILE))
    }

    /// Load from a specific path; a missing file yields the default
    /// (empty) configuration.
    pub fn load_from_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| Error::io(&config_path, e))?;
            serde_yaml_ng::from_str(&content).map_err(|e| {
                Error::Config(format!("cannot parse {}: {e}", config_path.display()))
            })?
        } else {
            RepositoryConfig::default()
        };

        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(&self.config)
            .map_err(|e| Error::Config(format!("cannot serialize configuration: {e}")))?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(&self.config_path, content).map_err(|e| Error::io(&self.config_path, e))
    }

    pub fn repositories(&self) -> &[RepositoryEntry] {
        &self.config.repositories
    }

    pub fn get(&self, name: &str) -> Option<&RepositoryEntry> {
        self.config.repositories.iter().find(|r| r.name == name)
    }

    /// Adds a repository; names and uris must both be unused.
    pub fn add(&mut self, name: &str, uri: &str) -> Result<()> {
        if !uri.starts_with("http://") && !uri.starts_with("https://") {
            return Err(Error::Config(format!(
                "repository uri must be http(s), got '{uri}'"
            )));
        }
        if self.config.repositories.iter().any(|r| r.name == name) {
            return Err(Error::Config(format!(
                "repository '{name}' already exists"
            )));
        }
        if self.config.repositories.iter().any(|r| r.uri == uri) {
            return Err(Error::DuplicateRepository {
                uri: uri.to_string(),
            });
        }
        self.config.repositories.push(RepositoryEntry {
            name: name.to_string(),
            uri: uri.to_string(),
        });
        Ok(())
    }

    /// Removes the repository under `name`.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let before = self.config.repositories.len();
        self.config.repositories.retain(|r| r.name != name);
        if self.config.repositories.len() == before {
            return Err(Error::Config(format!("repository '{name}' not found")));
        }
        Ok(())
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "dukebox", "dukebox")
}

/// Per-user configuration directory, created on first use.
pub fn config_dir() -> Result<PathBuf> {
    let dir = project_dirs()
        .map(|dirs| dirs.config_dir().to_path_buf())
        .or_else(|| dirs::config_dir().map(|d| d.join("dukebox")))
        .ok_or_else(|| Error::Config("cannot determine config directory".into()))?;
    std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    Ok(dir)
}

/// Default inventory root, created on first use.
pub fn inventory_dir() -> Result<PathBuf> {
    let dir = project_dirs()
        .map(|dirs| dirs.data_dir().join("inventory"))
        .or_else(|| dirs::data_dir().map(|d| d.join("dukebox").join("inventory")))
        .ok_or_else(|| Error::Config("cannot determine data directory".into()))?;
    std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    Ok(dir)
}

/// Default backend cache directory, created on first use.
pub fn cache_dir() -> Result<PathBuf> {
    let dir = project_dirs()
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .or_else(|| dirs::cache_dir().map(|d| d.join("dukebox")))
        .ok_or_else(|| Error::Config("cannot determine cache directory".into()))?;
    std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    Ok(dir)
}
