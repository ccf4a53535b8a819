//! Host configuration for Tether.
//!
//! ```toml
//! [store]
//! backend = "file"            # or "sqlite"
//! path = "${GROUP_CONTAINER}/promises.json"
//!
//! [registry]
//! stale_after_secs = 604800
//! ```
//!
//! Every section is optional. `TETHER_STORE_BACKEND` and `TETHER_STORE_PATH`
//! override the file; hosts may override both again (e.g. CLI flags).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt};

use serde::Deserialize;
use thiserror::Error;

pub const STORE_BACKEND_ENV: &str = "TETHER_STORE_BACKEND";
pub const STORE_PATH_ENV: &str = "TETHER_STORE_PATH";

#[derive(Debug, Default, Deserialize)]
pub struct TetherConfig {
    pub store: Option<StoreConfig>,
    pub registry: Option<RegistryConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unknown store backend {0:?} (expected \"file\" or \"sqlite\")")]
    UnknownBackend(String),
}

impl ConfigError {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
            ConfigError::UnknownBackend(_) => None,
        }
    }
}

/// Which persistence substrate holds the registry snapshot.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    File,
    Sqlite,
}

impl StoreBackend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Sqlite => "sqlite",
        }
    }

    const fn default_file_name(self) -> &'static str {
        match self {
            Self::File => "promises.json",
            Self::Sqlite => "promises.db",
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

/// Persistence substrate settings.
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Snapshot location. `${VAR}` references are expanded.
    pub path: Option<String>,
}

/// Registry housekeeping settings.
#[derive(Debug, Default, Deserialize)]
pub struct RegistryConfig {
    /// Age after which `prune` drops entries. Unset means never.
    pub stale_after_secs: Option<u64>,
}

/// Store location after file settings and environment overrides are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStore {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(end_rel) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + 2 + end_rel];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &rest[start + 2 + end_rel + 1..];
    }

    out.push_str(rest);
    out
}

impl TetherConfig {
    /// Load `~/.tether/config.toml`. A missing file is `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Resolve the store from this config, then `TETHER_STORE_*` overrides,
    /// then the default location under `~/.tether/`.
    pub fn resolve_store(&self) -> Result<ResolvedStore, ConfigError> {
        let backend = match env::var(STORE_BACKEND_ENV) {
            Ok(value) if !value.trim().is_empty() => value.parse()?,
            _ => self.store.as_ref().map(|s| s.backend).unwrap_or_default(),
        };

        let configured = env::var(STORE_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.store.as_ref().and_then(|s| s.path.clone()));

        let path = match configured {
            Some(raw) => PathBuf::from(expand_env_vars(&raw)),
            None => default_store_path(backend),
        };

        Ok(ResolvedStore { backend, path })
    }

    #[must_use]
    pub fn stale_after(&self) -> Option<Duration> {
        self.registry
            .as_ref()
            .and_then(|r| r.stale_after_secs)
            .map(Duration::from_secs)
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
}

/// `~/.tether/promises.{json,db}`, or `./.tether/...` without a home directory.
#[must_use]
pub fn default_store_path(backend: StoreBackend) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
        .join(backend.default_file_name())
}
