use std::path::{Path, PathBuf};

use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load e2e config: {0}")]
    Extract(#[from] Box<figment::Error>),
    #[error("failed to read repo list '{path}': {source}")]
    RepoListRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse repo list '{path}': {source}")]
    RepoListParse {
        path: String,
        source: serde_yaml::Error,
    },
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings shared by the pod helpers of an e2e run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct E2eConfig {
    /// OS distro of the nodes under test (`debian`, `ubuntu`, `windows`, ...).
    #[serde(default)]
    pub node_os_distro: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// YAML file overriding the registries images are pulled from.
    #[serde(default)]
    pub repo_list: Option<PathBuf>,
}

impl Default for E2eConfig {
    fn default() -> Self {
        Self {
            node_os_distro: None,
            log_level: default_log_level(),
            repo_list: None,
        }
    }
}

impl E2eConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("E2E_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Extract(Box::new(e)))
    }

    /// An unset distro never matches.
    pub fn node_os_distro_is(&self, distro: &str) -> bool {
        self.node_os_distro.as_deref() == Some(distro)
    }
}
