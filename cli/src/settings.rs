use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ferret_lsp::ClientConfig;
use serde::Deserialize;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub client: ClientConfig,
    pub watcher: WatcherSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl WatcherSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Replace `${VAR}` references with the variable's value (empty if unset).
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if !var.is_empty() {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

impl Settings {
    /// Load settings.
    ///
    /// An explicitly named file must exist and parse. The default file is
    /// optional: when missing, unreadable or invalid the stock settings are
    /// used.
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        if let Some(path) = explicit {
            return Self::read(path).map(Self::expanded);
        }

        let Some(path) = Self::path() else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }

        match Self::read(&path) {
            Ok(settings) => Ok(settings.expanded()),
            Err(err) => {
                tracing::warn!("{err}; using default settings");
                Ok(Self::default())
            }
        }
    }

    pub fn path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ferret").join("config.toml"))
    }

    fn read(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn expanded(mut self) -> Self {
        let server_path = self.client.server_path.to_string_lossy().into_owned();
        self.client.server_path = PathBuf::from(expand_env_vars(&server_path));
        for arg in &mut self.client.args {
            *arg = expand_env_vars(arg);
        }
        self
    }
}
