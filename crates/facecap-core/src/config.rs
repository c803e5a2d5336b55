use crate::stage::StageSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Application configuration, loaded from a TOML file with `FACECAP_*` overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory session folders are created under.
    pub save_root: PathBuf,
    /// Frames saved per session.
    pub quota: u32,
    /// Delay between display-loop polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Saved files are named `<file_prefix><n>.jpg`.
    pub file_prefix: String,
    /// Open the window fullscreen.
    pub fullscreen: bool,
    #[serde(rename = "stage")]
    pub stages: Vec<StageSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            save_root: PathBuf::from("."),
            quota: 10,
            poll_interval_ms: 10,
            file_prefix: "captured_image_".to_string(),
            fullscreen: true,
            stages: vec![
                StageSpec {
                    name: "encode".to_string(),
                    label: "Execute Script 1".to_string(),
                    command: vec!["python".to_string(), "script1.py".to_string()],
                    close_after: false,
                },
                StageSpec {
                    name: "recognize".to_string(),
                    label: "Execute Script 2".to_string(),
                    command: vec!["python".to_string(), "script2.py".to_string()],
                    close_after: true,
                },
            ],
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Lookup order: `explicit`, then `FACECAP_CONFIG`, then
    /// [`default_config_path`]. An explicitly named file must exist; a missing
    /// default file yields the built-in defaults. Environment overrides are
    /// applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let named = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("FACECAP_CONFIG").ok().map(PathBuf::from));

        let mut config = match named {
            Some(path) => Self::from_file(&path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    tracing::debug!(path = %path.display(), "no config file, using defaults");
                    Self::default()
                }
            }
        };

        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config");
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `FACECAP_*` overrides read through `lookup`. Unparseable values are ignored.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(device) = lookup("FACECAP_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        if let Some(root) = lookup("FACECAP_SAVE_ROOT") {
            self.save_root = PathBuf::from(root);
        }
        self.quota = parsed(&lookup, "FACECAP_QUOTA").unwrap_or(self.quota);
        self.poll_interval_ms =
            parsed(&lookup, "FACECAP_POLL_INTERVAL_MS").unwrap_or(self.poll_interval_ms);
        if let Some(v) = lookup("FACECAP_FULLSCREEN") {
            self.fullscreen = v != "0";
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quota == 0 {
            return Err(ConfigError::Invalid("quota must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
            if stage.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stage {} has an empty command",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        crate::stage::find_stage(&self.stages, name)
    }
}

/// `$XDG_CONFIG_HOME/facecap/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("facecap")
        .join("config.toml")
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.parse().ok())
}
