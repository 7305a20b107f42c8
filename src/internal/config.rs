use crate::internal::policy::policy::PolicyConfig;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_CONFIG_PATH: &str = "config/kernel.json";
pub const CONFIG_ENV: &str = "NUCLEUS_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub policy: PolicyConfig,
    pub trace_path: PathBuf,
    pub units_dir: PathBuf,
    pub tool_timeout_ms: u64,
    pub confirmation_timeout_ms: u64,
    pub sign_traces: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            trace_path: PathBuf::from("traces/nucleus.jsonl"),
            units_dir: PathBuf::from("units"),
            tool_timeout_ms: 30_000,
            confirmation_timeout_ms: 300_000,
            sign_traces: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read kernel config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid kernel config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl KernelConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Reads `$NUCLEUS_CONFIG` or `config/kernel.json`, falling back to defaults.
    pub fn load() -> Self {
        let path = env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        match Self::from_path(Path::new(&path)) {
            Ok(config) => {
                tracing::debug!(path = %path, "kernel config loaded");
                config
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "using default kernel config");
                Self::default()
            }
        }
    }
}
