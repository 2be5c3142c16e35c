//! Configuration parsing for the task orchestration daemon.
//!
//! Key=value format read from `.taskd/config`.
//! Precedence: CLI flags > `--config` file > `.taskd/config` > defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TaskKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid verify tier (expected name:command): {0}")]
    InvalidTier(String),
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// One named verification tier. Tiers run in configured order, cheapest
/// first, and short-circuit on the first failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub name: String,
    pub command: String,
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// Path to the AutonomyPolicy TOML file (defaults applied when unset).
    pub policy_path: Option<PathBuf>,

    /// Concurrency bound for the coordinator.
    pub max_concurrent_tasks: usize,
    /// Attempt budget applied to tasks that do not carry their own.
    pub default_max_attempts: u32,
    /// Per-kind overrides of the attempt budget.
    pub kind_max_attempts: BTreeMap<TaskKind, u32>,

    /// Command line for the execution collaborator (run via `sh -c`).
    pub collaborator_cmd: String,
    /// Timeout per collaborator invocation in seconds (0 = no timeout).
    pub collaborator_timeout_sec: u32,

    /// Verification tiers in increasing cost order.
    pub verify_tiers: Vec<TierSpec>,
    /// Timeout per tier in seconds (0 = no timeout).
    pub verify_timeout_sec: u32,

    /// HTTP control plane port.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            policy_path: None,
            max_concurrent_tasks: 3,
            default_max_attempts: 5,
            kind_max_attempts: BTreeMap::new(),
            collaborator_cmd: String::new(),
            collaborator_timeout_sec: 600,
            verify_tiers: Vec::new(),
            verify_timeout_sec: 300,
            port: 7710,
        }
    }
}

/// Default database path (`~/.local/share/taskd/taskd.db`).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    data_dir.join("taskd").join("taskd.db")
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Attempt budget for a task of the given kind.
    pub fn max_attempts_for(&self, kind: TaskKind) -> u32 {
        self.kind_max_attempts
            .get(&kind)
            .copied()
            .unwrap_or(self.default_max_attempts)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "db_path" => self.db_path = PathBuf::from(value),
            "policy_path" => {
                self.policy_path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "max_concurrent_tasks" => self.max_concurrent_tasks = Self::parse_int(key, value)?,
            "default_max_attempts" => self.default_max_attempts = Self::parse_int(key, value)?,
            "collaborator_cmd" => self.collaborator_cmd = value.to_string(),
            "collaborator_timeout_sec" => {
                self.collaborator_timeout_sec = Self::parse_int(key, value)?;
            }
            "verify_tiers" => {
                // Pipe-separated list of name:command pairs, cheapest first.
                self.verify_tiers = value
                    .split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|entry| {
                        let (name, command) = entry
                            .split_once(':')
                            .ok_or_else(|| ConfigError::InvalidTier(entry.to_string()))?;
                        Ok(TierSpec {
                            name: name.trim().to_string(),
                            command: command.trim().to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()?;
            }
            "verify_timeout_sec" => self.verify_timeout_sec = Self::parse_int(key, value)?,
            "port" => self.port = Self::parse_int(key, value)?,
            _ => {
                // Per-kind attempt budget overrides: max_attempts_<kind>.
                if let Some(kind_str) = key.strip_prefix("max_attempts_") {
                    let Some(kind) = TaskKind::parse(kind_str) else {
                        return Err(ConfigError::UnknownKey(key.to_string()));
                    };
                    let budget = Self::parse_int(key, value)?;
                    self.kind_max_attempts.insert(kind, budget);
                } else {
                    return Err(ConfigError::UnknownKey(key.to_string()));
                }
            }
        }
        Ok(())
    }
}
