//! Typed configuration from environment variables.
//!
//! Loaded once at startup and handed to `SessionBuilder`. Invalid values fail
//! fast; missing values fall back to defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::Interpreters;
use crate::observability::LogLevel;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },

    #[error("cannot determine working directory: {0}")]
    WorkDir(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub project: String,
    /// Queue used when the caller does not name one.
    pub default_queue: String,
    /// Base for relative task folders and script paths.
    pub work_dir: PathBuf,
    /// Log level given to new tasks; `None` disables log capture.
    pub log_level: Option<LogLevel>,
    pub poll_timeout: Duration,
    /// Tee captured task stdout/stderr to the process streams.
    pub echo_output: bool,
    pub interpreters: Interpreters,
}

impl Default for Config {
    fn default() -> Self {
        let project = "default".to_string();
        Self {
            default_queue: default_queue_name(&project),
            project,
            work_dir: PathBuf::from("."),
            log_level: Some(LogLevel::Warn),
            poll_timeout: Duration::from_secs(1),
            echo_output: false,
            interpreters: Interpreters::default(),
        }
    }
}

pub fn default_queue_name(project: &str) -> String {
    format!("{project}-default-queue")
}

impl Config {
    /// Load configuration from `BOBBIN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|name| std::env::var(name).ok())?;
        if config.work_dir.is_relative() {
            config.work_dir = std::env::current_dir()?.join(&config.work_dir);
        }
        Ok(config)
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(project) = lookup("BOBBIN_PROJECT") {
            config.default_queue = default_queue_name(&project);
            config.project = project;
        }
        if let Some(queue) = lookup("BOBBIN_DEFAULT_QUEUE") {
            config.default_queue = queue;
        }
        if let Some(dir) = lookup("BOBBIN_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("BOBBIN_LOG_LEVEL") {
            config.log_level = match level.to_ascii_lowercase().as_str() {
                "off" | "none" => None,
                other => Some(other.parse().map_err(|_| ConfigError::Invalid {
                    var: "BOBBIN_LOG_LEVEL",
                    value: level.clone(),
                })?),
            };
        }
        if let Some(ms) = lookup("BOBBIN_POLL_TIMEOUT_MS") {
            let millis: u64 = ms.parse().map_err(|_| ConfigError::Invalid {
                var: "BOBBIN_POLL_TIMEOUT_MS",
                value: ms.clone(),
            })?;
            config.poll_timeout = Duration::from_millis(millis);
        }
        if let Some(echo) = lookup("BOBBIN_ECHO_OUTPUT") {
            config.echo_output = parse_flag(&echo).ok_or(ConfigError::Invalid {
                var: "BOBBIN_ECHO_OUTPUT",
                value: echo.clone(),
            })?;
        }

        Ok(config)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
