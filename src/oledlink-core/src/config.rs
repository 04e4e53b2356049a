use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    #[serde(default = "default_stdout_enabled")]
    pub stdout: bool,
    #[serde(default = "crate::logging::default_log_file")]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            stdout: default_stdout_enabled(),
            file_name: crate::logging::default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// How the worker's message channel is wired.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// A Unix socket on the worker's fd 0; frames flow both ways.
    #[default]
    Ipc,
    /// A plain pipe on the worker's stdin; parent to worker only.
    Stdio,
}

impl ChannelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelMode::Ipc => "ipc",
            ChannelMode::Stdio => "stdio",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Leave the worker stopped after it exits.
    #[default]
    Never,
    /// Restart after a non-zero exit code or a fatal signal.
    OnFailure,
    /// Restart after any exit that `stop` did not request.
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default)]
    pub policy: RestartPolicy,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::default(),
            max_restarts: default_max_restarts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RestartConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// The display renderer process and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_executable")]
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub channel: ChannelMode,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub restart: RestartConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            args: Vec::new(),
            working_dir: None,
            channel: ChannelMode::default(),
            send_timeout_ms: default_send_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            channel_capacity: default_channel_capacity(),
            env: BTreeMap::new(),
            restart: RestartConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("worker.executable must not be empty")]
    MissingExecutable,
    #[error("worker.{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("worker.restart.initial_backoff_ms ({initial}) exceeds max_backoff_ms ({max})")]
    BackoffRange { initial: u64, max: u64 },
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load a config file that must exist, e.g. one named on the command line.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }

        let worker = &self.worker;
        if worker.executable.as_os_str().is_empty() {
            return Err(ValidationError::MissingExecutable);
        }
        if worker.send_timeout_ms == 0 {
            return Err(ValidationError::ZeroValue {
                field: "send_timeout_ms",
            });
        }
        if worker.channel_capacity == 0 {
            return Err(ValidationError::ZeroValue {
                field: "channel_capacity",
            });
        }
        let restart = &worker.restart;
        if restart.initial_backoff_ms > restart.max_backoff_ms {
            return Err(ValidationError::BackoffRange {
                initial: restart.initial_backoff_ms,
                max: restart.max_backoff_ms,
            });
        }
        Ok(())
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_stdout_enabled() -> bool {
    true
}

fn default_executable() -> PathBuf {
    PathBuf::from("/usr/bin/python3")
}

fn default_send_timeout_ms() -> u64 {
    500
}

fn default_stop_grace_ms() -> u64 {
    2_000
}

fn default_channel_capacity() -> usize {
    64
}

fn default_max_restarts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.max_log_files, 7);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.worker.channel, ChannelMode::Ipc);
        assert_eq!(config.worker.restart.policy, RestartPolicy::Never);
    }

    #[test]
    fn invalid_version_rejected() {
        let mut config = Config::default();
        config.config_version = CURRENT_CONFIG_VERSION + 1;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ValidationError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn worker_section_parses() {
        let config: Config = toml::from_str(
            r#"
            [worker]
            executable = "/opt/oled/render"
            args = ["--fps", "20"]
            channel = "stdio"
            env = { PYTHONUNBUFFERED = "1" }

            [worker.restart]
            policy = "on_failure"
            max_restarts = 2
            "#,
        )
        .expect("config should parse");

        assert!(config.validate().is_ok());
        assert_eq!(config.worker.executable, PathBuf::from("/opt/oled/render"));
        assert_eq!(config.worker.args, vec!["--fps", "20"]);
        assert_eq!(config.worker.channel, ChannelMode::Stdio);
        assert_eq!(config.worker.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert_eq!(config.worker.restart.policy, RestartPolicy::OnFailure);
        assert_eq!(config.worker.restart.max_restarts, 2);
        assert_eq!(config.worker.send_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn inverted_backoff_rejected() {
        let mut config = Config::default();
        config.worker.restart.initial_backoff_ms = 10_000;
        config.worker.restart.max_backoff_ms = 100;
        assert_eq!(
            config.validate(),
            Err(ValidationError::BackoffRange {
                initial: 10_000,
                max: 100
            })
        );
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut config = Config::default();
        config.worker.channel_capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::ZeroValue {
                field: "channel_capacity"
            })
        );
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "worker = 3").unwrap();

        let err = Config::load_from(&path).expect_err("bad config should fail");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = AppDirs::rooted_at(dir.path());
        let config = Config::load_or_default(&dirs).expect("defaults");
        assert_eq!(config.config_version, CURRENT_CONFIG_VERSION);
    }

    #[test]
    fn rendered_config_reparses() {
        let rendered = Config::default().to_toml().expect("render");
        let parsed: Config = toml::from_str(&rendered).expect("reparse");
        assert_eq!(parsed.worker.stop_grace_ms, 2_000);
    }
}
