//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Invalid configuration: {0}")]
  Invalid(String),
  #[error("Failed to parse configuration: {0}")]
  Parse(#[from] serde_json::Error),
}

/// IPC client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcConfig {
  /// Control socket path (None = generated under the runtime/temp dir).
  #[serde(default)]
  pub socket_path: Option<PathBuf>,

  /// Custom MPV executable path (None = auto-detect).
  #[serde(default)]
  pub mpv_path: Option<PathBuf>,

  /// Additional MPV command-line arguments.
  #[serde(default)]
  pub mpv_args: Vec<String>,

  /// Send the shutdown command to mpv when the client closes.
  #[serde(default = "default_exit_on_close")]
  pub exit_on_close: bool,

  /// Command sent on close when `exit_on_close` is set.
  #[serde(default = "default_shutdown_command")]
  pub shutdown_command: String,

  /// How long a command waits for its response, in milliseconds.
  #[serde(default = "default_command_timeout_ms")]
  pub command_timeout_ms: u64,

  /// Connection attempts before giving up.
  #[serde(default = "default_connect_retries")]
  pub connect_retries: u32,

  /// Delay between spawning mpv and the first connection attempt.
  #[serde(default = "default_startup_delay_ms")]
  pub startup_delay_ms: u64,

  /// Upper bound on concurrently running event deliveries.
  #[serde(default = "default_dispatch_concurrency")]
  pub dispatch_concurrency: usize,
}

fn default_exit_on_close() -> bool {
  true
}

fn default_shutdown_command() -> String {
  "exit".to_string()
}

fn default_command_timeout_ms() -> u64 {
  5000
}

fn default_connect_retries() -> u32 {
  10
}

fn default_startup_delay_ms() -> u64 {
  500
}

fn default_dispatch_concurrency() -> usize {
  64
}

/// A fresh socket path, unique per call.
pub fn default_socket_path() -> PathBuf {
  #[cfg(windows)]
  {
    PathBuf::from(format!(r"\\.\pipe\mpv-ipc-{}", uuid::Uuid::new_v4()))
  }
  #[cfg(not(windows))]
  {
    let dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
    dir.join(format!("mpv-ipc-{}.sock", uuid::Uuid::new_v4()))
  }
}

impl Default for IpcConfig {
  fn default() -> Self {
    Self {
      socket_path: None,
      mpv_path: None,
      mpv_args: Vec::new(),
      exit_on_close: default_exit_on_close(),
      shutdown_command: default_shutdown_command(),
      command_timeout_ms: default_command_timeout_ms(),
      connect_retries: default_connect_retries(),
      startup_delay_ms: default_startup_delay_ms(),
      dispatch_concurrency: default_dispatch_concurrency(),
    }
  }
}

impl IpcConfig {
  /// Configuration for an mpv instance that is already listening on `path`.
  pub fn for_socket(path: impl Into<PathBuf>) -> Self {
    Self {
      socket_path: Some(path.into()),
      ..Self::default()
    }
  }

  /// Parse a JSON document and validate it.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.command_timeout_ms < 1 || self.command_timeout_ms > 600_000 {
      return Err(ConfigError::Invalid(
        "Command timeout must be between 1 and 600000 milliseconds".to_string(),
      ));
    }
    if self.connect_retries < 1 {
      return Err(ConfigError::Invalid(
        "At least one connection attempt is required".to_string(),
      ));
    }
    if self.dispatch_concurrency < 1 {
      return Err(ConfigError::Invalid(
        "Dispatch concurrency must be at least 1".to_string(),
      ));
    }
    if self.exit_on_close && self.shutdown_command.trim().is_empty() {
      return Err(ConfigError::Invalid(
        "Shutdown command cannot be empty".to_string(),
      ));
    }
    if self
      .socket_path
      .as_ref()
      .is_some_and(|path| path.as_os_str().is_empty())
    {
      return Err(ConfigError::Invalid("Socket path cannot be empty".to_string()));
    }
    Ok(())
  }

  pub fn command_timeout(&self) -> Duration {
    Duration::from_millis(self.command_timeout_ms)
  }

  pub fn startup_delay(&self) -> Duration {
    Duration::from_millis(self.startup_delay_ms)
  }

  /// The configured socket path, or a newly generated one.
  pub fn resolve_socket_path(&self) -> PathBuf {
    self.socket_path.clone().unwrap_or_else(default_socket_path)
  }
}
