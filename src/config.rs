/// Configuration file: which tools to run and how sessions shut down.
///
/// Every table and field is optional. The file is resolved into
/// [`SessionOptions`] before any session is spawned.
use crate::geometry::WindowSize;
use crate::session::SessionOptions;
use crate::shutdown::{DEFAULT_CLOSE_SIGNAL, DEFAULT_CLOSE_TIMEOUT};
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration loaded from ptyexec.toml.
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ExecConfig {
    pub launcher: LauncherConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LauncherConfig {
    pub container_tool: String,
    pub recorder_tool: String,
    pub recording_dir: Option<PathBuf>,
    pub initial_cols: Option<u16>,
    pub initial_rows: Option<u16>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Signal name as understood by `kill -l`, with or without the `SIG` prefix.
    pub close_signal: String,
    /// Seconds to wait before each kill signal. Negative waits forever.
    pub close_timeout_secs: f64,
    /// Give up closing after this many kill signals. Must be at least 1.
    pub max_kill_signals: Option<u32>,
}

// --- Default implementations ---

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            container_tool: "docker".to_string(),
            recorder_tool: "asciinema".to_string(),
            recording_dir: None,
            initial_cols: None,
            initial_rows: None,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            close_signal: DEFAULT_CLOSE_SIGNAL.as_str().to_string(),
            close_timeout_secs: DEFAULT_CLOSE_TIMEOUT.as_secs_f64(),
            max_kill_signals: None,
        }
    }
}

/// Errors from reading or interpreting the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value for {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl ExecConfig {
    /// Load config from `path`. With `required == false` a missing file yields defaults.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config = Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), ?config, "loaded config");
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve into the options a session is spawned with.
    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        let close_signal = parse_signal(&self.shutdown.close_signal)?;

        let timeout = self.shutdown.close_timeout_secs;
        let close_timeout = if timeout < 0.0 {
            None
        } else {
            let duration =
                Duration::try_from_secs_f64(timeout).map_err(|e| ConfigError::Invalid {
                    field: "shutdown.close_timeout_secs",
                    reason: format!("{}: {}", timeout, e),
                })?;
            Some(duration)
        };

        let initial_size = match (self.launcher.initial_cols, self.launcher.initial_rows) {
            (Some(cols), Some(rows)) => Some(WindowSize::new(cols, rows)),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Invalid {
                    field: "launcher.initial_cols/initial_rows",
                    reason: "both or neither must be set".to_string(),
                })
            }
        };

        if self.launcher.container_tool.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "launcher.container_tool",
                reason: "must not be empty".to_string(),
            });
        }

        if self.shutdown.max_kill_signals == Some(0) {
            return Err(ConfigError::Invalid {
                field: "shutdown.max_kill_signals",
                reason: "must be at least 1, or left out to keep killing".to_string(),
            });
        }

        Ok(SessionOptions {
            container_tool: self.launcher.container_tool.clone(),
            recorder_tool: self.launcher.recorder_tool.clone(),
            recording_dir: self.launcher.recording_dir.clone(),
            initial_size,
            close_signal,
            close_timeout,
            kill_retry_limit: self.shutdown.max_kill_signals,
        })
    }
}

/// Accepts `SIGTERM`, `TERM` or `term`.
fn parse_signal(name: &str) -> Result<Signal, ConfigError> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).map_err(|_| ConfigError::Invalid {
        field: "shutdown.close_signal",
        reason: format!("unknown signal {:?}", name),
    })
}
