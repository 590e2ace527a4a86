//! Configuration management for rinawarp.
//!
//! The configuration file is located at `~/.rinawarp/config.toml`. Every
//! key is optional:
//!
//! ```toml
//! # Shell to launch (default: $SHELL, then /bin/sh; cmd.exe on Windows)
//! shell = "/bin/zsh"
//! shell_args = ["-l"]
//!
//! # Where the first session starts (default: current directory)
//! working_directory = "/home/me/src"
//!
//! font_size = 14
//! scrollback_lines = 1000
//!
//! [session]
//! grace_period_ms = 500
//!
//! [history]
//! limit = 100
//! ignore_sensitive = false
//! suggestion_limit = 10
//!
//! [events]
//! history_limit = 1000
//!
//! [keys]
//! prefix = "b"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::pty::TermSize;
use crate::events::bus::EVENT_HISTORY_LIMIT;
use crate::history::{HISTORY_LIMIT, SUGGESTION_LIMIT};
use crate::wm::SessionOptions;

/// Directory under the home directory holding config and logs
const APP_DIR: &str = ".rinawarp";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not determine home directory")]
    NoHome,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell command
    pub shell: Option<String>,
    pub shell_args: Vec<String>,
    /// Start directory for the first session
    pub working_directory: Option<PathBuf>,
    /// Handed to the display, which may ignore it
    pub font_size: u16,
    /// Lines of output kept per session for redraws
    pub scrollback_lines: usize,
    pub session: SessionConfig,
    pub history: HistoryConfig,
    pub events: EventsConfig,
    pub keys: KeysConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            shell_args: Vec::new(),
            working_directory: None,
            font_size: 14,
            scrollback_lines: 1000,
            session: SessionConfig::default(),
            history: HistoryConfig::default(),
            events: EventsConfig::default(),
            keys: KeysConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Milliseconds between hangup and kill when closing a session
    pub grace_period_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub limit: usize,
    /// Don't record commands that look like they carry secrets
    pub ignore_sensitive: bool,
    pub suggestion_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            limit: HISTORY_LIMIT,
            ignore_sensitive: false,
            suggestion_limit: SUGGESTION_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub history_limit: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_limit: EVENT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Prefix key, pressed with Ctrl
    pub prefix: char,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self { prefix: 'b' }
    }
}

/// A loaded configuration and whether defaults were used in its place
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
    pub defaulted: bool,
}

impl ConfigLoad {
    fn defaults() -> Self {
        Self {
            config: Config::default(),
            defaulted: true,
        }
    }
}

impl Config {
    /// `~/.rinawarp`
    pub fn app_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(APP_DIR))
            .ok_or(ConfigError::NoHome)
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> ConfigLoad {
        match Self::default_path() {
            Ok(path) => Self::load_from(&path),
            Err(e) => {
                warn!(error = %e, "using default configuration");
                ConfigLoad::defaults()
            }
        }
    }

    /// Load configuration from `path`, falling back to defaults
    ///
    /// A missing file is normal; an unreadable or malformed one is logged.
    pub fn load_from(path: &Path) -> ConfigLoad {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return ConfigLoad::defaults();
            }
            Err(source) => {
                let e = ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                };
                warn!(error = %e, "using default configuration");
                return ConfigLoad::defaults();
            }
        };

        match Self::parse(&content) {
            Ok(config) => ConfigLoad {
                config,
                defaulted: false,
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "using default configuration");
                ConfigLoad::defaults()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, content).map_err(write_err)
    }

    /// Configured shell, else `$SHELL`, else the platform default
    pub fn resolved_shell(&self) -> String {
        if let Some(shell) = self.shell.as_deref().filter(|s| !s.trim().is_empty()) {
            return shell.to_string();
        }
        if cfg!(windows) {
            return std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());
        }
        match std::env::var("SHELL") {
            Ok(shell) if !shell.is_empty() => shell,
            _ => "/bin/sh".to_string(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.session.grace_period_ms)
    }

    /// Launch options for new sessions
    pub fn session_options(&self, size: TermSize) -> SessionOptions {
        SessionOptions {
            shell: self.resolved_shell(),
            shell_args: self.shell_args.clone(),
            working_directory: self.working_directory.clone(),
            env: Vec::new(),
            size,
            grace_period: self.grace_period(),
            history_limit: self.history.limit,
            suggestion_limit: self.history.suggestion_limit,
            ignore_sensitive: self.history.ignore_sensitive,
        }
    }
}
