//! Configuration management for the workspace runtime.
//!
//! Handles:
//! - Command-line argument parsing
//! - Config home resolution (flag, environment, platform default)
//! - Location of the user settings file

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the config home directory
pub const CONFIG_HOME_ENV: &str = "EDITOR_WORKSPACE_CONFIG_HOME";

/// File name of the user settings file, relative to the config home
pub const CONFIG_FILE_NAME: &str = "settings.json";

/// Command-line arguments for the workspace runtime
#[derive(Debug, Default, Parser)]
#[command(name = "editor-workspace")]
#[command(about = "Workspace runtime driven by a remote editor over RPC")]
#[command(version)]
pub struct Args {
    /// Directory holding user settings and data files
    #[arg(long, help = "Config home directory (overrides EDITOR_WORKSPACE_CONFIG_HOME)")]
    pub config_home: Option<PathBuf>,

    /// Log level for the runtime
    #[arg(
        long,
        default_value = "info",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    pub log_level: String,

    /// Default timeout for host command execution
    #[arg(long, help = "Default command timeout in milliseconds")]
    pub timeout_ms: Option<u64>,
}

/// Combined configuration from all sources
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for settings and data files
    pub config_home: PathBuf,
    /// Log level
    pub log_level: String,
    /// Timeout applied to `execute_command` when the caller gives none
    pub command_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_home: default_config_home(),
            log_level: "info".to_string(),
            command_timeout: None,
        }
    }
}

impl Config {
    /// Create configuration from command-line arguments and environment
    pub fn from_args_and_env() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    /// Create configuration from explicit arguments (useful for testing)
    pub fn from_args(args: Args) -> Result<Self> {
        let config_home = match args.config_home {
            Some(dir) => dir,
            None => std::env::var_os(CONFIG_HOME_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(default_config_home),
        };

        let log_level = if args.log_level.is_empty() {
            "info".to_string()
        } else {
            args.log_level
        };

        Ok(Config {
            config_home,
            log_level,
            command_timeout: args.timeout_ms.map(Duration::from_millis),
        })
    }

    /// Path of the user settings file
    pub fn user_config_file(&self) -> PathBuf {
        self.config_home.join(CONFIG_FILE_NAME)
    }

    /// Directory for runtime data such as most-recently-used lists
    pub fn data_dir(&self) -> PathBuf {
        self.config_home.join("data")
    }
}

fn default_config_home() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("editor-workspace")
}
