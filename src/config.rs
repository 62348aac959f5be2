//! Application configuration for rostovvpn-rs.
//!
//! This module provides configuration parsing from TOML files, command-line arguments,
//! and environment variables. Configuration is applied in order: defaults → config file →
//! environment → command-line arguments, with later sources overriding earlier ones.
//!
//! The application config says *where* things live (work directory, settings
//! document, base engine config, engine binary) and how hard the control plane
//! tries. The user-facing VPN options themselves live in the settings document
//! and are parsed by [`crate::options`].
//!
//! # Configuration Flow
//!
//! ```text
//!     ┌─────────────────┐
//!     │ Config::default │ ◄── Start with sensible defaults
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌──────────────────┐
//!     │ Config file     │ ◄───│ rostovvpn.toml   │  (TOML format)
//!     │ exists?         │     │ or --config      │
//!     └────────┬────────┘     └──────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌────────────────────┐
//!     │ Apply env vars  │ ◄───│ ROSTOVVPN_WORK_DIR │
//!     │ and CLI flags   │     │ --control-port ... │
//!     └────────┬────────┘     └────────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Validate        │
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Final Config    │
//!     └─────────────────┘
//! ```
//!
//! # Configuration Sources
//!
//! | Source | Priority | Description |
//! |--------|----------|-------------|
//! | Defaults | Lowest | Built-in defaults |
//! | Config File | Medium | TOML file (`--config` or `ROSTOVVPN_CONFIG`) |
//! | Environment | High | `ROSTOVVPN_WORK_DIR` |
//! | CLI Arguments | Highest | Command-line flags override all |
//!
//! # Example Configuration File
//!
//! ```toml
//! loglevel = "notice"
//! # logfile = "/var/log/rostovvpn.log"
//! # logfile = ":syslog:"
//!
//! work_dir = "/var/lib/rostovvpn"
//! settings = "/var/lib/rostovvpn/settings.json"
//! base_config = "/var/lib/rostovvpn/profile.json"
//!
//! control_port = 18020
//! engine_path = "sing-box"
//! platform = "auto"
//!
//! install_wait_secs = 120
//! retry_limit = 5
//! ```
//!
//! # What This Module Does NOT Do
//!
//! - **Runtime reconfiguration**: Config is loaded once at startup
//! - **Options parsing**: The settings document belongs to [`crate::options`]

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::options::{load_settings, Options, Platform};
use crate::rpc::DEFAULT_CONTROL_PORT;
use crate::tunnel::ActivationTimings;

/// Log level for rostovvpn-rs output.
///
/// From most to least verbose:
/// [`Debug`](LogLevel::Debug) > [`Info`](LogLevel::Info) > [`Notice`](LogLevel::Notice) >
/// [`Warn`](LogLevel::Warn) > [`Error`](LogLevel::Error)
///
/// # Example
///
/// ```rust
/// use rostovvpn_rs::LogLevel;
///
/// let level = LogLevel::Notice;
/// assert!(level < LogLevel::Warn);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging information.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Notable events that may be of interest.
    #[default]
    Notice,
    /// Warning conditions that don't prevent operation.
    Warn,
    /// Error conditions that may impair functionality.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "notice" => Ok(LogLevel::Notice),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Platform override for synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformChoice {
    /// Use the platform this binary was built for.
    #[default]
    Auto,
    /// Desktop with a local mixed proxy.
    Desktop,
    /// Android VPN service.
    Android,
    /// iOS network extension.
    Ios,
}

impl PlatformChoice {
    /// Resolves `Auto` to the build target.
    pub fn resolve(self) -> Platform {
        match self {
            PlatformChoice::Auto => Platform::current(),
            PlatformChoice::Desktop => Platform::Desktop,
            PlatformChoice::Android => Platform::Android,
            PlatformChoice::Ios => Platform::Ios,
        }
    }
}

impl std::str::FromStr for PlatformChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(PlatformChoice::Auto),
            "desktop" => Ok(PlatformChoice::Desktop),
            "android" => Ok(PlatformChoice::Android),
            "ios" => Ok(PlatformChoice::Ios),
            _ => Err(Error::Config(format!("invalid platform: {}", s))),
        }
    }
}

/// Main configuration struct for rostovvpn-rs.
///
/// | Field | Type | Default | Description |
/// |-------|------|---------|-------------|
/// | `loglevel` | `LogLevel` | `Notice` | Log verbosity level |
/// | `logfile` | `Option<String>` | `None` | Log destination (file, `:syslog:`, or stdout) |
/// | `work_dir` | `PathBuf` | `"."` | current-config.json, stop marker, WARP identities |
/// | `settings` | `Option<PathBuf>` | `None` | Options settings document (JSON) |
/// | `base_config` | `Option<PathBuf>` | `None` | Engine config to synthesize from |
/// | `control_port` | `u16` | `18020` | Tunnel service control port |
/// | `engine_path` | `PathBuf` | `"sing-box"` | External engine binary |
/// | `platform` | `PlatformChoice` | `Auto` | Platform override |
/// | `install_wait_secs` | `u64` | `120` | How long to wait for an installed service |
/// | `retry_limit` | `u32` | `5` | Activation retries after the first failure |
///
/// # Example
///
/// ```rust
/// use rostovvpn_rs::Config;
///
/// let config = Config::default();
/// assert_eq!(config.control_port, 18020);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Log level for output.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log file path. None for stdout, ":syslog:" for syslog.
    #[serde(default)]
    pub logfile: Option<String>,
    /// Directory for runtime files.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Options settings document.
    #[serde(default)]
    pub settings: Option<PathBuf>,
    /// Engine configuration to synthesize from.
    #[serde(default)]
    pub base_config: Option<PathBuf>,
    /// Loopback port of the tunnel service control endpoint.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// External engine binary.
    #[serde(default = "default_engine_path")]
    pub engine_path: PathBuf,
    /// Platform override.
    #[serde(default)]
    pub platform: PlatformChoice,
    /// Seconds to wait for a freshly installed tunnel service.
    #[serde(default = "default_install_wait_secs")]
    pub install_wait_secs: u64,
    /// Activation retries after the first failure.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}
fn default_engine_path() -> PathBuf {
    PathBuf::from("sing-box")
}
fn default_install_wait_secs() -> u64 {
    120
}
fn default_retry_limit() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loglevel: LogLevel::default(),
            logfile: None,
            work_dir: default_work_dir(),
            settings: None,
            base_config: None,
            control_port: default_control_port(),
            engine_path: default_engine_path(),
            platform: PlatformChoice::default(),
            install_wait_secs: default_install_wait_secs(),
            retry_limit: default_retry_limit(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Config`] if the TOML is invalid.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.control_port == 0 {
            return Err(Error::Config("control_port must be non-zero".to_string()));
        }
        if self.install_wait_secs == 0 {
            return Err(Error::Config("install_wait_secs must be positive".to_string()));
        }
        if self.engine_path.as_os_str().is_empty() {
            return Err(Error::Config("engine_path must not be empty".to_string()));
        }
        Ok(())
    }

    /// Reads the settings document and applies the platform override.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the settings file cannot be read and
    /// [`Error::Config`] if the resulting options are invalid.
    pub fn load_options(&self) -> Result<Options> {
        let mut options = match &self.settings {
            Some(path) => load_settings(path)?,
            None => Options::default(),
        };
        if self.platform != PlatformChoice::Auto {
            options.platform = self.platform.resolve();
        }
        options.validate()?;
        Ok(options)
    }

    /// Path of the base engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if none is configured.
    pub fn require_base_config(&self) -> Result<&std::path::Path> {
        self.base_config
            .as_deref()
            .ok_or_else(|| Error::Config("no base_config given (use --base-config)".to_string()))
    }

    /// Control plane timings derived from this config.
    pub fn activation_timings(&self) -> ActivationTimings {
        ActivationTimings {
            install_wait: Duration::from_secs(self.install_wait_secs),
            retry_limit: self.retry_limit,
            ..ActivationTimings::default()
        }
    }
}

/// Top-level subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Synthesize the engine configuration and print or write it.
    Build {
        /// Write the document here instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Synthesize and validate without writing anything.
    Check,
    /// Start the engine and keep it running until Ctrl-C or `stop`.
    Run,
    /// Ask a running `run` process to stop.
    Stop,
    /// Privileged tunnel service.
    Tunnel {
        /// Tunnel action.
        #[command(subcommand)]
        action: TunnelCommand,
    },
    /// System proxy settings.
    Proxy {
        /// Proxy action.
        #[command(subcommand)]
        action: ProxyCommand,
    },
}

/// `tunnel` actions.
#[derive(Debug, Clone, Copy, Subcommand, PartialEq, Eq)]
pub enum TunnelCommand {
    /// Host the tunnel service in the foreground.
    Run,
    /// Start the registered service.
    Start,
    /// Stop the registered service.
    Stop,
    /// Register the service with the OS.
    Install,
    /// Remove the OS registration.
    Uninstall,
    /// Bring the tunnel up through the control plane.
    Activate,
    /// Tear the tunnel down through the control plane.
    Deactivate {
        /// Also stop a stubborn service process.
        #[arg(long)]
        force: bool,
    },
    /// Ask the service process to terminate.
    Exit,
}

/// `proxy` actions.
#[derive(Debug, Clone, Copy, Subcommand, PartialEq, Eq)]
pub enum ProxyCommand {
    /// Disable the OS system proxy.
    Off,
}

/// Command-line arguments for rostovvpn-rs.
///
/// Arguments override configuration file values. Global flags may be given
/// before or after the subcommand.
#[derive(Debug, Clone, Parser)]
#[command(name = "rostovvpn-rs")]
#[command(about = "Configuration synthesis and tunnel service control for RostovVPN")]
#[command(version)]
pub struct CliArgs {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Write default config to file and exit.
    #[arg(long = "generate-config", global = true)]
    pub generate_config: Option<PathBuf>,

    /// Path to configuration file.
    #[arg(
        long = "config",
        env = "ROSTOVVPN_CONFIG",
        default_value = "rostovvpn.toml",
        global = true
    )]
    pub config_file: PathBuf,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR).
    #[arg(long, global = true)]
    pub loglevel: Option<String>,

    /// Log to file instead of stdout (use ":syslog:" for syslog).
    #[arg(long, global = true)]
    pub logfile: Option<String>,

    /// Directory for runtime files.
    #[arg(long, env = "ROSTOVVPN_WORK_DIR", global = true)]
    pub work_dir: Option<PathBuf>,

    /// Options settings document.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Engine configuration to synthesize from.
    #[arg(long, global = true)]
    pub base_config: Option<PathBuf>,

    /// Tunnel service control port.
    #[arg(long, global = true)]
    pub control_port: Option<u16>,

    /// External engine binary.
    #[arg(long, global = true)]
    pub engine_path: Option<PathBuf>,

    /// Platform override (auto, desktop, android, ios).
    #[arg(long, global = true)]
    pub platform: Option<String>,

    /// Activation retries after the first failure.
    #[arg(long, global = true)]
    pub retry_limit: Option<u32>,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown log level or platform.
    pub fn apply_to(&self, config: &mut Config) -> Result<()> {
        if let Some(ref loglevel) = self.loglevel {
            config.loglevel = loglevel.parse()?;
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if let Some(ref work_dir) = self.work_dir {
            config.work_dir = work_dir.clone();
        }
        if let Some(ref settings) = self.settings {
            config.settings = Some(settings.clone());
        }
        if let Some(ref base_config) = self.base_config {
            config.base_config = Some(base_config.clone());
        }
        if let Some(control_port) = self.control_port {
            config.control_port = control_port;
        }
        if let Some(ref engine_path) = self.engine_path {
            config.engine_path = engine_path.clone();
        }
        if let Some(ref platform) = self.platform {
            config.platform = platform.parse()?;
        }
        if let Some(retry_limit) = self.retry_limit {
            config.retry_limit = retry_limit;
        }
        Ok(())
    }
}

/// Load configuration from file and CLI arguments.
///
/// 1. Start with defaults
/// 2. Apply config file if it exists
/// 3. Apply environment and CLI arguments (override)
///
/// # Errors
///
/// Returns [`Error::Config`] if configuration is invalid.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config)?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("rostovvpn-rs").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults_roundtrip_through_toml() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "control_port = 19000\nplatform = \"android\"").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.control_port, 19000);
        assert_eq!(config.platform, PlatformChoice::Android);
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.install_wait_secs, 120);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "control_port = 19000\nloglevel = \"error\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let args = parse(&["--config", &path, "check", "--control-port", "19500", "--loglevel", "debug"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.control_port, 19500);
        assert_eq!(config.loglevel, LogLevel::Debug);
    }

    #[test]
    fn test_bad_loglevel_rejected() {
        let args = parse(&["--config", "/nonexistent/rostovvpn.toml", "--loglevel", "chatty", "check"]);
        assert!(matches!(load_config(&args), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = Config {
            control_port: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_subcommands() {
        let args = parse(&["tunnel", "deactivate", "--force"]);
        assert!(matches!(
            args.command,
            Some(Command::Tunnel {
                action: TunnelCommand::Deactivate { force: true }
            })
        ));
        let args = parse(&["proxy", "off"]);
        assert!(matches!(
            args.command,
            Some(Command::Proxy {
                action: ProxyCommand::Off
            })
        ));
        let args = parse(&["build", "-o", "out.json"]);
        assert!(matches!(args.command, Some(Command::Build { output: Some(_) })));
    }

    #[test]
    fn test_platform_override_applies_to_options() {
        let config = Config {
            platform: PlatformChoice::Android,
            ..Config::default()
        };
        let options = config.load_options().unwrap();
        assert_eq!(options.platform, Platform::Android);
    }

    #[test]
    fn test_activation_timings() {
        let config = Config {
            install_wait_secs: 7,
            retry_limit: 2,
            ..Config::default()
        };
        let timings = config.activation_timings();
        assert_eq!(timings.install_wait, Duration::from_secs(7));
        assert_eq!(timings.retry_limit, 2);
    }

    #[test]
    fn test_loglevel_parse() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
