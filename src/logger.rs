//! Logging infrastructure for rostovvpn-rs.
//!
//! This module provides logging functionality using the tracing ecosystem.
//! It supports output to stdout, files, and syslog, with configurable log levels.
//!
//! # Overview
//!
//! - **Multiple output destinations**: stdout, file, or syslog
//! - **Configurable log levels**: From DEBUG to ERROR
//! - **Environment variable override**: `RUST_LOG` can override configured level
//! - **Non-blocking file output**: file writes go through `tracing-appender`
//!
//! # Log Levels
//!
//! | Level | Description | Use Case |
//! |-------|-------------|----------|
//! | [`Debug`](crate::LogLevel::Debug) | Low-level debugging | Development only |
//! | [`Info`](crate::LogLevel::Info) | Informational messages | Verbose operation |
//! | [`Notice`](crate::LogLevel::Notice) | Notable events | Default level |
//! | [`Warn`](crate::LogLevel::Warn) | Warning conditions | Potential issues |
//! | [`Error`](crate::LogLevel::Error) | Error conditions | Failures |
//!
//! # Example
//!
//! ```rust,no_run
//! use rostovvpn_rs::{LogLevel, logger};
//!
//! // Log to stdout (default)
//! logger::init(LogLevel::Notice, None).unwrap();
//!
//! logger::plog(LogLevel::Notice, "core started");
//! logger::plog(LogLevel::Warn, "tunnel service retry 2/5");
//! ```
//!
//! ```rust,no_run
//! use rostovvpn_rs::{LogLevel, logger};
//!
//! // Log to a file
//! logger::init(LogLevel::Debug, Some("/var/log/rostovvpn.log")).unwrap();
//!
//! // Log to syslog
//! logger::init(LogLevel::Notice, Some(":syslog:")).unwrap();
//! ```
//!
//! # What This Module Does NOT Do
//!
//! - **Log rotation**: Use external tools like logrotate
//! - **Engine logs**: The external engine writes its own log

use std::io::Write;
#[cfg(unix)]
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the logging system.
///
/// Sets up the tracing subscriber with the specified log level and output
/// destination. Subsequent calls are no-ops.
///
/// # Arguments
///
/// * `level` - The minimum log level to output
/// * `logfile` - Output destination:
///   - `None` - Log to stdout with ANSI colors
///   - `Some(":syslog:")` - Log to system syslog
///   - `Some(path)` - Append to the file at `path`
///
/// # Errors
///
/// Returns [`Error::Io`] if the log file cannot be opened.
///
/// Returns [`Error::Config`] if no syslog socket exists or the subscriber
/// cannot be set (usually means another one is already installed).
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    match logfile {
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        Some(":syslog:") => {
            init_syslog(env_filter)?;
        }
        Some(path) => {
            init_file_logger(Path::new(path), env_filter)?;
        }
    }

    LOGGER_INITIALIZED.get_or_init(|| ());
    Ok(())
}

/// `EnvFilter` directive for a configured level.
///
/// tracing has no notice level; notice maps to info.
fn filter_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info | LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

#[cfg(unix)]
fn init_syslog(env_filter: EnvFilter) -> Result<()> {
    let syslog_path = if Path::new("/dev/log").exists() {
        "/dev/log"
    } else if Path::new("/var/run/syslog").exists() {
        "/var/run/syslog"
    } else {
        return Err(Error::Config("no syslog socket found".to_string()));
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(move || SyslogWriter::connect(syslog_path))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;

    Ok(())
}

#[cfg(not(unix))]
fn init_syslog(_env_filter: EnvFilter) -> Result<()> {
    Err(Error::Config("syslog is not available on this platform".to_string()))
}

/// Datagram writer; a socket that failed to connect drops messages.
#[cfg(unix)]
struct SyslogWriter {
    socket: Option<UnixDatagram>,
}

#[cfg(unix)]
impl SyslogWriter {
    fn connect(path: &str) -> Self {
        let socket = UnixDatagram::unbound()
            .and_then(|sock| sock.connect(path).map(|()| sock))
            .ok();
        Self { socket }
    }
}

#[cfg(unix)]
impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(socket) = &self.socket {
            let msg = format!("rostovvpn: {}", String::from_utf8_lossy(buf));
            socket.send(msg.as_bytes())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_file_logger(path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;

    // flushes on drop, so it lives as long as the process
    let _ = FILE_GUARD.set(guard);
    Ok(())
}

/// Log a message at the specified level.
///
/// | LogLevel | tracing macro |
/// |----------|---------------|
/// | Debug | `debug!` |
/// | Info | `info!` |
/// | Notice | `info!` |
/// | Warn | `warn!` |
/// | Error | `error!` |
pub fn plog(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Info => info!("{}", message),
        LogLevel::Notice => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}

/// Log a formatted message at the specified level.
///
/// # Example
///
/// ```rust
/// use rostovvpn_rs::{LogLevel, plog_fmt};
///
/// plog_fmt!(LogLevel::Notice, "control port {}", 18020);
/// ```
#[macro_export]
macro_rules! plog_fmt {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::plog($level, &format!($($arg)*))
    };
}
