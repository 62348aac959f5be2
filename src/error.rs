//! Error types for rostovvpn-rs.
//!
//! This module defines the [`enum@Error`] enum representing every failure the
//! configuration pipeline and the tunnel-service control plane can report.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io                  ◄── File/socket I/O failures
//!   ├── Config              ◄── Invalid application configuration or options
//!   ├── ConfigBuild         ◄── Input that cannot be synthesized (overlay expansion, bad base document)
//!   ├── Validation          ◄── Finished document rejected by validation
//!   ├── ServiceUnreachable  ◄── Tunnel service control port not listening
//!   ├── ElevationFailed     ◄── No privilege-escalation candidate succeeded
//!   ├── Rpc                 ◄── Control call failed after connecting
//!   ├── Json                ◄── Document (de)serialization failures
//!   ├── Warp                ◄── WARP registration or identity store failures
//!   ├── Engine              ◄── External engine could not be started/stopped
//!   ├── Timeout             ◄── A bounded wait expired
//!   └── Cancelled           ◄── Tunnel activation overtaken by a deactivation
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Recovered locally | Surfaced | Exit code |
//! |-------|-------------------|----------|-----------|
//! | [`Io`](Error::Io) | No | Yes | 1 |
//! | [`Config`](Error::Config) | No | Yes | 2 |
//! | [`ConfigBuild`](Error::ConfigBuild) | No | Yes, no partial document | 2 |
//! | [`Validation`](Error::Validation) | No | Yes, no partial document | 2 |
//! | [`ServiceUnreachable`](Error::ServiceUnreachable) | Yes, by installing the service | Only if install fails | 1 |
//! | [`ElevationFailed`](Error::ElevationFailed) | No | Yes, needs user action | 3 |
//! | [`Rpc`](Error::Rpc) | One forced exit + reinstall, then backoff retries | After retries | 1 |
//! | [`Json`](Error::Json) | No | Yes | 2 |
//! | [`Warp`](Error::Warp) | No | Yes | 1 |
//! | [`Engine`](Error::Engine) | No | Yes | 3 |
//! | [`Timeout`](Error::Timeout) | No | Yes | 1 |
//! | [`Cancelled`](Error::Cancelled) | No | To the activation's awaiter | 1 |
//!
//! Network-rule cleanup errors never reach this type: they are reported
//! through [`crate::diagnostics`] instead.
//!
//! # Example
//!
//! ```rust
//! use rostovvpn_rs::{Error, Options, Result};
//!
//! fn load(json: &str) -> Result<Options> {
//!     let options = Options::from_json_str(json)?;
//!     options.validate()?;
//!     Ok(options)
//! }
//!
//! match load("{\"mixed-port\": 0}") {
//!     Err(Error::Config(msg)) => assert!(msg.contains("mixed_port")),
//!     other => panic!("unexpected: {:?}", other),
//! }
//! ```
//!
//! # See Also
//!
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`Error::exit_code`] - CLI exit-code mapping

use thiserror::Error;

/// Errors that can occur during rostovvpn-rs operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during file or socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Application configuration or options are invalid.
    ///
    /// Fix the configuration file, settings document or command-line
    /// arguments. Not recoverable without user intervention.
    #[error("configuration error: {0}")]
    Config(String),

    /// The input could not be turned into a configuration document.
    ///
    /// Raised for malformed base documents and for WARP overlay markers
    /// that cannot be expanded. Synthesis is aborted and no partial
    /// document is returned.
    #[error("config build error: {0}")]
    ConfigBuild(String),

    /// The finished document failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// The tunnel service control endpoint is not listening.
    ///
    /// # Recovery
    ///
    /// The control plane handles this itself by installing and launching
    /// the service with elevated privileges.
    #[error("tunnel service unreachable: {0}")]
    ServiceUnreachable(String),

    /// Every privilege-escalation candidate failed.
    ///
    /// Carries the last candidate's error. The user has to grant admin
    /// rights or install the service manually.
    #[error("failed to acquire admin rights: {0}")]
    ElevationFailed(String),

    /// A control call failed after the connection was established.
    #[error("RPC failure: {0}")]
    Rpc(String),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WARP registration or identity persistence failed.
    #[error("WARP error: {0}")]
    Warp(String),

    /// The external engine could not be started, stopped or restarted.
    #[error("engine error: {0}")]
    Engine(String),

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A tunnel activation was abandoned because a deactivation came in
    /// while it was still running.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Maps the error onto the CLI exit codes.
    ///
    /// | Code | Meaning |
    /// |------|---------|
    /// | 1 | Operational failure |
    /// | 2 | Usage or validation error |
    /// | 3 | Fatal error |
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) | Error::ConfigBuild(_) | Error::Validation(_) | Error::Json(_) => 2,
            Error::ElevationFailed(_) | Error::Engine(_) => 3,
            Error::Io(_)
            | Error::ServiceUnreachable(_)
            | Error::Rpc(_)
            | Error::Warp(_)
            | Error::Timeout(_)
            | Error::Cancelled(_) => 1,
        }
    }

    /// Returns true if the control plane may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_) | Error::Io(_) | Error::Timeout(_) | Error::ServiceUnreachable(_)
        )
    }
}

/// Result type alias for rostovvpn-rs operations.
pub type Result<T> = std::result::Result<T, Error>;
