//! External command seam.
//!
//! Privilege escalation, kernel network rules and OS service registration
//! all shell out to system tools (`pkexec`, `ip`, `nft`, `systemctl`,
//! `networksetup`, ...). Every such call goes through [`CommandRunner`] so
//! the logic above it can be exercised against a recording fake.
//!
//! # What This Module Does NOT Do
//!
//! - No shell interpretation: arguments are passed as an argv vector
//! - No retries: callers decide whether a failure matters

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Host operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    /// Linux desktop or server.
    Linux,
    /// macOS.
    MacOs,
    /// Windows.
    Windows,
    /// Anything else (mobile hosts included).
    Other,
}

impl HostOs {
    /// The OS this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            HostOs::Linux
        } else if cfg!(target_os = "macos") {
            HostOs::MacOs
        } else if cfg!(target_os = "windows") {
            HostOs::Windows
        } else {
            HostOs::Other
        }
    }
}

/// Runs external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` to completion and returns its stdout.
    ///
    /// A spawn failure or a non-zero exit status is an error whose message
    /// carries stderr.
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;

    /// Starts `program` without waiting for it.
    fn spawn(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<()>;

    /// Returns true if `program` is an absolute path or found on `PATH`.
    fn resolvable(&self, program: &str) -> bool;
}

/// [`CommandRunner`] backed by real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!(program, ?args, "running command");
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{}: {}", program, e))))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Rpc(format!(
                "{} {}: {} ({})",
                program,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<()> {
        debug!(program, ?args, "spawning command");
        let mut cmd = std::process::Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.spawn()?;
        Ok(())
    }

    fn resolvable(&self, program: &str) -> bool {
        Path::new(program).is_absolute() || which::which(program).is_ok()
    }
}

/// Converts string slices into an owned argv.
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
