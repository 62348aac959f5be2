//! Privilege escalation for tunnel-service commands.
//!
//! Installing or running the tunnel service needs administrator rights. The
//! [`SystemElevator`] walks an ordered list of escalation front ends for the
//! host OS and stops at the first one that starts (background) or completes
//! (foreground) successfully.
//!
//! # Candidate Order
//!
//! | OS | Candidates, in order |
//! |----|----------------------|
//! | Linux | `pkexec sh -c "cd ... && export LD_LIBRARY_PATH=... && exec ..."`, `sudo -A` (askpass set), `sudo`, `gksudo`, `kdesu`, `xterm -e sudo ...` |
//! | macOS | `osascript` administrator prompt, `cocoasudo`, `sudo -A` (askpass set), `sudo` |
//! | Windows | `powershell Start-Process -Verb RunAs` |
//!
//! A candidate whose program is not an absolute path and is not on `PATH`
//! is skipped. When every candidate fails the error carries the last
//! failure: `failed to acquire admin rights: <last>`.
//!
//! Inside an AppImage (`APPIMAGE` set) the AppImage path replaces the
//! executable, and only background launches are permitted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::command::{CommandRunner, HostOs};
use crate::error::{Error, Result};

/// Prompt text shown by graphical escalation front ends.
pub const PROMPT: &str = "RostovVPN needs root for tunneling.";

/// Runs an executable with administrator rights.
#[async_trait]
pub trait Elevator: Send + Sync {
    /// Runs `exe args...` elevated.
    ///
    /// With `background` the call returns once the process has started.
    async fn run(&self, exe: &Path, background: bool, args: &[String]) -> Result<()>;
}

/// [`Elevator`] that tries the host's escalation front ends in order.
pub struct SystemElevator {
    runner: Arc<dyn CommandRunner>,
    os: HostOs,
    askpass: bool,
    appimage: Option<PathBuf>,
}

impl SystemElevator {
    /// Creates an elevator configured from the process environment.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            os: HostOs::current(),
            askpass: std::env::var_os("SUDO_ASKPASS").is_some_and(|v| !v.is_empty()),
            appimage: std::env::var_os("APPIMAGE")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Overrides the detected OS.
    pub fn with_os(mut self, os: HostOs) -> Self {
        self.os = os;
        self
    }

    /// Overrides whether `SUDO_ASKPASS` is considered set.
    pub fn with_askpass(mut self, askpass: bool) -> Self {
        self.askpass = askpass;
        self
    }

    /// Overrides the AppImage path.
    pub fn with_appimage(mut self, appimage: Option<PathBuf>) -> Self {
        self.appimage = appimage;
        self
    }
}

#[async_trait]
impl Elevator for SystemElevator {
    async fn run(&self, exe: &Path, background: bool, args: &[String]) -> Result<()> {
        let cwd = exe.parent().map(Path::to_path_buf);
        let exe = match &self.appimage {
            Some(appimage) => {
                if !background {
                    return Err(Error::ElevationFailed(
                        "AppImage cannot have service".to_string(),
                    ));
                }
                appimage.clone()
            }
            None => exe.to_path_buf(),
        };

        let cwd_str = cwd
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        let exe_str = exe.to_string_lossy().into_owned();

        let mut last_err: Option<String> = None;
        for candidate in candidates(self.os, &exe_str, args, &cwd_str, self.askpass) {
            let Some((program, rest)) = candidate.split_first() else {
                continue;
            };
            if !self.runner.resolvable(program) {
                last_err = Some(format!("{}: executable file not found in $PATH", program));
                continue;
            }
            info!(program = %program, background, "requesting admin rights");
            let outcome = if background {
                self.runner.spawn(program, rest, cwd.as_deref())
            } else {
                self.runner.run(program, rest).await.map(|_| ())
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(program = %program, "escalation candidate failed: {}", e);
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(Error::ElevationFailed(
            last_err.unwrap_or_else(|| "no elevation candidate executed".to_string()),
        ))
    }
}

/// Builds the ordered escalation command lines for `os`.
pub fn candidates(
    os: HostOs,
    exe: &str,
    args: &[String],
    cwd: &str,
    askpass: bool,
) -> Vec<Vec<String>> {
    let mut full = vec![exe.to_string()];
    full.extend(args.iter().cloned());
    let direct = |prefix: &[&str]| -> Vec<String> {
        let mut line: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        line.extend(full.iter().cloned());
        line
    };

    let mut out = Vec::new();
    match os {
        HostOs::MacOs => {
            let script = format!("exec {}", shell_join(&full)).replace('"', "\\\"");
            out.push(vec![
                "/usr/bin/osascript".to_string(),
                "-e".to_string(),
                format!(
                    "do shell script \"{}\" with administrator privileges prompt \"{}\"",
                    script, PROMPT
                ),
            ]);
            out.push(direct(&["cocoasudo", &format!("--prompt={}", PROMPT)]));
            if askpass {
                out.push(direct(&["sudo", "-A"]));
            }
            out.push(direct(&["sudo"]));
        }
        HostOs::Windows => {
            let arg_list = args
                .iter()
                .map(|a| format!("'{}'", a.replace('\'', "''")))
                .collect::<Vec<_>>()
                .join(",");
            let mut command = format!(
                "Start-Process -FilePath '{}' -Verb RunAs -WorkingDirectory '{}'",
                exe.replace('\'', "''"),
                cwd.replace('\'', "''")
            );
            if !arg_list.is_empty() {
                command.push_str(&format!(" -ArgumentList {}", arg_list));
            }
            out.push(vec![
                "powershell".to_string(),
                "-NoProfile".to_string(),
                "-Command".to_string(),
                command,
            ]);
        }
        HostOs::Linux | HostOs::Other => {
            let cwd_quoted = shell_join(&[cwd.to_string()]);
            out.push(vec![
                "pkexec".to_string(),
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "cd {cwd} && export LD_LIBRARY_PATH={cwd}/lib:$LD_LIBRARY_PATH && exec {cmd}",
                    cwd = cwd_quoted,
                    cmd = shell_join(&full)
                ),
            ]);
            if askpass {
                out.push(direct(&["sudo", "-A"]));
            }
            out.push(direct(&["sudo"]));
            out.push(direct(&["gksudo"]));
            out.push(direct(&["kdesu"]));
            out.push(vec![
                "xterm".to_string(),
                "-e".to_string(),
                "sudo".to_string(),
                shell_join(&full),
            ]);
        }
    }
    out
}

/// Joins words into a single POSIX `sh -c` string.
///
/// Empty words become `''`. Words containing a single quote are wrapped
/// and each quote is written as `'\''`. Words containing whitespace,
/// backslash, double quote, `$` or a backtick are wrapped in single quotes.
pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| {
            if p.is_empty() {
                "''".to_string()
            } else if p.contains('\'') {
                format!("'{}'", p.replace('\'', "'\\''"))
            } else if p.contains([' ', '\t', '\n', '\\', '"', '$', '`']) {
                format!("'{}'", p)
            } else {
                p.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::argv;
    use crate::command::testing::RecordingRunner;

    fn programs(lines: &[Vec<String>]) -> Vec<String> {
        lines.iter().map(|c| c[0].clone()).collect()
    }

    #[test]
    fn test_shell_join_quoting() {
        assert_eq!(shell_join(&argv(&["a", "b"])), "a b");
        assert_eq!(shell_join(&argv(&[""])), "''");
        assert_eq!(shell_join(&argv(&["it's"])), "'it'\\''s'");
        assert_eq!(shell_join(&argv(&["/opt/My App/bin"])), "'/opt/My App/bin'");
        assert_eq!(shell_join(&argv(&["$HOME"])), "'$HOME'");
    }

    #[test]
    fn test_linux_candidate_order() {
        let lines = candidates(
            HostOs::Linux,
            "/opt/rv/rostovvpn-rs",
            &argv(&["tunnel", "install"]),
            "/opt/rv",
            false,
        );
        assert_eq!(
            programs(&lines),
            vec!["pkexec", "sudo", "gksudo", "kdesu", "xterm"]
        );
        assert_eq!(
            lines[0][3],
            "cd /opt/rv && export LD_LIBRARY_PATH=/opt/rv/lib:$LD_LIBRARY_PATH && exec /opt/rv/rostovvpn-rs tunnel install"
        );
        assert_eq!(lines[1], argv(&["sudo", "/opt/rv/rostovvpn-rs", "tunnel", "install"]));
    }

    #[test]
    fn test_askpass_adds_sudo_a() {
        let lines = candidates(HostOs::Linux, "/x", &[], "/", true);
        assert_eq!(lines[1], argv(&["sudo", "-A", "/x"]));
        let mac = candidates(HostOs::MacOs, "/x", &[], "/", true);
        assert_eq!(
            programs(&mac),
            vec!["/usr/bin/osascript", "cocoasudo", "sudo", "sudo"]
        );
    }

    #[test]
    fn test_macos_osascript_escapes_double_quotes() {
        let lines = candidates(HostOs::MacOs, "/A\"pp/x", &[], "/", false);
        assert!(lines[0][2].starts_with("do shell script \"exec '/A\\\"pp/x'\""));
        assert!(lines[0][2].ends_with(&format!("prompt \"{}\"", PROMPT)));
    }

    #[test]
    fn test_windows_uses_runas() {
        let lines = candidates(HostOs::Windows, "C:\\rv\\rv.exe", &argv(&["tunnel", "run"]), "C:\\rv", false);
        assert_eq!(lines.len(), 1);
        assert!(lines[0][3].contains("-Verb RunAs"));
        assert!(lines[0][3].contains("-ArgumentList 'tunnel','run'"));
    }

    #[tokio::test]
    async fn test_skips_unresolvable_and_stops_at_first_success() {
        let runner = Arc::new(RecordingRunner::new().with_missing(&["pkexec"]));
        let elevator = SystemElevator::new(runner.clone())
            .with_os(HostOs::Linux)
            .with_askpass(false)
            .with_appimage(None);
        elevator
            .run(Path::new("/opt/rv/rostovvpn-rs"), true, &argv(&["tunnel", "install"]))
            .await
            .unwrap();
        let spawned = runner.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0][0], "sudo");
    }

    #[tokio::test]
    async fn test_foreground_runs_to_completion() {
        let runner = Arc::new(RecordingRunner::new());
        let elevator = SystemElevator::new(runner.clone())
            .with_os(HostOs::Linux)
            .with_appimage(None);
        elevator
            .run(Path::new("/opt/rv/rostovvpn-rs"), false, &argv(&["tunnel", "uninstall"]))
            .await
            .unwrap();
        assert_eq!(runner.calls().len(), 1);
        assert!(runner.spawned().is_empty());
    }

    #[tokio::test]
    async fn test_all_candidates_fail_reports_last_error() {
        let runner = Arc::new(
            RecordingRunner::new()
                .with_failing(&["pkexec", "sudo", "gksudo", "kdesu"])
                .with_missing(&["xterm"]),
        );
        let elevator = SystemElevator::new(runner)
            .with_os(HostOs::Linux)
            .with_askpass(false)
            .with_appimage(None);
        let err = elevator
            .run(Path::new("/opt/rv/rostovvpn-rs"), true, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ElevationFailed(_)));
        assert!(err.to_string().starts_with("failed to acquire admin rights: xterm"));
    }

    #[tokio::test]
    async fn test_appimage_requires_background() {
        let runner = Arc::new(RecordingRunner::new());
        let elevator = SystemElevator::new(runner.clone())
            .with_os(HostOs::Linux)
            .with_appimage(Some(PathBuf::from("/home/u/RostovVPN.AppImage")));
        let err = elevator
            .run(Path::new("/tmp/.mount/rostovvpn-rs"), false, &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("AppImage cannot have service"));
        assert!(runner.calls().is_empty());

        elevator
            .run(Path::new("/tmp/.mount/rostovvpn-rs"), true, &argv(&["tunnel", "run"]))
            .await
            .unwrap();
        assert!(runner.spawned()[0][3].contains("exec /home/u/RostovVPN.AppImage tunnel run"));
    }
}
