//! System proxy reset (`proxy off`).
//!
//! Best effort on every desktop OS: each step runs even if an earlier one
//! failed, and the last failure is returned.
//!
//! | OS | Steps |
//! |----|-------|
//! | Linux | `gsettings set org.gnome.system.proxy mode none` |
//! | macOS | for every network service: web, secure web and auto proxy off |
//! | Windows | WinINet registry values cleared, `netsh winhttp reset proxy` |

use std::sync::Arc;

use tracing::{debug, info};

use crate::command::{argv, CommandRunner, HostOs};
use crate::error::{Error, Result};

const NETWORKSETUP: &str = "/usr/sbin/networksetup";
const INTERNET_SETTINGS: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// Turns the OS-level HTTP proxy off.
pub struct SystemProxy {
    runner: Arc<dyn CommandRunner>,
    os: HostOs,
}

impl SystemProxy {
    /// Proxy control for the current OS.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            os: HostOs::current(),
        }
    }

    /// Overrides the detected OS.
    pub fn with_os(mut self, os: HostOs) -> Self {
        self.os = os;
        self
    }

    /// Disables the system proxy.
    pub async fn off(&self) -> Result<()> {
        let steps: Vec<Vec<String>> = match self.os {
            HostOs::Linux => vec![argv(&["gsettings", "set", "org.gnome.system.proxy", "mode", "none"])],
            HostOs::MacOs => {
                let listing = self
                    .runner
                    .run(NETWORKSETUP, &argv(&["-listallnetworkservices"]))
                    .await?;
                network_services(&listing)
                    .into_iter()
                    .flat_map(|svc| {
                        ["-setwebproxystate", "-setsecurewebproxystate", "-setautoproxystate"]
                            .into_iter()
                            .map(move |flag| argv(&[NETWORKSETUP, flag, &svc, "off"]))
                    })
                    .collect()
            }
            HostOs::Windows => vec![
                argv(&[
                    "reg", "add", INTERNET_SETTINGS, "/v", "ProxyEnable", "/t", "REG_DWORD", "/d",
                    "0", "/f",
                ]),
                argv(&["reg", "delete", INTERNET_SETTINGS, "/v", "ProxyServer", "/f"]),
                argv(&["reg", "delete", INTERNET_SETTINGS, "/v", "AutoConfigURL", "/f"]),
                argv(&["reg", "delete", INTERNET_SETTINGS, "/v", "ProxyOverride", "/f"]),
                argv(&["netsh", "winhttp", "reset", "proxy"]),
            ],
            HostOs::Other => return Ok(()),
        };

        let mut last_err: Option<Error> = None;
        for step in steps {
            let Some((program, args)) = step.split_first() else {
                continue;
            };
            if let Err(e) = self.runner.run(program, args).await {
                debug!(program = %program, "proxy reset step failed: {}", e);
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => {
                info!("system proxy disabled");
                Ok(())
            }
        }
    }
}

/// Parses `networksetup -listallnetworkservices` output.
///
/// Skips the explanatory header and strips the `*` marking disabled
/// services.
fn network_services(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("An asterisk"))
        .map(|l| l.trim_start_matches('*').to_string())
        .collect()
}
