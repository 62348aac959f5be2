//! Privileged tunnel-service host and OS service registration.
//!
//! `tunnel run` executes [`run_service`]: a [`ControlServer`] on the
//! loopback control port whose `start` builds a small tunnel document (TUN
//! in, SOCKS out to the client's mixed port) and runs it through a
//! [`CoreService`].
//!
//! ```text
//!   apps ──▶ TUN 172.19.0.1/30 ──▶ socks-out ──▶ 127.0.0.1:<server_port> (client mixed inbound)
//!                 │
//!                 └── own processes ──▶ direct-out
//! ```
//!
//! [`ServiceManager`] registers the same binary as an OS service:
//!
//! | OS | Mechanism | Artifact |
//! |----|-----------|----------|
//! | Linux | systemd | `/etc/systemd/system/RostovVPNTunnelService.service` |
//! | macOS | launchd | `/Library/LaunchDaemons/RostovVPNTunnelService.plist` |
//! | Windows | `sc.exe` | service control manager entry |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::command::{argv, CommandRunner, HostOs};
use crate::core::{CoreService, CoreStatus, ProcessEngine, StartParams};
use crate::document::{
    Document, Inbound, LogOptions, Outbound, OutboundKind, RouteRule, RuleMatch, TunInbound,
};
use crate::error::{Error, Result};
use crate::rpc::{ControlClient, ControlServer, StartRequest, TunnelHandler};

/// OS service name.
pub const SERVICE_NAME: &str = "RostovVPNTunnelService";
/// Human-readable service name.
pub const DISPLAY_NAME: &str = "RostovVPN Tunnel Service";

/// IPv4 address of the service's TUN interface.
pub const TUNNEL_ADDRESS_V4: &str = "172.19.0.1/30";
/// IPv6 address of the service's TUN interface.
pub const TUNNEL_ADDRESS_V6: &str = "fdfe:dcba:9876::1/126";

const DEFAULT_SERVER_PORT: u16 = 12334;
const TUNNEL_MTU: u32 = 9000;
const TUNNEL_CONFIG: &str = "tunnel-config.json";

/// Client process names that must bypass the tunnel.
pub const OWN_PROCESSES: &[&str] = &[
    "RostovVPN",
    "RostovVPN.exe",
    "RostovVPNCli",
    "RostovVPNCli.exe",
    "rostovvpn-rs",
    "rostovvpn-rs.exe",
];

/// Builds the document the tunnel service runs for `request`.
pub fn tunnel_document(request: &StartRequest) -> Document {
    let server_port = match request.server_port {
        0 => DEFAULT_SERVER_PORT,
        p => p,
    };

    let mut address = vec![TUNNEL_ADDRESS_V4.to_string()];
    if request.ipv6 {
        address.push(TUNNEL_ADDRESS_V6.to_string());
    }
    let tun = TunInbound {
        tag: "tun-in".to_string(),
        address,
        mtu: TUNNEL_MTU,
        auto_route: true,
        strict_route: request.strict_route,
        endpoint_independent_nat: request.endpoint_independent_nat,
        stack: request.stack.clone(),
        ..TunInbound::default()
    };

    let mut socks = Outbound::new(OutboundKind::Socks, "socks-out");
    socks.server = Some("127.0.0.1".to_string());
    socks.server_port = Some(server_port);
    socks.extra.insert("version".to_string(), Value::String("5".to_string()));

    let mut doc = Document {
        log: Some(LogOptions {
            level: "warn".to_string(),
            ..LogOptions::default()
        }),
        inbounds: vec![Inbound::Tun(tun)],
        outbounds: vec![socks, Outbound::new(OutboundKind::Direct, "direct-out")],
        ..Document::default()
    };
    doc.route.rules.push(RouteRule::new(
        RuleMatch {
            process_name: OWN_PROCESSES.iter().map(|s| s.to_string()).collect(),
            ..RuleMatch::default()
        },
        "direct-out",
    ));
    doc.route.final_outbound = Some("socks-out".to_string());
    doc.route.auto_detect_interface = true;
    doc
}

/// [`TunnelHandler`] that runs tunnel documents in a [`CoreService`].
pub struct TunnelHost {
    core: Arc<CoreService>,
}

impl TunnelHost {
    /// Host backed by `core`.
    pub fn new(core: Arc<CoreService>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl TunnelHandler for TunnelHost {
    async fn start(&self, request: StartRequest) -> Result<()> {
        info!(port = request.server_port, stack = %request.stack, "tunnel start requested");
        self.core
            .start(StartParams::raw(tunnel_document(&request)))
            .await
            .map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        if self.core.status().status != CoreStatus::Started {
            return Ok(());
        }
        self.core.stop().await.map(|_| ())
    }
}

/// Hosts the tunnel service until an `exit` request or Ctrl-C.
///
/// Returns `Ok(false)` without binding if another instance already owns
/// the control port.
pub async fn run_service(port: u16, engine_binary: &Path, work_dir: &Path) -> Result<bool> {
    if ControlClient::new(port).probe().await {
        warn!(port, "tunnel service already running (port busy)");
        return Ok(false);
    }

    let engine = ProcessEngine::new(engine_binary, work_dir.join(TUNNEL_CONFIG));
    let core = Arc::new(CoreService::new(Arc::new(engine), work_dir));
    let server = ControlServer::bind(port, Arc::new(TunnelHost::new(core.clone()))).await?;
    info!(addr = %server.local_addr()?, "tunnel service listening");

    let result = tokio::select! {
        r = server.run() => r,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting tunnel service down");
            Ok(())
        }
    };

    if core.status().status == CoreStatus::Started {
        if let Err(e) = core.stop().await {
            warn!("stopping tunnel on shutdown: {}", e);
        }
    }
    result.map(|_| true)
}

/// Registration state reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Registered and running.
    Running,
    /// Registered, not running.
    Stopped,
    /// Not registered, or the OS could not tell.
    Unknown,
}

/// OS service registration actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    /// Register (replacing any previous registration) and start.
    Install,
    /// Stop and unregister.
    Uninstall,
    /// Start, registering first if unknown.
    Start,
    /// Stop.
    Stop,
}

/// Registers the tunnel service with the OS service manager.
pub struct ServiceManager {
    runner: Arc<dyn CommandRunner>,
    os: HostOs,
    exe: PathBuf,
    work_dir: PathBuf,
    unit_dir: PathBuf,
}

impl ServiceManager {
    /// Manager registering `exe tunnel run`.
    pub fn new(runner: Arc<dyn CommandRunner>, exe: PathBuf) -> Self {
        let os = HostOs::current();
        let work_dir = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            runner,
            os,
            exe,
            work_dir,
            unit_dir: default_unit_dir(os),
        }
    }

    /// Overrides the detected OS and its unit directory.
    pub fn with_os(mut self, os: HostOs) -> Self {
        self.os = os;
        self.unit_dir = default_unit_dir(os);
        self
    }

    /// Overrides where unit/plist files are written.
    pub fn with_unit_dir(mut self, dir: PathBuf) -> Self {
        self.unit_dir = dir;
        self
    }

    fn unit_path(&self) -> PathBuf {
        match self.os {
            HostOs::MacOs => self.unit_dir.join(format!("{}.plist", SERVICE_NAME)),
            _ => self.unit_dir.join(format!("{}.service", SERVICE_NAME)),
        }
    }

    /// Runs `action` and returns a human-readable outcome.
    pub async fn control(&self, action: ServiceAction) -> Result<String> {
        let status = self.status().await;
        match action {
            ServiceAction::Install => {
                self.uninstall_quietly().await;
                self.install().await?;
                if self.status().await != ServiceStatus::Running {
                    self.start().await?;
                }
                Ok("Tunnel Service installed successfully.".to_string())
            }
            ServiceAction::Uninstall => {
                if status == ServiceStatus::Running {
                    if let Err(e) = self.stop().await {
                        warn!("stop before uninstall: {}", e);
                    }
                }
                self.uninstall().await?;
                Ok("Tunnel Service uninstalled successfully.".to_string())
            }
            ServiceAction::Start => {
                if status == ServiceStatus::Running {
                    return Ok("Tunnel Service Already Running.".to_string());
                }
                if status == ServiceStatus::Unknown {
                    self.uninstall_quietly().await;
                    self.install().await?;
                }
                if self.status().await != ServiceStatus::Running {
                    self.start().await?;
                }
                Ok("Tunnel Service started successfully.".to_string())
            }
            ServiceAction::Stop => {
                if status == ServiceStatus::Stopped {
                    return Ok("Tunnel Service Already Stopped.".to_string());
                }
                self.stop().await?;
                Ok("Tunnel Service stopped successfully.".to_string())
            }
        }
    }

    /// Queries the OS for the service state.
    pub async fn status(&self) -> ServiceStatus {
        match self.os {
            HostOs::Linux | HostOs::Other => {
                match self
                    .runner
                    .run("systemctl", &argv(&["is-active", &self.unit_name()]))
                    .await
                {
                    Ok(out) if out.trim() == "active" => ServiceStatus::Running,
                    _ if self.unit_path().exists() => ServiceStatus::Stopped,
                    _ => ServiceStatus::Unknown,
                }
            }
            HostOs::MacOs => match self.runner.run("launchctl", &argv(&["list", SERVICE_NAME])).await {
                Ok(out) if out.contains("\"PID\"") => ServiceStatus::Running,
                Ok(_) => ServiceStatus::Stopped,
                Err(_) => ServiceStatus::Unknown,
            },
            HostOs::Windows => match self.runner.run("sc.exe", &argv(&["query", SERVICE_NAME])).await {
                Ok(out) if out.contains("RUNNING") => ServiceStatus::Running,
                Ok(_) => ServiceStatus::Stopped,
                Err(_) => ServiceStatus::Unknown,
            },
        }
    }

    fn unit_name(&self) -> String {
        format!("{}.service", SERVICE_NAME)
    }

    async fn install(&self) -> Result<()> {
        info!(os = ?self.os, exe = %self.exe.display(), "registering tunnel service");
        match self.os {
            HostOs::Linux | HostOs::Other => {
                crate::fsutil::write_atomic(&self.unit_path(), self.systemd_unit().as_bytes(), 0o644)?;
                self.runner.run("systemctl", &argv(&["daemon-reload"])).await?;
                self.runner
                    .run("systemctl", &argv(&["enable", &self.unit_name()]))
                    .await?;
            }
            HostOs::MacOs => {
                crate::fsutil::write_atomic(&self.unit_path(), self.launchd_plist().as_bytes(), 0o644)?;
                let plist = self.unit_path().to_string_lossy().into_owned();
                self.runner.run("launchctl", &argv(&["load", "-w", &plist])).await?;
            }
            HostOs::Windows => {
                let bin_path = format!("\"{}\" tunnel run", self.exe.display());
                self.runner
                    .run(
                        "sc.exe",
                        &argv(&[
                            "create",
                            SERVICE_NAME,
                            "binPath=",
                            &bin_path,
                            "start=",
                            "auto",
                            "DisplayName=",
                            DISPLAY_NAME,
                        ]),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        match self.os {
            HostOs::Linux | HostOs::Other => {
                if let Err(e) = self
                    .runner
                    .run("systemctl", &argv(&["disable", &self.unit_name()]))
                    .await
                {
                    warn!("systemctl disable: {}", e);
                }
                remove_if_exists(&self.unit_path())?;
                self.runner.run("systemctl", &argv(&["daemon-reload"])).await?;
            }
            HostOs::MacOs => {
                let plist = self.unit_path().to_string_lossy().into_owned();
                if let Err(e) = self.runner.run("launchctl", &argv(&["unload", "-w", &plist])).await {
                    warn!("launchctl unload: {}", e);
                }
                remove_if_exists(&self.unit_path())?;
            }
            HostOs::Windows => {
                self.runner.run("sc.exe", &argv(&["delete", SERVICE_NAME])).await?;
            }
        }
        Ok(())
    }

    async fn uninstall_quietly(&self) {
        if let Err(e) = self.uninstall().await {
            tracing::debug!("uninstall before install: {}", e);
        }
    }

    async fn start(&self) -> Result<()> {
        match self.os {
            HostOs::Linux | HostOs::Other => {
                self.runner.run("systemctl", &argv(&["start", &self.unit_name()])).await?;
            }
            HostOs::MacOs => {
                self.runner.run("launchctl", &argv(&["start", SERVICE_NAME])).await?;
            }
            HostOs::Windows => {
                self.runner.run("sc.exe", &argv(&["start", SERVICE_NAME])).await?;
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        match self.os {
            HostOs::Linux | HostOs::Other => {
                self.runner.run("systemctl", &argv(&["stop", &self.unit_name()])).await?;
            }
            HostOs::MacOs => {
                self.runner.run("launchctl", &argv(&["stop", SERVICE_NAME])).await?;
            }
            HostOs::Windows => {
                self.runner.run("sc.exe", &argv(&["stop", SERVICE_NAME])).await?;
            }
        }
        Ok(())
    }

    fn systemd_unit(&self) -> String {
        format!(
            "[Unit]\n\
             Description={display}\n\
             After=network-online.target\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart=\"{exe}\" tunnel run\n\
             WorkingDirectory={dir}\n\
             Restart=on-failure\n\
             RestartSec=3\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            display = DISPLAY_NAME,
            exe = self.exe.display(),
            dir = self.work_dir.display(),
        )
    }

    fn launchd_plist(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{name}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{exe}</string>
        <string>tunnel</string>
        <string>run</string>
    </array>
    <key>WorkingDirectory</key>
    <string>{dir}</string>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
</dict>
</plist>
"#,
            name = SERVICE_NAME,
            exe = xml_escape(&self.exe.to_string_lossy()),
            dir = xml_escape(&self.work_dir.to_string_lossy()),
        )
    }
}

fn default_unit_dir(os: HostOs) -> PathBuf {
    match os {
        HostOs::MacOs => PathBuf::from("/Library/LaunchDaemons"),
        _ => PathBuf::from("/etc/systemd/system"),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::core::testing::FakeEngine;
    use crate::rpc::testing::spawn_server;

    fn request() -> StartRequest {
        StartRequest {
            ipv6: true,
            server_port: 12334,
            strict_route: true,
            endpoint_independent_nat: true,
            stack: "gvisor".to_string(),
        }
    }

    #[test]
    fn test_tunnel_document_shape() {
        let doc = tunnel_document(&request());
        match doc.inbound("tun-in") {
            Some(Inbound::Tun(tun)) => {
                assert_eq!(tun.address, vec![TUNNEL_ADDRESS_V4, TUNNEL_ADDRESS_V6]);
                assert!(tun.auto_route && tun.strict_route && tun.endpoint_independent_nat);
                assert_eq!(tun.stack, "gvisor");
            }
            other => panic!("unexpected inbound: {:?}", other),
        }
        let socks = doc.outbound("socks-out").unwrap();
        assert_eq!(socks.server_port, Some(12334));
        assert_eq!(doc.route.final_outbound.as_deref(), Some("socks-out"));
        assert_eq!(doc.route.rules[0].outbound, "direct-out");
        assert!(doc.route.rules[0]
            .matcher
            .process_name
            .iter()
            .any(|p| p == "RostovVPN.exe"));
    }

    #[test]
    fn test_tunnel_document_defaults() {
        let mut req = request();
        req.ipv6 = false;
        req.server_port = 0;
        let doc = tunnel_document(&req);
        assert_eq!(doc.outbound("socks-out").unwrap().server_port, Some(DEFAULT_SERVER_PORT));
        match doc.inbound("tun-in") {
            Some(Inbound::Tun(tun)) => assert_eq!(tun.address.len(), 1),
            _ => panic!("missing TUN"),
        }
    }

    #[tokio::test]
    async fn test_host_runs_tunnel_document() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let core = Arc::new(CoreService::new(engine.clone(), dir.path()));
        let host = TunnelHost::new(core.clone());

        host.stop().await.unwrap();
        host.start(request()).await.unwrap();
        assert_eq!(core.status().status, CoreStatus::Started);
        assert_eq!(engine.started.lock().unwrap()[0], tunnel_document(&request()));
        host.stop().await.unwrap();
        assert_eq!(core.status().status, CoreStatus::Stopped);
    }

    #[tokio::test]
    async fn test_host_behind_control_server() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let core = Arc::new(CoreService::new(engine.clone(), dir.path()));
        let (client, task) = spawn_server(Arc::new(TunnelHost::new(core.clone()))).await;

        client.start(request()).await.unwrap();
        assert!(engine.running.load(std::sync::atomic::Ordering::SeqCst));
        client.exit().await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(core.status().status, CoreStatus::Stopped);
    }

    #[tokio::test]
    async fn test_systemd_install_writes_unit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let manager = ServiceManager::new(runner.clone(), PathBuf::from("/opt/rv/rostovvpn-rs"))
            .with_os(HostOs::Linux)
            .with_unit_dir(dir.path().to_path_buf());

        let msg = manager.control(ServiceAction::Install).await.unwrap();
        assert!(msg.contains("installed"));
        let unit = std::fs::read_to_string(dir.path().join("RostovVPNTunnelService.service")).unwrap();
        assert!(unit.contains("ExecStart=\"/opt/rv/rostovvpn-rs\" tunnel run"));
        assert!(unit.contains("WorkingDirectory=/opt/rv"));
        let lines = runner.lines();
        assert!(lines.contains(&"systemctl enable RostovVPNTunnelService.service".to_string()));
        assert!(lines.contains(&"systemctl start RostovVPNTunnelService.service".to_string()));
    }

    #[tokio::test]
    async fn test_start_when_running_is_noop() {
        let runner = Arc::new(
            RecordingRunner::new().with_output("systemctl is-active RostovVPNTunnelService.service", "active\n"),
        );
        let manager = ServiceManager::new(runner.clone(), PathBuf::from("/opt/rv/rostovvpn-rs"))
            .with_os(HostOs::Linux);
        let msg = manager.control(ServiceAction::Start).await.unwrap();
        assert_eq!(msg, "Tunnel Service Already Running.");
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_windows_uses_sc() {
        let runner = Arc::new(RecordingRunner::new());
        let manager = ServiceManager::new(runner.clone(), PathBuf::from("C:\\rv\\rostovvpn-rs.exe"))
            .with_os(HostOs::Windows);
        manager.control(ServiceAction::Uninstall).await.unwrap();
        assert!(runner
            .lines()
            .contains(&"sc.exe delete RostovVPNTunnelService".to_string()));
    }

    #[tokio::test]
    async fn test_launchd_plist_escapes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let manager = ServiceManager::new(runner, PathBuf::from("/Applications/R&D.app/rv"))
            .with_os(HostOs::MacOs)
            .with_unit_dir(dir.path().to_path_buf());
        manager.control(ServiceAction::Install).await.unwrap();
        let plist = std::fs::read_to_string(dir.path().join("RostovVPNTunnelService.plist")).unwrap();
        assert!(plist.contains("<string>/Applications/R&amp;D.app/rv</string>"));
    }
}
