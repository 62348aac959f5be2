//! Engine boundary and core lifecycle.
//!
//! The core never runs traffic itself. It synthesizes a document, persists
//! it as `current-config.json`, and hands it to an [`Engine`].
//! [`CoreService`] tracks the lifecycle and turns every failure, panics
//! included, into a [`StatusReport`] instead of crashing the process.
//!
//! # Lifecycle
//!
//! ```text
//!   Stopped ──start()──▶ Starting ──engine ok──▶ Started
//!      ▲                    │                      │
//!      │   read/parse/      │                      │ stop()
//!      │   build/start      │                      ▼
//!      │   failure          │                   Stopping
//!      └────────────────────┴──────────────────────┘
//! ```
//!
//! # Failure Mapping
//!
//! | Step | Message type |
//! |------|--------------|
//! | reading the config file | [`MessageType::ErrorReadingConfig`] |
//! | parsing the base document | [`MessageType::ErrorParsingConfig`] |
//! | WARP preparation or synthesis | [`MessageType::ErrorBuildingConfig`] |
//! | engine spawn | [`MessageType::CreateService`] |
//! | engine start | [`MessageType::StartService`] |
//! | panic anywhere | [`MessageType::UnexpectedError`] |
//!
//! # Cooperative Shutdown
//!
//! A second process asks a running `run` process to quit by creating
//! [`STOP_MARKER`] in the shared work directory; see
//! [`write_stop_marker`] and [`wait_for_stop_marker`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::document::Document;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::synth::{required_warp_keys, Synthesizer};
use crate::tunnel::{ActivationHandle, Activator, TunnelSupervisor};
use crate::warp::{IdentitySource, WarpIdentity, WarpManager};

/// File the last synthesized document is written to.
pub const CURRENT_CONFIG: &str = "current-config.json";

/// Marker file asking a running process to stop.
pub const STOP_MARKER: &str = "rostovvpn.stop";

const STOP_MARKER_POLL: Duration = Duration::from_secs(1);
const RESTART_PAUSE: Duration = Duration::from_millis(250);

/// Runs finished documents.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Starts the engine with `document`.
    async fn start(&self, document: &Document) -> Result<()>;

    /// Stops the engine. Stopping a stopped engine succeeds.
    async fn stop(&self) -> Result<()>;

    /// Stops, then starts with `document`.
    async fn restart(&self, document: &Document) -> Result<()> {
        self.stop().await?;
        self.start(document).await
    }

    /// True while the engine is running.
    fn is_running(&self) -> bool;
}

/// [`Engine`] backed by an external binary (`<binary> run -c <config>`).
pub struct ProcessEngine {
    binary: PathBuf,
    config_path: PathBuf,
    startup_grace: Duration,
    child: Mutex<Option<Child>>,
}

impl ProcessEngine {
    /// Engine that writes its config to `config_path` before each start.
    pub fn new(binary: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config_path: config_path.into(),
            startup_grace: Duration::from_millis(300),
            child: Mutex::new(None),
        }
    }

    /// How long to watch for an immediate exit after spawning.
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    async fn start(&self, document: &Document) -> Result<()> {
        if self.is_running() {
            return Err(Error::Engine("engine already running".to_string()));
        }
        document.write_to_file(&self.config_path)?;

        let mut child = Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Engine(format!("spawn {}: {}", self.binary.display(), e)))?;

        sleep(self.startup_grace).await;
        if let Some(status) = child.try_wait()? {
            return Err(Error::Engine(format!("engine exited during startup: {}", status)));
        }
        info!(binary = %self.binary.display(), pid = ?child.id(), "engine started");
        *self.lock() = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let child = self.lock().take();
        let Some(mut child) = child else {
            return Ok(());
        };
        if let Err(e) = child.start_kill() {
            debug!("engine already gone: {}", e);
        }
        let status = child.wait().await?;
        info!(%status, "engine stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        match self.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Core lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoreStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Why the core reported a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Empty,
    UnexpectedError,
    ErrorReadingConfig,
    ErrorParsingConfig,
    ErrorBuildingConfig,
    CreateService,
    StartService,
    InstanceNotStarted,
    InstanceNotFound,
    AlreadyStarted,
    AlreadyStopped,
}

/// A status transition as seen by front ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: CoreStatus,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl StatusReport {
    fn new(status: CoreStatus, message_type: MessageType, message: impl Into<String>) -> Self {
        Self {
            status,
            message_type,
            message: message.into(),
        }
    }
}

/// Where the document for a start comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Read from a file.
    Path(PathBuf),
    /// Inline JSON text.
    Content(String),
    /// An already-built document.
    Document(Box<Document>),
}

/// Parameters of [`CoreService::start`].
#[derive(Debug, Clone)]
pub struct StartParams {
    pub source: ConfigSource,
    /// Hand the document to the engine as-is, skipping synthesis.
    pub raw: bool,
    /// Pause briefly before starting the engine.
    pub delay_start: bool,
}

impl StartParams {
    /// Synthesize from a base document on disk.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ConfigSource::Path(path.into()),
            raw: false,
            delay_start: false,
        }
    }

    /// Run a finished document without synthesis.
    pub fn raw(document: Document) -> Self {
        Self {
            source: ConfigSource::Document(Box::new(document)),
            raw: true,
            delay_start: false,
        }
    }
}

/// Owns the engine, the options and the lifecycle state.
pub struct CoreService {
    engine: Arc<dyn Engine>,
    work_dir: PathBuf,
    options: Mutex<Options>,
    warp: Option<Arc<WarpManager>>,
    tunnel: Option<TunnelSupervisor>,
    status: watch::Sender<StatusReport>,
}

impl CoreService {
    /// Creates a stopped core writing into `work_dir`.
    pub fn new(engine: Arc<dyn Engine>, work_dir: impl Into<PathBuf>) -> Self {
        let (status, _) = watch::channel(StatusReport::new(
            CoreStatus::Stopped,
            MessageType::Empty,
            "",
        ));
        Self {
            engine,
            work_dir: work_dir.into(),
            options: Mutex::new(Options::default()),
            warp: None,
            tunnel: None,
            status,
        }
    }

    /// Uses `warp` to register identities before synthesis.
    pub fn with_warp(mut self, warp: Arc<WarpManager>) -> Self {
        self.warp = Some(warp);
        self
    }

    /// Activates and deactivates the tunnel service through `tunnel`.
    pub fn with_tunnel(mut self, tunnel: TunnelSupervisor) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Replaces the options used by the next synthesis.
    pub fn set_options(&self, options: Options) {
        *self.options.lock().unwrap_or_else(|e| e.into_inner()) = options;
    }

    /// Options used by the next synthesis.
    pub fn options(&self) -> Options {
        self.options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Latest status.
    pub fn status(&self) -> StatusReport {
        self.status.borrow().clone()
    }

    /// Receiver that sees every status change.
    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.status.subscribe()
    }

    /// Path of the last synthesized document.
    pub fn current_config_path(&self) -> PathBuf {
        self.work_dir.join(CURRENT_CONFIG)
    }

    fn set_status(&self, status: CoreStatus, message_type: MessageType, message: impl Into<String>) -> StatusReport {
        let report = StatusReport::new(status, message_type, message);
        debug!(status = ?report.status, message_type = ?report.message_type, "core status");
        self.status.send_replace(report.clone());
        report
    }

    /// Records a failure, tears everything down and returns `err`.
    async fn stop_and_alert(&self, message_type: MessageType, err: Error) -> Error {
        error!(?message_type, "{}", err);
        self.set_status(CoreStatus::Stopped, message_type, err.to_string());
        if let Some(tunnel) = &self.tunnel {
            if let Err(e) = tunnel.deactivate().await {
                warn!("tunnel deactivation after failure: {}", e);
            }
        }
        if let Err(e) = self.engine.stop().await {
            warn!("engine stop after failure: {}", e);
        }
        err
    }

    /// Builds and starts a configuration.
    ///
    /// A running engine is stopped first.
    pub async fn start(&self, params: StartParams) -> Result<StatusReport> {
        if self.status().status != CoreStatus::Stopped {
            info!("core not stopped, stopping before start");
            if let Err(e) = self.stop().await {
                debug!("stop before start: {}", e);
            }
        }
        self.set_status(CoreStatus::Starting, MessageType::Empty, "");
        self.start_inner(params).await
    }

    async fn start_inner(&self, params: StartParams) -> Result<StatusReport> {
        let base = match self.load(&params.source).await {
            Ok(doc) => doc,
            Err((kind, e)) => return Err(self.stop_and_alert(kind, e).await),
        };

        let document = if params.raw {
            base
        } else {
            match self.build(&base).await {
                Ok(doc) => doc,
                Err((kind, e)) => return Err(self.stop_and_alert(kind, e).await),
            }
        };

        if let Err(e) = document.write_to_file(&self.current_config_path()) {
            warn!("could not save {}: {}", CURRENT_CONFIG, e);
        }

        if params.delay_start {
            sleep(RESTART_PAUSE).await;
        }

        let engine = self.engine.clone();
        let run = tokio::spawn(async move { engine.start(&document).await });
        match run.await {
            Ok(Ok(())) => {}
            Ok(Err(e @ Error::Engine(_))) => {
                return Err(self.stop_and_alert(MessageType::CreateService, e).await);
            }
            Ok(Err(e)) => return Err(self.stop_and_alert(MessageType::StartService, e).await),
            Err(join) => {
                let e = Error::Engine(format!("engine start panicked: {}", join));
                return Err(self.stop_and_alert(MessageType::UnexpectedError, e).await);
            }
        }

        Ok(self.set_status(CoreStatus::Started, MessageType::Empty, ""))
    }

    async fn load(&self, source: &ConfigSource) -> std::result::Result<Document, (MessageType, Error)> {
        match source {
            ConfigSource::Path(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| (MessageType::ErrorReadingConfig, Error::Io(e)))?;
                Document::from_json_str(&text).map_err(|e| (MessageType::ErrorParsingConfig, e))
            }
            ConfigSource::Content(text) => {
                Document::from_json_str(text).map_err(|e| (MessageType::ErrorParsingConfig, e))
            }
            ConfigSource::Document(doc) => Ok((**doc).clone()),
        }
    }

    async fn build(&self, base: &Document) -> std::result::Result<Document, (MessageType, Error)> {
        let options = self.options();
        let building = |e| (MessageType::ErrorBuildingConfig, e);

        if let Some(warp) = &self.warp {
            let keys = required_warp_keys(&options, base);
            warp.prepare(keys.iter().map(String::as_str))
                .await
                .map_err(building)?;
        }

        let empty: BTreeMap<String, WarpIdentity> = BTreeMap::new();
        let identities: &dyn IdentitySource = match &self.warp {
            Some(warp) => warp.as_ref(),
            None => &empty,
        };

        let synthesized = catch_unwind(AssertUnwindSafe(|| {
            let mut synth = Synthesizer::new(identities);
            if let Some(tunnel) = &self.tunnel {
                synth = synth.with_activator(tunnel as &dyn Activator);
            }
            synth.synthesize(&options, base)
        }));

        match synthesized {
            Ok(Ok(out)) => {
                if let Some(handle) = out.activation {
                    watch_activation(handle);
                }
                Ok(out.document)
            }
            Ok(Err(e)) => Err(building(e)),
            Err(panic) => Err((
                MessageType::UnexpectedError,
                Error::ConfigBuild(format!("synthesis panicked: {}", panic_message(&panic))),
            )),
        }
    }

    /// Stops the engine and the tunnel service.
    pub async fn stop(&self) -> Result<StatusReport> {
        let current = self.status().status;
        if current != CoreStatus::Started {
            self.set_status(current, MessageType::InstanceNotStarted, "instance is not started");
            return Err(Error::Engine("instance not started".to_string()));
        }
        if !self.engine.is_running() {
            self.set_status(current, MessageType::InstanceNotFound, "instance is not found");
            return Err(Error::Engine("instance not found".to_string()));
        }

        self.set_status(CoreStatus::Stopping, MessageType::Empty, "");
        if let Some(tunnel) = &self.tunnel {
            if let Err(e) = tunnel.deactivate().await {
                warn!("tunnel deactivation: {}", e);
            }
        }

        let engine = self.engine.clone();
        match tokio::spawn(async move { engine.stop().await }).await {
            Ok(Ok(())) => Ok(self.set_status(CoreStatus::Stopped, MessageType::Empty, "")),
            Ok(Err(e)) => {
                self.set_status(
                    CoreStatus::Stopping,
                    MessageType::UnexpectedError,
                    "error while stopping the service",
                );
                Err(e)
            }
            Err(join) => {
                let e = Error::Engine(format!("engine stop panicked: {}", join));
                Err(self.stop_and_alert(MessageType::UnexpectedError, e).await)
            }
        }
    }

    /// Stops, pauses briefly and starts again.
    pub async fn restart(&self, params: StartParams) -> Result<StatusReport> {
        let current = self.status().status;
        if current != CoreStatus::Started {
            self.set_status(current, MessageType::InstanceNotStarted, "instance is not started");
            return Err(Error::Engine("instance not started".to_string()));
        }
        self.stop().await?;
        self.set_status(CoreStatus::Starting, MessageType::Empty, "");
        sleep(RESTART_PAUSE).await;
        self.start_inner(params).await
    }
}

fn watch_activation(handle: ActivationHandle) {
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move {
                if let Err(e) = handle.wait().await {
                    warn!("tunnel service activation failed: {}", e);
                }
            });
        }
        Err(_) => debug!("no runtime to watch tunnel activation"),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// True if the Clash-style management API accepts TCP connections.
pub async fn clash_api_alive(port: u16, wait: Duration) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    matches!(timeout(wait, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// Asks the process running in `work_dir` to stop.
pub fn write_stop_marker(work_dir: &Path) -> Result<()> {
    crate::fsutil::write_atomic(&work_dir.join(STOP_MARKER), b"stop\n", 0o644)
}

/// Waits until a stop marker appears in `work_dir`, then removes it.
pub async fn wait_for_stop_marker(work_dir: &Path) {
    let marker = work_dir.join(STOP_MARKER);
    loop {
        if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_file(&marker).await {
                warn!("could not remove stop marker: {}", e);
            }
            info!("stop marker found");
            return;
        }
        sleep(STOP_MARKER_POLL).await;
    }
}

/// Removes a stale stop marker left by an earlier run.
pub fn clear_stop_marker(work_dir: &Path) {
    let _ = std::fs::remove_file(work_dir.join(STOP_MARKER));
}


#[cfg(test)]
mod tests {
    use super::testing::FakeEngine;
    use super::*;
    use crate::document::tags;

    const BASE: &str = r#"{"outbounds": [
        {"type": "vless", "tag": "de", "server": "de.example.com", "server_port": 443}
    ]}"#;

    fn core(engine: Arc<FakeEngine>, dir: &Path) -> CoreService {
        CoreService::new(engine, dir)
    }

    #[tokio::test]
    async fn test_start_synthesizes_and_saves_current_config() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.json");
        std::fs::write(&base, BASE).unwrap();
        let engine = Arc::new(FakeEngine::default());
        let core = core(engine.clone(), dir.path());

        let report = core.start(StartParams::from_path(&base)).await.unwrap();
        assert_eq!(report.status, CoreStatus::Started);
        let started = engine.started.lock().unwrap();
        assert!(started[0].outbound(tags::SELECT).is_some());
        let saved = Document::from_file(&core.current_config_path()).unwrap();
        assert_eq!(saved, started[0]);
    }

    #[tokio::test]
    async fn test_raw_start_skips_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let core = core(engine.clone(), dir.path());
        let doc = Document::from_json_str(BASE).unwrap();
        core.start(StartParams::raw(doc.clone())).await.unwrap();
        assert_eq!(engine.started.lock().unwrap()[0], doc);
    }

    #[tokio::test]
    async fn test_missing_file_is_reading_error() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(Arc::new(FakeEngine::default()), dir.path());
        let err = core
            .start(StartParams::from_path(dir.path().join("nope.json")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        let status = core.status();
        assert_eq!(status.status, CoreStatus::Stopped);
        assert_eq!(status.message_type, MessageType::ErrorReadingConfig);
    }

    #[tokio::test]
    async fn test_bad_json_is_parsing_error() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(Arc::new(FakeEngine::default()), dir.path());
        let params = StartParams {
            source: ConfigSource::Content("{not json".into()),
            raw: false,
            delay_start: false,
        };
        core.start(params).await.unwrap_err();
        assert_eq!(core.status().message_type, MessageType::ErrorParsingConfig);
    }

    #[tokio::test]
    async fn test_unusable_base_is_building_error() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(Arc::new(FakeEngine::default()), dir.path());
        let params = StartParams {
            source: ConfigSource::Content(r#"{"outbounds": []}"#.into()),
            raw: false,
            delay_start: false,
        };
        let err = core.start(params).await.unwrap_err();
        assert!(matches!(err, Error::ConfigBuild(_)));
        assert_eq!(core.status().message_type, MessageType::ErrorBuildingConfig);
    }

    #[tokio::test]
    async fn test_engine_panic_becomes_unexpected_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            panic_on_start: true,
            ..FakeEngine::default()
        });
        let core = core(engine, dir.path());
        let doc = Document::from_json_str(BASE).unwrap();
        core.start(StartParams::raw(doc)).await.unwrap_err();
        let status = core.status();
        assert_eq!(status.status, CoreStatus::Stopped);
        assert_eq!(status.message_type, MessageType::UnexpectedError);
    }

    #[tokio::test]
    async fn test_engine_failure_is_start_service() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            fail_start: true,
            ..FakeEngine::default()
        });
        let core = core(engine, dir.path());
        core.start(StartParams::raw(Document::default())).await.unwrap_err();
        assert_eq!(core.status().message_type, MessageType::StartService);
    }

    #[tokio::test]
    async fn test_stop_when_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(Arc::new(FakeEngine::default()), dir.path());
        core.stop().await.unwrap_err();
        assert_eq!(core.status().message_type, MessageType::InstanceNotStarted);
    }

    #[tokio::test]
    async fn test_start_stop_restart() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let core = core(engine.clone(), dir.path());
        let mut rx = core.subscribe();
        let doc = Document::from_json_str(BASE).unwrap();

        core.start(StartParams::raw(doc.clone())).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().status, CoreStatus::Started);

        core.restart(StartParams::raw(doc)).await.unwrap();
        assert_eq!(engine.started.lock().unwrap().len(), 2);

        let report = core.stop().await.unwrap();
        assert_eq!(report.status, CoreStatus::Stopped);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_engine_vanished_is_instance_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let core = core(engine.clone(), dir.path());
        core.start(StartParams::raw(Document::default())).await.unwrap();
        engine.running.store(false, std::sync::atomic::Ordering::SeqCst);
        core.stop().await.unwrap_err();
        assert_eq!(core.status().message_type, MessageType::InstanceNotFound);
    }

    #[tokio::test]
    async fn test_stop_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_stop_marker(dir.path()).unwrap();
        tokio::time::timeout(Duration::from_secs(3), wait_for_stop_marker(dir.path()))
            .await
            .unwrap();
        assert!(!dir.path().join(STOP_MARKER).exists());
    }

    #[tokio::test]
    async fn test_clash_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(clash_api_alive(port, Duration::from_millis(500)).await);
        drop(listener);
        assert!(!clash_api_alive(port, Duration::from_millis(200)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_engine_lifecycle() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("engine.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = dir.path().join("engine.json");
        let engine = ProcessEngine::new(&script, &config).with_startup_grace(Duration::from_millis(50));
        engine.start(&Document::default()).await.unwrap();
        assert!(engine.is_running());
        assert!(config.exists());
        assert!(engine.start(&Document::default()).await.is_err());

        engine.stop().await.unwrap();
        assert!(!engine.is_running());
        engine.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_engine_early_exit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new("/bin/false", dir.path().join("c.json"))
            .with_startup_grace(Duration::from_millis(200));
        let err = engine.start(&Document::default()).await.unwrap_err();
        assert!(err.to_string().contains("exited during startup"));
    }
}
