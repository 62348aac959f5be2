//! Tunnel-service control plane.
//!
//! The privileged tunnel service owns the TUN device. This module drives it
//! from the unprivileged side through the loopback control surface in
//! [`crate::rpc`], installing it with elevated rights when it is not
//! listening.
//!
//! # State Machine
//!
//! ```text
//!              activate()                 start ok
//!   Stopped ─────────────────▶ Starting ─────────────▶ Started
//!      ▲                          │                       │
//!      │          start failed    │                       │ deactivate()
//!      ├──────────────────────────┘                       ▼
//!      │                                               Stopping
//!      └──────────────────────────────────────────────────┘
//!
//!   deactivate_force() and exit() move any state to Stopped.
//! ```
//!
//! # Activation
//!
//! ```text
//!   probe ──no──▶ elevate "tunnel install" ──fail──▶ elevate "tunnel run"
//!     │                       │                            │
//!    yes                      └────────────┬───────────────┘
//!     │                                    ▼
//!     │                         wait until listening (bounded)
//!     ▼                                    │
//!   Stop, Start ◀──────────────────────────┘
//!     │
//!     ├─ ok ──▶ ensure TPROXY rules (Linux) ──▶ Started
//!     └─ fail ─▶ Exit, reinstall once ─▶ wait ─▶ up to N retries, linear backoff
//! ```
//!
//! Activation always runs on a spawned task. [`ActivationHandle`] lets the
//! caller await the outcome; dropping it does not cancel anything.
//!
//! Every deactivation bumps a generation counter. A running activation
//! checks it before each `Start`, before installing rules and after
//! installing them; once it has moved the activation gives up with
//! [`Error::Cancelled`], undoing a `Start` it already sent.
//!
//! # What This Module Does NOT Do
//!
//! - Does not host the service: see [`crate::service`]
//! - Does not build the tunnel document: the service does that on `Start`

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::command::SystemRunner;
use crate::diagnostics::Diagnostics;
use crate::elevate::{Elevator, SystemElevator};
use crate::error::{Error, Result};
use crate::netrules::NetworkRules;
use crate::options::Options;
use crate::rpc::{ControlClient, StartRequest};

const SOURCE: &str = "tunnel";

/// Lifecycle state of the tunnel service as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not running, or never started.
    Stopped,
    /// Activation in progress.
    Starting,
    /// The service accepted `Start`.
    Started,
    /// A graceful stop is in progress.
    Stopping,
}

/// Control calls into the tunnel service.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// True if the control endpoint accepts connections.
    async fn probe(&self) -> bool;
    /// Starts the tunnel.
    async fn start(&self, request: StartRequest) -> Result<()>;
    /// Stops the tunnel; the service keeps running.
    async fn stop(&self) -> Result<()>;
    /// Terminates the service process.
    async fn exit(&self) -> Result<()>;
}

#[async_trait]
impl ServiceControl for ControlClient {
    async fn probe(&self) -> bool {
        ControlClient::probe(self).await
    }

    async fn start(&self, request: StartRequest) -> Result<()> {
        ControlClient::start(self, request).await
    }

    async fn stop(&self) -> Result<()> {
        ControlClient::stop(self).await
    }

    async fn exit(&self) -> Result<()> {
        ControlClient::exit(self).await
    }
}

/// Everything activation needs from the options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRequest {
    /// Parameters of the `Start` call.
    pub start: StartRequest,
    /// Port of the engine's TPROXY inbound.
    pub tproxy_port: u16,
    /// Port of the local DNS inbound.
    pub dns_port: u16,
}

impl ActivationRequest {
    /// Derives an activation request from user options.
    pub fn from_options(options: &Options) -> Self {
        Self {
            start: StartRequest::from_options(options),
            tproxy_port: options.tproxy_port,
            dns_port: options.local_dns_port,
        }
    }
}

/// Waits and limits used while activating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationTimings {
    /// How long to wait for the service to listen after an install.
    pub install_wait: Duration,
    /// Probe interval while waiting.
    pub poll_interval: Duration,
    /// Start retries after the service became ready.
    pub retry_limit: u32,
    /// Retry `n` (0-based) sleeps `(n + 1) * backoff_step`.
    pub backoff_step: Duration,
    /// How long a forced deactivation waits for the port to free.
    pub port_free_wait: Duration,
}

impl Default for ActivationTimings {
    fn default() -> Self {
        Self {
            install_wait: Duration::from_secs(120),
            poll_interval: Duration::from_millis(300),
            retry_limit: 5,
            backoff_step: Duration::from_secs(1),
            port_free_wait: Duration::from_secs(3),
        }
    }
}

/// Outcome of a background activation.
///
/// Awaiting it is optional; dropping it never cancels the activation.
#[derive(Debug)]
pub struct ActivationHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl ActivationHandle {
    /// A handle that already holds its outcome.
    pub fn ready(result: Result<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    fn pending() -> (oneshot::Sender<Result<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Waits for the activation to finish.
    pub async fn wait(self) -> Result<()> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::Rpc("activation task ended without a result".into())))
    }
}

/// Something that can bring the tunnel service up in the background.
pub trait Activator: Send + Sync {
    /// Starts activation and returns immediately.
    fn activate(&self, request: ActivationRequest) -> ActivationHandle;
}

struct Inner {
    control: Arc<dyn ServiceControl>,
    elevator: Arc<dyn Elevator>,
    rules: Arc<NetworkRules>,
    diagnostics: Diagnostics,
    service_exe: PathBuf,
    timings: ActivationTimings,
    state: Mutex<ServiceState>,
    closed: AtomicBool,
    generation: AtomicU64,
}

/// Owns the control-plane state for one tunnel service.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

impl TunnelSupervisor {
    /// Creates a supervisor from its collaborators.
    pub fn new(
        control: Arc<dyn ServiceControl>,
        elevator: Arc<dyn Elevator>,
        rules: Arc<NetworkRules>,
        service_exe: PathBuf,
    ) -> Self {
        Self::build(
            control,
            elevator,
            rules,
            service_exe,
            ActivationTimings::default(),
            Diagnostics::log_only(),
        )
    }

    /// Supervisor talking to `127.0.0.1:<port>` with the host's real tools.
    pub fn system(port: u16, service_exe: PathBuf, diagnostics: Diagnostics) -> Self {
        let runner = Arc::new(SystemRunner);
        Self::build(
            Arc::new(ControlClient::new(port)),
            Arc::new(SystemElevator::new(runner.clone())),
            Arc::new(NetworkRules::new(runner, diagnostics.clone())),
            service_exe,
            ActivationTimings::default(),
            diagnostics,
        )
    }

    fn build(
        control: Arc<dyn ServiceControl>,
        elevator: Arc<dyn Elevator>,
        rules: Arc<NetworkRules>,
        service_exe: PathBuf,
        timings: ActivationTimings,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                control,
                elevator,
                rules,
                diagnostics,
                service_exe,
                timings,
                state: Mutex::new(ServiceState::Stopped),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Replaces the activation timings. Call before sharing the supervisor.
    pub fn with_timings(self, timings: ActivationTimings) -> Self {
        let inner = &self.inner;
        Self::build(
            inner.control.clone(),
            inner.elevator.clone(),
            inner.rules.clone(),
            inner.service_exe.clone(),
            timings,
            inner.diagnostics.clone(),
        )
    }

    /// Replaces the diagnostics sink. Call before sharing the supervisor.
    pub fn with_diagnostics(self, diagnostics: Diagnostics) -> Self {
        let inner = &self.inner;
        Self::build(
            inner.control.clone(),
            inner.elevator.clone(),
            inner.rules.clone(),
            inner.service_exe.clone(),
            inner.timings,
            diagnostics,
        )
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        self.inner.state()
    }

    /// Brings the tunnel up on a background task.
    ///
    /// Returns an already-successful handle if activation is in progress or
    /// done. Without a Tokio runtime the handle carries an error.
    pub fn activate(&self, request: ActivationRequest) -> ActivationHandle {
        if self.inner.closed.load(Ordering::SeqCst) {
            return ActivationHandle::ready(Err(Error::Rpc(
                "tunnel supervisor is closed".to_string(),
            )));
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                return ActivationHandle::ready(Err(Error::Rpc(format!(
                    "no async runtime for tunnel activation: {}",
                    e
                ))));
            }
        };
        let generation = {
            let mut state = self.inner.lock_state();
            if matches!(*state, ServiceState::Starting | ServiceState::Started) {
                debug!(state = ?*state, "tunnel service already active");
                return ActivationHandle::ready(Ok(()));
            }
            *state = ServiceState::Starting;
            self.inner.generation.load(Ordering::SeqCst)
        };
        info!(port = request.start.server_port, stack = %request.start.stack, "activating tunnel service");

        let (tx, handle) = ActivationHandle::pending();
        let inner = self.inner.clone();
        runtime.spawn(async move {
            let mut result = inner.start_with_failover(&request, generation).await;
            {
                let mut state = inner.lock_state();
                let overtaken = inner.current(generation).is_err();
                if overtaken && result.is_ok() {
                    // The deactivation that overtook us owns the stop.
                    result = inner.current(generation);
                }
                // A later activation may own `Starting` by now.
                if *state == ServiceState::Starting && !overtaken {
                    *state = if result.is_ok() {
                        ServiceState::Started
                    } else {
                        ServiceState::Stopped
                    };
                }
            }
            match &result {
                Ok(()) => info!("tunnel service started"),
                Err(e) => warn!("tunnel service activation failed: {}", e),
            }
            let _ = tx.send(result);
        });
        handle
    }

    /// Stops the tunnel.
    ///
    /// If the service was marked active this waits for the `Stop` call and
    /// returns its outcome. Otherwise a best-effort stop is sent in the
    /// background and this returns immediately.
    pub async fn deactivate(&self) -> Result<()> {
        let was_active = {
            let mut state = self.inner.lock_state();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            let active = matches!(*state, ServiceState::Starting | ServiceState::Started);
            if active {
                *state = ServiceState::Stopping;
            }
            active
        };

        if !was_active {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.stop_request().await {
                    debug!("background stop: {}", e);
                }
            });
            return Ok(());
        }

        let result = self.inner.stop_request().await;
        self.inner.set_state(ServiceState::Stopped);
        result
    }

    /// Sends `Stop` and removes network rules, waiting for both whatever
    /// the local state says.
    ///
    /// Used by short-lived callers that never activated the tunnel
    /// themselves.
    pub async fn stop_service(&self) -> Result<()> {
        self.inner.cancel_activation();
        self.inner.set_state(ServiceState::Stopping);
        let result = self.inner.stop_request().await;
        self.inner.set_state(ServiceState::Stopped);
        result
    }

    /// Tears the service down regardless of its answers.
    ///
    /// Sends one `Stop`, asks the process to exit, removes network rules,
    /// and uninstalls the service with elevated rights if the control port
    /// is still open afterwards. Always succeeds; failures go to
    /// diagnostics.
    pub async fn deactivate_force(&self) -> Result<()> {
        let inner = &self.inner;
        inner.cancel_activation();
        inner.set_state(ServiceState::Stopping);

        if let Err(e) = inner.control.stop().await {
            inner.diagnostics.report(SOURCE, format!("forced stop: {}", e));
        }
        if inner.control.probe().await {
            if let Err(e) = inner.control.exit().await {
                inner.diagnostics.report(SOURCE, format!("forced exit: {}", e));
            }
        }
        inner.rules.cleanup().await;

        if !inner.wait_port_free().await {
            warn!("tunnel service still listening, uninstalling");
            let args = vec!["tunnel".to_string(), "uninstall".to_string()];
            if let Err(e) = inner.elevator.run(&inner.service_exe, false, &args).await {
                inner.diagnostics.report(SOURCE, format!("forced uninstall: {}", e));
            }
            if !inner.wait_port_free().await {
                inner
                    .diagnostics
                    .report(SOURCE, "control port still busy after forced deactivation");
            }
        }

        inner.set_state(ServiceState::Stopped);
        Ok(())
    }

    /// Terminates the service process, then removes network rules.
    ///
    /// A service that is not listening counts as already exited. If the
    /// exit call fails the rules stay in place, since the service may still
    /// be routing through them.
    pub async fn exit(&self) -> Result<()> {
        self.inner.cancel_activation();
        let result = match self.inner.control.exit().await {
            Err(Error::ServiceUnreachable(_)) => Ok(()),
            other => other,
        };
        if result.is_ok() {
            self.inner.rules.cleanup().await;
        }
        self.inner.set_state(ServiceState::Stopped);
        result
    }

    /// Stops an active tunnel and refuses further activations.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if matches!(
            self.state(),
            ServiceState::Starting | ServiceState::Started
        ) {
            if let Err(e) = self.deactivate().await {
                self.inner
                    .diagnostics
                    .report(SOURCE, format!("stop on close: {}", e));
            }
        }
    }
}

impl Activator for TunnelSupervisor {
    fn activate(&self, request: ActivationRequest) -> ActivationHandle {
        TunnelSupervisor::activate(self, request)
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> ServiceState {
        *self.lock_state()
    }

    /// Makes any running activation give up at its next check.
    fn cancel_activation(&self) {
        let _state = self.lock_state();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// `Err(Cancelled)` once a deactivation has happened since `generation`.
    fn current(&self, generation: u64) -> Result<()> {
        if self.generation.load(Ordering::SeqCst) == generation {
            Ok(())
        } else {
            Err(Error::Cancelled("tunnel deactivated during activation".to_string()))
        }
    }

    fn set_state(&self, next: ServiceState) {
        let mut state = self.lock_state();
        if *state != next {
            debug!(from = ?*state, to = ?next, "tunnel state");
            *state = next;
        }
    }

    async fn start_with_failover(&self, request: &ActivationRequest, generation: u64) -> Result<()> {
        let first = match self.try_start(request, generation).await {
            Ok(()) => return Ok(()),
            Err(e @ (Error::ElevationFailed(_) | Error::Cancelled(_))) => return Err(e),
            Err(e) => e,
        };
        warn!("tunnel start failed, waiting for service: {}", first);
        self.wait_ready(generation).await?;

        let mut last = first;
        for attempt in 0..self.timings.retry_limit {
            match self.start_on_listening(request, generation).await {
                Ok(()) => return Ok(()),
                Err(e @ Error::Cancelled(_)) => return Err(e),
                Err(e) => {
                    warn!(attempt = attempt + 1, "tunnel start retry failed: {}", e);
                    last = e;
                }
            }
            if attempt + 1 < self.timings.retry_limit {
                sleep(self.timings.backoff_step * (attempt + 1)).await;
            }
        }
        Err(last)
    }

    /// First attempt: installs the service when needed.
    async fn try_start(&self, request: &ActivationRequest, generation: u64) -> Result<()> {
        if !self.control.probe().await {
            return self.install_and_start(request, generation).await;
        }
        match self.stop_then_start(request, generation).await {
            Ok(()) => Ok(()),
            Err(e @ Error::Cancelled(_)) => Err(e),
            Err(e) => {
                warn!("start rejected, restarting service: {}", e);
                self.current(generation)?;
                if let Err(e) = self.control.exit().await {
                    debug!("exit before reinstall: {}", e);
                }
                self.install_and_start(request, generation).await
            }
        }
    }

    async fn install_and_start(&self, request: &ActivationRequest, generation: u64) -> Result<()> {
        self.current(generation)?;
        let install = vec!["tunnel".to_string(), "install".to_string()];
        if let Err(e) = self.elevator.run(&self.service_exe, true, &install).await {
            warn!("service install failed, running directly: {}", e);
            self.current(generation)?;
            let run = vec!["tunnel".to_string(), "run".to_string()];
            self.elevator.run(&self.service_exe, true, &run).await?;
        }
        self.wait_ready(generation).await?;
        self.start_on_listening(request, generation).await
    }

    async fn start_on_listening(&self, request: &ActivationRequest, generation: u64) -> Result<()> {
        self.current(generation)?;
        if !self.control.probe().await {
            return Err(Error::ServiceUnreachable("service is not running".to_string()));
        }
        self.stop_then_start(request, generation).await
    }

    async fn stop_then_start(&self, request: &ActivationRequest, generation: u64) -> Result<()> {
        if let Err(e) = self.control.stop().await {
            debug!("stop before start: {}", e);
        }
        self.current(generation)?;
        self.control.start(request.start.clone()).await?;
        if let Err(e) = self.current(generation) {
            self.undo_start().await;
            return Err(e);
        }
        if let Err(e) = self
            .rules
            .ensure(request.tproxy_port, request.dns_port, true)
            .await
        {
            self.diagnostics
                .report(SOURCE, format!("TPROXY rules: {}", e));
        }
        if let Err(e) = self.current(generation) {
            self.undo_start().await;
            return Err(e);
        }
        Ok(())
    }

    /// Stops a tunnel started by an activation that was since cancelled.
    async fn undo_start(&self) {
        debug!("activation overtaken by deactivation, stopping tunnel again");
        if let Err(e) = self.control.stop().await {
            self.diagnostics
                .report(SOURCE, format!("stop after cancelled activation: {}", e));
        }
        self.rules.cleanup().await;
    }

    async fn stop_request(&self) -> Result<()> {
        let mut result = self.control.stop().await;
        if let Err(Error::Rpc(e)) = &result {
            debug!("stop failed, retrying once: {}", e);
            result = self.control.stop().await;
        }
        self.rules.cleanup().await;
        result
    }

    async fn wait_ready(&self, generation: u64) -> Result<()> {
        let deadline = Instant::now() + self.timings.install_wait;
        loop {
            self.current(generation)?;
            if self.control.probe().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "service did not become ready within {:?}",
                    self.timings.install_wait
                )));
            }
            sleep(self.timings.poll_interval).await;
        }
    }

    async fn wait_port_free(&self) -> bool {
        let deadline = Instant::now() + self.timings.port_free_wait;
        loop {
            if !self.control.probe().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.timings.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::HostOs;
    use crate::netrules::testing::fake_kernel;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeControl {
        listening: AtomicBool,
        exit_closes: bool,
        start_results: Mutex<VecDeque<Result<()>>>,
        always_fail_start: bool,
        fail_exit: bool,
        start_delay: Duration,
        probes: AtomicUsize,
        starts: AtomicUsize,
        stops: AtomicUsize,
        exits: AtomicUsize,
    }

    impl FakeControl {
        fn listening() -> Self {
            let c = Self::default();
            c.listening.store(true, Ordering::SeqCst);
            c
        }
    }

    #[async_trait]
    impl ServiceControl for FakeControl {
        async fn probe(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.listening.load(Ordering::SeqCst)
        }

        async fn start(&self, _request: StartRequest) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if !self.start_delay.is_zero() {
                sleep(self.start_delay).await;
            }
            if !self.listening.load(Ordering::SeqCst) {
                return Err(Error::ServiceUnreachable("refused".into()));
            }
            if self.always_fail_start {
                return Err(Error::Rpc("start rejected: tun busy".into()));
            }
            self.start_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.listening.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::ServiceUnreachable("refused".into()))
            }
        }

        async fn exit(&self) -> Result<()> {
            self.exits.fetch_add(1, Ordering::SeqCst);
            if !self.listening.load(Ordering::SeqCst) {
                return Err(Error::ServiceUnreachable("refused".into()));
            }
            if self.fail_exit {
                return Err(Error::Rpc("exit rejected".into()));
            }
            if self.exit_closes {
                self.listening.store(false, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct FakeElevator {
        control: Arc<FakeControl>,
        brings_up: bool,
        fails: bool,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeElevator {
        fn new(control: Arc<FakeControl>, brings_up: bool) -> Self {
            Self {
                control,
                brings_up,
                fails: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Elevator for FakeElevator {
        async fn run(&self, _exe: &Path, _background: bool, args: &[String]) -> Result<()> {
            self.calls.lock().unwrap().push(args.to_vec());
            if self.fails {
                return Err(Error::ElevationFailed("dismissed".into()));
            }
            if args.last().map(String::as_str) == Some("uninstall") {
                self.control.listening.store(false, Ordering::SeqCst);
            } else if self.brings_up {
                self.control.listening.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn fast() -> ActivationTimings {
        ActivationTimings {
            install_wait: Duration::from_millis(40),
            poll_interval: Duration::from_millis(5),
            retry_limit: 5,
            backoff_step: Duration::from_millis(1),
            port_free_wait: Duration::from_millis(20),
        }
    }

    fn request() -> ActivationRequest {
        ActivationRequest::from_options(&Options::default())
    }

    fn supervisor(
        control: Arc<FakeControl>,
        elevator: Arc<FakeElevator>,
    ) -> (TunnelSupervisor, Arc<crate::command::testing::RecordingRunner>) {
        let (runner, _state) = fake_kernel();
        let rules = NetworkRules::new(runner.clone(), Diagnostics::log_only()).with_os(HostOs::Linux);
        let sup = TunnelSupervisor::new(control, elevator, Arc::new(rules), PathBuf::from("/opt/rv/rostovvpn-rs"))
            .with_timings(fast());
        (sup, runner)
    }

    async fn finish(handle: ActivationHandle) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("activation must terminate")
    }

    #[test]
    fn test_activation_request_from_options() {
        let opt = Options::default();
        let req = ActivationRequest::from_options(&opt);
        assert_eq!(req.start.server_port, opt.mixed_port);
        assert!(req.start.endpoint_independent_nat);
        assert_eq!(req.tproxy_port, opt.tproxy_port);
        assert_eq!(req.dns_port, opt.local_dns_port);
    }

    #[test]
    fn test_activate_without_runtime_reports_error() {
        let control = Arc::new(FakeControl::listening());
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, _) = supervisor(control, elevator);
        let handle = sup.activate(request());
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert!(rt.block_on(handle.wait()).is_err());
        assert_eq!(sup.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_activate_on_listening_service() {
        let control = Arc::new(FakeControl::listening());
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, runner) = supervisor(control.clone(), elevator.clone());

        finish(sup.activate(request())).await.unwrap();
        assert_eq!(sup.state(), ServiceState::Started);
        assert_eq!(control.stops.load(Ordering::SeqCst), 1);
        assert_eq!(control.starts.load(Ordering::SeqCst), 1);
        assert!(elevator.calls().is_empty());
        assert!(runner.lines().iter().any(|l| l == "nft list ruleset"));
    }

    #[tokio::test]
    async fn test_second_activate_is_noop() {
        let control = Arc::new(FakeControl::listening());
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, _) = supervisor(control.clone(), elevator);
        finish(sup.activate(request())).await.unwrap();
        finish(sup.activate(request())).await.unwrap();
        assert_eq!(control.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_installs_when_not_listening() {
        let control = Arc::new(FakeControl::default());
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, _) = supervisor(control.clone(), elevator.clone());

        finish(sup.activate(request())).await.unwrap();
        assert_eq!(elevator.calls(), vec![vec!["tunnel".to_string(), "install".to_string()]]);
        assert_eq!(control.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_service_terminates() {
        let control = Arc::new(FakeControl::default());
        let elevator = Arc::new(FakeElevator::new(control.clone(), false));
        let (sup, _) = supervisor(control.clone(), elevator.clone());

        let err = finish(sup.activate(request())).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(elevator.calls().len(), 1);
        assert_eq!(control.starts.load(Ordering::SeqCst), 0);
        assert_eq!(sup.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_start_failures_are_bounded() {
        let control = Arc::new(FakeControl {
            always_fail_start: true,
            ..FakeControl::listening()
        });
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, _) = supervisor(control.clone(), elevator.clone());

        let err = finish(sup.activate(request())).await.unwrap_err();
        assert!(matches!(err, Error::Rpc(_)));
        // Initial attempt, one reinstall, then five retries.
        assert_eq!(control.starts.load(Ordering::SeqCst), 7);
        assert_eq!(control.exits.load(Ordering::SeqCst), 1);
        assert_eq!(elevator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_recovers_on_retry() {
        let control = Arc::new(FakeControl::listening());
        control.start_results.lock().unwrap().extend([
            Err(Error::Rpc("busy".into())),
            Err(Error::Rpc("busy".into())),
            Err(Error::Rpc("busy".into())),
        ]);
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, _) = supervisor(control.clone(), elevator);
        finish(sup.activate(request())).await.unwrap();
        assert_eq!(control.starts.load(Ordering::SeqCst), 4);
        assert_eq!(sup.state(), ServiceState::Started);
    }

    #[tokio::test]
    async fn test_elevation_failure_surfaces_immediately() {
        let control = Arc::new(FakeControl::default());
        let elevator = Arc::new(FakeElevator {
            fails: true,
            ..FakeElevator::new(control.clone(), false)
        });
        let (sup, _) = supervisor(control.clone(), elevator.clone());

        let err = finish(sup.activate(request())).await.unwrap_err();
        assert!(matches!(err, Error::ElevationFailed(_)));
        let calls = elevator.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], vec!["tunnel".to_string(), "run".to_string()]);
    }

    #[tokio::test]
    async fn test_deactivate_after_start() {
        let control = Arc::new(FakeControl::listening());
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, runner) = supervisor(control.clone(), elevator);
        finish(sup.activate(request())).await.unwrap();

        sup.deactivate().await.unwrap();
        assert_eq!(sup.state(), ServiceState::Stopped);
        assert_eq!(control.stops.load(Ordering::SeqCst), 2);
        assert!(runner
            .lines()
            .iter()
            .any(|l| l == "nft delete table inet rostovvpn"));
    }

    #[tokio::test]
    async fn test_deactivate_when_never_started_returns_immediately() {
        let control = Arc::new(FakeControl::default());
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, _) = supervisor(control, elevator);
        sup.deactivate().await.unwrap();
        assert_eq!(sup.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_service_waits_for_stop() {
        let control = Arc::new(FakeControl::listening());
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, runner) = supervisor(control.clone(), elevator);
        sup.stop_service().await.unwrap();
        assert_eq!(control.stops.load(Ordering::SeqCst), 1);
        assert_eq!(sup.state(), ServiceState::Stopped);
        assert!(runner.lines().iter().any(|l| l.starts_with("nft delete table")));
    }

    #[tokio::test]
    async fn test_force_deactivate_never_started_stops_once() {
        let control = Arc::new(FakeControl::default());
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, _) = supervisor(control.clone(), elevator.clone());

        sup.deactivate_force().await.unwrap();
        assert!(control.stops.load(Ordering::SeqCst) <= 1);
        assert!(elevator.calls().is_empty());
        assert_eq!(sup.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_force_deactivate_uninstalls_stubborn_service() {
        let control = Arc::new(FakeControl::listening());
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (diag, mut rx) = Diagnostics::channel();
        let (sup, _) = supervisor(control.clone(), elevator.clone());
        let sup = sup.with_diagnostics(diag);

        sup.deactivate_force().await.unwrap();
        assert_eq!(control.stops.load(Ordering::SeqCst), 1);
        assert_eq!(control.exits.load(Ordering::SeqCst), 1);
        assert_eq!(
            elevator.calls(),
            vec![vec!["tunnel".to_string(), "uninstall".to_string()]]
        );
        assert!(!control.listening.load(Ordering::SeqCst));
        while let Ok(d) = rx.try_recv() {
            assert_ne!(d.source, SOURCE, "unexpected diagnostic: {}", d.message);
        }
    }

    #[tokio::test]
    async fn test_force_deactivate_exit_frees_port_without_elevation() {
        let control = Arc::new(FakeControl {
            exit_closes: true,
            ..FakeControl::listening()
        });
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, _) = supervisor(control.clone(), elevator.clone());
        sup.deactivate_force().await.unwrap();
        assert!(elevator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_exit_unreachable_is_ok() {
        let control = Arc::new(FakeControl::default());
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, runner) = supervisor(control.clone(), elevator);
        sup.exit().await.unwrap();
        assert_eq!(control.exits.load(Ordering::SeqCst), 1);
        assert!(runner.lines().iter().any(|l| l.starts_with("nft delete")));
    }

    #[tokio::test]
    async fn test_deactivate_during_retries_cancels_activation() {
        let control = Arc::new(FakeControl::listening());
        control
            .start_results
            .lock()
            .unwrap()
            .extend((0..4).map(|_| Err(Error::Rpc("busy".into()))));
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, runner) = supervisor(control.clone(), elevator);
        let sup = sup.with_timings(ActivationTimings {
            backoff_step: Duration::from_millis(30),
            ..fast()
        });

        let handle = sup.activate(request());
        sleep(Duration::from_millis(15)).await;
        sup.deactivate().await.unwrap();
        let starts = control.starts.load(Ordering::SeqCst);

        let err = finish(handle).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)), "{:?}", err);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(control.starts.load(Ordering::SeqCst), starts);
        assert_eq!(sup.state(), ServiceState::Stopped);
        assert!(!runner.lines().iter().any(|l| l.starts_with("nft add rule")));
    }

    #[tokio::test]
    async fn test_deactivate_during_start_call_stops_again() {
        let control = Arc::new(FakeControl {
            start_delay: Duration::from_millis(60),
            ..FakeControl::listening()
        });
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, runner) = supervisor(control.clone(), elevator);

        let handle = sup.activate(request());
        sleep(Duration::from_millis(20)).await;
        assert_eq!(control.starts.load(Ordering::SeqCst), 1);
        sup.deactivate().await.unwrap();
        let stops = control.stops.load(Ordering::SeqCst);

        let err = finish(handle).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)), "{:?}", err);
        assert_eq!(control.starts.load(Ordering::SeqCst), 1);
        // The late `Start` is answered with another `Stop`.
        assert_eq!(control.stops.load(Ordering::SeqCst), stops + 1);
        assert_eq!(sup.state(), ServiceState::Stopped);
        assert!(!runner.lines().iter().any(|l| l.starts_with("nft add rule")));
    }

    #[tokio::test]
    async fn test_activate_after_cancelled_activation_starts() {
        let control = Arc::new(FakeControl {
            start_delay: Duration::from_millis(30),
            ..FakeControl::listening()
        });
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, _) = supervisor(control.clone(), elevator);

        let first = sup.activate(request());
        sleep(Duration::from_millis(10)).await;
        sup.deactivate().await.unwrap();
        assert!(finish(first).await.is_err());

        finish(sup.activate(request())).await.unwrap();
        assert_eq!(sup.state(), ServiceState::Started);
    }

    #[tokio::test]
    async fn test_no_backoff_after_last_retry() {
        let control = Arc::new(FakeControl {
            always_fail_start: true,
            ..FakeControl::listening()
        });
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, _) = supervisor(control.clone(), elevator);
        let sup = sup.with_timings(ActivationTimings {
            retry_limit: 2,
            backoff_step: Duration::from_millis(150),
            ..fast()
        });

        let started = Instant::now();
        assert!(finish(sup.activate(request())).await.is_err());
        // One 150ms backoff between the two retries, none after the last.
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_failed_exit_keeps_rules() {
        let control = Arc::new(FakeControl {
            fail_exit: true,
            ..FakeControl::listening()
        });
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, runner) = supervisor(control.clone(), elevator);
        finish(sup.activate(request())).await.unwrap();

        assert!(matches!(sup.exit().await, Err(Error::Rpc(_))));
        assert!(!runner.lines().iter().any(|l| l.starts_with("nft delete")));
    }

    #[tokio::test]
    async fn test_closed_supervisor_rejects_activation() {
        let control = Arc::new(FakeControl::listening());
        let elevator = Arc::new(FakeElevator::new(control.clone(), true));
        let (sup, _) = supervisor(control.clone(), elevator);
        finish(sup.activate(request())).await.unwrap();
        sup.close().await;
        assert_eq!(sup.state(), ServiceState::Stopped);
        assert!(finish(sup.activate(request())).await.is_err());
    }
}
