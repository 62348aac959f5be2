//! Loopback RPC control surface of the tunnel service.
//!
//! One request per connection, one JSON object per line:
//!
//! ```text
//!   client                                   tunnel service
//!     │ ── {"method":"start","params":{..}}\n ──▶ │
//!     │ ◀── {"ok":true}\n ──────────────────────── │
//! ```
//!
//! | Method | Params | Effect |
//! |--------|--------|--------|
//! | `start` | [`StartRequest`] | Build and start the tunnel engine |
//! | `stop`  | none | Stop the tunnel engine, keep serving |
//! | `exit`  | none | Stop the engine and shut the server down |
//!
//! Both ends run on the same host, so the transport is plain TCP bound to
//! loopback. Connections from non-loopback peers are dropped unanswered.
//!
//! # Error Mapping
//!
//! | Failure | Error |
//! |---------|-------|
//! | connect refused / timed out | [`Error::ServiceUnreachable`] |
//! | I/O, timeout or `ok: false` after connecting | [`Error::Rpc`] |

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::options::{Ipv6Mode, Options};

/// Default control port of the tunnel service.
pub const DEFAULT_CONTROL_PORT: u16 = 18020;

const MAX_LINE: usize = 64 * 1024;

/// Parameters of the `start` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Give the TUN an IPv6 address.
    pub ipv6: bool,
    /// Local mixed-proxy port the tunnel forwards into.
    pub server_port: u16,
    pub strict_route: bool,
    pub endpoint_independent_nat: bool,
    /// TUN stack name.
    pub stack: String,
}

impl StartRequest {
    pub fn from_options(options: &Options) -> Self {
        Self {
            // The TUN gets an IPv6 address only when the user forces IPv6.
            ipv6: options.ipv6_mode == Ipv6Mode::Ipv6Only,
            server_port: options.mixed_port,
            strict_route: options.strict_route,
            endpoint_independent_nat: true,
            stack: options.tun_stack.clone(),
        }
    }
}

/// A control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    Start(StartRequest),
    Stop,
    Exit,
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Start(_) => "start",
            Request::Stop => "stop",
            Request::Exit => "exit",
        }
    }
}

/// A control response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Response {
    fn ok() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Client side of the control surface.
#[derive(Debug, Clone)]
pub struct ControlClient {
    addr: SocketAddr,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl ControlClient {
    /// Client for `127.0.0.1:<port>`.
    pub fn new(port: u16) -> Self {
        Self::with_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_secs(5),
        }
    }

    /// Overrides connect and call timeouts.
    pub fn with_timeouts(mut self, connect: Duration, call: Duration) -> Self {
        self.connect_timeout = connect;
        self.call_timeout = call;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// True if something accepts connections on the control port.
    pub async fn probe(&self) -> bool {
        matches!(
            timeout(self.connect_timeout, TcpStream::connect(self.addr)).await,
            Ok(Ok(_))
        )
    }

    pub async fn start(&self, request: StartRequest) -> Result<()> {
        self.call(Request::Start(request)).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.call(Request::Stop).await
    }

    pub async fn exit(&self) -> Result<()> {
        self.call(Request::Exit).await
    }

    /// Sends one request and waits for its response.
    pub async fn call(&self, request: Request) -> Result<()> {
        let method = request.name();
        let stream = match timeout(self.connect_timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ServiceUnreachable(format!("{}: {}", self.addr, e)));
            }
            Err(_) => {
                return Err(Error::ServiceUnreachable(format!(
                    "{}: connect timed out",
                    self.addr
                )));
            }
        };
        debug!(method, addr = %self.addr, "sending control request");

        let response = timeout(self.call_timeout, exchange(stream, &request))
            .await
            .map_err(|_| Error::Rpc(format!("{} timed out", method)))?
            .map_err(|e| Error::Rpc(format!("{}: {}", method, e)))?;

        if response.ok {
            Ok(())
        } else {
            Err(Error::Rpc(format!("{} rejected: {}", method, response.message)))
        }
    }
}

async fn exchange(stream: TcpStream, request: &Request) -> Result<Response> {
    let (reader, mut writer) = stream.into_split();
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;

    let mut reader = BufReader::new(reader);
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await?;
    if n == 0 {
        return Err(Error::Rpc("connection closed without a response".to_string()));
    }
    Ok(serde_json::from_str(buf.trim_end())?)
}

/// What the server does for each request.
#[async_trait]
pub trait TunnelHandler: Send + Sync {
    async fn start(&self, request: StartRequest) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Server side of the control surface.
///
/// Requests are handled one at a time, so `start` and `stop` never race.
pub struct ControlServer {
    listener: TcpListener,
    handler: Arc<dyn TunnelHandler>,
    read_timeout: Duration,
}

impl ControlServer {
    /// Binds `127.0.0.1:<port>`; port 0 picks a free one.
    pub async fn bind(port: u16, handler: Arc<dyn TunnelHandler>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        Ok(Self {
            listener,
            handler,
            read_timeout: Duration::from_secs(5),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until an `exit` request has been answered.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "control server listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if !peer.ip().is_loopback() {
                warn!(%peer, "dropping non-loopback control connection");
                continue;
            }
            match self.serve_one(stream).await {
                Ok(true) => {
                    info!("exit requested, control server stopping");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!(%peer, error = %e, "control connection failed"),
            }
        }
    }

    /// Handles one connection. Returns true after an `exit`.
    async fn serve_one(&self, stream: TcpStream) -> Result<bool> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader).take(MAX_LINE as u64);
        let mut buf = String::new();
        let n = timeout(self.read_timeout, reader.read_line(&mut buf))
            .await
            .map_err(|_| Error::Timeout("control request not received in time".to_string()))??;
        if n == 0 {
            // A bare connect, e.g. a health probe.
            return Ok(false);
        }

        let (response, exit) = match serde_json::from_str::<Request>(buf.trim_end()) {
            Ok(request) => {
                debug!(method = request.name(), "control request");
                self.dispatch(request).await
            }
            Err(e) => (Response::err(format!("bad request: {}", e)), false),
        };

        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(exit)
    }

    async fn dispatch(&self, request: Request) -> (Response, bool) {
        let to_response = |r: Result<()>| match r {
            Ok(()) => Response::ok(),
            Err(e) => Response::err(e.to_string()),
        };
        match request {
            Request::Start(params) => (to_response(self.handler.start(params).await), false),
            Request::Stop => (to_response(self.handler.stop().await), false),
            Request::Exit => {
                if let Err(e) = self.handler.stop().await {
                    warn!(error = %e, "stop during exit failed");
                }
                (Response::ok(), true)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn request() -> StartRequest {
        StartRequest {
            ipv6: false,
            server_port: 12334,
            strict_route: true,
            endpoint_independent_nat: true,
            stack: "mixed".into(),
        }
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(Request::Start(request())).unwrap();
        assert_eq!(json["method"], "start");
        assert_eq!(json["params"]["server_port"], 12334);
        let stop = serde_json::to_string(&Request::Stop).unwrap();
        assert_eq!(stop, r#"{"method":"stop"}"#);
        let back: Request = serde_json::from_str(r#"{"method":"exit"}"#).unwrap();
        assert_eq!(back, Request::Exit);
    }

    #[test]
    fn test_from_options() {
        let opt = Options {
            mixed_port: 2080,
            tun_stack: "gvisor".into(),
            ..Options::default()
        };
        let req = StartRequest::from_options(&opt);
        assert_eq!(req.server_port, 2080);
        assert_eq!(req.stack, "gvisor");
        assert!(!req.ipv6);

        for (mode, ipv6) in [
            (Ipv6Mode::PreferIpv4, false),
            (Ipv6Mode::PreferIpv6, false),
            (Ipv6Mode::Ipv6Only, true),
        ] {
            let opt = Options {
                ipv6_mode: mode,
                ..Options::default()
            };
            assert_eq!(StartRequest::from_options(&opt).ipv6, ipv6, "{:?}", mode);
        }
    }

    #[tokio::test]
    async fn test_round_trip_and_exit() {
        let handler = Arc::new(RecordingHandler::default());
        let (client, task) = spawn_server(handler.clone()).await;

        assert!(client.probe().await);
        client.start(request()).await.unwrap();
        client.stop().await.unwrap();
        client.exit().await.unwrap();
        task.await.unwrap().unwrap();

        let calls = handler.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["start:12334", "stop", "stop"]);
        assert!(!client.probe().await);
    }

    #[tokio::test]
    async fn test_handler_error_is_rpc_failure() {
        let handler = Arc::new(RecordingHandler::default());
        *handler.fail_start.lock().unwrap() = true;
        let (client, task) = spawn_server(handler).await;

        let err = client.start(request()).await.unwrap_err();
        assert!(matches!(err, Error::Rpc(ref m) if m.contains("tun busy")));
        client.exit().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = ControlClient::with_addr(addr);
        assert!(!client.probe().await);
        assert!(matches!(client.stop().await, Err(Error::ServiceUnreachable(_))));
    }
}
