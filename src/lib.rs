//! # rostovvpn-rs
//!
//! Configuration synthesis and tunnel-service control plane for the RostovVPN client.
//!
//! # Overview
//!
//! rostovvpn-rs turns a small set of user-facing [`Options`] and an already-converted
//! engine configuration into a complete, self-consistent engine [`Document`], and
//! supervises the privileged service that owns the system TUN device when the
//! client runs in tunnel mode.
//!
//! ```text
//!   settings.json ──▶ Options ─┐
//!                              ├──▶ Synthesizer ──▶ Document ──▶ Engine
//!   profile.json ──▶ Document ─┘         │
//!                                        └──▶ TunnelSupervisor ──RPC──▶ tunnel service
//!                                                   │                        │
//!                                             Elevator, NetworkRules      Engine (TUN)
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Application configuration (TOML, CLI, environment) |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`logger`] | Logging infrastructure using tracing |
//! | [`options`] | User options, defaults and settings ingestion |
//! | [`document`] | Typed engine configuration document |
//! | [`outbound`] | Per-outbound patching (TLS tricks, mux, WARP markers) |
//! | [`dns`] | DNS topology |
//! | [`route`] | Routing rules and remote rule-sets |
//! | [`warp`] | WARP identities, registration and overlay expansion |
//! | [`synth`] | Config synthesis and final validation |
//! | [`rpc`] | Loopback control protocol, client and server |
//! | [`tunnel`] | Tunnel service activation state machine |
//! | [`service`] | Privileged tunnel service host and OS registration |
//! | [`elevate`] | Privilege escalation |
//! | [`netrules`] | Idempotent TPROXY policy routing and nftables rules |
//! | [`core`] | Engine boundary and instance lifecycle |
//! | [`sysproxy`] | System proxy reset |
//! | [`command`] | External program execution |
//! | [`diagnostics`] | Non-fatal diagnostics channel |
//!
//! # What This Library Does NOT Do
//!
//! - **Packet forwarding**: The external engine moves traffic
//! - **Subscription fetching**: Profiles arrive already converted
//! - **GUI**: The desktop client drives this crate through the CLI or the library
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use rostovvpn_rs::{Document, Options, Synthesizer, WarpIdentity};
//!
//! # fn main() -> rostovvpn_rs::Result<()> {
//! let base = Document::from_json_str(r#"{"outbounds":[{"type":"direct","tag":"out"}]}"#)?;
//! let identities: BTreeMap<String, WarpIdentity> = BTreeMap::new();
//! let out = Synthesizer::new(&identities).synthesize(&Options::default(), &base)?;
//! println!("{}", out.document.to_json_pretty()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## As a CLI Application
//!
//! ```bash
//! # Print the synthesized document
//! rostovvpn-rs --settings settings.json --base-config profile.json build
//!
//! # Run the engine until Ctrl-C or `rostovvpn-rs stop`
//! rostovvpn-rs --base-config profile.json run
//!
//! # Host the privileged tunnel service
//! sudo rostovvpn-rs tunnel run
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod command;
pub mod config;
#[allow(missing_docs)]
pub mod core;
pub mod diagnostics;
pub mod dns;
#[allow(missing_docs)]
pub mod document;
pub mod elevate;
pub mod error;
pub mod fsutil;
pub mod logger;
pub mod netrules;
#[allow(missing_docs)]
pub mod options;
pub mod outbound;
pub mod route;
#[allow(missing_docs)]
pub mod rpc;
pub mod service;
pub mod synth;
pub mod sysproxy;
pub mod tunnel;
pub mod warp;

pub use command::{CommandRunner, HostOs, SystemRunner};
pub use config::{CliArgs, Command, Config, LogLevel, PlatformChoice, ProxyCommand, TunnelCommand};
pub use crate::core::{CoreService, CoreStatus, Engine, MessageType, ProcessEngine, StartParams, StatusReport};
pub use diagnostics::{Diagnostic, Diagnostics};
pub use document::{Document, Outbound, OutboundKind};
pub use elevate::{Elevator, SystemElevator};
pub use error::{Error, Result};
pub use netrules::NetworkRules;
pub use options::{Options, Platform};
pub use rpc::{ControlClient, ControlServer, StartRequest, TunnelHandler, DEFAULT_CONTROL_PORT};
pub use service::{ServiceAction, ServiceManager, TunnelHost};
pub use synth::{validate_document, SynthesisOutput, Synthesizer};
pub use sysproxy::SystemProxy;
pub use tunnel::{ActivationHandle, ActivationRequest, Activator, ServiceState, TunnelSupervisor};
pub use warp::{IdentityStore, WarpIdentity, WarpManager};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
