//! Typed engine-native configuration document.
//!
//! The engine consumes a single JSON document. This module models the parts
//! the synthesizer reads or writes with concrete types, and keeps every other
//! key in `extra` maps so a base document survives a parse/serialize cycle
//! without loss.
//!
//! ```text
//!   Document
//!   ├── log            LogOptions
//!   ├── dns            DnsOptions { servers, rules, final, ... }
//!   ├── inbounds       [Inbound::{Tun, Mixed, Direct}]
//!   ├── outbounds      [Outbound { kind, tag, tls, transport, ... }]
//!   ├── route          RouteOptions { rules, rule_set, final, ... }
//!   └── experimental   clash_api, cache_file
//! ```
//!
//! Outbounds are keyed by [`OutboundKind`]. Protocol payloads the core does
//! not understand stay in [`Outbound::extra`]; the fields the patcher is
//! allowed to mutate (`multiplex`, `tls`, `tls_fragment`, `tcp_fast_open`,
//! `detour`, the WireGuard fields) are explicit.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Well-known inbound, outbound and DNS server tags.
pub mod tags {
    /// TUN inbound.
    pub const TUN_IN: &str = "tun-in";
    /// Mixed HTTP+SOCKS inbound.
    pub const MIXED_IN: &str = "mixed-in";
    /// DNS-capture inbound.
    pub const DNS_IN: &str = "dns-in";

    /// Main selector.
    pub const SELECT: &str = "select";
    /// Health-check group.
    pub const AUTO: &str = "auto";
    /// Direct egress used by the core's own plumbing.
    pub const DIRECT: &str = "direct";
    /// Direct egress for user bypass traffic.
    pub const BYPASS: &str = "bypass";
    /// Reject.
    pub const BLOCK: &str = "block";
    /// DNS pseudo-outbound.
    pub const DNS_OUT: &str = "dns-out";

    /// Proxied remote resolver, the DNS final.
    pub const DNS_REMOTE: &str = "dns-remote";
    /// Bootstrap resolver, always dialed directly.
    pub const DNS_DIRECT: &str = "dns-direct";
    /// HTTPS resolver dialed directly for censorship resistance.
    pub const DNS_TRICK_DIRECT: &str = "dns-trick-direct";
    /// OS resolver.
    pub const DNS_LOCAL: &str = "dns-local";
    /// Fake-IP pool.
    pub const DNS_FAKE: &str = "dns-fake";
    /// Static host records.
    pub const DNS_STATIC: &str = "dns-static";
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A finished (or base) engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Engine logging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogOptions>,
    /// DNS topology.
    #[serde(default, skip_serializing_if = "DnsOptions::is_empty")]
    pub dns: DnsOptions,
    /// Listeners.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbounds: Vec<Inbound>,
    /// Outbounds, in emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbounds: Vec<Outbound>,
    /// Routing.
    #[serde(default, skip_serializing_if = "RouteOptions::is_empty")]
    pub route: RouteOptions,
    /// Management API and cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Experimental>,
    /// Sections the core does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    /// Parses a document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigBuild`] if the text is not a valid document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::ConfigBuild(format!("invalid base config: {}", e)))
    }

    /// Reads and parses a document from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the document atomically (temp file + rename).
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let json = self.to_json_pretty()?;
        crate::fsutil::write_atomic(path, json.as_bytes(), 0o644)
    }

    /// Looks up an outbound by tag.
    pub fn outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag == tag)
    }

    /// Looks up an inbound by tag.
    pub fn inbound(&self, tag: &str) -> Option<&Inbound> {
        self.inbounds.iter().find(|i| i.tag() == tag)
    }
}

/// Engine log sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Engine log level.
    #[serde(default)]
    pub level: String,
    /// Log file, stdout when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Prefix lines with timestamps.
    #[serde(default)]
    pub timestamp: bool,
    /// Disable engine logging.
    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,
}

/// Management API and cache file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experimental {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clash_api: Option<ClashApi>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_file: Option<CacheFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClashApi {
    pub external_controller: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFile {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

// ---------------------------------------------------------------------------
// Inbounds
// ---------------------------------------------------------------------------

/// A listener, keyed by engine type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Tun(TunInbound),
    Mixed(MixedInbound),
    Direct(DirectInbound),
}

impl Inbound {
    pub fn tag(&self) -> &str {
        match self {
            Inbound::Tun(t) => &t.tag,
            Inbound::Mixed(m) => &m.tag,
            Inbound::Direct(d) => &d.tag,
        }
    }

    pub fn is_tun(&self) -> bool {
        matches!(self, Inbound::Tun(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunInbound {
    pub tag: String,
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub auto_route: bool,
    #[serde(default)]
    pub strict_route: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub endpoint_independent_nat: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stack: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sniff: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sniff_override_destination: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_package: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MixedInbound {
    pub tag: String,
    pub listen: String,
    pub listen_port: u16,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sniff: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sniff_override_destination: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub set_system_proxy: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectInbound {
    pub tag: String,
    pub listen: String,
    pub listen_port: u16,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Outbounds
// ---------------------------------------------------------------------------

/// Outbound protocol type.
///
/// Unknown engine types round-trip through [`OutboundKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum OutboundKind {
    #[default]
    Direct,
    Block,
    Dns,
    Selector,
    UrlTest,
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    WireGuard,
    Hysteria,
    Hysteria2,
    Tuic,
    Socks,
    Http,
    Ssh,
    ShadowTls,
    Other(String),
}

impl OutboundKind {
    pub fn as_str(&self) -> &str {
        match self {
            OutboundKind::Direct => "direct",
            OutboundKind::Block => "block",
            OutboundKind::Dns => "dns",
            OutboundKind::Selector => "selector",
            OutboundKind::UrlTest => "urltest",
            OutboundKind::Vmess => "vmess",
            OutboundKind::Vless => "vless",
            OutboundKind::Trojan => "trojan",
            OutboundKind::Shadowsocks => "shadowsocks",
            OutboundKind::WireGuard => "wireguard",
            OutboundKind::Hysteria => "hysteria",
            OutboundKind::Hysteria2 => "hysteria2",
            OutboundKind::Tuic => "tuic",
            OutboundKind::Socks => "socks",
            OutboundKind::Http => "http",
            OutboundKind::Ssh => "ssh",
            OutboundKind::ShadowTls => "shadowtls",
            OutboundKind::Other(s) => s,
        }
    }

    /// Group and pseudo outbounds the patcher leaves untouched.
    pub fn is_passthrough(&self) -> bool {
        matches!(
            self,
            OutboundKind::Selector
                | OutboundKind::UrlTest
                | OutboundKind::Block
                | OutboundKind::Dns
                | OutboundKind::Direct
        )
    }

    /// Protocols that accept stream multiplexing.
    pub fn supports_mux(&self) -> bool {
        matches!(
            self,
            OutboundKind::Vmess | OutboundKind::Vless | OutboundKind::Trojan | OutboundKind::Shadowsocks
        )
    }
}

impl From<String> for OutboundKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "direct" => OutboundKind::Direct,
            "block" => OutboundKind::Block,
            "dns" => OutboundKind::Dns,
            "selector" => OutboundKind::Selector,
            "urltest" => OutboundKind::UrlTest,
            "vmess" => OutboundKind::Vmess,
            "vless" => OutboundKind::Vless,
            "trojan" => OutboundKind::Trojan,
            "shadowsocks" => OutboundKind::Shadowsocks,
            "wireguard" => OutboundKind::WireGuard,
            "hysteria" => OutboundKind::Hysteria,
            "hysteria2" => OutboundKind::Hysteria2,
            "tuic" => OutboundKind::Tuic,
            "socks" => OutboundKind::Socks,
            "http" => OutboundKind::Http,
            "ssh" => OutboundKind::Ssh,
            "shadowtls" => OutboundKind::ShadowTls,
            _ => OutboundKind::Other(s),
        }
    }
}

impl From<OutboundKind> for String {
    fn from(k: OutboundKind) -> Self {
        k.as_str().to_string()
    }
}

impl fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for OutboundKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OutboundKind {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(d).map(OutboundKind::from)
    }
}

/// One outbound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detour: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplex: Option<Multiplex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_fast_open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_fragment: Option<TlsFragment>,
    /// Overlay marker, expanded by the patcher and never emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warp: Option<WarpMarker>,
    #[serde(flatten)]
    pub group: GroupFields,
    #[serde(flatten)]
    pub wireguard: WireGuardFields,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Outbound {
    /// A bare outbound of `kind`.
    pub fn new(kind: OutboundKind, tag: impl Into<String>) -> Self {
        Self {
            kind,
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// True for TLS camouflaged as "reality".
    pub fn is_reality(&self) -> bool {
        self.tls
            .as_ref()
            .and_then(|t| t.reality.as_ref())
            .is_some_and(|r| r.enabled)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.enabled)
    }

    /// Transport type, `None` for raw TCP.
    pub fn transport_type(&self) -> Option<&str> {
        self.transport.as_ref().map(|t| t.kind.as_str())
    }
}

/// Selector / URL-test group fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFields {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbounds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_exist_connections: Option<bool>,
}

/// WireGuard-specific fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardFields {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_address: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake_packets: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake_packets_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake_packets_delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake_packets_mode: Option<String>,
}

/// In-document request for a WARP overlay in place of this outbound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpMarker {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detour: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fake_packets: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fake_packets_size: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fake_packets_delay: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fake_packets_mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality: Option<Reality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utls: Option<Utls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_tricks: Option<TlsTrickFields>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reality {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utls {
    pub enabled: bool,
    #[serde(default)]
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsTrickFields {
    #[serde(default, skip_serializing_if = "is_false")]
    pub mixedcase_sni: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub padding_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub padding_size: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multiplex {
    pub enabled: bool,
    #[serde(default)]
    pub padding: bool,
    #[serde(default)]
    pub max_streams: u32,
    #[serde(default)]
    pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFragment {
    pub enabled: bool,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub sleep: String,
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<DnsServer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<DnsRule>,
    #[serde(default, rename = "final", skip_serializing_if = "Option::is_none")]
    pub final_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub independent_cache: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DnsOptions {
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
            && self.rules.is_empty()
            && self.final_server.is_none()
            && self.extra.is_empty()
    }

    pub fn server(&self, tag: &str) -> Option<&DnsServer> {
        self.servers.iter().find(|s| s.tag == tag)
    }
}

/// Resolver transport, in the engine's spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsTransport {
    Local,
    Udp,
    Tcp,
    Tls,
    Https,
    H3,
    Quic,
    Fakeip,
    Hosts,
}

impl DnsTransport {
    /// Default port for network transports.
    pub fn default_port(self) -> Option<u16> {
        match self {
            DnsTransport::Udp | DnsTransport::Tcp => Some(53),
            DnsTransport::Tls => Some(853),
            DnsTransport::Https | DnsTransport::H3 | DnsTransport::Quic => Some(443),
            DnsTransport::Local | DnsTransport::Fakeip | DnsTransport::Hosts => None,
        }
    }
}

/// Which resolver looks up another server's own hostname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainResolver {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsServer {
    #[serde(rename = "type")]
    pub transport: DnsTransport,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detour: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_resolver: Option<DomainResolver>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inet4_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inet6_range: Option<String>,
    /// Static records for `hosts` servers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub predefined: BTreeMap<String, Vec<String>>,
}

impl DnsServer {
    pub fn new(transport: DnsTransport, tag: impl Into<String>) -> Self {
        Self {
            transport,
            tag: tag.into(),
            server: None,
            server_port: None,
            path: None,
            detour: None,
            domain_resolver: None,
            strategy: None,
            inet4_range: None,
            inet6_range: None,
            predefined: BTreeMap::new(),
        }
    }
}

/// Matchers shared by route and DNS rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbound: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_suffix: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_keyword: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_cidr: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_is_private: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_set: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub package_name: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub process_name: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RuleMatch {
    pub fn inbound(tags: &[&str]) -> Self {
        Self {
            inbound: tags.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn port(ports: &[u16]) -> Self {
        Self {
            port: ports.to_vec(),
            ..Self::default()
        }
    }

    pub fn domains(domains: Vec<String>) -> Self {
        Self {
            domain: domains,
            ..Self::default()
        }
    }

    pub fn rule_sets(tags: Vec<String>) -> Self {
        Self {
            rule_set: tags,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(flatten)]
    pub matcher: RuleMatch,
    pub outbound: String,
}

impl RouteRule {
    pub fn new(matcher: RuleMatch, outbound: impl Into<String>) -> Self {
        Self {
            matcher,
            outbound: outbound.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsRule {
    #[serde(flatten)]
    pub matcher: RuleMatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_ttl: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_cache: Option<bool>,
}

impl DnsRule {
    /// Resolve matches with `server`.
    pub fn route(matcher: RuleMatch, server: impl Into<String>) -> Self {
        Self {
            matcher,
            action: Some("route".to_string()),
            server: Some(server.into()),
            ..Self::default()
        }
    }

    /// Answer matches with a fixed response code.
    pub fn predefined(matcher: RuleMatch, rcode: impl Into<String>) -> Self {
        Self {
            matcher,
            action: Some("predefined".to_string()),
            rcode: Some(rcode.into()),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RouteRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_set: Vec<RuleSet>,
    #[serde(default, rename = "final", skip_serializing_if = "Option::is_none")]
    pub final_outbound: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_detect_interface: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_domain_resolver: Option<DomainResolver>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RouteOptions {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
            && self.rule_set.is_empty()
            && self.final_outbound.is_none()
            && !self.auto_detect_interface
            && self.default_domain_resolver.is_none()
            && self.extra.is_empty()
    }
}

/// A remote binary rule-set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    pub format: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub download_detour: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub update_interval: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"{
        "outbounds": [
            {"type": "vless", "tag": "de-1", "server": "de.example.com", "server_port": 443,
             "uuid": "00000000-0000-0000-0000-000000000000",
             "tls": {"enabled": true, "server_name": "de.example.com", "reality": {"enabled": true, "public_key": "abc"}},
             "transport": {"type": "grpc", "service_name": "x"}},
            {"type": "naive", "tag": "n", "custom": [1, 2]},
            {"type": "wireguard", "tag": "wg", "warp": {"key": "p1", "host": "auto"}}
        ],
        "ntp": {"enabled": true}
    }"#;

    #[test]
    fn test_parse_keeps_unknown_keys() {
        let doc = Document::from_json_str(BASE).unwrap();
        assert_eq!(doc.outbounds.len(), 3);
        let vless = &doc.outbounds[0];
        assert_eq!(vless.kind, OutboundKind::Vless);
        assert!(vless.is_reality());
        assert_eq!(vless.transport_type(), Some("grpc"));
        assert!(vless.extra.contains_key("uuid"));
        assert_eq!(doc.outbounds[1].kind, OutboundKind::Other("naive".into()));
        assert!(doc.outbounds[2].warp.is_some());
        assert!(doc.extra.contains_key("ntp"));

        let out: Value = serde_json::from_str(&doc.to_json_pretty().unwrap()).unwrap();
        assert_eq!(out["outbounds"][0]["uuid"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(out["outbounds"][0]["tls"]["reality"]["public_key"], "abc");
        assert_eq!(out["outbounds"][1]["type"], "naive");
        assert_eq!(out["outbounds"][1]["custom"][1], 2);
        assert_eq!(out["ntp"]["enabled"], true);
    }

    #[test]
    fn test_invalid_base_is_config_build_error() {
        let err = Document::from_json_str(r#"{"outbounds": 5}"#).unwrap_err();
        assert!(matches!(err, Error::ConfigBuild(_)));
    }

    #[test]
    fn test_inbound_tagging() {
        let json = r#"{"type": "mixed", "tag": "mixed-in", "listen": "127.0.0.1", "listen_port": 12334}"#;
        let inbound: Inbound = serde_json::from_str(json).unwrap();
        assert_eq!(inbound.tag(), "mixed-in");
        assert!(!inbound.is_tun());
    }

    #[test]
    fn test_dns_rule_shapes() {
        let rule = DnsRule::predefined(RuleMatch::domains(vec!["ads.example".into()]), "NXDOMAIN");
        let v = serde_json::to_value(&rule).unwrap();
        assert_eq!(v["action"], "predefined");
        assert_eq!(v["rcode"], "NXDOMAIN");
        assert_eq!(v["domain"][0], "ads.example");
        assert!(v.get("server").is_none());
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("current-config.json");
        let doc = Document::from_json_str(BASE).unwrap();
        doc.write_to_file(&path).unwrap();
        let back = Document::from_file(&path).unwrap();
        assert_eq!(back, doc);
    }
}
