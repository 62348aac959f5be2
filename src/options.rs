//! Options Model: every user-settable toggle the synthesizer reads.
//!
//! [`Options`] is pure data. It is produced once per synthesis call, either
//! from compiled-in defaults, a typed settings document, or a legacy flat
//! preference map written by older front ends, and is read-only afterwards.
//!
//! # Settings Ingestion
//!
//! ```text
//!   settings.json
//!        │
//!        ▼
//!   ┌──────────────────┐  any known typed key   ┌──────────────────┐
//!   │  JSON object     │───────────────────────▶│  typed merge     │
//!   └────────┬─────────┘                        └────────┬─────────┘
//!            │ only "flutter.*" / legacy keys            │
//!            ▼                                           │
//!   ┌──────────────────┐  coerce "true"/"42",            │
//!   │  legacy mapping  │  strategy aliases, URL scheme   │
//!   └────────┬─────────┘─────────────────────────────────┤
//!            ▼                                           ▼
//!                    defaults ◄── merged key by key (bad values skipped)
//! ```
//!
//! Unknown keys are ignored and values that do not fit the field's type
//! keep the default; neither is an error.
//!
//! # Example
//!
//! ```rust
//! use rostovvpn_rs::Options;
//!
//! let legacy = r#"{"flutter.region": "de", "flutter.block-ads": "true", "flutter.unknown": 1}"#;
//! let options = Options::from_json_str(legacy).unwrap();
//! assert_eq!(options.region, "de");
//! assert!(options.block_ads);
//! ```
//!
//! # See Also
//!
//! - [`crate::synth::Synthesizer`] - Consumes the options
//! - [`crate::config::Config`] - Application (not user) configuration

use std::path::Path;

use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default remote resolver, reached through the proxy.
pub const DEFAULT_REMOTE_DNS: &str = "https://1.1.1.1/dns-query";
/// Default bootstrap resolver, always reached directly.
pub const DEFAULT_DIRECT_DNS: &str = "1.1.1.1";
/// Region value that disables region rule-sets.
pub const REGION_OTHER: &str = "other";

/// Platform the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Windows, macOS or Linux desktop.
    #[default]
    Desktop,
    /// Android, where the engine owns the VPN service TUN.
    Android,
    /// iOS network extension.
    Ios,
}

impl Platform {
    /// Returns the platform this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else {
            Platform::Desktop
        }
    }

    /// Mobile platforms capture all traffic in a TUN owned by the engine.
    pub fn is_mobile(self) -> bool {
        matches!(self, Platform::Android | Platform::Ios)
    }
}

/// How a resolver or route picks between A and AAAA answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStrategy {
    /// Leave the engine's default.
    #[default]
    AsIs,
    /// Prefer IPv4, fall back to IPv6.
    PreferIpv4,
    /// Prefer IPv6, fall back to IPv4.
    PreferIpv6,
    /// IPv4 only.
    Ipv4Only,
    /// IPv6 only.
    Ipv6Only,
}

impl DomainStrategy {
    /// Parses the spellings older front ends wrote.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "as_is" | "asis" | "as-is" => Some(DomainStrategy::AsIs),
            "prefer_ipv4" | "prefer-ipv4" | "ipv4_prefer" => Some(DomainStrategy::PreferIpv4),
            "prefer_ipv6" | "prefer-ipv6" | "ipv6_prefer" => Some(DomainStrategy::PreferIpv6),
            "ipv4_only" | "ipv4-only" | "force_ipv4" | "ipv4" => Some(DomainStrategy::Ipv4Only),
            "ipv6_only" | "ipv6-only" | "force_ipv6" | "ipv6" => Some(DomainStrategy::Ipv6Only),
            _ => None,
        }
    }

    /// The engine's spelling, `None` for [`DomainStrategy::AsIs`].
    pub fn as_engine_str(self) -> Option<&'static str> {
        match self {
            DomainStrategy::AsIs => None,
            DomainStrategy::PreferIpv4 => Some("prefer_ipv4"),
            DomainStrategy::PreferIpv6 => Some("prefer_ipv6"),
            DomainStrategy::Ipv4Only => Some("ipv4_only"),
            DomainStrategy::Ipv6Only => Some("ipv6_only"),
        }
    }
}

/// The user's IPv6 connectivity preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ipv6Mode {
    /// Never use IPv6.
    #[default]
    Ipv4Only,
    /// Use both, prefer IPv4.
    PreferIpv4,
    /// Use both, prefer IPv6.
    PreferIpv6,
    /// Only IPv6.
    Ipv6Only,
}

impl Ipv6Mode {
    /// True unless IPv6 is disabled.
    pub fn allows_ipv6(self) -> bool {
        !matches!(self, Ipv6Mode::Ipv4Only)
    }

    /// The route strategy implied by this mode.
    pub fn domain_strategy(self) -> DomainStrategy {
        match self {
            Ipv6Mode::Ipv4Only => DomainStrategy::Ipv4Only,
            Ipv6Mode::PreferIpv4 => DomainStrategy::PreferIpv4,
            Ipv6Mode::PreferIpv6 => DomainStrategy::PreferIpv6,
            Ipv6Mode::Ipv6Only => DomainStrategy::Ipv6Only,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match DomainStrategy::parse(s)? {
            DomainStrategy::AsIs | DomainStrategy::Ipv4Only => Some(Ipv6Mode::Ipv4Only),
            DomainStrategy::PreferIpv4 => Some(Ipv6Mode::PreferIpv4),
            DomainStrategy::PreferIpv6 => Some(Ipv6Mode::PreferIpv6),
            DomainStrategy::Ipv6Only => Some(Ipv6Mode::Ipv6Only),
        }
    }
}

/// What a user rule does with matching traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Send through the main selector.
    #[default]
    Proxy,
    /// Send directly.
    Bypass,
    /// Reject.
    Block,
}

/// A user-defined routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UserRule {
    /// Exact domains.
    pub domain: Vec<String>,
    /// Domain suffixes.
    pub domain_suffix: Vec<String>,
    /// Domain keywords.
    pub domain_keyword: Vec<String>,
    /// Destination CIDRs.
    pub ip_cidr: Vec<String>,
    /// Destination ports.
    pub port: Vec<u16>,
    /// `tcp` or `udp`, empty for both.
    pub network: String,
    /// What to do with matches.
    pub action: RuleAction,
}

impl UserRule {
    /// True if the rule has a domain matcher, so it can also steer DNS.
    pub fn has_domain_matcher(&self) -> bool {
        !(self.domain.is_empty() && self.domain_suffix.is_empty() && self.domain_keyword.is_empty())
    }

    /// True if the rule matches nothing.
    pub fn is_empty(&self) -> bool {
        !self.has_domain_matcher() && self.ip_cidr.is_empty() && self.port.is_empty()
    }
}

/// Stream multiplexing applied to protocol outbounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MuxOptions {
    /// Attach multiplex options at all.
    #[serde(default)]
    pub enable: bool,
    /// Enable padding frames.
    #[serde(default)]
    pub padding: bool,
    /// Maximum streams per connection.
    #[serde(default = "default_mux_max_streams")]
    pub max_streams: u32,
    /// `h2mux`, `smux` or `yamux`.
    #[serde(default = "default_mux_protocol")]
    pub protocol: String,
}

fn default_mux_max_streams() -> u32 {
    8
}
fn default_mux_protocol() -> String {
    "h2mux".to_string()
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            enable: false,
            padding: false,
            max_streams: default_mux_max_streams(),
            protocol: default_mux_protocol(),
        }
    }
}

/// TLS handshake evasion knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsTricks {
    /// Fragment the ClientHello.
    #[serde(default)]
    pub enable_fragment: bool,
    /// Fragment size range, `lo-hi` bytes.
    #[serde(default = "default_fragment_size")]
    pub fragment_size: String,
    /// Sleep between fragments, `lo-hi` milliseconds.
    #[serde(default = "default_fragment_sleep")]
    pub fragment_sleep: String,
    /// Randomize SNI letter case.
    #[serde(default)]
    pub mixed_sni_case: bool,
    /// Pad the ClientHello.
    #[serde(default)]
    pub enable_padding: bool,
    /// Padding size range, `lo-hi` bytes.
    #[serde(default = "default_padding_size")]
    pub padding_size: String,
}

fn default_fragment_size() -> String {
    "10-30".to_string()
}
fn default_fragment_sleep() -> String {
    "2-8".to_string()
}
fn default_padding_size() -> String {
    "1-1500".to_string()
}

impl Default for TlsTricks {
    fn default() -> Self {
        Self {
            enable_fragment: false,
            fragment_size: default_fragment_size(),
            fragment_sleep: default_fragment_sleep(),
            mixed_sni_case: false,
            enable_padding: false,
            padding_size: default_padding_size(),
        }
    }
}

impl TlsTricks {
    /// True if any trick is switched on.
    pub fn any_enabled(&self) -> bool {
        self.enable_fragment || self.mixed_sni_case || self.enable_padding
    }
}

/// Global WARP placement relative to the user's proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarpMode {
    /// No global overlay; per-outbound markers still expand.
    #[default]
    None,
    /// WARP tunnels through the proxy selector and becomes the route final.
    WarpOverProxy,
    /// Proxies tunnel through WARP, which goes out directly.
    ProxyOverWarp,
}

/// WARP overlay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WarpOptions {
    /// Placement of the global overlay.
    #[serde(default)]
    pub mode: WarpMode,
    /// Identity key: `p1`, `p2`, a 26-character license or any custom name.
    #[serde(default = "default_warp_key")]
    pub wireguard_config_key: String,
    /// Endpoint host or one of the sentinels `auto`, `auto4`, `auto6`, `random`.
    #[serde(default = "default_warp_clean_ip")]
    pub clean_ip: String,
    /// Endpoint port, 0 for random.
    #[serde(default)]
    pub clean_port: u16,
    /// Fake packet count range.
    #[serde(default)]
    pub noise: String,
    /// Fake packet size range.
    #[serde(default)]
    pub noise_size: String,
    /// Fake packet delay range.
    #[serde(default)]
    pub noise_delay: String,
    /// Fake packet mode.
    #[serde(default)]
    pub noise_mode: String,
}

fn default_warp_key() -> String {
    "p1".to_string()
}
fn default_warp_clean_ip() -> String {
    "auto".to_string()
}

impl Default for WarpOptions {
    fn default() -> Self {
        Self {
            mode: WarpMode::None,
            wireguard_config_key: default_warp_key(),
            clean_ip: default_warp_clean_ip(),
            clean_port: 0,
            noise: String::new(),
            noise_size: String::new(),
            noise_delay: String::new(),
            noise_mode: String::new(),
        }
    }
}

/// Every user-settable toggle.
///
/// Keys are kebab-case in settings documents. All fields default; see
/// [`Options::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Options {
    /// Two-letter region code, or `other`.
    pub region: String,
    /// Route ad/malware rule-sets to block.
    pub block_ads: bool,
    /// Send private-range destinations directly.
    pub bypass_lan: bool,
    /// Bind the mixed inbound on all interfaces.
    pub allow_connection_from_lan: bool,
    /// Let the engine set the OS system proxy to the mixed inbound.
    pub set_system_proxy: bool,
    /// Engine log level.
    pub log_level: String,
    /// Mixed (HTTP+SOCKS) inbound port.
    pub mixed_port: u16,
    /// Transparent-proxy port used by the tunnel service.
    pub tproxy_port: u16,
    /// DNS-capture inbound port.
    pub local_dns_port: u16,
    /// Management API port.
    pub clash_api_port: u16,
    /// Expose the management API.
    pub enable_clash_api: bool,
    /// Management API secret, random when empty.
    pub clash_api_secret: String,
    /// Remote resolver address.
    pub remote_dns_address: String,
    /// Remote resolver strategy.
    pub remote_dns_domain_strategy: DomainStrategy,
    /// Bootstrap resolver address.
    pub direct_dns_address: String,
    /// Bootstrap resolver strategy.
    pub direct_dns_domain_strategy: DomainStrategy,
    /// Keep a separate DNS cache per server.
    pub independent_dns_cache: bool,
    /// Answer TUN queries from a fake-IP pool.
    pub enable_fake_dns: bool,
    /// Fake-IP IPv4 pool.
    pub fake_ip_v4_range: String,
    /// Fake-IP IPv6 pool.
    pub fake_ip_v6_range: String,
    /// Emit DNS rules at all.
    pub enable_dns_routing: bool,
    /// Sniff and override destinations on inbounds.
    pub resolve_destination: bool,
    /// IPv6 connectivity preference.
    pub ipv6_mode: Ipv6Mode,
    /// Explicit route strategy, derived from `ipv6_mode` when unset.
    pub route_domain_strategy: Option<DomainStrategy>,
    /// TUN MTU.
    pub mtu: u32,
    /// Strict routing for TUN.
    pub strict_route: bool,
    /// TUN stack: `system`, `gvisor` or `mixed`.
    pub tun_stack: String,
    /// Capture traffic through the privileged tunnel service.
    pub enable_tun_service: bool,
    /// URL probed by the health-check group.
    pub connection_test_url: String,
    /// Health-check interval in seconds.
    pub url_test_interval: u64,
    /// Health-check tolerance in milliseconds.
    pub url_test_tolerance: u32,
    /// Skip certificate verification on TLS outbounds.
    pub allow_insecure: bool,
    /// Copy passthrough sections of the base document.
    pub full_config: bool,
    /// Target platform.
    pub platform: Platform,
    /// Android packages that bypass the tunnel.
    pub excluded_packages: Vec<String>,
    /// User routing rules, evaluated in order.
    pub rules: Vec<UserRule>,
    /// Multiplexing.
    pub mux: MuxOptions,
    /// TLS evasion.
    pub tls_tricks: TlsTricks,
    /// WARP overlay.
    pub warp: WarpOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            region: REGION_OTHER.to_string(),
            block_ads: false,
            bypass_lan: false,
            allow_connection_from_lan: false,
            set_system_proxy: false,
            log_level: "warn".to_string(),
            mixed_port: 12334,
            tproxy_port: 12335,
            local_dns_port: 16450,
            clash_api_port: 16756,
            enable_clash_api: true,
            clash_api_secret: String::new(),
            remote_dns_address: DEFAULT_REMOTE_DNS.to_string(),
            remote_dns_domain_strategy: DomainStrategy::AsIs,
            direct_dns_address: DEFAULT_DIRECT_DNS.to_string(),
            direct_dns_domain_strategy: DomainStrategy::AsIs,
            independent_dns_cache: true,
            enable_fake_dns: false,
            fake_ip_v4_range: "198.18.0.0/15".to_string(),
            fake_ip_v6_range: "fc00::/18".to_string(),
            enable_dns_routing: true,
            resolve_destination: false,
            ipv6_mode: Ipv6Mode::Ipv4Only,
            route_domain_strategy: None,
            mtu: 9000,
            strict_route: true,
            tun_stack: "mixed".to_string(),
            enable_tun_service: false,
            connection_test_url: "http://cp.cloudflare.com".to_string(),
            url_test_interval: 600,
            url_test_tolerance: 1,
            allow_insecure: false,
            full_config: false,
            platform: Platform::current(),
            excluded_packages: Vec::new(),
            rules: Vec::new(),
            mux: MuxOptions::default(),
            tls_tricks: TlsTricks::default(),
            warp: WarpOptions::default(),
        }
    }
}

impl Options {
    /// Parses a settings document, typed or legacy, over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the text is not JSON and
    /// [`Error::Config`] if it is JSON but not an object.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(s)?;
        match value {
            Value::Object(map) => Self::from_map(map),
            Value::Null => Ok(Self::default()),
            other => Err(Error::Config(format!(
                "settings must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Merges a settings object over the defaults.
    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        let known = typed_keys()?;
        let is_typed = map
            .keys()
            .any(|k| !k.starts_with(LEGACY_PREFIX) && known.contains(k));
        let overlay = if is_typed {
            map
        } else {
            debug!("settings look like a legacy preference map");
            legacy_to_typed(&map)
        };
        merge_over_defaults(overlay)
    }

    /// True when the engine cannot rely on the proxy for its own bootstrap:
    /// mobile platforms and tunnel-service mode capture all traffic.
    pub fn is_constrained(&self) -> bool {
        self.platform.is_mobile() || self.enable_tun_service
    }

    /// The route strategy, explicit or derived from [`Options::ipv6_mode`].
    pub fn effective_route_strategy(&self) -> DomainStrategy {
        self.route_domain_strategy
            .unwrap_or_else(|| self.ipv6_mode.domain_strategy())
    }

    /// Parsed fake-IP pools.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if either range is not a CIDR of the right family.
    pub fn fake_ip_ranges(&self) -> Result<(Ipv4Network, Ipv6Network)> {
        let v4 = self
            .fake_ip_v4_range
            .parse::<Ipv4Network>()
            .map_err(|e| Error::Config(format!("fake_ip_v4_range: {}", e)))?;
        let v6 = self
            .fake_ip_v6_range
            .parse::<Ipv6Network>()
            .map_err(|e| Error::Config(format!("fake_ip_v6_range: {}", e)))?;
        Ok((v4, v6))
    }

    /// Checks ports, ranges and enumerated strings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let mut ports = vec![
            ("mixed_port", self.mixed_port),
            ("tproxy_port", self.tproxy_port),
            ("local_dns_port", self.local_dns_port),
        ];
        if self.enable_clash_api {
            ports.push(("clash_api_port", self.clash_api_port));
        }
        for (name, port) in &ports {
            if *port == 0 {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }
        for (i, (a, pa)) in ports.iter().enumerate() {
            for (b, pb) in ports.iter().skip(i + 1) {
                if pa == pb {
                    return Err(Error::Config(format!(
                        "{} and {} both use port {}",
                        a, b, pa
                    )));
                }
            }
        }

        let region_ok = self.region == REGION_OTHER
            || (self.region.len() == 2 && self.region.chars().all(|c| c.is_ascii_alphabetic()));
        if !region_ok {
            return Err(Error::Config(format!("invalid region: {}", self.region)));
        }

        if !matches!(self.tun_stack.as_str(), "system" | "gvisor" | "mixed") {
            return Err(Error::Config(format!("invalid tun_stack: {}", self.tun_stack)));
        }
        if self.url_test_interval == 0 {
            return Err(Error::Config("url_test_interval must be positive".to_string()));
        }
        if !self.connection_test_url.contains("://") {
            return Err(Error::Config(format!(
                "connection_test_url needs a scheme: {}",
                self.connection_test_url
            )));
        }

        let t = &self.tls_tricks;
        for (name, value) in [
            ("tls_tricks.fragment_size", &t.fragment_size),
            ("tls_tricks.fragment_sleep", &t.fragment_sleep),
            ("tls_tricks.padding_size", &t.padding_size),
        ] {
            if parse_range(value).is_none() {
                return Err(Error::Config(format!("{} is not a range: {}", name, value)));
            }
        }
        for (name, value) in [
            ("warp.noise", &self.warp.noise),
            ("warp.noise_size", &self.warp.noise_size),
            ("warp.noise_delay", &self.warp.noise_delay),
        ] {
            if !value.is_empty() && parse_range(value).is_none() {
                return Err(Error::Config(format!("{} is not a range: {}", name, value)));
            }
        }

        self.fake_ip_ranges()?;
        Ok(())
    }
}

/// Loads settings from `path`, falling back to defaults.
///
/// A missing file yields the defaults. A file that is not valid JSON is
/// logged and also yields the defaults, so a corrupt settings file never
/// prevents the client from starting.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file exists but cannot be read.
pub fn load_settings(path: &Path) -> Result<Options> {
    if !path.exists() {
        debug!(path = %path.display(), "no settings file, using defaults");
        return Ok(Options::default());
    }
    let content = std::fs::read_to_string(path)?;
    match Options::from_json_str(&content) {
        Ok(options) => Ok(options),
        Err(e) => {
            warn!(path = %path.display(), "ignoring unreadable settings: {}", e);
            Ok(Options::default())
        }
    }
}

/// Parses `lo-hi` (or a single number) into an inclusive range.
pub fn parse_range(s: &str) -> Option<(u32, u32)> {
    let s = s.trim();
    let (lo, hi) = match s.split_once('-') {
        Some((lo, hi)) => (lo.trim().parse().ok()?, hi.trim().parse().ok()?),
        None => {
            let v = s.parse().ok()?;
            (v, v)
        }
    };
    (lo <= hi).then_some((lo, hi))
}

const LEGACY_PREFIX: &str = "flutter.";

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn typed_keys() -> Result<Vec<String>> {
    match serde_json::to_value(Options::default())? {
        Value::Object(map) => Ok(map.keys().cloned().collect()),
        _ => Ok(Vec::new()),
    }
}

/// Applies `overlay` key by key so one bad value cannot discard the rest.
fn merge_over_defaults(overlay: Map<String, Value>) -> Result<Options> {
    let mut base = match serde_json::to_value(Options::default())? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, value) in overlay {
        if !base.contains_key(&key) {
            continue;
        }
        let mut candidate = base.clone();
        candidate.insert(key.clone(), value);
        match serde_json::from_value::<Options>(Value::Object(candidate.clone())) {
            Ok(_) => base = candidate,
            Err(e) => warn!(key = %key, "ignoring setting: {}", e),
        }
    }
    Ok(serde_json::from_value(Value::Object(base))?)
}

#[derive(Clone, Copy)]
enum Coerce {
    Bool,
    Int,
    Str,
    Url,
    Strategy,
    Ipv6Mode,
    ServiceMode,
}

/// Legacy key → (typed path, coercion).
const LEGACY_KEYS: &[(&str, &[&str], Coerce)] = &[
    ("region", &["region"], Coerce::Str),
    ("block-ads", &["block-ads"], Coerce::Bool),
    ("bypass-lan", &["bypass-lan"], Coerce::Bool),
    ("allow-connection-from-lan", &["allow-connection-from-lan"], Coerce::Bool),
    ("service-mode", &[], Coerce::ServiceMode),
    ("log-level", &["log-level"], Coerce::Str),
    ("mixed-port", &["mixed-port"], Coerce::Int),
    ("tproxy-port", &["tproxy-port"], Coerce::Int),
    ("local-dns-port", &["local-dns-port"], Coerce::Int),
    ("clash-api-port", &["clash-api-port"], Coerce::Int),
    ("enable-clash-api", &["enable-clash-api"], Coerce::Bool),
    ("remote-dns-address", &["remote-dns-address"], Coerce::Str),
    ("remote-dns-domain-strategy", &["remote-dns-domain-strategy"], Coerce::Strategy),
    ("direct-dns-address", &["direct-dns-address"], Coerce::Str),
    ("direct-dns-domain-strategy", &["direct-dns-domain-strategy"], Coerce::Strategy),
    ("ipv6-mode", &["ipv6-mode"], Coerce::Ipv6Mode),
    ("enable-dns-routing", &["enable-dns-routing"], Coerce::Bool),
    ("resolve-destination", &["resolve-destination"], Coerce::Bool),
    ("enable-fake-dns", &["enable-fake-dns"], Coerce::Bool),
    ("connection-test-url", &["connection-test-url"], Coerce::Url),
    ("url-test-interval", &["url-test-interval"], Coerce::Int),
    ("strict-route", &["strict-route"], Coerce::Bool),
    ("tun-stack", &["tun-stack"], Coerce::Str),
    ("mtu", &["mtu"], Coerce::Int),
    ("allow-insecure", &["allow-insecure"], Coerce::Bool),
    ("enable-mux", &["mux", "enable"], Coerce::Bool),
    ("mux-padding", &["mux", "padding"], Coerce::Bool),
    ("mux-max-streams", &["mux", "max-streams"], Coerce::Int),
    ("mux-protocol", &["mux", "protocol"], Coerce::Str),
    ("enable-tls-fragment", &["tls-tricks", "enable-fragment"], Coerce::Bool),
    ("tls-fragment-size", &["tls-tricks", "fragment-size"], Coerce::Str),
    ("tls-fragment-sleep", &["tls-tricks", "fragment-sleep"], Coerce::Str),
    ("enable-tls-mixed-sni-case", &["tls-tricks", "mixed-sni-case"], Coerce::Bool),
    ("enable-tls-padding", &["tls-tricks", "enable-padding"], Coerce::Bool),
    ("tls-padding-size", &["tls-tricks", "padding-size"], Coerce::Str),
    ("warp-mode", &["warp", "mode"], Coerce::Str),
    ("warp-wireguard-config-key", &["warp", "wireguard-config-key"], Coerce::Str),
    ("warp-clean-ip", &["warp", "clean-ip"], Coerce::Str),
    ("warp-port", &["warp", "clean-port"], Coerce::Int),
    ("warp-noise", &["warp", "noise"], Coerce::Str),
    ("warp-noise-size", &["warp", "noise-size"], Coerce::Str),
    ("warp-noise-delay", &["warp", "noise-delay"], Coerce::Str),
];

fn legacy_to_typed(map: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (raw_key, raw) in map {
        let key = raw_key.strip_prefix(LEGACY_PREFIX).unwrap_or(raw_key);
        let Some((_, path, coerce)) = LEGACY_KEYS.iter().find(|(k, _, _)| *k == key) else {
            continue;
        };
        match coerce {
            Coerce::ServiceMode => {
                let mode = as_string(raw).unwrap_or_default().to_ascii_lowercase();
                match mode.as_str() {
                    "vpn" | "tun" => insert_path(&mut out, &["enable-tun-service"], Value::Bool(true)),
                    "system-proxy" | "systemproxy" => {
                        insert_path(&mut out, &["set-system-proxy"], Value::Bool(true))
                    }
                    _ => {}
                }
            }
            other => {
                if let Some(value) = coerce_value(*other, raw) {
                    insert_path(&mut out, path, value);
                } else {
                    debug!(key, "legacy value has the wrong shape, keeping default");
                }
            }
        }
    }
    out
}

fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_value(coerce: Coerce, raw: &Value) -> Option<Value> {
    match coerce {
        Coerce::Bool => match raw {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            Value::Number(n) => n.as_i64().map(|i| Value::Bool(i != 0)),
            _ => None,
        },
        Coerce::Int => match raw {
            Value::Number(n) => n.as_u64().map(Value::from),
            Value::String(s) => s.trim().parse::<u64>().ok().map(Value::from),
            _ => None,
        },
        Coerce::Str => as_string(raw).map(Value::String),
        Coerce::Url => as_string(raw).map(|s| {
            let s = s.trim().to_string();
            if s.is_empty() || s.contains("://") {
                Value::String(s)
            } else {
                Value::String(format!("http://{}", s))
            }
        }),
        Coerce::Strategy => as_string(raw)
            .and_then(|s| DomainStrategy::parse(&s))
            .and_then(|s| serde_json::to_value(s).ok()),
        Coerce::Ipv6Mode => as_string(raw)
            .and_then(|s| Ipv6Mode::parse(&s))
            .and_then(|m| serde_json::to_value(m).ok()),
        Coerce::ServiceMode => None,
    }
}

fn insert_path(out: &mut Map<String, Value>, path: &[&str], value: Value) {
    match path {
        [] => {}
        [leaf] => {
            out.insert((*leaf).to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = out
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(inner) = entry {
                insert_path(inner, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_validate() {
        let options = Options::default();
        options.validate().unwrap();
        assert_eq!(options.region, "other");
        assert_eq!(options.remote_dns_address, DEFAULT_REMOTE_DNS);
        assert!(!options.enable_tun_service);
    }

    #[test]
    fn test_typed_document() {
        let json = r#"{"region": "ir", "block-ads": true, "mux": {"enable": true}, "bogus": 1}"#;
        let options = Options::from_json_str(json).unwrap();
        assert_eq!(options.region, "ir");
        assert!(options.block_ads);
        assert!(options.mux.enable);
        assert_eq!(options.mux.max_streams, 8);
    }

    #[test]
    fn test_typed_bad_value_keeps_default() {
        let json = r#"{"region": "de", "mixed-port": "not a port"}"#;
        let options = Options::from_json_str(json).unwrap();
        assert_eq!(options.region, "de");
        assert_eq!(options.mixed_port, 12334);
    }

    #[test]
    fn test_legacy_map() {
        let json = r#"{
            "flutter.region": "cn",
            "flutter.bypass-lan": "true",
            "flutter.clash-api-port": "9090",
            "flutter.connection-test-url": "www.gstatic.com/generate_204",
            "flutter.remote-dns-domain-strategy": "force_ipv4",
            "flutter.ipv6-mode": "prefer-ipv6",
            "flutter.enable-tls-fragment": true,
            "flutter.service-mode": "vpn",
            "flutter.some-ui-flag": "x"
        }"#;
        let options = Options::from_json_str(json).unwrap();
        assert_eq!(options.region, "cn");
        assert!(options.bypass_lan);
        assert_eq!(options.clash_api_port, 9090);
        assert_eq!(
            options.connection_test_url,
            "http://www.gstatic.com/generate_204"
        );
        assert_eq!(options.remote_dns_domain_strategy, DomainStrategy::Ipv4Only);
        assert_eq!(options.ipv6_mode, Ipv6Mode::PreferIpv6);
        assert!(options.tls_tricks.enable_fragment);
        assert!(options.enable_tun_service);
    }

    #[test]
    fn test_legacy_system_proxy_mode() {
        let options = Options::from_json_str(r#"{"flutter.service-mode": "system-proxy"}"#).unwrap();
        assert!(options.set_system_proxy);
        assert!(!options.enable_tun_service);
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(
            Options::from_json_str("[1,2]"),
            Err(Error::Config(_))
        ));
        assert!(matches!(Options::from_json_str("{"), Err(Error::Json(_))));
    }

    #[test]
    fn test_validate_port_collision() {
        let options = Options {
            local_dns_port: 12334,
            ..Options::default()
        };
        let err = options.validate().unwrap_err().to_string();
        assert!(err.contains("mixed_port"));
        assert!(err.contains("local_dns_port"));
    }

    #[test]
    fn test_validate_region_and_ranges() {
        let mut options = Options {
            region: "germany".to_string(),
            ..Options::default()
        };
        assert!(options.validate().is_err());
        options.region = "de".to_string();
        options.tls_tricks.fragment_size = "30-10".to_string();
        assert!(options.validate().is_err());
        options.tls_tricks.fragment_size = "10-30".to_string();
        options.fake_ip_v4_range = "fc00::/18".to_string();
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_domain_strategy_aliases() {
        assert_eq!(DomainStrategy::parse("as-is"), Some(DomainStrategy::AsIs));
        assert_eq!(DomainStrategy::parse("ipv4_prefer"), Some(DomainStrategy::PreferIpv4));
        assert_eq!(DomainStrategy::parse("FORCE_IPV6"), Some(DomainStrategy::Ipv6Only));
        assert_eq!(DomainStrategy::parse("sometimes"), None);
        assert_eq!(DomainStrategy::AsIs.as_engine_str(), None);
    }

    #[test]
    fn test_effective_route_strategy() {
        let mut options = Options::default();
        assert_eq!(options.effective_route_strategy(), DomainStrategy::Ipv4Only);
        options.ipv6_mode = Ipv6Mode::PreferIpv6;
        assert_eq!(options.effective_route_strategy(), DomainStrategy::PreferIpv6);
        options.route_domain_strategy = Some(DomainStrategy::PreferIpv4);
        assert_eq!(options.effective_route_strategy(), DomainStrategy::PreferIpv4);
    }

    #[test]
    fn test_load_settings_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_settings(&dir.path().join("nope.json")).unwrap();
        assert_eq!(missing, Options::default());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not json").unwrap();
        let corrupt = load_settings(file.path()).unwrap();
        assert_eq!(corrupt.region, "other");
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("10-30"), Some((10, 30)));
        assert_eq!(parse_range(" 5 "), Some((5, 5)));
        assert_eq!(parse_range("30-10"), None);
        assert_eq!(parse_range("a-b"), None);
    }
}
