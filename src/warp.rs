//! WARP Overlay Manager.
//!
//! Obtains WireGuard identities for the WARP overlay network, persists
//! them, and expands in-document overlay markers into real WireGuard
//! outbounds with randomized endpoints.
//!
//! # Overview
//!
//! ```text
//!   ┌─────────────────────┐  cached?  ┌─────────────────────┐
//!   │ get_or_create(key)  │──────────▶│ IdentityStore       │──▶ identity (unchanged)
//!   └──────────┬──────────┘   yes     │ warp-identities.json│
//!              │ no                   └─────────▲───────────┘
//!              ▼                                │ persist (0600, atomic)
//!   ┌─────────────────────┐  x25519 keypair     │
//!   │ Registrar::register │─────────────────────┘
//!   └─────────────────────┘  (HTTPS, out of band)
//!
//!   synthesis:  WarpMarker + cached identity ──▶ expand_overlay() ──▶ wireguard Outbound
//!                                                      │
//!                                                      └──▶ static host records
//! ```
//!
//! Identity material is generated once per logical key (`p1`, `p2`, a
//! license or any custom name) and reused until [`WarpManager::rotate`] is
//! called. Synthesis only ever reads the cache through [`IdentitySource`];
//! registration happens in [`WarpManager::prepare`] before synthesis.
//!
//! # Endpoint Selection
//!
//! | Marker host | Result |
//! |-------------|--------|
//! | `""`, `auto`, `random`, `default` | random endpoint IP, family from IPv6 mode |
//! | `auto4` / `auto6` | random IPv4 / IPv6 endpoint IP |
//! | known-blocked hostname | random placeholder domain backed by static records |
//! | anything else | kept as-is |
//!
//! Port 0 becomes a random port from the known WARP port list.
//!
//! # Security Considerations
//!
//! - Private keys and access tokens live in [`SecretString`], zeroized on
//!   drop and redacted in `Debug` output
//! - The identity store is written with 0600 permissions on Unix

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::dns::StaticHosts;
use crate::document::{Outbound, OutboundKind, WarpMarker};
use crate::error::{Error, Result};
use crate::options::Ipv6Mode;

/// File name of the identity store inside the work directory.
pub const IDENTITY_FILE: &str = "warp-identities.json";

const WARP_MTU: u32 = 1330;
const WARP_DETOURED_MTU: u32 = 1280;
const DEFAULT_FAKE_PACKETS: &str = "1-3";
const DEFAULT_FAKE_PACKETS_RANGE: &str = "10-30";
const PLACEHOLDER_SUFFIX: &str = "warp-endpoint.invalid";

/// Hostnames that censors commonly block.
pub const BLOCKED_HOSTS: &[&str] = &["engage.cloudflareclient.com"];

/// /24 networks WARP endpoints live in.
const ENDPOINT_V4: &[[u8; 3]] = &[
    [162, 159, 192],
    [162, 159, 193],
    [162, 159, 195],
    [188, 114, 96],
    [188, 114, 97],
    [188, 114, 98],
    [188, 114, 99],
];

/// /48 networks WARP endpoints live in.
const ENDPOINT_V6: &[[u16; 3]] = &[[0x2606, 0x4700, 0xd0], [0x2606, 0x4700, 0xd1]];

/// Ports WARP endpoints accept WireGuard on.
pub const WARP_PORTS: &[u16] = &[
    500, 854, 859, 864, 878, 880, 890, 891, 894, 903, 908, 928, 934, 939, 942, 943, 945, 946,
    955, 968, 987, 988, 1002, 1010, 1014, 1018, 1070, 1074, 1180, 1387, 1701, 1843, 2371, 2408,
    2506, 3138, 3476, 3581, 3854, 4177, 4198, 4233, 4500, 5279, 5956, 7103, 7152, 7156, 7281,
    7559, 8319, 8742, 8854, 8886,
];

/// A string that is zeroized on drop and never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}

/// A registered WARP device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpIdentity {
    /// Base64 X25519 private key.
    pub private_key: SecretString,
    /// Base64 public key of the WARP peer.
    pub peer_public_key: String,
    /// Interface IPv4 address, without prefix.
    pub local_address_v4: String,
    /// Interface IPv6 address, without prefix.
    pub local_address_v6: String,
    /// Base64 client ID; its first three bytes are the reserved field.
    pub client_id: String,
    /// Account identifier returned by registration.
    #[serde(default)]
    pub account_id: String,
    /// Bearer token for account updates.
    #[serde(default)]
    pub access_token: SecretString,
    /// WARP+ license applied to the account, if any.
    #[serde(default)]
    pub license: Option<String>,
    /// When the device was registered.
    pub registered_at: DateTime<Utc>,
}

impl WarpIdentity {
    /// The 3-byte reserved field derived from the client ID.
    pub fn reserved(&self) -> [u8; 3] {
        let bytes = BASE64.decode(self.client_id.trim()).unwrap_or_default();
        let mut reserved = [0u8; 3];
        for (slot, b) in reserved.iter_mut().zip(bytes.iter()) {
            *slot = *b;
        }
        reserved
    }

    /// Interface addresses in CIDR form.
    pub fn local_addresses(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.local_address_v4.is_empty() {
            out.push(format!("{}/24", self.local_address_v4));
        }
        if !self.local_address_v6.is_empty() {
            out.push(format!("{}/128", self.local_address_v6));
        }
        out
    }
}

/// The license embedded in an identity key, if any.
///
/// A bare 26-character key is a license. Keys of the form `xx_<license>`
/// (longer than 28 characters) carry one after the prefix.
pub fn license_from_key(key: &str) -> Option<String> {
    if key.len() == 26 {
        return Some(key.to_string());
    }
    if key.len() > 28 && key.as_bytes().get(2) == Some(&b'_') {
        return key.get(3..).map(String::from);
    }
    None
}

/// Generates a base64 X25519 keypair `(private, public)`.
pub fn generate_keypair() -> (SecretString, String) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let mut raw = secret.to_bytes();
    let private = SecretString::new(BASE64.encode(raw));
    raw.zeroize();
    (private, BASE64.encode(public.as_bytes()))
}

/// Result of an out-of-band registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub peer_public_key: String,
    pub local_address_v4: String,
    pub local_address_v6: String,
    pub client_id: String,
    pub account_id: String,
    pub access_token: SecretString,
    pub license: Option<String>,
}

/// Performs the registration exchange for a fresh public key.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, public_key: &str, license: Option<&str>) -> Result<Registration>;
}

/// Registers devices with the Cloudflare client API.
pub struct CloudflareRegistrar {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct RegResponse {
    id: String,
    token: String,
    config: RegConfig,
}

#[derive(Deserialize)]
struct RegConfig {
    client_id: String,
    peers: Vec<RegPeer>,
    interface: RegInterface,
}

#[derive(Deserialize)]
struct RegPeer {
    public_key: String,
}

#[derive(Deserialize)]
struct RegInterface {
    addresses: RegAddresses,
}

#[derive(Deserialize)]
struct RegAddresses {
    #[serde(default)]
    v4: String,
    #[serde(default)]
    v6: String,
}

impl CloudflareRegistrar {
    /// Production API endpoint.
    pub const DEFAULT_BASE_URL: &'static str = "https://api.cloudflareclient.com/v0a4005";

    pub fn new() -> Result<Self> {
        Self::with_base_url(Self::DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("okhttp/3.12.1")
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Warp(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Registrar for CloudflareRegistrar {
    async fn register(&self, public_key: &str, license: Option<&str>) -> Result<Registration> {
        let body = serde_json::json!({
            "install_id": "",
            "fcm_token": "",
            "tos": Utc::now().to_rfc3339(),
            "key": public_key,
            "type": "Android",
            "model": "PC",
            "locale": "en_US",
            "warp_enabled": true,
        });
        let resp = self
            .client
            .post(format!("{}/reg", self.base_url))
            .header("CF-Client-Version", "a-6.30-3596")
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Warp(format!("registration failed: {}", e)))?;
        let reg: RegResponse = resp
            .json()
            .await
            .map_err(|e| Error::Warp(format!("unexpected registration response: {}", e)))?;
        let peer = reg
            .config
            .peers
            .first()
            .ok_or_else(|| Error::Warp("registration returned no peers".to_string()))?;

        let mut applied = None;
        if let Some(license) = license {
            self.client
                .put(format!("{}/reg/{}/account", self.base_url, reg.id))
                .bearer_auth(&reg.token)
                .header("CF-Client-Version", "a-6.30-3596")
                .json(&serde_json::json!({ "license": license }))
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| Error::Warp(format!("applying license failed: {}", e)))?;
            applied = Some(license.to_string());
        }

        Ok(Registration {
            peer_public_key: peer.public_key.clone(),
            local_address_v4: reg.config.interface.addresses.v4.clone(),
            local_address_v6: reg.config.interface.addresses.v6.clone(),
            client_id: reg.config.client_id.clone(),
            account_id: reg.id,
            access_token: SecretString::new(reg.token),
            license: applied,
        })
    }
}

/// Identities keyed by logical key, persisted as JSON.
#[derive(Debug, Default)]
pub struct IdentityStore {
    path: Option<PathBuf>,
    identities: BTreeMap<String, WarpIdentity>,
}

impl IdentityStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the store at `path`, empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Warp`] if the file exists but is corrupt.
    pub fn load(path: &Path) -> Result<Self> {
        let identities = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)
                .map_err(|e| Error::Warp(format!("corrupt identity store {}: {}", path.display(), e)))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            identities,
        })
    }

    pub fn get(&self, key: &str) -> Option<&WarpIdentity> {
        self.identities.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.identities.keys().map(String::as_str)
    }

    /// Inserts and persists.
    pub fn insert(&mut self, key: &str, identity: WarpIdentity) -> Result<()> {
        self.identities.insert(key.to_string(), identity);
        self.save()
    }

    /// Removes and persists. Returns whether the key existed.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let existed = self.identities.remove(key).is_some();
        if existed {
            self.save()?;
        }
        Ok(existed)
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&self.identities)?;
        crate::fsutil::write_atomic(path, &json, 0o600)
    }
}

/// Read-only identity lookup used during synthesis.
pub trait IdentitySource {
    fn identity(&self, key: &str) -> Option<WarpIdentity>;
}

impl IdentitySource for BTreeMap<String, WarpIdentity> {
    fn identity(&self, key: &str) -> Option<WarpIdentity> {
        self.get(key).cloned()
    }
}

/// Owns the identity store and the registrar.
pub struct WarpManager {
    store: Mutex<IdentityStore>,
    registrar: Arc<dyn Registrar>,
}

impl WarpManager {
    pub fn new(store: IdentityStore, registrar: Arc<dyn Registrar>) -> Self {
        Self {
            store: Mutex::new(store),
            registrar,
        }
    }

    /// Opens `<work_dir>/warp-identities.json` with the Cloudflare registrar.
    pub fn open(work_dir: &Path) -> Result<Self> {
        let store = IdentityStore::load(&work_dir.join(IDENTITY_FILE))?;
        Ok(Self::new(store, Arc::new(CloudflareRegistrar::new()?)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdentityStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the identity for `key`, registering one if none is cached.
    ///
    /// A cached identity is returned unchanged. If two callers race, the
    /// first persisted identity wins and the other registration is dropped.
    pub async fn get_or_create_identity(&self, key: &str) -> Result<WarpIdentity> {
        if let Some(identity) = self.lock().get(key) {
            return Ok(identity.clone());
        }

        let license = license_from_key(key);
        let (private_key, public_key) = generate_keypair();
        info!(key, "registering new WARP identity");
        let reg = self.registrar.register(&public_key, license.as_deref()).await?;

        let mut store = self.lock();
        if let Some(identity) = store.get(key) {
            debug!(key, "identity appeared while registering, keeping it");
            return Ok(identity.clone());
        }
        let identity = WarpIdentity {
            private_key,
            peer_public_key: reg.peer_public_key,
            local_address_v4: reg.local_address_v4,
            local_address_v6: reg.local_address_v6,
            client_id: reg.client_id,
            account_id: reg.account_id,
            access_token: reg.access_token,
            license: reg.license,
            registered_at: Utc::now(),
        };
        store.insert(key, identity.clone())?;
        Ok(identity)
    }

    /// Ensures identities for all `keys` exist.
    pub async fn prepare<'a, I>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for key in keys {
            self.get_or_create_identity(key).await?;
        }
        Ok(())
    }

    /// Forgets the identity for `key`; the next request registers a new one.
    pub fn rotate(&self, key: &str) -> Result<bool> {
        self.lock().remove(key)
    }
}

impl IdentitySource for WarpManager {
    fn identity(&self, key: &str) -> Option<WarpIdentity> {
        self.lock().get(key).cloned()
    }
}

/// A random endpoint address from the known-good ranges.
pub fn random_endpoint_ip<R: Rng + ?Sized>(v6: bool, rng: &mut R) -> IpAddr {
    if v6 {
        let [a, b, c] = ENDPOINT_V6.choose(rng).copied().unwrap_or([0x2606, 0x4700, 0xd0]);
        let tail: [u16; 5] = rng.gen();
        IpAddr::V6(Ipv6Addr::new(a, b, c, tail[0], tail[1], tail[2], tail[3], tail[4].max(1)))
    } else {
        let [a, b, c] = ENDPOINT_V4.choose(rng).copied().unwrap_or([162, 159, 192]);
        IpAddr::V4(Ipv4Addr::new(a, b, c, rng.gen_range(1..=254)))
    }
}

/// A random port from [`WARP_PORTS`].
pub fn random_port<R: Rng + ?Sized>(rng: &mut R) -> u16 {
    WARP_PORTS.choose(rng).copied().unwrap_or(2408)
}

/// A random domain that only static host records can resolve.
pub fn placeholder_domain<R: Rng + ?Sized>(rng: &mut R) -> String {
    let label: String = (0..12)
        .map(|_| char::from(b'a' + rng.gen_range(0..26u8)))
        .collect();
    format!("{}.{}", label, PLACEHOLDER_SUFFIX)
}

fn is_sentinel(host: &str) -> bool {
    matches!(
        host.trim().to_ascii_lowercase().as_str(),
        "" | "auto" | "auto4" | "auto6" | "random" | "default"
    )
}

/// Picks the endpoint host, recording static records for placeholders.
fn resolve_endpoint<R: Rng + ?Sized>(
    host: &str,
    ipv6_mode: Ipv6Mode,
    rng: &mut R,
    hosts: &mut StaticHosts,
) -> String {
    let lower = host.trim().to_ascii_lowercase();
    let v6_allowed = ipv6_mode.allows_ipv6();
    match lower.as_str() {
        "auto4" => random_endpoint_ip(false, rng).to_string(),
        "auto6" => random_endpoint_ip(v6_allowed, rng).to_string(),
        "" | "auto" | "random" | "default" => {
            let v6 = matches!(ipv6_mode, Ipv6Mode::PreferIpv6 | Ipv6Mode::Ipv6Only);
            random_endpoint_ip(v6, rng).to_string()
        }
        h if BLOCKED_HOSTS.contains(&h) => {
            let domain = placeholder_domain(rng);
            let mut ips = vec![random_endpoint_ip(false, rng)];
            if v6_allowed {
                ips.push(random_endpoint_ip(true, rng));
            }
            hosts.insert(domain.clone(), ips);
            domain
        }
        _ => host.trim().to_string(),
    }
}

/// Expands an overlay marker into a WireGuard outbound.
///
/// `tag` and the marker's explicit detour are preserved.
pub fn expand_overlay<R: Rng + ?Sized>(
    tag: &str,
    marker: &WarpMarker,
    identity: &WarpIdentity,
    ipv6_mode: Ipv6Mode,
    rng: &mut R,
    hosts: &mut StaticHosts,
) -> Outbound {
    let sentinel = is_sentinel(&marker.host);
    let server = resolve_endpoint(&marker.host, ipv6_mode, rng, hosts);
    let port = if marker.port == 0 {
        random_port(rng)
    } else {
        marker.port
    };

    let mut fake_packets = marker.fake_packets.clone();
    if fake_packets.is_empty() && sentinel {
        fake_packets = DEFAULT_FAKE_PACKETS.to_string();
    }
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    let mut fake_size = non_empty(&marker.fake_packets_size);
    let mut fake_delay = non_empty(&marker.fake_packets_delay);
    if !fake_packets.is_empty() {
        fake_size.get_or_insert_with(|| DEFAULT_FAKE_PACKETS_RANGE.to_string());
        fake_delay.get_or_insert_with(|| DEFAULT_FAKE_PACKETS_RANGE.to_string());
    }

    let mut out = Outbound::new(OutboundKind::WireGuard, tag);
    out.server = Some(server);
    out.server_port = Some(port);
    out.detour = marker.detour.clone().filter(|d| !d.is_empty());
    out.wireguard.local_address = identity.local_addresses();
    out.wireguard.private_key = Some(identity.private_key.as_str().to_string());
    out.wireguard.peer_public_key = Some(identity.peer_public_key.clone());
    out.wireguard.reserved = Some(identity.reserved().to_vec());
    out.wireguard.mtu = Some(WARP_MTU);
    out.wireguard.fake_packets = non_empty(&fake_packets);
    out.wireguard.fake_packets_size = fake_size;
    out.wireguard.fake_packets_delay = fake_delay;
    out.wireguard.fake_packets_mode = non_empty(&marker.fake_packets_mode);

    // Nested inside another tunnel: smaller MTU, and noise would only
    // disturb the outer protocol.
    if out.detour.is_some() {
        out.wireguard.mtu = Some(WARP_DETOURED_MTU);
        out.wireguard.fake_packets = None;
        out.wireguard.fake_packets_size = None;
        out.wireguard.fake_packets_delay = None;
        out.wireguard.fake_packets_mode = None;
    }
    out
}
