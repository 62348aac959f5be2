//! Config Synthesizer.
//!
//! Turns [`Options`] plus an already-converted base [`Document`] into one
//! finished engine document, and decides whether the privileged tunnel
//! service has to be activated.
//!
//! # Pipeline
//!
//! ```text
//!   Options ─┐
//!            ├─▶ 1 passthrough (full_config only)
//!   base ────┘   2 management API, log, inbounds
//!                3 DNS topology       ◀── server hostnames, static hosts ──┐
//!                4 routing rules                                           │
//!                5 fake-IP pool (part of the DNS topology)                 │
//!                6 outbounds: select + auto, WARP, patched base, pseudo ───┘
//!                         │
//!                         ▼
//!                   validate_document()
//!                         │
//!               ┌─────────┴──────────┐
//!               ▼                    ▼
//!           Document        ActivationHandle (tunnel-service mode, desktop)
//! ```
//!
//! Outbounds are patched before the DNS topology is assembled because the
//! topology consumes the hostnames they reveal; the emitted document keeps
//! the section order above.
//!
//! Synthesis is synchronous. WARP identities must be prepared beforehand
//! (see [`required_warp_keys`] and [`crate::warp::WarpManager::prepare`]);
//! a missing identity is a [`Error::ConfigBuild`].
//!
//! # What This Module Does NOT Do
//!
//! - Start the engine ([`crate::core`])
//! - Talk to the tunnel service directly ([`crate::tunnel`])

use std::collections::{BTreeSet, HashSet};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info};

use crate::dns::{DnsInputs, DnsTopologyBuilder, StaticHosts};
use crate::document::{
    tags, CacheFile, ClashApi, DirectInbound, Document, Experimental, GroupFields, Inbound,
    LogOptions, MixedInbound, Outbound, OutboundKind, TunInbound, WarpMarker,
};
use crate::error::{Error, Result};
use crate::options::{Ipv6Mode, Options, WarpMode};
use crate::outbound::OutboundPatcher;
use crate::route::RouteRuleBuilder;
use crate::tunnel::{ActivationHandle, ActivationRequest, Activator};
use crate::warp::{expand_overlay, IdentitySource};

/// Tag of the globally placed WARP outbound.
pub const WARP_TAG: &str = "rostovvpn-warp";

const TUN_ADDRESS_V4: &str = "172.19.0.1/28";
const TUN_ADDRESS_V6: &str = "fdfe:dcba:9876::1/126";
const TUN_FALLBACK_MTU: u32 = 1450;
const CLASH_CACHE_FILE: &str = "clash.db";
const CLASH_SECRET_LEN: usize = 16;

/// Tags the synthesizer owns; base outbounds may not take them.
const RESERVED_TAGS: &[&str] = &[
    tags::SELECT,
    tags::AUTO,
    tags::DIRECT,
    tags::BYPASS,
    tags::BLOCK,
    tags::DNS_OUT,
    WARP_TAG,
];

/// A finished document and the activation it triggered, if any.
#[derive(Debug)]
pub struct SynthesisOutput {
    pub document: Document,
    /// Present when tunnel-service mode asked for the privileged service.
    pub activation: Option<ActivationHandle>,
}

/// Builds finished documents.
pub struct Synthesizer<'a> {
    identities: &'a dyn IdentitySource,
    activator: Option<&'a dyn Activator>,
}

impl<'a> Synthesizer<'a> {
    pub fn new(identities: &'a dyn IdentitySource) -> Self {
        Self {
            identities,
            activator: None,
        }
    }

    /// Activation target for tunnel-service mode.
    pub fn with_activator(mut self, activator: &'a dyn Activator) -> Self {
        self.activator = Some(activator);
        self
    }

    /// Synthesizes with a fresh OS-seeded RNG.
    pub fn synthesize(&self, options: &Options, base: &Document) -> Result<SynthesisOutput> {
        self.synthesize_with_rng(options, base, &mut rand::thread_rng())
    }

    /// Synthesizes using `rng` for secrets and WARP endpoints.
    ///
    /// # Errors
    ///
    /// - [`Error::ConfigBuild`] if an overlay cannot be expanded or the base
    ///   has no usable proxy outbound
    /// - [`Error::Validation`] if the finished document is inconsistent
    pub fn synthesize_with_rng<R: Rng + ?Sized>(
        &self,
        options: &Options,
        base: &Document,
        rng: &mut R,
    ) -> Result<SynthesisOutput> {
        let mut doc = Document::default();

        if options.full_config {
            doc.extra = base.extra.clone();
            doc.dns.extra = base.dns.extra.clone();
            doc.route.extra = base.route.extra.clone();
        }
        doc.experimental = base.experimental.clone();

        set_clash_api(&mut doc, options, rng);
        doc.log = Some(LogOptions {
            level: options.log_level.clone(),
            output: None,
            timestamp: true,
            disabled: false,
        });
        doc.inbounds = build_inbounds(options, base);

        let built = self.build_outbounds(options, base, rng)?;

        let dns_extra = std::mem::take(&mut doc.dns.extra);
        doc.dns = DnsTopologyBuilder::new(options, built.dns_inputs).build().into_options();
        doc.dns.extra = dns_extra;

        let existing_final = options
            .full_config
            .then(|| base.route.final_outbound.clone())
            .flatten();
        let route_extra = std::mem::take(&mut doc.route.extra);
        doc.route = RouteRuleBuilder::new(options)
            .main_outbound(built.main.clone())
            .existing_final(existing_final)
            .build();
        doc.route.extra = route_extra;

        doc.outbounds = built.outbounds;

        validate_document(&doc)?;
        debug!(
            outbounds = doc.outbounds.len(),
            dns_servers = doc.dns.servers.len(),
            rules = doc.route.rules.len(),
            "document synthesized"
        );

        let activation = self.maybe_activate(options);
        Ok(SynthesisOutput {
            document: doc,
            activation,
        })
    }

    fn maybe_activate(&self, options: &Options) -> Option<ActivationHandle> {
        // Mobile platforms run the TUN in-process instead.
        if !options.enable_tun_service || options.platform.is_mobile() {
            return None;
        }
        let request = ActivationRequest::from_options(options);
        match self.activator {
            Some(activator) => {
                info!("tunnel-service mode requested, activating");
                Some(activator.activate(request))
            }
            None => {
                debug!("tunnel-service mode requested but no activator configured");
                None
            }
        }
    }

    fn build_outbounds<R: Rng + ?Sized>(
        &self,
        options: &Options,
        base: &Document,
        rng: &mut R,
    ) -> Result<BuiltOutbounds> {
        let mut patcher = OutboundPatcher::new(options, self.identities);
        let mut main = tags::SELECT.to_string();
        let mut head = Vec::new();

        let warp_mode = effective_warp_mode(options, base);
        if warp_mode != WarpMode::None {
            let key = &options.warp.wireguard_config_key;
            let identity = self.identities.identity(key).ok_or_else(|| {
                Error::ConfigBuild(format!("no WARP identity for key {:?}", key))
            })?;
            let mut marker = global_marker(options);
            if warp_mode == WarpMode::WarpOverProxy {
                marker.detour = Some(tags::SELECT.to_string());
                main = WARP_TAG.to_string();
            }
            let mut hosts = StaticHosts::new();
            let mut warp = expand_overlay(
                WARP_TAG,
                &marker,
                &identity,
                options.ipv6_mode,
                rng,
                &mut hosts,
            );
            patcher.add_static_hosts(hosts);
            if warp_mode == WarpMode::ProxyOverWarp {
                warp.detour = Some(tags::DIRECT.to_string());
            }
            head.push(warp);
        }

        let mut used: HashSet<String> = RESERVED_TAGS.iter().map(|t| t.to_string()).collect();
        let mut members = Vec::new();
        let mut body = Vec::new();

        for (index, original) in base.outbounds.iter().enumerate() {
            let mut ob = original.clone();
            if ob.kind.is_passthrough() {
                if RESERVED_TAGS.contains(&ob.tag.as_str()) || ob.tag.is_empty() {
                    debug!(tag = %ob.tag, kind = %ob.kind, "dropping base pseudo outbound");
                    continue;
                }
            } else if warp_mode == WarpMode::ProxyOverWarp
                && ob.warp.is_none()
                && ob.detour.as_deref().map_or(true, str::is_empty)
            {
                ob.detour = Some(WARP_TAG.to_string());
            }

            let mut patched = patcher.patch(ob, rng)?;
            patched.tag = unique_tag(&patched.tag, index, &mut used);
            if !patched.kind.is_passthrough() && !patched.tag.to_ascii_lowercase().contains("hide") {
                members.push(patched.tag.clone());
            }
            body.push(patched);
        }

        if members.is_empty() {
            return Err(Error::ConfigBuild(
                "base config has no usable proxy outbounds".to_string(),
            ));
        }

        let interval = options.url_test_interval;
        let mut auto = Outbound::new(OutboundKind::UrlTest, tags::AUTO);
        auto.group = GroupFields {
            outbounds: members.clone(),
            url: Some(options.connection_test_url.clone()),
            interval: Some(format!("{}s", interval)),
            tolerance: Some(options.url_test_tolerance),
            idle_timeout: Some(format!("{}s", interval.saturating_mul(3))),
            interrupt_exist_connections: Some(true),
            ..GroupFields::default()
        };

        let default = members
            .iter()
            .find(|t| t.to_ascii_lowercase().contains("default"))
            .cloned()
            .unwrap_or_else(|| tags::AUTO.to_string());
        let mut select = Outbound::new(OutboundKind::Selector, tags::SELECT);
        let mut choices = vec![tags::AUTO.to_string()];
        choices.extend(members);
        select.group = GroupFields {
            outbounds: choices,
            default: Some(default),
            interrupt_exist_connections: Some(true),
            ..GroupFields::default()
        };

        let mut outbounds = vec![select, auto];
        outbounds.extend(head);
        outbounds.extend(body);
        outbounds.push(Outbound::new(OutboundKind::Dns, tags::DNS_OUT));
        outbounds.push(Outbound::new(OutboundKind::Direct, tags::DIRECT));
        outbounds.push(Outbound::new(OutboundKind::Direct, tags::BYPASS));
        outbounds.push(Outbound::new(OutboundKind::Block, tags::BLOCK));

        Ok(BuiltOutbounds {
            outbounds,
            main,
            dns_inputs: patcher.into_dns_inputs(),
        })
    }
}

struct BuiltOutbounds {
    outbounds: Vec<Outbound>,
    main: String,
    dns_inputs: DnsInputs,
}

/// WARP identity keys a synthesis of `base` with `options` will look up.
pub fn required_warp_keys(options: &Options, base: &Document) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    if effective_warp_mode(options, base) != WarpMode::None {
        keys.insert(options.warp.wireguard_config_key.clone());
    }
    for marker in base.outbounds.iter().filter_map(|o| o.warp.as_ref()) {
        if marker.key.is_empty() {
            keys.insert(options.warp.wireguard_config_key.clone());
        } else {
            keys.insert(marker.key.clone());
        }
    }
    keys
}

/// The global WARP mode, off when the base already carries a `p1` overlay.
fn effective_warp_mode(options: &Options, base: &Document) -> WarpMode {
    if options.warp.mode == WarpMode::None {
        return WarpMode::None;
    }
    let has_p1 = base.outbounds.iter().any(|o| {
        o.warp.as_ref().is_some_and(|w| w.key == "p1")
            || (o.kind == OutboundKind::WireGuard && o.wireguard.private_key.as_deref() == Some("p1"))
    });
    if has_p1 {
        debug!("base config already has a p1 WARP outbound, global WARP disabled");
        return WarpMode::None;
    }
    options.warp.mode
}

fn global_marker(options: &Options) -> WarpMarker {
    let w = &options.warp;
    WarpMarker {
        key: w.wireguard_config_key.clone(),
        host: w.clean_ip.clone(),
        port: w.clean_port,
        detour: None,
        fake_packets: w.noise.clone(),
        fake_packets_size: w.noise_size.clone(),
        fake_packets_delay: w.noise_delay.clone(),
        fake_packets_mode: w.noise_mode.clone(),
    }
}

/// `tag`, or an auto-numbered variant if it is empty or taken.
fn unique_tag(tag: &str, index: usize, used: &mut HashSet<String>) -> String {
    let stem = if tag.trim().is_empty() {
        format!("outbound-{}", index)
    } else {
        tag.to_string()
    };
    let mut candidate = stem.clone();
    let mut n = 1;
    while used.contains(&candidate) {
        candidate = format!("{}-{}", stem, n);
        n += 1;
    }
    used.insert(candidate.clone());
    candidate
}

fn set_clash_api<R: Rng + ?Sized>(doc: &mut Document, options: &Options, rng: &mut R) {
    if !options.enable_clash_api {
        if let Some(exp) = doc.experimental.as_mut() {
            exp.clash_api = None;
        }
        return;
    }
    let secret = if options.clash_api_secret.is_empty() {
        (0..CLASH_SECRET_LEN)
            .map(|_| char::from(rng.sample(Alphanumeric)))
            .collect()
    } else {
        options.clash_api_secret.clone()
    };
    let exp = doc.experimental.get_or_insert_with(Experimental::default);
    exp.clash_api = Some(ClashApi {
        external_controller: format!("127.0.0.1:{}", options.clash_api_port),
        secret,
    });
    exp.cache_file = Some(CacheFile {
        enabled: true,
        path: CLASH_CACHE_FILE.to_string(),
    });
}

fn build_inbounds(options: &Options, base: &Document) -> Vec<Inbound> {
    let mut inbounds = Vec::new();
    let sniff_override = options.resolve_destination;

    if options.enable_tun_service && options.platform.is_mobile() {
        let mtu = if options.mtu == 0 || options.mtu > 2000 {
            TUN_FALLBACK_MTU
        } else {
            options.mtu
        };
        let address = match options.ipv6_mode {
            Ipv6Mode::Ipv4Only => vec![TUN_ADDRESS_V4.to_string()],
            Ipv6Mode::Ipv6Only => vec![TUN_ADDRESS_V6.to_string()],
            _ => vec![TUN_ADDRESS_V4.to_string(), TUN_ADDRESS_V6.to_string()],
        };
        inbounds.push(Inbound::Tun(TunInbound {
            tag: tags::TUN_IN.to_string(),
            address,
            mtu,
            auto_route: true,
            strict_route: options.strict_route,
            stack: options.tun_stack.clone(),
            sniff: true,
            sniff_override_destination: sniff_override,
            ..TunInbound::default()
        }));
    }

    let bind = if options.allow_connection_from_lan {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    inbounds.push(Inbound::Mixed(MixedInbound {
        tag: tags::MIXED_IN.to_string(),
        listen: bind.to_string(),
        listen_port: options.mixed_port,
        sniff: true,
        sniff_override_destination: sniff_override,
        set_system_proxy: options.set_system_proxy,
        ..MixedInbound::default()
    }));
    inbounds.push(Inbound::Direct(DirectInbound {
        tag: tags::DNS_IN.to_string(),
        listen: bind.to_string(),
        listen_port: options.local_dns_port,
        ..DirectInbound::default()
    }));

    if options.full_config {
        for inbound in &base.inbounds {
            let clash = inbounds.iter().any(|i| i.tag() == inbound.tag());
            // A base TUN would capture traffic behind the user's back.
            if clash || inbound.is_tun() {
                continue;
            }
            inbounds.push(inbound.clone());
        }
    }
    inbounds
}

/// Checks internal consistency of a finished document.
///
/// # Errors
///
/// Returns [`Error::Validation`] describing the first problem found.
pub fn validate_document(doc: &Document) -> Result<()> {
    let invalid = |msg: String| Err(Error::Validation(msg));

    let mut outbound_tags = HashSet::new();
    for ob in &doc.outbounds {
        if ob.tag.is_empty() {
            return invalid(format!("{} outbound without a tag", ob.kind));
        }
        if !outbound_tags.insert(ob.tag.as_str()) {
            return invalid(format!("duplicate outbound tag {:?}", ob.tag));
        }
    }
    for ob in &doc.outbounds {
        if let Some(detour) = ob.detour.as_deref() {
            if detour == ob.tag || !outbound_tags.contains(detour) {
                return invalid(format!("outbound {:?}: bad detour {:?}", ob.tag, detour));
            }
        }
        for member in &ob.group.outbounds {
            if !outbound_tags.contains(member.as_str()) {
                return invalid(format!("group {:?}: unknown member {:?}", ob.tag, member));
            }
        }
        if let Some(default) = ob.group.default.as_deref() {
            if !ob.group.outbounds.iter().any(|m| m == default) {
                return invalid(format!("group {:?}: default {:?} not a member", ob.tag, default));
            }
        }
        if ob.warp.is_some() {
            return invalid(format!("outbound {:?}: unexpanded WARP marker", ob.tag));
        }
    }

    let mut inbound_tags = HashSet::new();
    for ib in &doc.inbounds {
        if !inbound_tags.insert(ib.tag()) {
            return invalid(format!("duplicate inbound tag {:?}", ib.tag()));
        }
    }
    if doc.inbounds.iter().filter(|i| i.is_tun()).count() > 1 {
        return invalid("more than one TUN inbound".to_string());
    }

    let mut dns_tags = HashSet::new();
    for server in &doc.dns.servers {
        if !dns_tags.insert(server.tag.as_str()) {
            return invalid(format!("duplicate DNS server tag {:?}", server.tag));
        }
    }
    match doc.dns.final_server.as_deref() {
        Some(f) if dns_tags.contains(f) => {}
        Some(f) => return invalid(format!("DNS final {:?} is not a server", f)),
        None if doc.dns.servers.is_empty() => {}
        None => return invalid("DNS servers without a final".to_string()),
    }
    for server in &doc.dns.servers {
        if let Some(detour) = server.detour.as_deref() {
            if !outbound_tags.contains(detour) {
                return invalid(format!("DNS server {:?}: unknown detour {:?}", server.tag, detour));
            }
        }
        if let Some(resolver) = &server.domain_resolver {
            if resolver.server == server.tag || !dns_tags.contains(resolver.server.as_str()) {
                return invalid(format!(
                    "DNS server {:?}: bad domain resolver {:?}",
                    server.tag, resolver.server
                ));
            }
        }
    }

    let rule_sets: HashSet<&str> = doc.route.rule_set.iter().map(|r| r.tag.as_str()).collect();
    for rule in &doc.dns.rules {
        if let Some(server) = rule.server.as_deref() {
            if !dns_tags.contains(server) {
                return invalid(format!("DNS rule points at unknown server {:?}", server));
            }
        }
        if let Some(missing) = rule.matcher.rule_set.iter().find(|s| !rule_sets.contains(s.as_str())) {
            return invalid(format!("DNS rule uses unknown rule-set {:?}", missing));
        }
    }

    for rule in &doc.route.rules {
        if !outbound_tags.contains(rule.outbound.as_str()) {
            return invalid(format!("route rule points at unknown outbound {:?}", rule.outbound));
        }
        if let Some(missing) = rule.matcher.rule_set.iter().find(|s| !rule_sets.contains(s.as_str())) {
            return invalid(format!("route rule uses unknown rule-set {:?}", missing));
        }
    }
    for set in &doc.route.rule_set {
        if !set.download_detour.is_empty() && !outbound_tags.contains(set.download_detour.as_str()) {
            return invalid(format!("rule-set {:?}: unknown download detour", set.tag));
        }
    }
    if let Some(f) = doc.route.final_outbound.as_deref() {
        if !outbound_tags.contains(f) {
            return invalid(format!("route final {:?} is not an outbound", f));
        }
    }
    if let Some(resolver) = &doc.route.default_domain_resolver {
        if !dns_tags.contains(resolver.server.as_str()) {
            return invalid(format!("default domain resolver {:?} is not a server", resolver.server));
        }
    }
    Ok(())
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::options::Platform;
    use crate::warp::testing::identity;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn no_tun_without_tunnel_service(
            lan in any::<bool>(),
            fake in any::<bool>(),
            bypass in any::<bool>(),
            mobile in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let opt = Options {
                allow_connection_from_lan: lan,
                enable_fake_dns: fake,
                bypass_lan: bypass,
                enable_tun_service: false,
                platform: if mobile { Platform::Android } else { Platform::Desktop },
                ..Options::default()
            };
            let base = Document::from_json_str(
                r#"{"outbounds": [{"type": "vless", "tag": "a", "server": "a.example", "server_port": 443}]}"#,
            ).unwrap();
            let mut ids = BTreeMap::new();
            ids.insert("p1".to_string(), identity("peer"));
            let doc = Synthesizer::new(&ids)
                .synthesize_with_rng(&opt, &base, &mut StdRng::seed_from_u64(seed))
                .unwrap()
                .document;
            prop_assert!(!doc.inbounds.iter().any(Inbound::is_tun));
            let mixed: Vec<_> = doc.inbounds.iter().filter_map(|i| match i {
                Inbound::Mixed(m) => Some(m.listen.clone()),
                _ => None,
            }).collect();
            prop_assert_eq!(mixed.len(), 1);
            prop_assert_eq!(mixed[0] == "127.0.0.1", !lan);
        }
    }
}
