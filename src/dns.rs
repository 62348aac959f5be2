//! DNS Topology Builder.
//!
//! Builds the ordered resolver list and the DNS rules that pick among them.
//! The engine resolves hostnames of its own upstreams with other resolvers,
//! so the list must form a dependency chain that ends in something that
//! never needs DNS at all.
//!
//! # Resolver Dependencies
//!
//! ```text
//!   dns-remote ──domain_resolver──▶ dns-trick-direct ──domain_resolver──▶ dns-static
//!   (via select, or direct when      (HTTPS, dialed directly)               (literal IPs,
//!    the platform is constrained)                                             no network)
//!
//!   dns-direct ──domain_resolver──▶ dns-local
//!   (bootstrap, dialed directly)     (OS resolver)
//!
//!   dns-fake  (fake-IP pool, only when enabled)
//! ```
//!
//! No resolver ever looks up its own hostname: the anti-censorship server's
//! hostname is answered from static records, never by itself.
//!
//! # Rule Precedence
//!
//! | Order | Rule | Server |
//! |-------|------|--------|
//! | 0 | static host records (always) | `dns-static` |
//! | 1 | user rules: bypass / block / proxy | `dns-direct` / predefined / `dns-remote` |
//! | 2 | outbound server hostnames | `dns-direct` |
//! | 3 | connection-test host | `dns-remote` |
//! | 4 | region suffix and rule-set | `dns-direct` |
//! | 5 | fake-IP for TUN-originated queries | `dns-fake` |
//!
//! Rows 1 to 4 are emitted only when DNS routing is enabled.
//!
//! # Address Syntax
//!
//! [`parse_dns_address`] accepts `local`, `fakeip`, bare `host[:port]`
//! (UDP), and `udp|tcp|tls|https|h3|quic://host[:port][/path]`. Blank or
//! unusable input falls back to the given default.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use reqwest::Url;
use tracing::warn;

use crate::document::{tags, DnsOptions, DnsRule, DnsServer, DnsTransport, DomainResolver, RuleMatch};
use crate::options::{Options, RuleAction, DEFAULT_DIRECT_DNS, DEFAULT_REMOTE_DNS, REGION_OTHER};
use crate::route::region_rule_set_tags;

/// Hostname of the anti-censorship HTTPS resolver.
pub const TRICK_DNS_HOST: &str = "dns.google";
/// Literal IPv4 addresses of [`TRICK_DNS_HOST`].
pub const TRICK_DNS_IPV4: &[&str] = &["8.8.8.8", "8.8.4.4"];
/// Literal IPv6 addresses of [`TRICK_DNS_HOST`].
pub const TRICK_DNS_IPV6: &[&str] = &["2001:4860:4860::8888", "2001:4860:4860::8844"];
/// Response code for blocked queries.
pub const BLOCK_RCODE: &str = "NXDOMAIN";

/// The role a resolver plays in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsRole {
    /// OS resolver, last resort.
    Local,
    /// User's remote resolver, normally through the proxy.
    Remote,
    /// HTTPS resolver dialed directly.
    AntiCensorship,
    /// Plain resolver dialed directly.
    Bootstrap,
    /// Fake-IP pool.
    FakeIp,
    /// Literal records.
    StaticHosts,
}

impl DnsRole {
    /// Tag of the server playing this role.
    pub fn tag(self) -> &'static str {
        match self {
            DnsRole::Local => tags::DNS_LOCAL,
            DnsRole::Remote => tags::DNS_REMOTE,
            DnsRole::AntiCensorship => tags::DNS_TRICK_DIRECT,
            DnsRole::Bootstrap => tags::DNS_DIRECT,
            DnsRole::FakeIp => tags::DNS_FAKE,
            DnsRole::StaticHosts => tags::DNS_STATIC,
        }
    }
}

/// An exact-match domain recorded for force-direct resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FullDomain(pub String);

impl fmt::Display for FullDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "full:{}", self.0)
    }
}

/// Domain → literal addresses, served without any DNS round-trip.
pub type StaticHosts = BTreeMap<String, Vec<IpAddr>>;

/// A resolver address split into engine fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAddress {
    pub transport: DnsTransport,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
}

impl DnsAddress {
    /// True if the host is a literal IP, so no resolver is needed to reach it.
    pub fn host_is_ip(&self) -> bool {
        self.host
            .as_deref()
            .is_some_and(|h| h.parse::<IpAddr>().is_ok())
    }

    fn into_server(self, tag: &str) -> DnsServer {
        let mut server = DnsServer::new(self.transport, tag);
        let default_port = self.transport.default_port();
        server.server = self.host;
        server.server_port = self.port.filter(|p| Some(*p) != default_port);
        server.path = self.path.filter(|p| p != "/dns-query" && p != "/" && !p.is_empty());
        server
    }
}

/// Adds a scheme to scheme-less addresses.
///
/// `8.8.8.8` becomes `udp://8.8.8.8`; keywords and `rcode://` pass through.
pub fn normalize_dns_address(address: &str) -> String {
    let a = address.trim();
    let lower = a.to_ascii_lowercase();
    if a.is_empty()
        || a.contains("://")
        || matches!(lower.as_str(), "local" | "system" | "fakeip")
    {
        return a.to_string();
    }
    format!("udp://{}", a)
}

/// Parses a resolver address, falling back to `default` when blank or unusable.
pub fn parse_dns_address(address: &str, default: &str) -> DnsAddress {
    match try_parse_dns_address(address) {
        Some(parsed) => parsed,
        None => {
            if !address.trim().is_empty() {
                warn!(address, default, "unusable DNS address, using default");
            }
            try_parse_dns_address(default).unwrap_or(DnsAddress {
                transport: DnsTransport::Local,
                host: None,
                port: None,
                path: None,
            })
        }
    }
}

fn try_parse_dns_address(address: &str) -> Option<DnsAddress> {
    let normalized = normalize_dns_address(address);
    match normalized.to_ascii_lowercase().as_str() {
        "" => return None,
        "local" | "system" => {
            return Some(DnsAddress {
                transport: DnsTransport::Local,
                host: None,
                port: None,
                path: None,
            })
        }
        "fakeip" => {
            return Some(DnsAddress {
                transport: DnsTransport::Fakeip,
                host: None,
                port: None,
                path: None,
            })
        }
        _ => {}
    }

    let url = Url::parse(&normalized).ok()?;
    let transport = match url.scheme() {
        "udp" => DnsTransport::Udp,
        "tcp" => DnsTransport::Tcp,
        "tls" => DnsTransport::Tls,
        "https" => DnsTransport::Https,
        "h3" => DnsTransport::H3,
        "quic" => DnsTransport::Quic,
        _ => return None,
    };
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())?;
    let path = matches!(transport, DnsTransport::Https | DnsTransport::H3)
        .then(|| url.path().to_string());
    Some(DnsAddress {
        transport,
        host: Some(host),
        port: url.port().or(transport.default_port()),
        path,
    })
}

/// The DNS section of a finished document, plus the static records the
/// routing builder needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsTopology {
    /// Resolvers in dependency order, tagged with their role.
    pub entries: Vec<(DnsRole, DnsServer)>,
    /// Rules, first match wins.
    pub rules: Vec<DnsRule>,
    /// The single final resolver.
    pub final_tag: String,
    /// Separate cache per server.
    pub independent_cache: bool,
}

impl DnsTopology {
    /// Looks up a server by role.
    pub fn server(&self, role: DnsRole) -> Option<&DnsServer> {
        self.entries.iter().find(|(r, _)| *r == role).map(|(_, s)| s)
    }

    /// Converts into the document section.
    pub fn into_options(self) -> DnsOptions {
        DnsOptions {
            servers: self.entries.into_iter().map(|(_, s)| s).collect(),
            rules: self.rules,
            final_server: Some(self.final_tag),
            strategy: None,
            independent_cache: self.independent_cache,
            extra: Default::default(),
        }
    }
}

/// Inputs discovered while patching outbounds.
#[derive(Debug, Clone, Default)]
pub struct DnsInputs {
    /// Hostnames of proxy servers, resolved directly.
    pub server_domains: Vec<FullDomain>,
    /// Extra literal records, e.g. WARP placeholder domains.
    pub static_hosts: StaticHosts,
}

/// Builds the resolver topology for `options`.
pub struct DnsTopologyBuilder<'a> {
    options: &'a Options,
    inputs: DnsInputs,
}

impl<'a> DnsTopologyBuilder<'a> {
    pub fn new(options: &'a Options, inputs: DnsInputs) -> Self {
        Self { options, inputs }
    }

    /// Produces the topology. Never fails: bad addresses fall back to defaults.
    pub fn build(self) -> DnsTopology {
        let opt = self.options;
        let mut entries = Vec::new();

        let mut hosts = self.inputs.static_hosts.clone();
        hosts.insert(TRICK_DNS_HOST.to_string(), trick_dns_ips(opt.ipv6_mode.allows_ipv6()));
        let mut static_server = DnsServer::new(DnsTransport::Hosts, DnsRole::StaticHosts.tag());
        static_server.predefined = hosts
            .iter()
            .map(|(domain, ips)| {
                (
                    domain.to_ascii_lowercase(),
                    ips.iter().map(|ip| ip.to_string()).collect(),
                )
            })
            .collect();
        entries.push((DnsRole::StaticHosts, static_server));

        let bootstrap = parse_dns_address(&opt.direct_dns_address, DEFAULT_DIRECT_DNS);
        let bootstrap_needs_resolver = !bootstrap.host_is_ip() && bootstrap.host.is_some();
        let mut direct = bootstrap.into_server(DnsRole::Bootstrap.tag());
        direct.strategy = opt.direct_dns_domain_strategy.as_engine_str().map(String::from);
        if bootstrap_needs_resolver {
            direct.domain_resolver = Some(DomainResolver {
                server: DnsRole::Local.tag().to_string(),
                strategy: None,
            });
        }
        entries.push((DnsRole::Bootstrap, direct));

        let remote_addr = parse_dns_address(&opt.remote_dns_address, DEFAULT_REMOTE_DNS);
        let remote_needs_resolver = !remote_addr.host_is_ip() && remote_addr.host.is_some();
        let mut remote = remote_addr.into_server(DnsRole::Remote.tag());
        remote.strategy = opt.remote_dns_domain_strategy.as_engine_str().map(String::from);
        // Constrained platforms capture everything, so the remote resolver
        // cannot wait for the proxy selector to come up.
        remote.detour = if opt.is_constrained() {
            None
        } else {
            Some(tags::SELECT.to_string())
        };
        if remote_needs_resolver {
            remote.domain_resolver = Some(DomainResolver {
                server: DnsRole::AntiCensorship.tag().to_string(),
                strategy: None,
            });
        }
        entries.push((DnsRole::Remote, remote));

        let mut trick = DnsServer::new(DnsTransport::Https, DnsRole::AntiCensorship.tag());
        trick.server = Some(TRICK_DNS_HOST.to_string());
        trick.domain_resolver = Some(DomainResolver {
            server: DnsRole::StaticHosts.tag().to_string(),
            strategy: None,
        });
        trick.strategy = opt.direct_dns_domain_strategy.as_engine_str().map(String::from);
        entries.push((DnsRole::AntiCensorship, trick));

        entries.push((
            DnsRole::Local,
            DnsServer::new(DnsTransport::Local, DnsRole::Local.tag()),
        ));

        if opt.enable_fake_dns {
            let mut fake = DnsServer::new(DnsTransport::Fakeip, DnsRole::FakeIp.tag());
            fake.inet4_range = Some(opt.fake_ip_v4_range.clone());
            if opt.ipv6_mode.allows_ipv6() {
                fake.inet6_range = Some(opt.fake_ip_v6_range.clone());
            }
            entries.push((DnsRole::FakeIp, fake));
        }

        let rules = self.rules(&hosts);

        DnsTopology {
            entries,
            rules,
            final_tag: DnsRole::Remote.tag().to_string(),
            independent_cache: opt.independent_dns_cache,
        }
    }

    fn rules(&self, hosts: &StaticHosts) -> Vec<DnsRule> {
        let opt = self.options;
        let mut rules = Vec::new();

        let mut static_rule = DnsRule::route(
            RuleMatch::domains(hosts.keys().map(|d| d.to_ascii_lowercase()).collect()),
            DnsRole::StaticHosts.tag(),
        );
        static_rule.disable_cache = Some(true);
        rules.push(static_rule);

        if !opt.enable_dns_routing {
            return rules;
        }

        for rule in opt.rules.iter().filter(|r| r.has_domain_matcher()) {
            let matcher = RuleMatch {
                domain: rule.domain.clone(),
                domain_suffix: rule.domain_suffix.clone(),
                domain_keyword: rule.domain_keyword.clone(),
                ..RuleMatch::default()
            };
            let dns_rule = match rule.action {
                RuleAction::Bypass => DnsRule::route(matcher, DnsRole::Bootstrap.tag()),
                RuleAction::Block => DnsRule::predefined(matcher, BLOCK_RCODE),
                RuleAction::Proxy => DnsRule::route(matcher, DnsRole::Remote.tag()),
            };
            rules.push(dns_rule);
        }

        let mut server_domains: Vec<String> = self
            .inputs
            .server_domains
            .iter()
            .map(|d| d.0.to_ascii_lowercase())
            .filter(|d| !hosts.contains_key(d) && d != TRICK_DNS_HOST)
            .collect();
        server_domains.sort();
        server_domains.dedup();
        if !server_domains.is_empty() {
            rules.push(DnsRule::route(
                RuleMatch::domains(server_domains),
                DnsRole::Bootstrap.tag(),
            ));
        }

        if let Some(host) = url_host(&opt.connection_test_url) {
            let mut rule = DnsRule::route(RuleMatch::domains(vec![host]), DnsRole::Remote.tag());
            rule.rewrite_ttl = Some(3000);
            rules.push(rule);
        }

        if opt.region != REGION_OTHER {
            let (_, geosite) = region_rule_set_tags(&opt.region);
            rules.push(DnsRule::route(
                RuleMatch {
                    domain_suffix: vec![format!(".{}", opt.region)],
                    ..RuleMatch::default()
                },
                DnsRole::Bootstrap.tag(),
            ));
            rules.push(DnsRule::route(
                RuleMatch::rule_sets(vec![geosite]),
                DnsRole::Bootstrap.tag(),
            ));
        }

        if opt.enable_fake_dns {
            let mut fake = DnsRule::route(
                RuleMatch::inbound(&[tags::TUN_IN, tags::MIXED_IN]),
                DnsRole::FakeIp.tag(),
            );
            fake.disable_cache = Some(true);
            rules.push(fake);
        }

        rules
    }
}

fn trick_dns_ips(with_v6: bool) -> Vec<IpAddr> {
    let mut ips: Vec<IpAddr> = TRICK_DNS_IPV4.iter().filter_map(|s| s.parse().ok()).collect();
    if with_v6 {
        ips.extend(TRICK_DNS_IPV6.iter().filter_map(|s| s.parse::<IpAddr>().ok()));
    }
    ips
}

/// Host part of a URL, if it is a domain.
pub fn url_host(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    if host.parse::<IpAddr>().is_ok() || host.starts_with('[') {
        return None;
    }
    Some(host.to_ascii_lowercase())
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_address() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            Just("local".to_string()),
            "[a-z]{1,10}\\.[a-z]{2,3}",
            (1u8..=254, 0u8..=255, 0u8..=255, 1u8..=254)
                .prop_map(|(a, b, c, d)| format!("{}.{}.{}.{}", a, b, c, d)),
            ("(udp|tcp|tls|https|h3|quic|bogus)", "[a-z]{1,10}\\.[a-z]{2,3}")
                .prop_map(|(s, h)| format!("{}://{}", s, h)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn topology_has_no_self_reference(
            remote in arb_address(),
            direct in arb_address(),
            fake in any::<bool>(),
            tun in any::<bool>(),
        ) {
            let opt = Options {
                remote_dns_address: remote,
                direct_dns_address: direct,
                enable_fake_dns: fake,
                enable_tun_service: tun,
                ..Options::default()
            };
            let topo = DnsTopologyBuilder::new(&opt, DnsInputs::default()).build();

            let finals: Vec<_> = topo.entries.iter().filter(|(_, s)| s.tag == topo.final_tag).collect();
            prop_assert_eq!(finals.len(), 1);

            for (_, server) in &topo.entries {
                if let Some(resolver) = &server.domain_resolver {
                    prop_assert_ne!(&resolver.server, &server.tag);
                }
            }
            for rule in &topo.rules {
                if rule.matcher.domain.iter().any(|d| d == TRICK_DNS_HOST) {
                    prop_assert_ne!(rule.server.as_deref(), Some(tags::DNS_TRICK_DIRECT));
                }
            }
            prop_assert!(topo.server(DnsRole::Bootstrap).is_some());
        }
    }
}
