//! Routing Rule Builder.
//!
//! Assembles the route section: an ordered, first-match-wins rule list,
//! the remote rule-sets those rules reference, the final outbound and the
//! default resolver used for outbound server hostnames.
//!
//! # Precedence
//!
//! ```text
//!    1  inbound dns-in              ─▶ dns-out
//!    2  port 53                     ─▶ dns-out
//!    3  port 853 to private ranges  ─▶ direct      ┐ constrained
//!       port 853 elsewhere          ─▶ block       ┘ platforms only
//!    4  own/excluded packages       ─▶ bypass        Android only
//!    5  private destinations        ─▶ bypass        bypass_lan only
//!    6  anti-censorship resolver    ─▶ direct
//!    7  user rules                  ─▶ bypass | block | main
//!    8  ads/malware rule-sets       ─▶ block         block_ads only
//!    9  region rule-sets            ─▶ direct        region != "other"
//!       final                       ─▶ main, unless the base already set one
//! ```
//!
//! DNS traffic is always captured before anything the user controls, so a
//! user rule can never leak plaintext queries around the DNS topology.

use crate::dns::TRICK_DNS_HOST;
use crate::document::{tags, DomainResolver, RouteOptions, RouteRule, RuleMatch, RuleSet};
use crate::options::{Options, Platform, RuleAction, REGION_OTHER};

/// Package name of the Android client, always excluded from the tunnel.
pub const OWN_PACKAGE: &str = "app.rostovvpn.com";

const RULE_SET_BASE: &str = "https://raw.githubusercontent.com/hiddify/hiddify-geo/rule-set";
const RULE_SET_UPDATE_INTERVAL: &str = "5d";

/// `(tag, file)` rule-sets blocked when ad blocking is on. Files live under
/// the `block/` group.
pub const AD_RULE_SETS: &[(&str, &str)] = &[
    ("geosite-ads", "geosite-category-ads-all"),
    ("geosite-malware", "geosite-malware"),
    ("geosite-phishing", "geosite-phishing"),
    ("geosite-cryptominers", "geosite-cryptominers"),
    ("geoip-phishing", "geoip-phishing"),
    ("geoip-malware", "geoip-malware"),
];

/// `(geoip, geosite)` rule-set tags for a region.
pub fn region_rule_set_tags(region: &str) -> (String, String) {
    let r = region.to_ascii_lowercase();
    (format!("geoip-{}", r), format!("geosite-{}", r))
}

fn remote_rule_set(tag: &str, group: &str, file: &str) -> RuleSet {
    RuleSet {
        kind: "remote".to_string(),
        tag: tag.to_string(),
        format: "binary".to_string(),
        url: format!("{}/{}/{}.srs", RULE_SET_BASE, group, file),
        download_detour: tags::SELECT.to_string(),
        update_interval: RULE_SET_UPDATE_INTERVAL.to_string(),
    }
}

/// Builds the route section.
pub struct RouteRuleBuilder<'a> {
    options: &'a Options,
    main_outbound: String,
    existing_final: Option<String>,
}

impl<'a> RouteRuleBuilder<'a> {
    pub fn new(options: &'a Options) -> Self {
        Self {
            options,
            main_outbound: tags::SELECT.to_string(),
            existing_final: None,
        }
    }

    /// Outbound that "proxy" rules and the final point at.
    pub fn main_outbound(mut self, tag: impl Into<String>) -> Self {
        self.main_outbound = tag.into();
        self
    }

    /// A final outbound the caller already fixed; it wins over the main one.
    pub fn existing_final(mut self, tag: Option<String>) -> Self {
        self.existing_final = tag.filter(|t| !t.is_empty());
        self
    }

    pub fn build(self) -> RouteOptions {
        let opt = self.options;
        let mut rules = Vec::new();
        let mut rule_sets = Vec::new();

        rules.push(RouteRule::new(RuleMatch::inbound(&[tags::DNS_IN]), tags::DNS_OUT));
        rules.push(RouteRule::new(RuleMatch::port(&[53]), tags::DNS_OUT));

        if opt.is_constrained() {
            rules.push(RouteRule::new(
                RuleMatch {
                    port: vec![853],
                    ip_is_private: Some(true),
                    ..RuleMatch::default()
                },
                tags::DIRECT,
            ));
            rules.push(RouteRule::new(RuleMatch::port(&[853]), tags::BLOCK));
        }

        if opt.platform == Platform::Android {
            let mut packages = vec![OWN_PACKAGE.to_string()];
            packages.extend(opt.excluded_packages.iter().cloned());
            rules.push(RouteRule::new(
                RuleMatch {
                    package_name: packages,
                    ..RuleMatch::default()
                },
                tags::BYPASS,
            ));
        }

        if opt.bypass_lan {
            rules.push(RouteRule::new(
                RuleMatch {
                    ip_is_private: Some(true),
                    ..RuleMatch::default()
                },
                tags::BYPASS,
            ));
        }

        rules.push(RouteRule::new(
            RuleMatch::domains(vec![TRICK_DNS_HOST.to_string()]),
            tags::DIRECT,
        ));

        for rule in opt.rules.iter().filter(|r| !r.is_empty()) {
            let outbound = match rule.action {
                RuleAction::Bypass => tags::BYPASS,
                RuleAction::Block => tags::BLOCK,
                RuleAction::Proxy => self.main_outbound.as_str(),
            };
            let matcher = RuleMatch {
                domain: rule.domain.clone(),
                domain_suffix: rule.domain_suffix.clone(),
                domain_keyword: rule.domain_keyword.clone(),
                ip_cidr: rule.ip_cidr.clone(),
                port: rule.port.clone(),
                network: Some(rule.network.clone()).filter(|n| !n.is_empty()),
                ..RuleMatch::default()
            };
            rules.push(RouteRule::new(matcher, outbound));
        }

        if opt.block_ads {
            rule_sets.extend(
                AD_RULE_SETS
                    .iter()
                    .map(|(tag, file)| remote_rule_set(tag, "block", file)),
            );
            rules.push(RouteRule::new(
                RuleMatch::rule_sets(AD_RULE_SETS.iter().map(|(tag, _)| tag.to_string()).collect()),
                tags::BLOCK,
            ));
        }

        if opt.region != REGION_OTHER {
            let (geoip, geosite) = region_rule_set_tags(&opt.region);
            rule_sets.push(remote_rule_set(&geoip, "country", &geoip));
            rule_sets.push(remote_rule_set(&geosite, "country", &geosite));
            rules.push(RouteRule::new(
                RuleMatch::rule_sets(vec![geoip, geosite]),
                tags::DIRECT,
            ));
        }

        let final_outbound = self.existing_final.unwrap_or(self.main_outbound);

        RouteOptions {
            rules,
            rule_set: rule_sets,
            final_outbound: Some(final_outbound),
            auto_detect_interface: true,
            default_domain_resolver: Some(DomainResolver {
                server: tags::DNS_DIRECT.to_string(),
                strategy: opt.effective_route_strategy().as_engine_str().map(String::from),
            }),
            extra: Default::default(),
        }
    }
}
