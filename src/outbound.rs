//! Outbound Patcher.
//!
//! Applies the user's transport knobs to each protocol outbound of the base
//! document and collects the bookkeeping the DNS builder needs.
//!
//! ```text
//!   base outbound ──▶ passthrough? ──yes──▶ unchanged
//!                         │ no
//!                         ▼
//!                   warp marker? ──yes──▶ expand_overlay() (tag, detour kept)
//!                         │ no
//!                         ▼
//!                   multiplex      (mux enabled, protocol supports it, not reality)
//!                   TLS tricks     (TLS on, HTTP-like or raw transport, not reality)
//!                   insecure       (allow_insecure, TLS on)
//!                         │
//!                         ▼
//!                   server hostname recorded as a force-direct domain
//!                   (no detour, not a literal IP)
//! ```
//!
//! Reality-camouflaged outbounds never receive multiplexing or TLS tricks:
//! both change the handshake shape the camouflage depends on.

use std::net::IpAddr;

use rand::Rng;
use tracing::debug;

use crate::dns::{DnsInputs, FullDomain, StaticHosts};
use crate::document::{Multiplex, Outbound, TlsFragment, TlsTrickFields, Utls};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::warp::{expand_overlay, IdentitySource};

/// Transports over which TLS tricks are safe.
const TRICK_TRANSPORTS: &[&str] = &["ws", "grpc", "httpupgrade"];

/// Patches outbounds one at a time and accumulates DNS inputs.
pub struct OutboundPatcher<'a> {
    options: &'a Options,
    identities: &'a dyn IdentitySource,
    server_domains: Vec<FullDomain>,
    static_hosts: StaticHosts,
}

impl<'a> OutboundPatcher<'a> {
    pub fn new(options: &'a Options, identities: &'a dyn IdentitySource) -> Self {
        Self {
            options,
            identities,
            server_domains: Vec::new(),
            static_hosts: StaticHosts::new(),
        }
    }

    /// Patches one outbound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigBuild`] if a WARP marker names a key with no
    /// prepared identity.
    pub fn patch<R: Rng + ?Sized>(&mut self, outbound: Outbound, rng: &mut R) -> Result<Outbound> {
        if outbound.kind.is_passthrough() {
            return Ok(outbound);
        }
        if outbound.warp.is_some() {
            return self.expand_marker(outbound, rng);
        }

        let mut out = outbound;
        let opt = self.options;
        let reality = out.is_reality();

        if opt.mux.enable && out.kind.supports_mux() && !reality {
            out.multiplex = Some(Multiplex {
                enabled: true,
                padding: opt.mux.padding,
                max_streams: opt.mux.max_streams,
                protocol: opt.mux.protocol.clone(),
            });
        }

        let tricks = &opt.tls_tricks;
        let transport_ok = out
            .transport_type()
            .map_or(true, |t| TRICK_TRANSPORTS.contains(&t));
        if tricks.any_enabled() && out.tls_enabled() && !reality && transport_ok {
            if tricks.enable_fragment {
                out.tcp_fast_open = Some(false);
                out.tls_fragment = Some(TlsFragment {
                    enabled: true,
                    size: tricks.fragment_size.clone(),
                    sleep: tricks.fragment_sleep.clone(),
                });
            }
            if let Some(tls) = out.tls.as_mut() {
                tls.tls_tricks = Some(TlsTrickFields {
                    mixedcase_sni: tricks.mixed_sni_case,
                    padding_mode: if tricks.enable_padding { "random".into() } else { String::new() },
                    padding_size: if tricks.enable_padding { tricks.padding_size.clone() } else { String::new() },
                });
                if tricks.enable_padding || tricks.mixed_sni_case {
                    // Custom ClientHello shaping needs the uTLS stack.
                    let fingerprint = tls
                        .utls
                        .as_ref()
                        .map(|u| u.fingerprint.clone())
                        .filter(|f| !f.is_empty())
                        .unwrap_or_else(|| "custom".to_string());
                    tls.utls = Some(Utls {
                        enabled: true,
                        fingerprint,
                    });
                }
            }
        }

        if opt.allow_insecure && out.tls_enabled() {
            if let Some(tls) = out.tls.as_mut() {
                tls.insecure = Some(true);
            }
        }

        self.record_server(&out);
        Ok(out)
    }

    fn expand_marker<R: Rng + ?Sized>(&mut self, outbound: Outbound, rng: &mut R) -> Result<Outbound> {
        let Some(mut marker) = outbound.warp else {
            return Ok(outbound);
        };
        if marker.key.is_empty() {
            marker.key = self.options.warp.wireguard_config_key.clone();
        }
        if marker.detour.is_none() {
            marker.detour = outbound.detour.clone();
        }
        let identity = self.identities.identity(&marker.key).ok_or_else(|| {
            Error::ConfigBuild(format!(
                "outbound {:?}: no WARP identity for key {:?}",
                outbound.tag, marker.key
            ))
        })?;
        debug!(tag = %outbound.tag, key = %marker.key, "expanding WARP marker");
        let expanded = expand_overlay(
            &outbound.tag,
            &marker,
            &identity,
            self.options.ipv6_mode,
            rng,
            &mut self.static_hosts,
        );
        self.record_server(&expanded);
        Ok(expanded)
    }

    fn record_server(&mut self, out: &Outbound) {
        if out.detour.as_deref().is_some_and(|d| !d.is_empty()) {
            return;
        }
        let Some(server) = out.server.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            return;
        };
        let host = server.trim_start_matches('[').trim_end_matches(']');
        if host.parse::<IpAddr>().is_ok() || self.static_hosts.contains_key(host) {
            return;
        }
        self.server_domains.push(FullDomain(host.to_ascii_lowercase()));
    }

    /// Adds records for endpoints expanded outside the patcher.
    pub fn add_static_hosts(&mut self, hosts: StaticHosts) {
        self.static_hosts.extend(hosts);
    }

    /// Domains and static records gathered so far.
    pub fn into_dns_inputs(self) -> DnsInputs {
        DnsInputs {
            server_domains: self.server_domains,
            static_hosts: self.static_hosts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{OutboundKind, Reality, TlsOptions, Transport, WarpMarker};
    use crate::warp::{testing::identity, WarpIdentity};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn no_identities() -> BTreeMap<String, WarpIdentity> {
        BTreeMap::new()
    }

    fn tls_outbound(kind: OutboundKind, transport: Option<&str>, reality: bool) -> Outbound {
        let mut out = Outbound::new(kind, "proxy");
        out.server = Some("Proxy.Example.com".into());
        out.server_port = Some(443);
        out.tls = Some(TlsOptions {
            enabled: true,
            reality: reality.then(|| Reality {
                enabled: true,
                ..Reality::default()
            }),
            ..TlsOptions::default()
        });
        out.transport = transport.map(|t| Transport {
            kind: t.into(),
            ..Transport::default()
        });
        out
    }

    fn tricky_options() -> Options {
        let mut opt = Options::default();
        opt.mux.enable = true;
        opt.tls_tricks.enable_fragment = true;
        opt.tls_tricks.enable_padding = true;
        opt.tls_tricks.mixed_sni_case = true;
        opt
    }

    #[test]
    fn test_passthrough_untouched() {
        let opt = tricky_options();
        let ids = no_identities();
        let mut patcher = OutboundPatcher::new(&opt, &ids);
        let mut rng = StdRng::seed_from_u64(0);
        let mut sel = Outbound::new(OutboundKind::Selector, "select");
        sel.server = Some("should.not.record".into());
        let out = patcher.patch(sel.clone(), &mut rng).unwrap();
        assert_eq!(out, sel);
        assert!(patcher.into_dns_inputs().server_domains.is_empty());
    }

    #[test]
    fn test_mux_and_tricks_applied() {
        let opt = tricky_options();
        let ids = no_identities();
        let mut patcher = OutboundPatcher::new(&opt, &ids);
        let mut rng = StdRng::seed_from_u64(0);
        let out = patcher
            .patch(tls_outbound(OutboundKind::Vless, Some("ws"), false), &mut rng)
            .unwrap();
        let mux = out.multiplex.unwrap();
        assert!(mux.enabled);
        assert_eq!(mux.max_streams, 8);
        assert_eq!(out.tcp_fast_open, Some(false));
        assert_eq!(out.tls_fragment.unwrap().size, "10-30");
        let tls = out.tls.unwrap();
        let tricks = tls.tls_tricks.unwrap();
        assert!(tricks.mixedcase_sni);
        assert_eq!(tricks.padding_mode, "random");
        assert_eq!(tls.utls.unwrap().fingerprint, "custom");

        let inputs = patcher.into_dns_inputs();
        assert_eq!(inputs.server_domains, vec![FullDomain("proxy.example.com".into())]);
    }

    #[test]
    fn test_reality_skips_mux_and_tricks() {
        let opt = tricky_options();
        let ids = no_identities();
        let mut patcher = OutboundPatcher::new(&opt, &ids);
        let mut rng = StdRng::seed_from_u64(0);
        let out = patcher
            .patch(tls_outbound(OutboundKind::Vless, None, true), &mut rng)
            .unwrap();
        assert!(out.multiplex.is_none());
        assert!(out.tls_fragment.is_none());
        assert!(out.tls.unwrap().tls_tricks.is_none());
    }

    #[test]
    fn test_tricks_need_http_like_transport() {
        let opt = tricky_options();
        let ids = no_identities();
        let mut patcher = OutboundPatcher::new(&opt, &ids);
        let mut rng = StdRng::seed_from_u64(0);
        let out = patcher
            .patch(tls_outbound(OutboundKind::Trojan, Some("quic"), false), &mut rng)
            .unwrap();
        assert!(out.tls_fragment.is_none());
        assert!(out.multiplex.is_some());
    }

    #[test]
    fn test_mux_only_for_supported_protocols() {
        let opt = tricky_options();
        let ids = no_identities();
        let mut patcher = OutboundPatcher::new(&opt, &ids);
        let mut rng = StdRng::seed_from_u64(0);
        let out = patcher
            .patch(tls_outbound(OutboundKind::Hysteria2, None, false), &mut rng)
            .unwrap();
        assert!(out.multiplex.is_none());
    }

    #[test]
    fn test_ip_and_detoured_servers_not_recorded() {
        let opt = Options::default();
        let ids = no_identities();
        let mut patcher = OutboundPatcher::new(&opt, &ids);
        let mut rng = StdRng::seed_from_u64(0);
        let mut ip = Outbound::new(OutboundKind::Shadowsocks, "ss");
        ip.server = Some("203.0.113.9".into());
        patcher.patch(ip, &mut rng).unwrap();
        let mut v6 = Outbound::new(OutboundKind::Shadowsocks, "ss6");
        v6.server = Some("[2001:db8::1]".into());
        patcher.patch(v6, &mut rng).unwrap();
        let mut chained = Outbound::new(OutboundKind::Vmess, "chained");
        chained.server = Some("inner.example".into());
        chained.detour = Some("ss".into());
        patcher.patch(chained, &mut rng).unwrap();
        assert!(patcher.into_dns_inputs().server_domains.is_empty());
    }

    #[test]
    fn test_allow_insecure() {
        let opt = Options {
            allow_insecure: true,
            ..Options::default()
        };
        let ids = no_identities();
        let mut patcher = OutboundPatcher::new(&opt, &ids);
        let mut rng = StdRng::seed_from_u64(0);
        let out = patcher
            .patch(tls_outbound(OutboundKind::Trojan, None, false), &mut rng)
            .unwrap();
        assert_eq!(out.tls.unwrap().insecure, Some(true));
    }

    #[test]
    fn test_warp_marker_expanded_in_place() {
        let opt = Options::default();
        let mut ids = BTreeMap::new();
        ids.insert("p1".to_string(), identity("peer-p1"));
        let mut patcher = OutboundPatcher::new(&opt, &ids);
        let mut rng = StdRng::seed_from_u64(5);
        let mut marked = Outbound::new(OutboundKind::WireGuard, "my-warp");
        marked.detour = Some("proxy".into());
        marked.warp = Some(WarpMarker {
            host: "engage.cloudflareclient.com".into(),
            ..WarpMarker::default()
        });
        let out = patcher.patch(marked, &mut rng).unwrap();
        assert_eq!(out.tag, "my-warp");
        assert_eq!(out.detour.as_deref(), Some("proxy"));
        assert!(out.warp.is_none());
        assert_eq!(out.wireguard.peer_public_key.as_deref(), Some("peer-p1"));
        let inputs = patcher.into_dns_inputs();
        assert_eq!(inputs.static_hosts.len(), 1);
        assert!(inputs.server_domains.is_empty());
    }

    #[test]
    fn test_warp_marker_without_identity_fails() {
        let opt = Options::default();
        let ids = no_identities();
        let mut patcher = OutboundPatcher::new(&opt, &ids);
        let mut rng = StdRng::seed_from_u64(0);
        let mut marked = Outbound::new(OutboundKind::WireGuard, "w");
        marked.warp = Some(WarpMarker {
            key: "p2".into(),
            ..WarpMarker::default()
        });
        let err = patcher.patch(marked, &mut rng).unwrap_err();
        assert!(matches!(err, Error::ConfigBuild(msg) if msg.contains("p2")));
    }
}
