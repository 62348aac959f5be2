//! Linux transparent-proxy (TPROXY) network rules.
//!
//! When the tunnel service is active on Linux, packets are steered into the
//! engine's TPROXY inbound with policy routing plus an nftables chain:
//!
//! ```text
//!   ip rule:   fwmark 0x1 lookup 100
//!   ip route:  local 0.0.0.0/0 dev lo table 100      (+ ::/0, best effort)
//!
//!   table inet rostovvpn
//!     chain prerouting { type filter hook prerouting priority mangle; policy accept; }
//!       ip protocol tcp tproxy to :<tproxy> meta mark set 0x1 accept
//!       ip protocol udp tproxy to :<tproxy> meta mark set 0x1 accept
//!       udp dport 53 redirect to :<dns>               (optional)
//! ```
//!
//! [`NetworkRules::ensure`] checks each rule against the kernel's current
//! listing and only adds what is missing, so calling it twice leaves the
//! same rule set as calling it once. [`NetworkRules::cleanup`] deletes
//! everything unconditionally and never fails; its errors go to
//! [`Diagnostics`].
//!
//! On every other OS both operations are no-ops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::command::{argv, CommandRunner, HostOs};
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};

/// nftables table name.
pub const NFT_TABLE: &str = "rostovvpn";
/// nftables chain name.
pub const NFT_CHAIN: &str = "prerouting";
/// Packet mark used by the policy rule.
pub const FW_MARK: &str = "0x1";
/// Routing table dedicated to marked packets.
pub const ROUTE_TABLE: &str = "100";

const ENSURE_TIMEOUT: Duration = Duration::from_secs(6);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(4);
const SOURCE: &str = "netrules";

/// Installs and removes the TPROXY policy routing and nftables rules.
pub struct NetworkRules {
    runner: Arc<dyn CommandRunner>,
    diagnostics: Diagnostics,
    os: HostOs,
    // Ensure/cleanup pairs must not interleave.
    lock: Mutex<()>,
}

impl NetworkRules {
    /// Creates a rule manager for the current OS.
    pub fn new(runner: Arc<dyn CommandRunner>, diagnostics: Diagnostics) -> Self {
        Self {
            runner,
            diagnostics,
            os: HostOs::current(),
            lock: Mutex::new(()),
        }
    }

    /// Overrides the detected OS.
    pub fn with_os(mut self, os: HostOs) -> Self {
        self.os = os;
        self
    }

    /// Installs the rules, adding only what is missing.
    ///
    /// # Errors
    ///
    /// Fails if an IPv4 policy rule, route or nftables rule cannot be added,
    /// or if the whole operation exceeds six seconds. IPv6 and table/chain
    /// creation failures are reported to diagnostics only.
    pub async fn ensure(&self, tproxy_port: u16, dns_port: u16, redirect_dns: bool) -> Result<()> {
        if self.os != HostOs::Linux {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        tokio::time::timeout(
            ENSURE_TIMEOUT,
            self.ensure_inner(tproxy_port, dns_port, redirect_dns),
        )
        .await
        .map_err(|_| Error::Timeout("installing TPROXY rules".to_string()))?
    }

    async fn ensure_inner(&self, tproxy_port: u16, dns_port: u16, redirect_dns: bool) -> Result<()> {
        let rules = self.runner.run("ip", &argv(&["rule", "show"])).await?;
        if !has_policy_rule(&rules) {
            self.runner
                .run("ip", &argv(&["rule", "add", "fwmark", FW_MARK, "lookup", ROUTE_TABLE]))
                .await?;
        }

        let routes = self
            .runner
            .run("ip", &argv(&["route", "show", "table", ROUTE_TABLE]))
            .await?;
        if !has_local_route(&routes, "0.0.0.0/0") {
            self.runner
                .run(
                    "ip",
                    &argv(&["route", "add", "local", "0.0.0.0/0", "dev", "lo", "table", ROUTE_TABLE]),
                )
                .await?;
        }

        self.ensure_ipv6().await;

        self.best_effort("nft", &["create", "table", "inet", NFT_TABLE]).await;
        self.best_effort(
            "nft",
            &[
                "add",
                "chain",
                "inet",
                NFT_TABLE,
                NFT_CHAIN,
                "{ type filter hook prerouting priority mangle; policy accept; }",
            ],
        )
        .await;

        let ruleset = self.runner.run("nft", &argv(&["list", "ruleset"])).await?;
        let port = format!(":{}", tproxy_port);
        for proto in ["tcp", "udp"] {
            if !has_tproxy_rule(&ruleset, proto, tproxy_port) {
                self.runner
                    .run(
                        "nft",
                        &argv(&[
                            "add", "rule", "inet", NFT_TABLE, NFT_CHAIN, "ip", "protocol", proto,
                            "tproxy", "to", port.as_str(), "meta", "mark", "set", FW_MARK, "accept",
                        ]),
                    )
                    .await?;
            }
        }

        if redirect_dns && !has_dns_redirect(&ruleset, dns_port) {
            let dns = format!(":{}", dns_port);
            self.runner
                .run(
                    "nft",
                    &argv(&[
                        "add", "rule", "inet", NFT_TABLE, NFT_CHAIN, "udp", "dport", "53",
                        "redirect", "to", dns.as_str(),
                    ]),
                )
                .await?;
        }

        info!(tproxy_port, dns_port, redirect_dns, "TPROXY rules in place");
        Ok(())
    }

    async fn ensure_ipv6(&self) {
        let rules = self.runner.run("ip", &argv(&["-6", "rule", "show"])).await;
        if !rules.as_deref().map(has_policy_rule).unwrap_or(false) {
            self.best_effort("ip", &["-6", "rule", "add", "fwmark", FW_MARK, "lookup", ROUTE_TABLE])
                .await;
        }
        let routes = self
            .runner
            .run("ip", &argv(&["-6", "route", "show", "table", ROUTE_TABLE]))
            .await;
        if !routes
            .as_deref()
            .map(|r| has_local_route(r, "::/0"))
            .unwrap_or(false)
        {
            self.best_effort(
                "ip",
                &["-6", "route", "add", "local", "::/0", "dev", "lo", "table", ROUTE_TABLE],
            )
            .await;
        }
    }

    /// Removes every rule this module installs. Never fails.
    pub async fn cleanup(&self) {
        if self.os != HostOs::Linux {
            return;
        }
        let _guard = self.lock.lock().await;
        let steps = async {
            self.best_effort("nft", &["delete", "table", "inet", NFT_TABLE]).await;
            self.best_effort("ip", &["rule", "del", "fwmark", FW_MARK, "lookup", ROUTE_TABLE])
                .await;
            self.best_effort(
                "ip",
                &["route", "del", "local", "0.0.0.0/0", "dev", "lo", "table", ROUTE_TABLE],
            )
            .await;
            self.best_effort("ip", &["-6", "rule", "del", "fwmark", FW_MARK, "lookup", ROUTE_TABLE])
                .await;
            self.best_effort(
                "ip",
                &["-6", "route", "del", "local", "::/0", "dev", "lo", "table", ROUTE_TABLE],
            )
            .await;
        };
        if tokio::time::timeout(CLEANUP_TIMEOUT, steps).await.is_err() {
            self.diagnostics
                .report(SOURCE, "removing TPROXY rules timed out");
        }
        debug!("TPROXY rules removed");
    }

    async fn best_effort(&self, program: &str, args: &[&str]) {
        if let Err(e) = self.runner.run(program, &argv(args)).await {
            self.diagnostics.report(SOURCE, e.to_string());
        }
    }
}

fn has_policy_rule(listing: &str) -> bool {
    let wanted = format!("fwmark {} lookup {}", FW_MARK, ROUTE_TABLE);
    listing.lines().any(|l| l.contains(&wanted))
}

fn has_local_route(listing: &str, prefix: &str) -> bool {
    let wanted = format!("local {} dev lo", prefix);
    listing.lines().map(str::trim_start).any(|l| {
        l.starts_with(&wanted) || l.starts_with("local default dev lo")
    })
}

/// `nft list ruleset` prints marks zero-padded (`0x00000001`), so marks
/// compare by value.
fn has_tproxy_rule(ruleset: &str, proto: &str, port: u16) -> bool {
    let target = format!(":{}", port);
    let Some(mark) = parse_mark(FW_MARK) else {
        return false;
    };
    ruleset.lines().any(|line| {
        let words: Vec<&str> = line.split_whitespace().collect();
        let follows = |key: &str, value: &str| {
            words.windows(2).any(|w| w[0] == key && w[1] == value)
        };
        let marked = words
            .windows(3)
            .any(|w| w[0] == "mark" && w[1] == "set" && parse_mark(w[2]) == Some(mark));
        (follows("protocol", proto) || follows("l4proto", proto))
            && words.contains(&"tproxy")
            && follows("to", &target)
            && marked
    })
}

fn parse_mark(token: &str) -> Option<u32> {
    match token.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => token.parse().ok(),
    }
}

fn has_dns_redirect(ruleset: &str, port: u16) -> bool {
    let wanted = format!("udp dport 53 redirect to :{}", port);
    ruleset.lines().any(|l| l.contains(&wanted))
}


#[cfg(test)]
mod tests {
    use super::testing::fake_kernel;
    use super::*;
    use crate::command::testing::RecordingRunner;

    fn rules(runner: Arc<dyn CommandRunner>) -> NetworkRules {
        NetworkRules::new(runner, Diagnostics::log_only()).with_os(HostOs::Linux)
    }

    #[tokio::test]
    async fn test_ensure_installs_everything() {
        let (runner, state) = fake_kernel();
        rules(runner).ensure(12335, 16450, true).await.unwrap();
        let s = state.lock().unwrap().clone();
        assert_eq!(s.rules_v4, vec!["fwmark 0x1 lookup 100"]);
        assert_eq!(s.routes_v4, vec!["local 0.0.0.0/0 dev lo"]);
        assert_eq!(s.routes_v6, vec!["local ::/0 dev lo"]);
        assert!(s.table && s.chain);
        assert_eq!(
            s.nft_rules,
            vec![
                "ip protocol tcp tproxy to :12335 meta mark set 0x1 accept",
                "ip protocol udp tproxy to :12335 meta mark set 0x1 accept",
                "udp dport 53 redirect to :16450",
            ]
        );
    }

    #[tokio::test]
    async fn test_ensure_twice_equals_once() {
        let (runner, state) = fake_kernel();
        let manager = rules(runner);
        manager.ensure(12335, 16450, true).await.unwrap();
        let once = state.lock().unwrap().clone();
        manager.ensure(12335, 16450, true).await.unwrap();
        let twice = state.lock().unwrap().clone();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_dns_redirect_is_optional() {
        let (runner, state) = fake_kernel();
        rules(runner).ensure(12335, 16450, false).await.unwrap();
        assert!(!state
            .lock()
            .unwrap()
            .nft_rules
            .iter()
            .any(|r| r.contains("dport 53")));
    }

    #[tokio::test]
    async fn test_cleanup_removes_everything_and_tolerates_double_delete() {
        let (runner, state) = fake_kernel();
        let (diag, mut rx) = Diagnostics::channel();
        let manager = NetworkRules::new(runner, diag).with_os(HostOs::Linux);
        manager.ensure(12335, 16450, true).await.unwrap();
        manager.cleanup().await;
        assert_eq!(*state.lock().unwrap(), testing::KernelState::default());
        while rx.try_recv().is_ok() {}

        manager.cleanup().await;
        assert!(rx.try_recv().is_ok(), "second cleanup should report swallowed errors");
    }

    #[tokio::test]
    async fn test_ipv4_add_failure_surfaces() {
        let runner = Arc::new(RecordingRunner::new().with_responder(|inv| {
            (inv.join(" ") == "ip rule add fwmark 0x1 lookup 100")
                .then(|| Err(Error::Rpc("Operation not permitted".into())))
        }));
        let err = rules(runner).ensure(12335, 16450, true).await.unwrap_err();
        assert!(err.to_string().contains("Operation not permitted"));
    }

    #[tokio::test]
    async fn test_non_linux_is_noop() {
        let runner = Arc::new(RecordingRunner::new());
        let manager = NetworkRules::new(runner.clone(), Diagnostics::log_only()).with_os(HostOs::MacOs);
        manager.ensure(1, 2, true).await.unwrap();
        manager.cleanup().await;
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_listing_parsers() {
        assert!(has_policy_rule("0:\tfrom all lookup local\n32765:\tfrom all fwmark 0x1 lookup 100\n"));
        assert!(!has_policy_rule("32766:\tfrom all lookup main\n"));
        assert!(has_local_route("local default dev lo scope host\n", "0.0.0.0/0"));
        assert!(!has_tproxy_rule("ip protocol tcp tproxy to :1 meta mark set 0x1 accept", "udp", 1));
        assert!(has_dns_redirect("udp dport 53 redirect to :16450", 16450));
    }

    const HOST_RULESET: &str = "table inet rostovvpn {
\tchain prerouting {
\t\ttype filter hook prerouting priority mangle; policy accept;
\t\tip protocol tcp tproxy to :12335 meta mark set 0x00000001 accept
\t\tip protocol udp tproxy to :12335 meta mark set 0x00000001 accept
\t\tudp dport 53 redirect to :16450
\t}
}
";

    #[test]
    fn test_host_ruleset_listing_is_recognised() {
        assert!(has_tproxy_rule(HOST_RULESET, "tcp", 12335));
        assert!(has_tproxy_rule(HOST_RULESET, "udp", 12335));
        assert!(!has_tproxy_rule(HOST_RULESET, "tcp", 1233));
        assert!(!has_tproxy_rule(
            "ip protocol tcp tproxy to :12335 meta mark set 0x00000002 accept",
            "tcp",
            12335
        ));
        assert!(has_dns_redirect(HOST_RULESET, 16450));
    }

    #[tokio::test]
    async fn test_ensure_skips_rules_from_host_listing() {
        let runner = Arc::new(RecordingRunner::new().with_output("nft list ruleset", HOST_RULESET));
        rules(runner.clone()).ensure(12335, 16450, true).await.unwrap();
        assert!(!runner.lines().iter().any(|l| l.starts_with("nft add rule")));
    }
}
