//! Computes the packet-filter ruleset that enforces the policies touching
//! this cell.
//!
//! The ruleset is laid out as follows:
//!
//! 1. accept packets of established connections, so replacing the ruleset
//!    never interrupts a flow;
//! 2. mark packets sent by local containers with their group's tag;
//! 3. accept local-to-local packets allowed by a policy;
//! 4. accept packets arriving from the overlay whose mark carries the tag of
//!    a source allowed to reach the local destination;
//! 5. optionally log, then drop, everything else between containers.
//!
//! Each family is sorted so that identical inputs produce identical rules.

use ipnet::Ipv4Net;
use netpol_cell::{Container, Rule};
use netpol_policy_server_core::{PortRange, Protocol, Tag, TagWidth, TaggedPolicy};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
};

#[cfg(test)]
mod tests;

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// The CIDR from which every container on every cell is addressed.
    pub overlay_network: Ipv4Net,
    /// The portion of the overlay assigned to this cell.
    pub local_subnet: Ipv4Net,
    /// The bridge local containers are attached to.
    pub local_iface: String,
    /// The device carrying overlay traffic between cells.
    pub encap_iface: String,
    pub tag_width: TagWidth,
}

#[derive(Clone, Debug)]
pub struct Planner {
    config: PlannerConfig,
}

type Key<'p> = &'p str;

// === impl Planner ===

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Lists the distinct groups of local containers, which selects the
    /// policies this cell must enforce.
    pub fn local_groups<'c>(containers: impl IntoIterator<Item = &'c Container>) -> Vec<String> {
        containers
            .into_iter()
            .filter_map(|c| c.group_key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn plan<'c>(
        &self,
        containers: impl IntoIterator<Item = &'c Container>,
        policies: &[TaggedPolicy],
        logging: bool,
    ) -> Vec<Rule> {
        let mut local = BTreeMap::<Key<'_>, BTreeSet<Ipv4Addr>>::new();
        for c in containers {
            match c.group_key.as_deref() {
                Some(key) => {
                    local.entry(key).or_default().insert(c.ip);
                }
                None => tracing::warn!(
                    handle = %c.handle,
                    ip = %c.ip,
                    "Container has no policy group; restage the app to apply policies"
                ),
            }
        }
        let ips = |key: &str| local.get(key).into_iter().flatten().copied();

        let mut marks = BTreeSet::<(Key<'_>, Ipv4Addr, Tag)>::new();
        let mut local_allows =
            BTreeSet::<(Protocol, Key<'_>, Key<'_>, PortRange, Ipv4Addr, Ipv4Addr)>::new();
        let mut remote_allows =
            BTreeSet::<(Protocol, Key<'_>, Key<'_>, PortRange, Ipv4Addr, Tag)>::new();
        for tagged in policies {
            let p = &tagged.policy;
            for src_ip in ips(p.source.as_str()) {
                marks.insert((p.source.as_str(), src_ip, tagged.source_tag));
            }
            for dst_ip in ips(p.destination.as_str()) {
                remote_allows.insert((
                    p.protocol,
                    p.source.as_str(),
                    p.destination.as_str(),
                    p.ports,
                    dst_ip,
                    tagged.source_tag,
                ));
                for src_ip in ips(p.source.as_str()) {
                    local_allows.insert((
                        p.protocol,
                        p.source.as_str(),
                        p.destination.as_str(),
                        p.ports,
                        src_ip,
                        dst_ip,
                    ));
                }
            }
        }

        let mut rules = Vec::with_capacity(
            1 + marks.len() + local_allows.len() + remote_allows.len() + 4,
        );
        rules.push(
            Rule::new(["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED"]).jump("ACCEPT"),
        );
        rules.extend(
            marks
                .into_iter()
                .map(|(key, ip, tag)| self.mark_set(key, ip, tag)),
        );
        rules.extend(
            local_allows
                .into_iter()
                .map(|(proto, src, dst, ports, src_ip, dst_ip)| {
                    self.local_allow(proto, src, dst, ports, src_ip, dst_ip)
                }),
        );
        rules.extend(
            remote_allows
                .into_iter()
                .map(|(proto, src, dst, ports, dst_ip, tag)| {
                    self.remote_allow(proto, src, dst, ports, dst_ip, tag)
                }),
        );
        self.deny(&mut rules, logging);
        rules
    }

    fn mark(&self, tag: Tag) -> String {
        let width = self.config.tag_width;
        format!(
            "0x{}/0x{:0w$x}",
            tag.to_hex(width),
            width.mask(),
            w = width.hex_len()
        )
    }

    fn mark_set(&self, key: &str, ip: Ipv4Addr, tag: Tag) -> Rule {
        Rule::new(["--source".to_string(), ip.to_string()])
            .comment(comment(&format!("src:{key}")))
            .args_from(["-j", "MARK", "--set-xmark"])
            .arg(self.mark(tag))
    }

    fn local_allow(
        &self,
        protocol: Protocol,
        src: &str,
        dst: &str,
        ports: PortRange,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Rule {
        Rule::new(["-i", self.config.local_iface.as_str()])
            .args_from(["-s".to_string(), src_ip.to_string()])
            .args_from(["-d".to_string(), dst_ip.to_string()])
            .args_from(["-p", protocol.as_str()])
            .args_from(["--dport".to_string(), ports.to_string()])
            .comment(comment(&format!("src:{src}_dst:{dst}")))
            .jump("ACCEPT")
    }

    fn remote_allow(
        &self,
        protocol: Protocol,
        src: &str,
        dst: &str,
        ports: PortRange,
        dst_ip: Ipv4Addr,
        tag: Tag,
    ) -> Rule {
        Rule::new(["-i", self.config.encap_iface.as_str()])
            .args_from(["-d".to_string(), dst_ip.to_string()])
            .args_from(["-p", protocol.as_str()])
            .args_from(["--dport".to_string(), ports.to_string()])
            .args_from(["-m", "mark", "--mark"])
            .arg(self.mark(tag))
            .comment(comment(&format!("src:{src}_dst:{dst}")))
            .jump("ACCEPT")
    }

    fn deny(&self, rules: &mut Vec<Rule>, logging: bool) {
        let subnet = self.config.local_subnet.to_string();
        let overlay = self.config.overlay_network.to_string();
        let guards = [
            (
                Rule::new(["-i", self.config.local_iface.as_str()])
                    .args_from(["-s", subnet.as_str(), "-d", subnet.as_str()]),
                "DENY_LOCAL: ",
            ),
            (
                Rule::new(["-i", self.config.encap_iface.as_str()])
                    .args_from(["-s", overlay.as_str(), "-d", subnet.as_str()]),
                "DENY_REMOTE: ",
            ),
        ];
        for (guard, prefix) in guards {
            if logging {
                rules.push(
                    guard
                        .clone()
                        .args_from(["-m", "limit", "--limit", "2/min", "-j", "LOG"])
                        .args_from(["--log-prefix", prefix]),
                );
            }
            rules.push(guard.jump("DROP"));
        }
    }
}

/// Renders comment text without whitespace.
fn comment(text: &str) -> String {
    text.replace(char::is_whitespace, "_")
}
