//! Evaluates packets against the rules held by a fake packet filter.
//!
//! Only the matches and targets the cell agent writes are understood. New
//! connections are modelled, so conntrack state matches never apply.

use ipnet::Ipv4Net;
use netpol_cell::{iptables::fake::FakeIpTables, Rule};
use std::net::Ipv4Addr;

/// A packet traversing the forward path of a cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub iface: String,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: String,
    pub dport: u16,
    pub mark: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

/// What became of a packet, along with any log prefixes it triggered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace {
    pub verdict: Verdict,
    pub mark: u32,
    pub logged: Vec<String>,
}

enum Flow {
    Continue,
    Return,
    Final(Verdict),
}

// === impl Packet ===

impl Packet {
    pub fn tcp(iface: &str, src: [u8; 4], dst: [u8; 4], dport: u16) -> Self {
        Self {
            iface: iface.to_string(),
            src: src.into(),
            dst: dst.into(),
            proto: "tcp".to_string(),
            dport,
            mark: 0,
        }
    }

    pub fn udp(iface: &str, src: [u8; 4], dst: [u8; 4], dport: u16) -> Self {
        Self {
            proto: "udp".to_string(),
            ..Self::tcp(iface, src, dst, dport)
        }
    }

    pub fn with_mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }
}

/// Walks `table`/`chain` as the kernel would, falling through to accept.
pub fn traverse(ipt: &FakeIpTables, table: &str, chain: &str, packet: &Packet) -> Trace {
    let mut packet = packet.clone();
    let mut logged = Vec::new();
    let verdict = match walk(ipt, table, chain, &mut packet, &mut logged, 0) {
        Flow::Final(verdict) => verdict,
        Flow::Continue | Flow::Return => Verdict::Accept,
    };
    Trace {
        verdict,
        mark: packet.mark,
        logged,
    }
}

fn walk(
    ipt: &FakeIpTables,
    table: &str,
    chain: &str,
    packet: &mut Packet,
    logged: &mut Vec<String>,
    depth: usize,
) -> Flow {
    assert!(depth < 16, "chain {chain} recurses too deeply");
    let rules = ipt
        .rules(table, chain)
        .unwrap_or_else(|| panic!("chain {table}/{chain} does not exist"));
    for rule in &rules {
        match apply(ipt, table, rule, packet, logged, depth) {
            Flow::Continue => {}
            Flow::Return => return Flow::Continue,
            flow @ Flow::Final(_) => return flow,
        }
    }
    Flow::Return
}

fn apply(
    ipt: &FakeIpTables,
    table: &str,
    rule: &Rule,
    packet: &mut Packet,
    logged: &mut Vec<String>,
    depth: usize,
) -> Flow {
    let mut args = rule.args().iter().map(String::as_str);
    while let Some(arg) = args.next() {
        let matched = match arg {
            "-i" => Some(packet.iface.as_str()) == args.next(),
            "-s" | "--source" => contains(args.next(), packet.src),
            "-d" | "--destination" => contains(args.next(), packet.dst),
            "-p" => Some(packet.proto.as_str()) == args.next(),
            "--dport" => in_ports(args.next(), packet.dport),
            "-m" => match args.next() {
                Some("conntrack") => {
                    let _ = (args.next(), args.next());
                    false
                }
                Some("mark") => {
                    assert_eq!(args.next(), Some("--mark"));
                    let (value, mask) = mark(args.next());
                    packet.mark & mask == value
                }
                Some("comment") | Some("limit") => {
                    let _ = (args.next(), args.next());
                    true
                }
                module => panic!("unsupported match module {module:?} in {rule}"),
            },
            "-j" => return jump(ipt, table, &mut args, packet, logged, depth),
            arg => panic!("unsupported argument {arg:?} in {rule}"),
        };
        if !matched {
            return Flow::Continue;
        }
    }
    Flow::Continue
}

fn jump<'a>(
    ipt: &FakeIpTables,
    table: &str,
    mut args: impl Iterator<Item = &'a str>,
    packet: &mut Packet,
    logged: &mut Vec<String>,
    depth: usize,
) -> Flow {
    match args.next() {
        Some("ACCEPT") => Flow::Final(Verdict::Accept),
        Some("DROP") | Some("REJECT") => Flow::Final(Verdict::Drop),
        Some("RETURN") => Flow::Return,
        Some("MARK") => {
            assert_eq!(args.next(), Some("--set-xmark"));
            let (value, mask) = mark(args.next());
            packet.mark = (packet.mark & !mask) ^ value;
            Flow::Continue
        }
        Some("LOG") => {
            while let Some(opt) = args.next() {
                if opt == "--log-prefix" {
                    logged.extend(args.next().map(str::to_string));
                }
            }
            Flow::Continue
        }
        Some(chain) => match walk(ipt, table, chain, packet, logged, depth + 1) {
            Flow::Final(verdict) => Flow::Final(verdict),
            Flow::Continue | Flow::Return => Flow::Continue,
        },
        None => Flow::Continue,
    }
}

fn contains(net: Option<&str>, ip: Ipv4Addr) -> bool {
    let net = net.expect("address match requires an argument");
    match net.parse::<Ipv4Net>() {
        Ok(net) => net.contains(&ip),
        Err(_) => net.parse::<Ipv4Addr>().ok() == Some(ip),
    }
}

fn in_ports(ports: Option<&str>, port: u16) -> bool {
    let ports = ports.expect("--dport requires an argument");
    let (start, end) = ports.split_once(':').unwrap_or((ports, ports));
    let start = start.parse::<u16>().expect("port must be numeric");
    let end = end.parse::<u16>().expect("port must be numeric");
    (start..=end).contains(&port)
}

fn mark(spec: Option<&str>) -> (u32, u32) {
    let spec = spec.expect("mark requires an argument");
    let (value, mask) = spec.split_once('/').unwrap_or((spec, "0xffffffff"));
    let hex = |s: &str| {
        u32::from_str_radix(s.trim_start_matches("0x"), 16).expect("mark must be hexadecimal")
    };
    (hex(value), hex(mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(rules: Vec<Rule>) -> FakeIpTables {
        let ipt = FakeIpTables::with_builtin([("filter", "FORWARD")]);
        ipt.seed("filter", "FORWARD", vec![Rule::new(["-j", "policy"])]);
        ipt.seed("filter", "policy", rules);
        ipt
    }

    #[test]
    fn marks_then_matches() {
        let ipt = filter(vec![
            Rule::new(["--source", "10.0.0.1", "-j", "MARK", "--set-xmark", "0x0002/0xffff"]),
            Rule::new(["-p", "tcp", "--dport", "80:90", "-m", "mark", "--mark", "0x0002/0xffff"])
                .jump("ACCEPT"),
            Rule::new(["-s", "10.0.0.0/24"])
                .args_from(["-m", "limit", "--limit", "2/min", "-j", "LOG"])
                .args_from(["--log-prefix", "DENY: "]),
            Rule::new(["-s", "10.0.0.0/24"]).jump("DROP"),
        ]);

        let ok = traverse(&ipt, "filter", "FORWARD", &Packet::tcp("eth0", [10, 0, 0, 1], [10, 0, 0, 9], 85));
        assert_eq!(ok.verdict, Verdict::Accept);
        assert_eq!(ok.mark, 2);

        let denied = traverse(&ipt, "filter", "FORWARD", &Packet::tcp("eth0", [10, 0, 0, 3], [10, 0, 0, 9], 85));
        assert_eq!(denied.verdict, Verdict::Drop);
        assert_eq!(denied.logged, vec!["DENY: ".to_string()]);

        let elsewhere = traverse(&ipt, "filter", "FORWARD", &Packet::udp("eth0", [10, 1, 0, 3], [10, 0, 0, 9], 85));
        assert_eq!(elsewhere.verdict, Verdict::Accept);
    }

    #[test]
    fn conntrack_never_matches_new_packets() {
        let ipt = filter(vec![
            Rule::new(["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED"]).jump("ACCEPT"),
            Rule::new(["-i", "eth0"]).jump("DROP"),
        ]);
        let trace = traverse(&ipt, "filter", "FORWARD", &Packet::tcp("eth0", [1, 1, 1, 1], [2, 2, 2, 2], 1));
        assert_eq!(trace.verdict, Verdict::Drop);
    }
}
