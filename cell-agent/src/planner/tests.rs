use super::*;
use maplit::btreemap;
use netpol_cell::canonical;
use netpol_policy_server_core::Policy;
use pretty_assertions::assert_eq;

fn config() -> PlannerConfig {
    PlannerConfig {
        overlay_network: "10.255.0.0/16".parse().unwrap(),
        local_subnet: "10.255.1.0/24".parse().unwrap(),
        local_iface: "cni0".to_string(),
        encap_iface: "flannel.1".to_string(),
        tag_width: TagWidth::default(),
    }
}

fn container(handle: &str, ip: [u8; 4], group: Option<&str>) -> Container {
    let metadata = match group {
        Some(g) => btreemap! { "policy_group_id".to_string() => serde_json::json!(g) },
        None => Default::default(),
    };
    Container::new(
        handle,
        Ipv4Addr::from(ip),
        format!("/var/vcap/data/netns/{handle}"),
        vec![],
        metadata,
    )
}

fn policy(
    src: &str,
    src_tag: u32,
    dst: &str,
    dst_tag: u32,
    proto: Protocol,
    ports: (u16, u16),
) -> TaggedPolicy {
    TaggedPolicy {
        policy: Policy::new(src, dst, proto, PortRange::new(ports.0, ports.1).unwrap()).unwrap(),
        source_tag: Tag::new(src_tag).unwrap(),
        destination_tag: Tag::new(dst_tag).unwrap(),
    }
}

fn lines(rules: &[Rule]) -> Vec<String> {
    rules.iter().map(ToString::to_string).collect()
}

#[derive(Copy, Clone, Debug)]
struct Packet {
    iface: &'static str,
    src: [u8; 4],
    dst: [u8; 4],
    proto: &'static str,
    dport: u16,
    mark: u32,
    established: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Accept,
    Drop,
    /// Fell off the end of the chain.
    Return,
}

impl Packet {
    fn new(iface: &'static str, src: [u8; 4], dst: [u8; 4], dport: u16) -> Self {
        Self {
            iface,
            src,
            dst,
            proto: "tcp",
            dport,
            mark: 0,
            established: false,
        }
    }
}

/// Walks `rules` the way the kernel would for the subset of matches the
/// planner emits.
fn traverse(rules: &[Rule], mut pkt: Packet) -> (Verdict, u32) {
    let addr_matches = |spec: &str, ip: [u8; 4]| match spec.parse::<Ipv4Net>() {
        Ok(net) => net.contains(&Ipv4Addr::from(ip)),
        Err(_) => spec.parse::<Ipv4Addr>().unwrap() == Ipv4Addr::from(ip),
    };
    let parse_mark = |spec: &str| {
        let (value, mask) = spec.split_once('/').unwrap();
        let hex = |s: &str| u32::from_str_radix(s.trim_start_matches("0x"), 16).unwrap();
        (hex(value), hex(mask))
    };

    'rules: for rule in rules {
        let args = rule.args();
        let mut i = 0;
        while i < args.len() {
            let value = args.get(i + 1).map(String::as_str).unwrap_or_default();
            let matched = match args[i].as_str() {
                "-i" => value == pkt.iface,
                "-s" | "--source" => addr_matches(value, pkt.src),
                "-d" => addr_matches(value, pkt.dst),
                "-p" => value == pkt.proto,
                "--dport" => {
                    let (start, end) = value.split_once(':').unwrap_or((value, value));
                    (start.parse::<u16>().unwrap()..=end.parse::<u16>().unwrap()).contains(&pkt.dport)
                }
                "--ctstate" => pkt.established,
                "--mark" => {
                    let (v, m) = parse_mark(value);
                    pkt.mark & m == v
                }
                "-m" | "--comment" | "--limit" => true,
                "-j" => match value {
                    "ACCEPT" => return (Verdict::Accept, pkt.mark),
                    "DROP" => return (Verdict::Drop, pkt.mark),
                    "LOG" => continue 'rules,
                    "MARK" => {
                        assert_eq!(args[i + 2], "--set-xmark");
                        let (v, m) = parse_mark(&args[i + 3]);
                        pkt.mark = (pkt.mark & !m) ^ v;
                        continue 'rules;
                    }
                    target => panic!("unexpected target {target}"),
                },
                arg => panic!("unexpected argument {arg}"),
            };
            if !matched {
                continue 'rules;
            }
            i += 2;
        }
    }
    (Verdict::Return, pkt.mark)
}

#[test]
fn enforces_a_policy_between_local_containers() {
    let containers = [
        container("a", [10, 255, 1, 2], Some("app-a")),
        container("b", [10, 255, 1, 3], Some("app-b")),
        container("c", [10, 255, 1, 4], Some("app-c")),
    ];
    let policies = [policy("app-a", 1, "app-b", 2, Protocol::Tcp, (8080, 8080))];
    let rules = Planner::new(config()).plan(&containers, &policies, false);

    assert_eq!(
        lines(&rules),
        vec![
            "-m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT",
            "--source 10.255.1.2 -m comment --comment src:app-a -j MARK --set-xmark 0x0001/0xffff",
            "-i cni0 -s 10.255.1.2 -d 10.255.1.3 -p tcp --dport 8080 \
             -m comment --comment src:app-a_dst:app-b -j ACCEPT",
            "-i flannel.1 -d 10.255.1.3 -p tcp --dport 8080 -m mark --mark 0x0001/0xffff \
             -m comment --comment src:app-a_dst:app-b -j ACCEPT",
            "-i cni0 -s 10.255.1.0/24 -d 10.255.1.0/24 -j DROP",
            "-i flannel.1 -s 10.255.0.0/16 -d 10.255.1.0/24 -j DROP",
        ]
    );

    let a_to_b = Packet::new("cni0", [10, 255, 1, 2], [10, 255, 1, 3], 8080);
    assert_eq!(traverse(&rules, a_to_b), (Verdict::Accept, 1));

    let c_to_b = Packet { src: [10, 255, 1, 4], ..a_to_b };
    assert_eq!(traverse(&rules, c_to_b).0, Verdict::Drop);

    let wrong_port = Packet { dport: 9090, ..a_to_b };
    assert_eq!(traverse(&rules, wrong_port).0, Verdict::Drop);

    let established = Packet { established: true, ..c_to_b };
    assert_eq!(traverse(&rules, established).0, Verdict::Accept);

    let from_remote_a = Packet {
        iface: "flannel.1",
        src: [10, 255, 7, 9],
        mark: 1,
        ..a_to_b
    };
    assert_eq!(traverse(&rules, from_remote_a).0, Verdict::Accept);
    let from_remote_other = Packet { mark: 3, ..from_remote_a };
    assert_eq!(traverse(&rules, from_remote_other).0, Verdict::Drop);
}

#[test]
fn marks_traffic_leaving_for_remote_destinations() {
    let containers = [container("a", [10, 255, 1, 2], Some("app-a"))];
    let policies = [policy("app-a", 5, "app-b", 6, Protocol::Udp, (53, 53))];
    let rules = Planner::new(config()).plan(&containers, &policies, false);

    assert_eq!(rules.len(), 4, "{rules:#?}");
    let egress = Packet {
        proto: "udp",
        ..Packet::new("cni0", [10, 255, 1, 2], [10, 255, 2, 8], 53)
    };
    // Not ours to accept or drop: the packet leaves over the overlay with its
    // source's tag.
    assert_eq!(traverse(&rules, egress), (Verdict::Return, 5));
}

#[test]
fn allows_remote_sources_by_tag_only() {
    let containers = [
        container("b1", [10, 255, 1, 3], Some("app-b")),
        container("b2", [10, 255, 1, 5], Some("app-b")),
    ];
    let policies = [
        policy("app-c", 3, "app-b", 2, Protocol::Tcp, (9000, 9010)),
        policy("app-a", 1, "app-b", 2, Protocol::Tcp, (8080, 8080)),
    ];
    let rules = Planner::new(config()).plan(&containers, &policies, false);

    assert_eq!(
        lines(&rules[1..5]),
        vec![
            "-i flannel.1 -d 10.255.1.3 -p tcp --dport 8080 -m mark --mark 0x0001/0xffff \
             -m comment --comment src:app-a_dst:app-b -j ACCEPT",
            "-i flannel.1 -d 10.255.1.5 -p tcp --dport 8080 -m mark --mark 0x0001/0xffff \
             -m comment --comment src:app-a_dst:app-b -j ACCEPT",
            "-i flannel.1 -d 10.255.1.3 -p tcp --dport 9000:9010 -m mark --mark 0x0003/0xffff \
             -m comment --comment src:app-c_dst:app-b -j ACCEPT",
            "-i flannel.1 -d 10.255.1.5 -p tcp --dport 9000:9010 -m mark --mark 0x0003/0xffff \
             -m comment --comment src:app-c_dst:app-b -j ACCEPT",
        ]
    );
    assert_eq!(rules.len(), 7);
}

#[test]
fn output_does_not_depend_on_input_order() {
    let mut containers = vec![
        container("a", [10, 255, 1, 2], Some("app-a")),
        container("b", [10, 255, 1, 3], Some("app-b")),
        container("a2", [10, 255, 1, 9], Some("app-a")),
    ];
    let mut policies = vec![
        policy("app-a", 1, "app-b", 2, Protocol::Tcp, (8080, 8080)),
        policy("app-b", 2, "app-a", 1, Protocol::Udp, (5000, 5001)),
        policy("app-a", 1, "app-b", 2, Protocol::Tcp, (443, 443)),
    ];
    let planner = Planner::new(config());
    let first = planner.plan(&containers, &policies, true);

    containers.reverse();
    policies.reverse();
    let second = planner.plan(&containers, &policies, true);
    assert_eq!(canonical(&first), canonical(&second));
}

#[test]
fn logs_before_each_drop_when_enabled() {
    let rules = Planner::new(config()).plan(&Vec::<Container>::new(), &[], true);
    assert_eq!(
        lines(&rules),
        vec![
            "-m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT",
            "-i cni0 -s 10.255.1.0/24 -d 10.255.1.0/24 -m limit --limit 2/min -j LOG \
             --log-prefix \"DENY_LOCAL: \"",
            "-i cni0 -s 10.255.1.0/24 -d 10.255.1.0/24 -j DROP",
            "-i flannel.1 -s 10.255.0.0/16 -d 10.255.1.0/24 -m limit --limit 2/min -j LOG \
             --log-prefix \"DENY_REMOTE: \"",
            "-i flannel.1 -s 10.255.0.0/16 -d 10.255.1.0/24 -j DROP",
        ]
    );
}

#[test]
fn ignores_containers_without_a_group() {
    let containers = [
        container("a", [10, 255, 1, 2], Some("app-a")),
        container("x", [10, 255, 1, 7], None),
    ];
    let policies = [policy("app-a", 1, "app-a", 1, Protocol::Tcp, (80, 80))];
    let rules = Planner::new(config()).plan(&containers, &policies, false);
    assert!(rules.iter().all(|r| !r.to_string().contains("10.255.1.7")));

    let from_x = Packet::new("cni0", [10, 255, 1, 7], [10, 255, 1, 2], 80);
    assert_eq!(traverse(&rules, from_x).0, Verdict::Drop);

    assert_eq!(Planner::local_groups(&containers), vec!["app-a".to_string()]);
}

#[test]
fn mark_width_follows_configuration() {
    let config = PlannerConfig {
        tag_width: TagWidth::new(1).unwrap(),
        ..config()
    };
    let containers = [container("a", [10, 255, 1, 2], Some("app-a"))];
    let policies = [policy("app-a", 0x2a, "app-b", 1, Protocol::Tcp, (80, 80))];
    let rules = Planner::new(config).plan(&containers, &policies, false);
    assert_eq!(
        rules[1].to_string(),
        "--source 10.255.1.2 -m comment --comment src:app-a -j MARK --set-xmark 0x2a/0xff"
    );
}
