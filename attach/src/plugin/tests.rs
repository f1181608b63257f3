use super::*;
use pretty_assertions::assert_eq;
use std::os::unix::fs::PermissionsExt;

const BRIDGE: &str = r#"#!/bin/sh
cat > "$0.$CNI_COMMAND.stdin"
echo "$CNI_COMMAND $CNI_CONTAINERID $CNI_NETNS $CNI_IFNAME" >> "$0.log"
if [ "$CNI_COMMAND" = ADD ]; then
  printf '{"cniVersion":"0.4.0","interfaces":[{"name":"eth0"}],"ips":[{"version":"4","address":"10.255.1.2/24","interface":0}],"dns":{"nameservers":["169.254.0.2"]}}'
fi
"#;

const BROKEN: &str = r#"#!/bin/sh
cat > /dev/null
printf '{"code":7,"msg":"no more addresses"}'
exit 1
"#;

struct Setup {
    dir: tempfile::TempDir,
}

impl Setup {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        std::fs::create_dir(dir.path().join("conf")).unwrap();
        Self { dir }
    }

    fn plugin(&self, name: &str, script: &str) {
        let path = self.dir.path().join("bin").join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn network(&self, file: &str, config: Value) {
        let path = self.dir.path().join("conf").join(file);
        std::fs::write(path, serde_json::to_vec(&config).unwrap()).unwrap();
    }

    fn chain(&self) -> CniChain {
        CniChain::load(
            vec![self.dir.path().join("missing"), self.dir.path().join("bin")],
            &self.dir.path().join("conf"),
        )
        .unwrap()
    }

    fn log(&self, name: &str) -> Vec<String> {
        let path = self.dir.path().join("bin").join(format!("{name}.log"));
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn stdin(&self, name: &str, command: &str) -> Value {
        let path = self.dir.path().join("bin").join(format!("{name}.{command}.stdin"));
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }
}

fn request() -> AddRequest {
    AddRequest {
        netns: "/var/vcap/data/netns/h1".into(),
        handle: "h1".to_string(),
        metadata: maplit::btreemap! {
            "policy_group_id".to_string() => json!("app-a"),
        },
        port_mappings: vec![PortMapping {
            host_port: 60000,
            container_port: 8080,
        }],
        netout_rules: vec![json!({"protocol": 1})],
    }
}

#[tokio::test]
async fn runs_networks_in_order() {
    let setup = Setup::new();
    setup.plugin("bridge", BRIDGE);
    setup.plugin("wrapper", BRIDGE);
    setup.network("20-wrapper.conf", json!({"name": "wrapped", "type": "wrapper"}));
    setup.network("10-bridge.conf", json!({"name": "overlay", "type": "bridge", "mtu": 1450}));
    setup.network("README", json!({"type": "ignored"}));
    let chain = setup.chain();

    let result = chain.add(&request()).await.unwrap();
    assert_eq!(
        result.ipv4().unwrap(),
        Attached {
            ip: Ipv4Addr::new(10, 255, 1, 2),
            interface: Some("eth0".to_string()),
        }
    );
    assert_eq!(result.dns.nameservers, vec!["169.254.0.2".to_string()]);
    assert_eq!(
        setup.log("bridge"),
        vec!["ADD h1 /var/vcap/data/netns/h1 eth0".to_string()]
    );
    assert_eq!(
        setup.log("wrapper"),
        vec!["ADD h1 /var/vcap/data/netns/h1 eth1".to_string()]
    );

    let first = setup.stdin("bridge", "ADD");
    assert_eq!(first["mtu"], json!(1450));
    assert_eq!(
        first["runtimeConfig"],
        json!({
            "portMappings": [{"host_port": 60000, "container_port": 8080}],
            "netOutRules": [{"protocol": 1}],
        })
    );
    assert_eq!(first["metadata"], json!({"policy_group_id": "app-a"}));
    assert_eq!(first.get("prevResult"), None);
    let second = setup.stdin("wrapper", "ADD");
    assert_eq!(second["prevResult"]["ips"][0]["address"], json!("10.255.1.2/24"));

    chain.del(Path::new("/var/vcap/data/netns/h1"), "h1").await.unwrap();
    assert_eq!(setup.log("bridge").len(), 2);
    assert_eq!(setup.log("bridge")[1], "DEL h1 /var/vcap/data/netns/h1 eth0");
    assert_eq!(setup.log("wrapper")[1], "DEL h1 /var/vcap/data/netns/h1 eth1");
}

#[tokio::test]
async fn plugin_errors_are_reported() {
    let setup = Setup::new();
    setup.plugin("broken", BROKEN);
    setup.network("10-broken.conf", json!({"type": "broken"}));

    let err = setup.chain().add(&request()).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "plugin broken failed: no more addresses (code 7)"
    );

    let err = setup
        .chain()
        .del(Path::new("/ns"), "h1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Plugin { .. }));
}

#[tokio::test]
async fn missing_binaries_fail() {
    let setup = Setup::new();
    setup.network("10-bridge.conf", json!({"type": "bridge"}));
    let err = setup.chain().add(&request()).await.unwrap_err();
    assert!(matches!(err, Error::Plugin { plugin, .. } if plugin == "bridge"));
}

#[tokio::test]
async fn no_networks_allocate_nothing() {
    let setup = Setup::new();
    let err = setup.chain().add(&request()).await.unwrap_err();
    assert!(matches!(err, Error::NoIPv4Allocated(_)));
}

#[test]
fn invalid_network_configs_are_rejected() {
    let setup = Setup::new();
    setup.network("10-bad.conf", json!({"type": "../../bin/sh"}));
    let err = CniChain::load(vec![], &setup.dir.path().join("conf")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn selects_the_ipv4_config() {
    let result = AddResult {
        interfaces: vec![
            Interface {
                name: "host0".to_string(),
                sandbox: None,
            },
            Interface {
                name: "eth0".to_string(),
                sandbox: Some("/ns".to_string()),
            },
        ],
        ips: vec![
            IpConfig {
                version: Some("6".to_string()),
                address: "fd00::2/64".to_string(),
                interface: Some(1),
                ..IpConfig::default()
            },
            IpConfig {
                version: None,
                address: "10.255.1.9/24".to_string(),
                interface: Some(1),
                ..IpConfig::default()
            },
        ],
        dns: Dns::default(),
    };
    assert_eq!(
        result.ipv4().unwrap(),
        Attached {
            ip: Ipv4Addr::new(10, 255, 1, 9),
            interface: Some("eth0".to_string()),
        }
    );

    let mut out_of_range = result.clone();
    out_of_range.ips[1].interface = Some(2);
    assert!(matches!(out_of_range.ipv4(), Err(Error::NoIPv4Allocated(_))));

    let mut v6_only = result;
    v6_only.ips.truncate(1);
    assert!(matches!(v6_only.ipv4(), Err(Error::NoIPv4Allocated(_))));
}
