use netpol_policy_test::{init_tracing, Cell, Packet, PolicyServer, Verdict};
use pretty_assertions::assert_eq;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

const A: [u8; 4] = [10, 255, 1, 2];
const B: [u8; 4] = [10, 255, 1, 3];
const C: [u8; 4] = [10, 255, 1, 4];
const REMOTE: [u8; 4] = [10, 255, 2, 9];

fn a_to_b() -> Value {
    json!({
        "policies": [{
            "source": {"id": "app-a"},
            "destination": {"id": "app-b", "protocol": "tcp", "ports": {"start": 8080, "end": 8080}},
        }]
    })
}

async fn setup() -> (PolicyServer, Cell) {
    let server = PolicyServer::start(&["app-a", "app-b", "app-c"]).await;
    let (status, body) = server
        .request(Method::POST, "/v1/policies", Some(a_to_b()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let cell = Cell::new(&server, "10.255.1.0/24");
    cell.add_container("a", A, "app-a");
    cell.add_container("b", B, "app-b");
    cell.add_container("c", C, "app-c");
    (server, cell)
}

fn tag(hex: &str) -> u32 {
    u32::from_str_radix(hex, 16).expect("tags are hexadecimal")
}

#[tokio::test(flavor = "current_thread")]
async fn policies_are_enforced_on_the_cell() {
    let _tracing = init_tracing();
    let (server, mut cell) = setup().await;

    let (status, list) = server.request(Method::GET, "/v1/policies", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total_policies"], json!(1));
    let source_tag = list["policies"][0]["source"]["tag"]
        .as_str()
        .expect("source must be tagged")
        .to_string();
    let destination_tag = list["policies"][0]["destination"]["tag"]
        .as_str()
        .expect("destination must be tagged");
    assert_eq!(source_tag.len(), 4);
    assert_ne!(source_tag, destination_tag);

    let chain = cell.poll().await.expect("poll must succeed");
    assert!(chain.is_some(), "a chain must be attached");

    let rules = cell.policy_rules();
    assert_eq!(
        rules.first().map(ToString::to_string),
        Some("-m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT".to_string()),
    );
    assert_eq!(rules.last().and_then(|r| r.target()), Some("DROP"));
    let marks = rules
        .iter()
        .filter(|r| r.target() == Some("MARK"))
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    assert_eq!(
        marks,
        vec![format!(
            "--source 10.255.1.2 -m comment --comment src:app-a -j MARK --set-xmark 0x{source_tag}/0xffff"
        )],
    );

    let trace = cell.forward(&Packet::tcp("cni0", A, B, 8080));
    assert_eq!(trace.verdict, Verdict::Accept);
    assert_eq!(trace.mark, tag(&source_tag));

    for denied in [
        Packet::tcp("cni0", C, B, 8080),
        Packet::tcp("cni0", A, B, 9090),
        Packet::udp("cni0", A, B, 8080),
        Packet::tcp("cni0", B, A, 8080),
    ] {
        assert_eq!(cell.forward(&denied).verdict, Verdict::Drop, "{denied:?}");
    }

    let remote = Packet::tcp("flannel.1", REMOTE, B, 8080);
    assert_eq!(
        cell.forward(&remote.clone().with_mark(tag(&source_tag))).verdict,
        Verdict::Accept
    );
    assert_eq!(cell.forward(&remote).verdict, Verdict::Drop);

    assert_eq!(cell.poll().await.expect("poll must succeed"), None);
}

#[tokio::test(flavor = "current_thread")]
async fn stale_policies_are_withdrawn_from_the_cell() {
    let _tracing = init_tracing();
    let (server, mut cell) = setup().await;
    let first = cell
        .poll()
        .await
        .expect("poll must succeed")
        .expect("a chain must be attached");

    server.inventory.remove("app-a");
    let outcome = server.reconcile().await;
    assert_eq!(outcome.deleted.len(), 1);
    assert_eq!(outcome.deleted[0].source, "app-a");

    let (_, list) = server.request(Method::GET, "/v1/policies", None).await;
    assert_eq!(list, json!({"total_policies": 0, "policies": []}));

    let second = cell
        .poll()
        .await
        .expect("poll must succeed")
        .expect("a new chain must be attached");
    assert_ne!(first, second);
    assert_eq!(
        cell.iptables.chains("filter"),
        vec!["FORWARD".to_string(), second]
    );

    let rules = cell.policy_rules();
    assert!(
        rules
            .iter()
            .all(|r| r.target() != Some("MARK") && !r.to_string().contains("app-a")),
        "{rules:?}"
    );
    assert_eq!(
        cell.forward(&Packet::tcp("cni0", A, B, 8080)).verdict,
        Verdict::Drop
    );

    let outcome = server.reconcile().await;
    assert!(outcome.deleted.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn denied_traffic_is_logged_when_enabled() {
    let _tracing = init_tracing();
    let (_server, mut cell) = setup().await;
    cell.poll().await.expect("poll must succeed");
    assert!(cell.forward(&Packet::tcp("cni0", C, B, 8080)).logged.is_empty());

    cell.logging.set(true);
    cell.poll()
        .await
        .expect("poll must succeed")
        .expect("logging changes the rules");
    let trace = cell.forward(&Packet::tcp("cni0", C, B, 8080));
    assert_eq!(trace.verdict, Verdict::Drop);
    assert_eq!(trace.logged, vec!["DENY_LOCAL: ".to_string()]);
}
