use super::*;
use netpol_cell::iptables::fake::{FakeIpTables, Op};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU64, Ordering};

const TABLE: &str = "filter";
const PARENT: &str = "FORWARD";

fn spec() -> ChainSpec {
    ChainSpec {
        table: TABLE.to_string(),
        parent: PARENT.to_string(),
        prefix: "vpa--".to_string(),
    }
}

fn enforcer(now: u64) -> (Enforcer<Arc<FakeIpTables>>, Arc<FakeIpTables>, Arc<AtomicU64>) {
    let ipt = Arc::new(FakeIpTables::with_builtin([(TABLE, PARENT)]));
    let clock = Arc::new(AtomicU64::new(now));
    let enforcer = Enforcer::with_clock(
        ipt.clone(),
        spec(),
        Arc::new({
            let clock = clock.clone();
            move || clock.load(Ordering::SeqCst)
        }),
    );
    (enforcer, ipt, clock)
}

fn rules(n: usize) -> Vec<Rule> {
    (0..n)
        .map(|i| {
            let ip = format!("10.255.{}.{}", i / 250, i % 250);
            Rule::new(["-s".to_string(), ip]).jump("ACCEPT")
        })
        .collect()
}

fn jump(chain: &str) -> Rule {
    Rule::default().jump(chain)
}

fn managed_jumps(rules: &[Rule]) -> usize {
    rules
        .iter()
        .filter(|r| r.target().is_some_and(|t| t.starts_with("vpa--")))
        .count()
}

#[tokio::test]
async fn swaps_generations_without_detaching() {
    let (enforcer, ipt, _) = enforcer(200);
    ipt.seed(TABLE, "vpa--100", rules(100));
    ipt.seed(TABLE, PARENT, vec![jump("vpa--100"), jump("other")]);
    ipt.watch(TABLE, PARENT);

    let desired = rules(3);
    let chain = enforcer.enforce(&desired).await.unwrap();
    assert_eq!(chain, "vpa--200");

    assert_eq!(ipt.rules(TABLE, "vpa--200"), Some(desired.clone()));
    assert_eq!(
        ipt.rules(TABLE, PARENT),
        Some(vec![jump("vpa--200"), jump("other")])
    );
    assert_eq!(ipt.rules(TABLE, "vpa--100"), None);

    assert_eq!(
        ipt.ops(),
        vec![
            Op::NewChain("vpa--200".to_string()),
            Op::AppendAll("vpa--200".to_string(), desired),
            Op::Insert(PARENT.to_string(), 1, jump("vpa--200")),
            Op::Delete(PARENT.to_string(), jump("vpa--100")),
            Op::Flush("vpa--100".to_string()),
            Op::DeleteChain("vpa--100".to_string()),
        ]
    );

    let history = ipt.history();
    assert_eq!(history.len(), 6);
    for (i, parent) in history.iter().enumerate() {
        assert!(managed_jumps(parent) >= 1, "detached after op {i}: {parent:?}");
        assert_eq!(
            parent.iter().filter(|r| r.target() == Some("other")).count(),
            1
        );
    }
}

#[tokio::test]
async fn repeated_enforcement_keeps_only_the_newest_generation() {
    let (enforcer, ipt, _) = enforcer(1_700_000_000);
    let desired = rules(2);

    let first = enforcer.enforce(&desired).await.unwrap();
    let second = enforcer.enforce(&desired).await.unwrap();
    assert_eq!(first, "vpa--1700000000");
    assert_eq!(second, "vpa--1700000001");

    assert_eq!(ipt.list_chains(TABLE).await.unwrap(), vec![second.clone()]);
    assert_eq!(ipt.rules(TABLE, PARENT), Some(vec![jump(&second)]));
}

#[tokio::test]
async fn names_outrun_a_lagging_clock() {
    let (enforcer, ipt, clock) = enforcer(50);
    ipt.seed(TABLE, "vpa--90", rules(1));
    ipt.seed(TABLE, PARENT, vec![jump("vpa--90")]);

    assert_eq!(enforcer.enforce(&rules(1)).await.unwrap(), "vpa--91");

    clock.store(95, Ordering::SeqCst);
    assert_eq!(enforcer.enforce(&rules(1)).await.unwrap(), "vpa--95");
}

#[tokio::test]
async fn failed_population_keeps_the_prior_generation() {
    let (enforcer, ipt, _) = enforcer(200);
    ipt.seed(TABLE, "vpa--100", rules(4));
    ipt.seed(TABLE, PARENT, vec![jump("vpa--100")]);
    ipt.fail_on("append_all", "vpa--");

    assert!(enforcer.enforce(&rules(2)).await.is_err());
    assert_eq!(ipt.list_chains(TABLE).await.unwrap(), vec!["vpa--100".to_string()]);
    assert_eq!(ipt.rules(TABLE, "vpa--100"), Some(rules(4)));
    assert_eq!(ipt.rules(TABLE, PARENT), Some(vec![jump("vpa--100")]));
}

#[tokio::test]
async fn failed_attachment_discards_the_new_chain() {
    let (enforcer, ipt, _) = enforcer(200);
    ipt.seed(TABLE, "vpa--100", rules(4));
    ipt.seed(TABLE, PARENT, vec![jump("vpa--100")]);
    ipt.fail_on("insert", PARENT);

    assert!(enforcer.enforce(&rules(2)).await.is_err());
    assert_eq!(ipt.list_chains(TABLE).await.unwrap(), vec!["vpa--100".to_string()]);
    assert_eq!(ipt.rules(TABLE, PARENT), Some(vec![jump("vpa--100")]));

    ipt.clear_failures();
    assert_eq!(enforcer.enforce(&rules(2)).await.unwrap(), "vpa--201");
    assert_eq!(ipt.list_chains(TABLE).await.unwrap(), vec!["vpa--201".to_string()]);
}

#[tokio::test]
async fn prune_failures_are_retried_by_the_next_generation() {
    let (enforcer, ipt, _) = enforcer(200);
    ipt.seed(TABLE, "vpa--100", rules(1));
    ipt.seed(TABLE, "vpa--150", rules(1));
    ipt.seed(TABLE, PARENT, vec![jump("vpa--150"), jump("vpa--100")]);
    ipt.fail_on("delete_chain", "vpa--100");

    assert_eq!(enforcer.enforce(&rules(1)).await.unwrap(), "vpa--200");
    assert_eq!(
        ipt.list_chains(TABLE).await.unwrap(),
        vec!["vpa--100".to_string(), "vpa--200".to_string()]
    );
    assert_eq!(ipt.rules(TABLE, "vpa--100"), Some(vec![]));
    assert_eq!(ipt.rules(TABLE, PARENT), Some(vec![jump("vpa--200")]));

    ipt.clear_failures();
    assert_eq!(enforcer.enforce(&rules(1)).await.unwrap(), "vpa--201");
    assert_eq!(ipt.list_chains(TABLE).await.unwrap(), vec!["vpa--201".to_string()]);
}

#[tokio::test]
async fn leaves_unmanaged_chains_alone() {
    let (enforcer, ipt, _) = enforcer(200);
    ipt.seed(TABLE, "vpa--abc", vec![]);
    ipt.seed(TABLE, "netout--1", vec![]);

    enforcer.enforce(&rules(1)).await.unwrap();
    assert_eq!(
        ipt.list_chains(TABLE).await.unwrap(),
        vec!["netout--1".to_string(), "vpa--200".to_string(), "vpa--abc".to_string()]
    );
}
