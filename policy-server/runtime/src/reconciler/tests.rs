use super::*;
use ahash::{AHashMap, AHashSet};
use netpol_policy_server_core::{PortRange, Protocol, TagWidth};
use netpol_policy_server_store::Store;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::time::SystemTime;

#[derive(Default)]
struct FakeInventory {
    live: Mutex<AHashSet<String>>,
    lookups: Mutex<Vec<Vec<String>>>,
    fail_on: Option<&'static str>,
    hang: bool,
}

impl FakeInventory {
    fn live(keys: &[&str]) -> Self {
        Self {
            live: Mutex::new(keys.iter().map(|k| k.to_string()).collect()),
            ..Default::default()
        }
    }

    fn lookups(&self) -> usize {
        self.lookups.lock().len()
    }
}

#[async_trait::async_trait]
impl Inventory for FakeInventory {
    async fn live_apps(&self, keys: &[String]) -> Result<AHashSet<String>, UpstreamError> {
        self.lookups.lock().push(keys.to_vec());
        if self.hang {
            futures::future::pending::<()>().await;
        }
        if let Some(bad) = self.fail_on {
            if keys.iter().any(|k| k == bad) {
                return Err(UpstreamError::retryable("cloud-controller", "502 bad gateway"));
            }
        }
        let live = self.live.lock();
        Ok(keys.iter().filter(|k| live.contains(*k)).cloned().collect())
    }

    async fn app_spaces(&self, _: &[String]) -> Result<AHashMap<String, String>, UpstreamError> {
        Ok(AHashMap::new())
    }

    async fn developer_spaces(&self, _: &str) -> Result<AHashSet<String>, UpstreamError> {
        Ok(AHashSet::new())
    }
}

fn policy(src: &str, dst: &str, port: u16) -> Policy {
    Policy::new(src, dst, Protocol::Tcp, PortRange::single(port).unwrap()).unwrap()
}

async fn mk_store(policies: Vec<Policy>) -> Store {
    let store = Store::in_memory(TagWidth::default()).unwrap();
    store.create(policies, None).await.unwrap();
    store
}

fn mk_reconciler(store: &Store, inventory: Arc<FakeInventory>, chunk_size: usize) -> Reconciler {
    Reconciler::new(
        Arc::new(store.clone()),
        inventory,
        chunk_size,
        Duration::from_secs(5),
        ReconcileMetrics::default(),
    )
}

fn keys(groups: &[Group]) -> Vec<&str> {
    let mut keys = groups.iter().map(|g| g.key.as_str()).collect::<Vec<_>>();
    keys.sort();
    keys
}

#[tokio::test]
async fn deletes_policies_referencing_missing_apps() {
    let store = mk_store(vec![policy("app-a", "app-b", 8080), policy("app-c", "app-d", 53)]).await;
    let inventory = Arc::new(FakeInventory::live(&["app-b", "app-c", "app-d"]));
    let reconciler = mk_reconciler(&store, inventory, 100);

    let outcome = reconciler.cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.deleted, vec![policy("app-a", "app-b", 8080)]);
    assert_eq!(keys(&outcome.released), vec!["app-a"]);

    let remaining = store.snapshot(Filter::any()).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].policy, policy("app-c", "app-d", 53));

    // app-b is unreferenced but still live, so it keeps its tag.
    assert_eq!(
        keys(&store.groups().await.unwrap()),
        vec!["app-b", "app-c", "app-d"]
    );
}

#[tokio::test]
async fn lookups_are_chunked() {
    let store = mk_store(vec![policy("a", "b", 1), policy("c", "d", 1), policy("e", "a", 1)]).await;
    let inventory = Arc::new(FakeInventory::live(&["a", "b", "c", "d", "e"]));
    let reconciler = mk_reconciler(&store, inventory.clone(), 2);

    let outcome = reconciler.cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, Outcome::default());

    let lookups = inventory.lookups.lock();
    assert_eq!(lookups.len(), 3);
    assert!(lookups.iter().all(|chunk| chunk.len() <= 2));
    let mut seen = lookups.iter().flatten().cloned().collect::<Vec<_>>();
    seen.sort();
    assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn inventory_failure_aborts_without_mutation() {
    let store = mk_store(vec![policy("a", "b", 1), policy("c", "d", 1)]).await;
    let inventory = Arc::new(FakeInventory {
        fail_on: Some("d"),
        ..FakeInventory::live(&["b", "c"])
    });
    let reconciler = mk_reconciler(&store, inventory, 1);

    let err = reconciler
        .cycle(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::Inventory(_)), "{err}");
    assert_eq!(store.snapshot(Filter::any()).await.unwrap().len(), 2);
    assert_eq!(store.groups().await.unwrap().len(), 4);
}

#[tokio::test]
async fn only_app_groups_are_checked() {
    let store = mk_store(vec![]).await;
    store
        .ensure_tag("router-1".into(), GroupKind::Router)
        .await
        .unwrap();
    store.create(vec![policy("router-1", "app-a", 80)], None).await.unwrap();
    let inventory = Arc::new(FakeInventory::live(&[]));
    let reconciler = mk_reconciler(&store, inventory.clone(), 100);

    let outcome = reconciler.cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.deleted, vec![policy("router-1", "app-a", 80)]);
    assert_eq!(keys(&outcome.released), vec!["app-a"]);
    assert_eq!(*inventory.lookups.lock(), vec![vec!["app-a".to_string()]]);
    assert_eq!(keys(&store.groups().await.unwrap()), vec!["router-1"]);
}

#[tokio::test]
async fn orphaned_groups_are_released() {
    let store = mk_store(vec![]).await;
    store.ensure_tag("gone".into(), GroupKind::App).await.unwrap();
    store.ensure_tag("here".into(), GroupKind::App).await.unwrap();
    let reconciler = mk_reconciler(&store, Arc::new(FakeInventory::live(&["here"])), 100);

    let outcome = reconciler.cycle(&CancellationToken::new()).await.unwrap();
    assert!(outcome.deleted.is_empty());
    assert_eq!(keys(&outcome.released), vec!["gone"]);
    assert_eq!(keys(&store.groups().await.unwrap()), vec!["here"]);
}

#[tokio::test]
async fn cancelled_cycles_make_no_changes() {
    let store = mk_store(vec![policy("a", "b", 1)]).await;
    let reconciler = mk_reconciler(&store, Arc::new(FakeInventory::live(&[])), 100);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = reconciler.cycle(&cancel).await.unwrap_err();
    assert!(matches!(err, CycleError::Cancelled));
    assert_eq!(store.snapshot(Filter::any()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn slow_inventory_times_out() {
    let store = mk_store(vec![policy("a", "b", 1)]).await;
    let inventory = Arc::new(FakeInventory {
        hang: true,
        ..Default::default()
    });
    let reconciler = Reconciler::new(
        Arc::new(store.clone()),
        inventory,
        100,
        Duration::from_millis(50),
        ReconcileMetrics::default(),
    );

    let cancel = CancellationToken::new();
    let err = reconciler.cycle(&cancel).await.unwrap_err();
    assert!(matches!(err, CycleError::TimedOut(_)));
    assert!(cancel.is_cancelled());
    assert_eq!(store.snapshot(Filter::any()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cleanup_returns_deleted_policies() {
    let store = mk_store(vec![policy("a", "b", 1), policy("b", "c", 2)]).await;
    let reconciler = mk_reconciler(&store, Arc::new(FakeInventory::live(&["b", "c"])), 100);
    let deleted = reconciler.delete_stale().await.unwrap();
    assert_eq!(deleted, vec![policy("a", "b", 1)]);
}

#[tokio::test]
async fn runs_only_while_leading() {
    let store = mk_store(vec![policy("a", "b", 1)]).await;
    let inventory = Arc::new(FakeInventory::live(&["a", "b"]));
    let reconciler = mk_reconciler(&store, inventory.clone(), 100);

    let claim = |holder: &str| {
        Arc::new(Claim {
            holder: holder.to_string(),
            expiry: SystemTime::now() + Duration::from_secs(60),
        })
    };
    let (tx, rx) = watch::channel(claim("other"));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(reconciler.run(
        rx,
        "me".to_string(),
        Duration::from_millis(10),
        shutdown.clone(),
    ));

    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(inventory.lookups(), 0);

    tx.send_replace(claim("me"));
    time::timeout(Duration::from_secs(5), async {
        while inventory.lookups() < 2 {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    tx.send_replace(claim("other"));
    time::sleep(Duration::from_millis(100)).await;
    let stopped_at = inventory.lookups();
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(inventory.lookups(), stopped_at);

    shutdown.cancel();
    time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
