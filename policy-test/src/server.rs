use ahash::{AHashMap, AHashSet};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use netpol_policy_server_core::{
    Introspect, Inventory, PolicyStore, TagWidth, TokenInfo, UpstreamError,
};
use netpol_policy_server_http::{
    Authenticator, Cors, ExternalApi, ExternalConfig, InternalApi, ADMIN_SCOPE,
};
use netpol_policy_server_runtime::reconciler::{Outcome, ReconcileMetrics, Reconciler};
use netpol_policy_server_store::Store;
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const ADMIN_TOKEN: &str = "admin-token";

/// A policy server backed by an in-memory store and a controllable inventory.
pub struct PolicyServer {
    pub store: Store,
    pub inventory: Arc<FakeInventory>,
    pub reconciler: Reconciler,
    pub external: Url,
    pub internal: Url,
    http: reqwest::Client,
}

/// Reports a mutable set of applications as live, all in one space.
#[derive(Debug, Default)]
pub struct FakeInventory {
    live: Mutex<AHashSet<String>>,
}

struct AdminOnly;

// === impl PolicyServer ===

impl PolicyServer {
    pub async fn start(live: &[&str]) -> Self {
        let store = Store::in_memory(TagWidth::default()).expect("store must open");
        let inventory = Arc::new(FakeInventory::default());
        for app in live {
            inventory.add(app);
        }
        let shared: Arc<dyn PolicyStore> = Arc::new(store.clone());
        let reconciler = Reconciler::new(
            shared.clone(),
            inventory.clone(),
            100,
            Duration::from_secs(10),
            ReconcileMetrics::default(),
        );

        let external = ExternalApi::new(
            shared.clone(),
            inventory.clone(),
            Arc::new(reconciler.clone()),
            Authenticator::new(
                Arc::new(AdminOnly),
                Duration::from_secs(60),
                Default::default(),
            ),
            Cors::new(vec![]),
            ExternalConfig {
                tag_width: TagWidth::default(),
                max_policies_per_source: 150,
                tls: false,
            },
            Default::default(),
        );
        let internal = InternalApi::new(shared, TagWidth::default(), Default::default());

        Self {
            store,
            inventory,
            reconciler,
            external: spawn(external).await,
            internal: spawn(internal).await,
            http: reqwest::Client::new(),
        }
    }

    /// Calls the external API as an administrator.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let url = self
            .external
            .join(path.trim_start_matches('/'))
            .expect("path must be valid");
        let mut req = self.http.request(method, url).bearer_auth(ADMIN_TOKEN);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let rsp = req.send().await.expect("request must complete");
        let status = rsp.status();
        let body = rsp.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn reconcile(&self) -> Outcome {
        self.reconciler
            .cycle(&CancellationToken::new())
            .await
            .expect("reconciliation must succeed")
    }
}

/// Serves `svc` on an ephemeral loopback port.
async fn spawn<S>(svc: S) -> Url
where
    S: tower::Service<
            hyper::Request<hyper::body::Incoming>,
            Response = hyper::Response<netpol_policy_server_http::Body>,
            Error = std::convert::Infallible,
        > + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind a loopback port");
    let addr = listener.local_addr().expect("listener must have an address");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let svc = TowerToHyperService::new(svc.clone());
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    Url::parse(&format!("http://{addr}/")).expect("address must form a URL")
}

// === impl FakeInventory ===

impl FakeInventory {
    pub fn add(&self, app: &str) {
        self.live.lock().insert(app.to_string());
    }

    pub fn remove(&self, app: &str) {
        self.live.lock().remove(app);
    }
}

#[async_trait::async_trait]
impl Inventory for FakeInventory {
    async fn live_apps(&self, keys: &[String]) -> Result<AHashSet<String>, UpstreamError> {
        let live = self.live.lock();
        Ok(keys.iter().filter(|k| live.contains(*k)).cloned().collect())
    }

    async fn app_spaces(
        &self,
        keys: &[String],
    ) -> Result<AHashMap<String, String>, UpstreamError> {
        let live = self.live.lock();
        Ok(keys
            .iter()
            .filter(|k| live.contains(*k))
            .map(|k| (k.clone(), "space".to_string()))
            .collect())
    }

    async fn developer_spaces(&self, _: &str) -> Result<AHashSet<String>, UpstreamError> {
        Ok(AHashSet::new())
    }
}

#[async_trait::async_trait]
impl Introspect for AdminOnly {
    async fn check_token(&self, token: &str) -> Result<Option<TokenInfo>, UpstreamError> {
        Ok((token == ADMIN_TOKEN).then(|| TokenInfo {
            scopes: vec![ADMIN_SCOPE.to_string()],
            user_id: "admin-id".to_string(),
            user_name: "admin".to_string(),
        }))
    }
}
