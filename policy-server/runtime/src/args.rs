use crate::{
    inventory::CloudController,
    lease::{self, LeaseManager},
    reconciler::{ReconcileMetrics, Reconciler},
    uaa::UaaClient,
    upstream,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use netpol_policy_server_core::{PolicyStore, TagWidth};
use netpol_policy_server_http::{
    metrics::{AuthMetrics, HttpMetrics},
    serve, Authenticator, Cors, ExternalApi, ExternalConfig, InternalApi, TlsConfig,
};
use netpol_policy_server_store::{metrics as store_metrics, Store};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "policy-server", about = "Stores and serves container network policies")]
pub struct Args {
    #[clap(long, default_value = "netpol=info,warn", env = "NETPOL_POLICY_SERVER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(long, default_value = "0.0.0.0:4002")]
    external_addr: SocketAddr,

    /// Serves the external API over TLS when set together with
    /// `--external-tls-key`.
    #[clap(long)]
    external_tls_cert: Option<PathBuf>,

    #[clap(long)]
    external_tls_key: Option<PathBuf>,

    #[clap(long, default_value = "0.0.0.0:4003")]
    internal_addr: SocketAddr,

    #[clap(long)]
    internal_tls_cert: PathBuf,

    #[clap(long)]
    internal_tls_key: PathBuf,

    /// CA that signs the certificates cell agents present to the internal
    /// API.
    #[clap(long)]
    internal_client_ca: PathBuf,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "policy-server.db", env = "NETPOL_DATABASE")]
    database: PathBuf,

    #[clap(long, default_value = "5000")]
    database_busy_timeout_ms: u64,

    /// Width of group tags in bytes.
    #[clap(long, default_value = "2")]
    tag_width: TagWidth,

    #[clap(long, default_value = "150")]
    max_policies_per_source: usize,

    #[clap(long, default_value = "60")]
    reconcile_interval_secs: u64,

    #[clap(long, default_value = "100")]
    inventory_chunk_size: usize,

    /// Base URL of the cloud controller.
    #[clap(long, env = "NETPOL_INVENTORY_URL")]
    inventory_url: String,

    #[clap(long, env = "NETPOL_UAA_URL")]
    uaa_url: String,

    #[clap(long, default_value = "network-policy")]
    uaa_client_id: String,

    #[clap(long, env = "NETPOL_UAA_CLIENT_SECRET", hide_env_values = true)]
    uaa_client_secret: String,

    /// Additional CA bundle trusted when calling the cloud controller and UAA.
    #[clap(long)]
    upstream_ca: Option<PathBuf>,

    #[clap(long, default_value = "5")]
    request_timeout_secs: u64,

    /// Origins allowed to call the external API from a browser.
    #[clap(long, value_delimiter = ',')]
    cors_origins: Vec<String>,

    #[clap(long, default_value = "60")]
    token_cache_ttl_secs: u64,

    #[clap(long, default_value = "30")]
    lease_ttl_secs: u64,

    #[clap(long, default_value = lease::LOCK_KEY)]
    lock_key: String,

    /// Identifies this replica in the lock table. Defaults to `HOSTNAME`.
    #[clap(long)]
    lock_owner: Option<String>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            external_addr,
            external_tls_cert,
            external_tls_key,
            internal_addr,
            internal_tls_cert,
            internal_tls_key,
            internal_client_ca,
            admin,
            database,
            database_busy_timeout_ms,
            tag_width,
            max_policies_per_source,
            reconcile_interval_secs,
            inventory_chunk_size,
            inventory_url,
            uaa_url,
            uaa_client_id,
            uaa_client_secret,
            upstream_ca,
            request_timeout_secs,
            cors_origins,
            token_cache_ttl_secs,
            lease_ttl_secs,
            lock_key,
            lock_owner,
        } = self;

        log_format.try_init(log_level)?;
        let (shutdown, drain) = kubert::shutdown::sigint_or_sigterm()?;

        let owner = match lock_owner {
            Some(owner) => owner,
            None => std::env::var("HOSTNAME")
                .context("Failed to fetch `HOSTNAME` environment variable; set --lock-owner")?,
        };
        let interval = Duration::from_secs(reconcile_interval_secs);

        let external_tls = match (external_tls_cert, external_tls_key) {
            (Some(cert), Some(key)) => Some(
                TlsConfig {
                    cert,
                    key,
                    client_ca: None,
                }
                .load()
                .context("invalid external TLS configuration")?,
            ),
            (None, None) => None,
            _ => bail!("--external-tls-cert and --external-tls-key must be set together"),
        };
        let internal_tls = TlsConfig {
            cert: internal_tls_cert,
            key: internal_tls_key,
            client_ca: Some(internal_client_ca),
        }
        .load()
        .context("invalid internal TLS configuration")?;

        let store = Store::open(
            &database,
            tag_width,
            Duration::from_millis(database_busy_timeout_ms),
        )
        .with_context(|| format!("failed to open {}", database.display()))?;
        info!(path = %database.display(), tag_width = tag_width.bytes(), "Opened policy store");

        let mut prom = <Registry>::default();
        store_metrics::register(prom.sub_registry_with_prefix("store"), store.clone());
        let http_metrics = HttpMetrics::register(prom.sub_registry_with_prefix("http"));
        let auth_metrics = AuthMetrics::register(prom.sub_registry_with_prefix("auth"));
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("reconciler"));

        let http = upstream::client(
            Duration::from_secs(request_timeout_secs),
            upstream_ca.as_deref(),
        )?;
        let uaa = UaaClient::new(
            http.clone(),
            upstream::base_url(&uaa_url).context("invalid --uaa-url")?,
            uaa_client_id,
            uaa_client_secret,
        );
        let inventory = Arc::new(CloudController::new(
            http,
            upstream::base_url(&inventory_url).context("invalid --inventory-url")?,
            uaa.clone(),
            inventory_chunk_size,
        ));

        let policies: Arc<dyn PolicyStore> = Arc::new(store.clone());
        let reconciler = Reconciler::new(
            policies.clone(),
            inventory.clone(),
            inventory_chunk_size,
            interval,
            reconcile_metrics,
        );

        // Background work stops as soon as shutdown begins.
        let stop = CancellationToken::new();
        tokio::spawn({
            let stop = stop.clone();
            let drain = drain.clone();
            async move {
                let _release = drain.signaled().await;
                stop.cancel();
            }
        });

        let (claims, lease_task) = LeaseManager::new(
            Arc::new(store.clone()),
            lock_key,
            owner.clone(),
            Duration::from_secs(lease_ttl_secs),
        )
        .spawn(stop.clone());
        let reconcile_task = tokio::spawn(
            reconciler
                .clone()
                .run(claims, owner, interval, stop.clone())
                .instrument(info_span!("reconciler")),
        );

        let external = ExternalApi::new(
            policies.clone(),
            inventory,
            Arc::new(reconciler),
            Authenticator::new(
                Arc::new(uaa),
                Duration::from_secs(token_cache_ttl_secs),
                auth_metrics,
            ),
            Cors::new(cors_origins),
            ExternalConfig {
                tag_width,
                max_policies_per_source,
                tls: external_tls.is_some(),
            },
            http_metrics.clone(),
        );
        let internal = InternalApi::new(policies, tag_width, http_metrics);
        let admin = admin
            .into_builder()
            .with_prometheus(prom)
            .bind()
            .context("failed to bind the admin server")?;
        let readiness = admin.readiness();
        let _admin = admin.spawn();
        info!(addr = %_admin.local_addr(), "Admin server listening");

        let listener = |addr: SocketAddr| async move {
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))
        };
        tokio::spawn(
            serve(
                "external",
                listener(external_addr).await?,
                external_tls,
                external,
                drain.clone(),
            )
            .instrument(info_span!("external")),
        );
        tokio::spawn(
            serve(
                "internal",
                listener(internal_addr).await?,
                Some(internal_tls),
                internal,
                drain,
            )
            .instrument(info_span!("internal")),
        );
        readiness.set(true);

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if shutdown.signaled().await.is_err() {
            bail!("Aborted");
        }
        stop.cancel();
        let _ = tokio::join!(lease_task, reconcile_task);

        Ok(())
    }
}
