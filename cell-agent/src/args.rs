use crate::{
    admin::Admin,
    Agent, AgentMetrics, ChainSpec, Enforcer, InternalClient, LoggingState, Planner,
    PlannerConfig,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use ipnet::Ipv4Net;
use netpol_cell::{Datastore, FileLock, IpTablesCommand, LockedIpTables};
use netpol_policy_server_core::TagWidth;
use netpol_policy_server_http::serve;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};
use url::Url;

#[derive(Debug, Parser)]
#[clap(
    name = "cell-agent",
    about = "Enforces container network policies on a cell"
)]
pub struct Args {
    #[clap(long, default_value = "netpol=info,warn", env = "NETPOL_CELL_AGENT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    /// Base URL of the policy server's internal API.
    #[clap(long, env = "NETPOL_POLICY_SERVER_URL")]
    policy_server_url: String,

    #[clap(long)]
    client_cert: PathBuf,

    #[clap(long)]
    client_key: PathBuf,

    /// CA that signs the policy server's certificate.
    #[clap(long)]
    server_ca: PathBuf,

    #[clap(long, default_value = "5")]
    request_timeout_secs: u64,

    /// Container records written by the attachment driver.
    #[clap(long, default_value = "/var/vcap/data/container-metadata/store.json")]
    datastore: PathBuf,

    #[clap(long)]
    overlay_network: Ipv4Net,

    /// This cell's slice of the overlay network.
    #[clap(long)]
    local_subnet: Ipv4Net,

    #[clap(long, default_value = "cni0")]
    local_iface: String,

    /// Defaults to `flannel.<vni>`.
    #[clap(long)]
    encap_iface: Option<String>,

    #[clap(long, default_value = "1")]
    vni: u32,

    /// Width of group tags in bytes.
    #[clap(long, default_value = "2")]
    tag_width: TagWidth,

    #[clap(long, default_value = "filter")]
    iptables_table: String,

    #[clap(long, default_value = "FORWARD")]
    iptables_parent_chain: String,

    #[clap(long, default_value = "vpa--")]
    iptables_chain_prefix: String,

    /// Lock shared by every process on the cell that edits the packet filter.
    #[clap(long, default_value = "/var/vcap/data/netpol/iptables.lock")]
    iptables_lock_file: PathBuf,

    #[clap(long, default_value = "iptables")]
    iptables: PathBuf,

    #[clap(long, default_value = "iptables-restore")]
    iptables_restore: PathBuf,

    #[clap(long, default_value = "5")]
    poll_interval_secs: u64,

    #[clap(long, default_value = "127.0.0.1:9091")]
    admin_addr: SocketAddr,

    /// Logs denied packets. May be toggled at runtime via the admin server.
    #[clap(long)]
    iptables_logging: bool,
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
            policy_server_url,
            client_cert,
            client_key,
            server_ca,
            request_timeout_secs,
            datastore,
            overlay_network,
            local_subnet,
            local_iface,
            encap_iface,
            vni,
            tag_width,
            iptables_table,
            iptables_parent_chain,
            iptables_chain_prefix,
            iptables_lock_file,
            iptables,
            iptables_restore,
            poll_interval_secs,
            admin_addr,
            iptables_logging,
        } = self;

        log_format.try_init(log_level)?;
        let (shutdown, drain) = kubert::shutdown::sigint_or_sigterm()?;

        if !overlay_network.contains(&local_subnet) {
            bail!("--local-subnet {local_subnet} is not within --overlay-network {overlay_network}");
        }

        let mut base = Url::parse(&policy_server_url).context("invalid --policy-server-url")?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = InternalClient::mtls_client(
            &client_cert,
            &client_key,
            &server_ca,
            Duration::from_secs(request_timeout_secs),
        )
        .context("invalid client TLS configuration")?;
        let client = InternalClient::new(http, &base)?;

        let mut prom = <Registry>::default();
        let metrics = AgentMetrics::register(prom.sub_registry_with_prefix("agent"));
        let logging = LoggingState::new(iptables_logging);

        let ipt = LockedIpTables::new(
            IpTablesCommand::new(iptables, iptables_restore),
            Arc::new(FileLock::new(iptables_lock_file)),
        );
        let enforcer = Enforcer::new(
            ipt,
            ChainSpec {
                table: iptables_table,
                parent: iptables_parent_chain,
                prefix: iptables_chain_prefix,
            },
        );
        let planner = Planner::new(PlannerConfig {
            overlay_network,
            local_subnet,
            local_iface,
            encap_iface: encap_iface.unwrap_or_else(|| format!("flannel.{vni}")),
            tag_width,
        });
        info!(
            datastore = %datastore.display(),
            %overlay_network,
            %local_subnet,
            "Starting cell agent"
        );

        let stop = CancellationToken::new();
        tokio::spawn({
            let stop = stop.clone();
            let drain = drain.clone();
            async move {
                let _release = drain.signaled().await;
                stop.cancel();
            }
        });

        let agent = Agent::new(
            Datastore::new(datastore),
            client,
            planner,
            enforcer,
            logging.clone(),
            metrics,
        );
        let agent_task = tokio::spawn(
            agent
                .run(Duration::from_secs(poll_interval_secs), stop.clone())
                .instrument(info_span!("agent")),
        );
        let admin = Admin::new(prom, logging);
        let listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind {admin_addr}"))?;
        tokio::spawn(
            serve("admin", listener, None, admin.clone(), drain).instrument(info_span!("admin")),
        );
        admin.set_ready();

        // Block the main thread on the shutdown signal. Once it fires, wait for the poll loop to
        // finish its cycle before exiting.
        if shutdown.signaled().await.is_err() {
            bail!("Aborted");
        }
        stop.cancel();
        let _ = agent_task.await;

        Ok(())
    }
}
