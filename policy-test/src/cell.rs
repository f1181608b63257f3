use crate::{
    filter::{self, Packet, Trace},
    PolicyServer,
};
use netpol_cell::{
    datastore::GROUP_KEY, iptables::fake::FakeIpTables, Container, Datastore, Rule,
};
use netpol_cell_agent::{
    agent::PollError, Agent, AgentMetrics, ChainSpec, Enforcer, InternalClient, LoggingState,
    Planner, PlannerConfig,
};
use netpol_policy_server_core::TagWidth;
use std::{net::Ipv4Addr, path::Path, sync::Arc};

pub const OVERLAY: &str = "10.255.0.0/16";
pub const LOCAL_IFACE: &str = "cni0";
pub const ENCAP_IFACE: &str = "flannel.1";

const TABLE: &str = "filter";
const PARENT: &str = "FORWARD";

/// A cell whose agent polls a [`PolicyServer`] and enforces into a fake
/// packet filter.
pub struct Cell {
    pub datastore: Datastore,
    pub iptables: Arc<FakeIpTables>,
    pub logging: LoggingState,
    agent: Agent<InternalClient, Arc<FakeIpTables>>,
    _dir: tempfile::TempDir,
}

// === impl Cell ===

impl Cell {
    /// Creates a cell owning `local_subnet` of the overlay.
    pub fn new(server: &PolicyServer, local_subnet: &str) -> Self {
        let dir = tempfile::tempdir().expect("must create a temporary directory");
        let datastore = Datastore::new(dir.path().join("store.json"));
        let iptables = Arc::new(FakeIpTables::with_builtin([(TABLE, PARENT)]));
        let logging = LoggingState::default();
        let client = InternalClient::new(reqwest::Client::new(), &server.internal)
            .expect("internal URL must be valid");
        let planner = Planner::new(PlannerConfig {
            overlay_network: OVERLAY.parse().expect("overlay must parse"),
            local_subnet: local_subnet.parse().expect("subnet must parse"),
            local_iface: LOCAL_IFACE.to_string(),
            encap_iface: ENCAP_IFACE.to_string(),
            tag_width: TagWidth::default(),
        });
        let enforcer = Enforcer::with_clock(
            iptables.clone(),
            ChainSpec {
                table: TABLE.to_string(),
                parent: PARENT.to_string(),
                prefix: "vpa--".to_string(),
            },
            Arc::new(|| 1_000),
        );
        let agent = Agent::new(
            datastore.clone(),
            client,
            planner,
            enforcer,
            logging.clone(),
            AgentMetrics::default(),
        );
        Self {
            datastore,
            iptables,
            logging,
            agent,
            _dir: dir,
        }
    }

    pub fn datastore_path(&self) -> &Path {
        self.datastore.path()
    }

    /// Records a container of `group` as attached to this cell.
    pub fn add_container(&self, handle: &str, ip: [u8; 4], group: &str) {
        let metadata = maplit::btreemap! {
            GROUP_KEY.to_string() => serde_json::json!(group),
        };
        self.datastore
            .add(Container::new(
                handle,
                Ipv4Addr::from(ip),
                format!("/var/run/netns/{handle}"),
                vec![],
                metadata,
            ))
            .expect("datastore must accept the container");
    }

    pub fn remove(&self, handle: &str) {
        self.datastore
            .remove(handle)
            .expect("datastore must remove the container");
    }

    pub async fn poll(&mut self) -> Result<Option<String>, PollError> {
        self.agent.poll().await
    }

    /// The rules of the policy chain currently attached to the parent.
    pub fn policy_rules(&self) -> Vec<Rule> {
        let parent = self
            .iptables
            .rules(TABLE, PARENT)
            .expect("parent chain must exist");
        let chain = parent
            .first()
            .and_then(Rule::target)
            .expect("a policy chain must be attached");
        self.iptables
            .rules(TABLE, chain)
            .expect("attached chain must exist")
    }

    /// Passes `packet` through the forward path.
    pub fn forward(&self, packet: &Packet) -> Trace {
        filter::traverse(&self.iptables, TABLE, PARENT, packet)
    }
}
