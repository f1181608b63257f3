use crate::{
    metrics::{AgentMetrics, Outcome},
    Enforcer, LoggingState, Planner, PolicySource,
};
use netpol_cell::{canonical, Datastore, IpTables};
use netpol_policy_server_core::UpstreamError;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polls for policies and keeps the packet filter in sync with them.
pub struct Agent<P, T> {
    datastore: Datastore,
    source: P,
    planner: Planner,
    enforcer: Enforcer<T>,
    logging: LoggingState,
    metrics: AgentMetrics,
    applied: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("failed to read containers: {0}")]
    Datastore(#[source] netpol_cell::Error),

    #[error("failed to fetch policies: {0}")]
    Policies(#[from] UpstreamError),

    #[error("failed to enforce policies: {0}")]
    Enforce(#[source] netpol_cell::Error),
}

// === impl Agent ===

impl<P: PolicySource, T: IpTables> Agent<P, T> {
    pub fn new(
        datastore: Datastore,
        source: P,
        planner: Planner,
        enforcer: Enforcer<T>,
        logging: LoggingState,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            datastore,
            source,
            planner,
            enforcer,
            logging,
            metrics,
            applied: None,
        }
    }

    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Stopping");
                    return;
                }
                _ = timer.tick() => {}
            }

            let outcome = match self.poll().await {
                Ok(Some(_)) => Outcome::Enforced,
                Ok(None) => Outcome::Unchanged,
                Err(error @ PollError::Enforce(_)) => {
                    warn!(%error, "Poll failed");
                    Outcome::EnforceError
                }
                Err(error) => {
                    warn!(%error, "Poll failed");
                    Outcome::PollError
                }
            };
            self.metrics.cycle(outcome);
        }
    }

    /// Runs one cycle. Returns the name of the newly attached chain, or
    /// `None` when the planned rules match the ones already in place.
    pub async fn poll(&mut self) -> Result<Option<String>, PollError> {
        let datastore = self.datastore.clone();
        let containers = tokio::task::spawn_blocking(move || datastore.read_all())
            .await
            .map_err(|e| PollError::Datastore(std::io::Error::other(e).into()))?
            .map_err(PollError::Datastore)?;

        let groups = Planner::local_groups(containers.values());
        let policies = self.source.policies(&groups).await?;
        let rules = self
            .planner
            .plan(containers.values(), &policies, self.logging.enabled());

        let ruleset = canonical(&rules);
        if self.applied.as_deref() == Some(ruleset.as_str()) {
            debug!(rules = rules.len(), "Rules unchanged");
            return Ok(None);
        }

        match self.enforcer.enforce(&rules).await {
            Ok(chain) => {
                info!(
                    %chain,
                    containers = containers.len(),
                    policies = policies.len(),
                    rules = rules.len(),
                    "Enforced policies"
                );
                self.metrics.enforced(rules.len());
                self.applied = Some(ruleset);
                Ok(Some(chain))
            }
            Err(error) => {
                self.applied = None;
                Err(PollError::Enforce(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{enforcer::ChainSpec, PlannerConfig};
    use netpol_cell::{iptables::fake::FakeIpTables, Container};
    use netpol_policy_server_core::{Policy, PortRange, Protocol, Tag, TagWidth, TaggedPolicy};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::{
        net::Ipv4Addr,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    };

    #[derive(Default)]
    struct FakeSource {
        policies: Mutex<Vec<TaggedPolicy>>,
        requests: Mutex<Vec<Vec<String>>>,
        unavailable: Mutex<bool>,
    }

    #[async_trait::async_trait]
    impl PolicySource for Arc<FakeSource> {
        async fn policies(&self, keys: &[String]) -> Result<Vec<TaggedPolicy>, UpstreamError> {
            self.requests.lock().push(keys.to_vec());
            if *self.unavailable.lock() {
                return Err(UpstreamError::retryable(
                    "policy-server",
                    "connection refused",
                ));
            }
            Ok(self
                .policies
                .lock()
                .iter()
                .filter(|p| keys.iter().any(|k| p.policy.involves(k)))
                .cloned()
                .collect())
        }
    }

    fn a_to_b() -> TaggedPolicy {
        let ports = PortRange::single(8080).unwrap();
        TaggedPolicy {
            policy: Policy::new("app-a", "app-b", Protocol::Tcp, ports).unwrap(),
            source_tag: Tag::new(1).unwrap(),
            destination_tag: Tag::new(2).unwrap(),
        }
    }

    struct Fixture {
        agent: Agent<Arc<FakeSource>, Arc<FakeIpTables>>,
        source: Arc<FakeSource>,
        ipt: Arc<FakeIpTables>,
        logging: LoggingState,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Datastore::new(dir.path().join("containers.json"));
        let containers = [
            ("a", [10, 255, 1, 2], "app-a"),
            ("b", [10, 255, 1, 3], "app-b"),
        ];
        for (handle, ip, group) in containers {
            let metadata = maplit::btreemap! {
                "policy_group_id".to_string() => serde_json::json!(group),
            };
            datastore
                .add(Container::new(handle, Ipv4Addr::from(ip), "/ns", vec![], metadata))
                .unwrap();
        }

        let source = Arc::new(FakeSource::default());
        source.policies.lock().push(a_to_b());
        let ipt = Arc::new(FakeIpTables::with_builtin([("filter", "FORWARD")]));
        let logging = LoggingState::default();
        let clock = Arc::new(AtomicU64::new(1000));
        let planner = Planner::new(PlannerConfig {
            overlay_network: "10.255.0.0/16".parse().unwrap(),
            local_subnet: "10.255.1.0/24".parse().unwrap(),
            local_iface: "cni0".to_string(),
            encap_iface: "flannel.1".to_string(),
            tag_width: TagWidth::default(),
        });
        let enforcer = Enforcer::with_clock(
            ipt.clone(),
            ChainSpec {
                table: "filter".to_string(),
                parent: "FORWARD".to_string(),
                prefix: "vpa--".to_string(),
            },
            Arc::new(move || clock.load(Ordering::SeqCst)),
        );
        let agent = Agent::new(
            datastore,
            source.clone(),
            planner,
            enforcer,
            logging.clone(),
            AgentMetrics::default(),
        );
        Fixture {
            agent,
            source,
            ipt,
            logging,
            _dir: dir,
        }
    }

    fn attached(ipt: &FakeIpTables) -> Vec<String> {
        let parent = ipt.rules("filter", "FORWARD").unwrap();
        let chain = parent[0].target().unwrap().to_string();
        ipt.rules("filter", &chain)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[tokio::test]
    async fn enforces_only_when_rules_change() {
        let Fixture {
            mut agent,
            source,
            ipt,
            logging,
            _dir,
        } = fixture();

        assert_eq!(agent.poll().await.unwrap().as_deref(), Some("vpa--1000"));
        assert_eq!(
            source.requests.lock().clone(),
            vec![vec!["app-a".to_string(), "app-b".to_string()]]
        );
        assert!(attached(&ipt)
            .iter()
            .any(|r| r.contains("--set-xmark 0x0001/0xffff")));

        assert_eq!(agent.poll().await.unwrap(), None);

        logging.set(true);
        assert_eq!(agent.poll().await.unwrap().as_deref(), Some("vpa--1001"));
        assert!(attached(&ipt).iter().any(|r| r.contains("-j LOG")));
        assert_eq!(
            ipt.list_chains("filter").await.unwrap(),
            vec!["vpa--1001".to_string()]
        );
    }

    #[tokio::test]
    async fn removed_policies_are_withdrawn() {
        let Fixture {
            mut agent,
            source,
            ipt,
            _dir,
            ..
        } = fixture();

        agent.poll().await.unwrap();
        source.policies.lock().clear();
        agent.poll().await.unwrap();

        let rules = attached(&ipt);
        assert!(rules.iter().all(|r| !r.contains("app-a")), "{rules:#?}");
        assert_eq!(rules.len(), 3);
    }

    #[tokio::test]
    async fn failures_are_retried() {
        let Fixture {
            mut agent,
            source,
            ipt,
            _dir,
            ..
        } = fixture();

        *source.unavailable.lock() = true;
        assert!(matches!(agent.poll().await, Err(PollError::Policies(_))));
        assert_eq!(ipt.rules("filter", "FORWARD"), Some(vec![]));
        *source.unavailable.lock() = false;

        ipt.fail_on("insert", "FORWARD");
        assert!(matches!(agent.poll().await, Err(PollError::Enforce(_))));
        ipt.clear_failures();
        assert!(agent.poll().await.unwrap().is_some());
    }
}
