use crate::{Config, Result};
use ipnet::Ipv4Net;
use netpol_cell::{FileLock, IpTables, IpTablesCommand, LockedIpTables, Rule};
use std::{path::Path, sync::Arc};
use tracing::debug;

const TABLE: &str = "nat";
const COMMENT: &str = "sidecar-redirect";

/// Installs rules inside a container's namespace.
#[async_trait::async_trait]
pub trait Redirect: Send + Sync {
    async fn apply(&self, netns: &Path) -> Result<()>;
}

#[async_trait::async_trait]
impl<T: Redirect + ?Sized> Redirect for Arc<T> {
    async fn apply(&self, netns: &Path) -> Result<()> {
        (**self).apply(netns).await
    }
}

/// Sends a container's TCP traffic through its sidecar proxy.
#[derive(Clone, Debug)]
pub struct SidecarRedirect {
    egress: Option<Ipv4Net>,
    ingress: bool,
    port: u16,
    uid: Option<u32>,
    lock: Arc<FileLock>,
}

// === impl SidecarRedirect ===

impl SidecarRedirect {
    pub fn from_config(config: &Config) -> Self {
        Self {
            egress: config.proxy_redirect_cidr,
            ingress: config.enable_ingress_proxy_redirect,
            port: config.proxy_port,
            uid: config.proxy_uid,
            lock: Arc::new(FileLock::new(&config.iptables_lock_file)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.egress.is_some() || self.ingress
    }

    fn rules(&self) -> Vec<(&'static str, Rule)> {
        let to_port = self.port.to_string();
        let mut rules = Vec::with_capacity(2);
        if let Some(cidr) = self.egress {
            let mut rule = Rule::new(["-d".to_string(), cidr.to_string()]).args_from(["-p", "tcp"]);
            if let Some(uid) = self.uid {
                rule = rule
                    .args_from(["-m", "owner", "!", "--uid-owner"])
                    .arg(uid.to_string());
            }
            rules.push((
                "OUTPUT",
                rule.comment(COMMENT)
                    .jump("REDIRECT")
                    .args_from(["--to-ports", to_port.as_str()]),
            ));
        }
        if self.ingress {
            rules.push((
                "PREROUTING",
                Rule::new(["-p", "tcp"])
                    .comment(COMMENT)
                    .jump("REDIRECT")
                    .args_from(["--to-ports", to_port.as_str()]),
            ));
        }
        rules
    }

    /// Appends any redirect rule the namespace does not already have.
    pub async fn apply_with<T: IpTables>(&self, ipt: &T) -> Result<()> {
        for (chain, rule) in self.rules() {
            if ipt.list(TABLE, chain).await?.contains(&rule) {
                debug!(%chain, %rule, "Redirect already installed");
                continue;
            }
            ipt.append_all(TABLE, chain, std::slice::from_ref(&rule))
                .await?;
            debug!(%chain, %rule, "Installed redirect");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Redirect for SidecarRedirect {
    async fn apply(&self, netns: &Path) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let ipt = LockedIpTables::new(IpTablesCommand::default().in_netns(netns), self.lock.clone());
        self.apply_with(&ipt).await
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    #[derive(Debug, Default)]
    pub struct FakeRedirect {
        applied: Mutex<Vec<PathBuf>>,
        fail: Mutex<bool>,
    }

    impl FakeRedirect {
        pub fn applied(&self) -> Vec<PathBuf> {
            self.applied.lock().clone()
        }

        pub fn fail(&self, fail: bool) {
            *self.fail.lock() = fail;
        }
    }

    #[async_trait::async_trait]
    impl Redirect for FakeRedirect {
        async fn apply(&self, netns: &Path) -> Result<()> {
            if *self.fail.lock() {
                return Err(netpol_cell::Error::Command {
                    command: "iptables".to_string(),
                    status: "exit status: 4".to_string(),
                    stderr: "injected failure".to_string(),
                }
                .into());
            }
            self.applied.lock().push(netns.to_path_buf());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpol_cell::iptables::fake::FakeIpTables;
    use pretty_assertions::assert_eq;

    fn redirect(egress: Option<&str>, ingress: bool, uid: Option<u32>) -> SidecarRedirect {
        SidecarRedirect {
            egress: egress.map(|c| c.parse().unwrap()),
            ingress,
            port: 15001,
            uid,
            lock: Arc::new(FileLock::new("/unused.lock")),
        }
    }

    fn rendered(ipt: &FakeIpTables, chain: &str) -> Vec<String> {
        ipt.rules(TABLE, chain)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[tokio::test]
    async fn installs_rules_once() {
        let ipt = FakeIpTables::with_builtin([(TABLE, "OUTPUT"), (TABLE, "PREROUTING")]);
        let redirect = redirect(Some("10.255.0.0/16"), true, Some(1000));

        redirect.apply_with(&ipt).await.unwrap();
        redirect.apply_with(&ipt).await.unwrap();

        assert_eq!(
            rendered(&ipt, "OUTPUT"),
            vec![
                "-d 10.255.0.0/16 -p tcp -m owner ! --uid-owner 1000 -m comment --comment sidecar-redirect -j REDIRECT --to-ports 15001"
            ]
        );
        assert_eq!(
            rendered(&ipt, "PREROUTING"),
            vec!["-p tcp -m comment --comment sidecar-redirect -j REDIRECT --to-ports 15001"]
        );
    }

    #[tokio::test]
    async fn ingress_only() {
        let ipt = FakeIpTables::with_builtin([(TABLE, "OUTPUT"), (TABLE, "PREROUTING")]);
        redirect(None, true, None).apply_with(&ipt).await.unwrap();
        assert_eq!(rendered(&ipt, "OUTPUT"), Vec::<String>::new());
        assert_eq!(rendered(&ipt, "PREROUTING").len(), 1);
    }

    #[tokio::test]
    async fn disabled_redirect_touches_nothing() {
        let redirect = redirect(None, false, None);
        assert!(!redirect.is_enabled());
        redirect
            .apply(Path::new("/var/vcap/data/netns/none"))
            .await
            .unwrap();
    }
}
