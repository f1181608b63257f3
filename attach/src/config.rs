use crate::{Error, Result};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// The driver's configuration file.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Directories searched, in order, for plugin binaries.
    pub cni_plugin_dir: PathBuf,

    /// Holds one `*.conf` file per network, applied in file-name order.
    pub cni_config_dir: PathBuf,

    /// Namespace files are bind-mounted here, one per container handle.
    pub bind_mount_dir: PathBuf,

    /// The port pool.
    pub state_file: PathBuf,

    pub start_port: u16,

    pub total_ports: u16,

    /// Records attached containers for the cell agent.
    #[serde(default)]
    pub datastore: Option<PathBuf>,

    pub iptables_lock_file: PathBuf,

    /// Egress to this network is redirected to the sidecar proxy.
    #[serde(default)]
    pub proxy_redirect_cidr: Option<Ipv4Net>,

    #[serde(default)]
    pub enable_ingress_proxy_redirect: bool,

    #[serde(default)]
    pub proxy_port: u16,

    /// Traffic from this user is exempt from egress redirection so the
    /// proxy's own connections are not looped back to it.
    #[serde(default)]
    pub proxy_uid: Option<u32>,

    #[serde(default)]
    pub dns_servers: Vec<String>,

    #[serde(default)]
    pub search_domains: Vec<String>,
}

// === impl Config ===

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let config = serde_json::from_slice::<Self>(bytes)
            .map_err(|e| Error::Config(format!("parsing config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.total_ports == 0 {
            return Err(Error::Config("total_ports must be positive".into()));
        }
        if self.start_port == 0
            || u32::from(self.start_port) + u32::from(self.total_ports) > 65536
        {
            return Err(Error::Config(format!(
                "port pool {}+{} does not fit in the port space",
                self.start_port, self.total_ports
            )));
        }
        if self.redirects() && self.proxy_port == 0 {
            return Err(Error::Config(
                "proxy_port is required when proxy redirection is enabled".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn redirects(&self) -> bool {
        self.proxy_redirect_cidr.is_some() || self.enable_ingress_proxy_redirect
    }
}
