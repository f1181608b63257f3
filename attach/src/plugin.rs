//! Runs the configured CNI plugins against a container's namespace.

use crate::{Error, Result};
use netpol_cell::PortMapping;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

#[async_trait::async_trait]
pub trait PluginChain: Send + Sync {
    async fn add(&self, req: &AddRequest) -> Result<AddResult>;

    async fn del(&self, netns: &Path, handle: &str) -> Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddRequest {
    pub netns: PathBuf,
    pub handle: String,
    pub metadata: BTreeMap<String, Value>,
    pub port_mappings: Vec<PortMapping>,
    pub netout_rules: Vec<Value>,
}

/// The parts of a plugin result the driver consumes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AddResult {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(default)]
    pub dns: Dns,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IpConfig {
    /// Absent in results from plugins speaking version 1.0 and later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// An address in CIDR notation.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Dns {
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub search: Vec<String>,
}

/// The container's address and the name of the interface carrying it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attached {
    pub ip: Ipv4Addr,
    pub interface: Option<String>,
}

/// Executes plugin binaries following the CNI calling convention.
#[derive(Clone, Debug)]
pub struct CniChain {
    plugin_dirs: Vec<PathBuf>,
    networks: Vec<Network>,
}

#[derive(Clone, Debug)]
struct Network {
    name: String,
    plugin: String,
    config: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

#[derive(Copy, Clone, Debug)]
enum Command {
    Add,
    Del,
}

#[async_trait::async_trait]
impl<T: PluginChain + ?Sized> PluginChain for std::sync::Arc<T> {
    async fn add(&self, req: &AddRequest) -> Result<AddResult> {
        (**self).add(req).await
    }

    async fn del(&self, netns: &Path, handle: &str) -> Result<()> {
        (**self).del(netns, handle).await
    }
}

// === impl AddResult ===

impl AddResult {
    /// Selects the first IPv4 configuration and resolves its interface.
    pub fn ipv4(&self) -> Result<Attached> {
        let (ip, config) = self
            .ips
            .iter()
            .filter(|c| c.version.as_deref().map_or(true, |v| v == "4"))
            .find_map(|c| Some((ipv4_of(&c.address)?, c)))
            .ok_or_else(|| Error::NoIPv4Allocated("no IPv4 address in plugin result".into()))?;

        let interface = match config.interface {
            None => None,
            Some(i) => match self.interfaces.get(i) {
                Some(iface) => Some(iface.name.clone()),
                None => {
                    return Err(Error::NoIPv4Allocated(format!(
                        "interface index {i} out of range: result lists {} interfaces",
                        self.interfaces.len()
                    )))
                }
            },
        };
        Ok(Attached { ip, interface })
    }
}

fn ipv4_of(address: &str) -> Option<Ipv4Addr> {
    let addr = address.split('/').next()?;
    addr.parse().ok()
}

// === impl CniChain ===

impl CniChain {
    /// Loads every `*.conf` network in `config_dir`, in file-name order.
    pub fn load(plugin_dirs: Vec<PathBuf>, config_dir: &Path) -> Result<Self> {
        let mut files = std::fs::read_dir(config_dir)
            .map_err(|e| Error::Config(format!("reading {}: {e}", config_dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "conf"))
            .collect::<Vec<_>>();
        files.sort();

        let networks = files
            .iter()
            .map(|path| {
                let bytes = std::fs::read(path)?;
                Network::parse(&bytes)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(networks = networks.len(), "Loaded plugin configuration");
        Ok(Self {
            plugin_dirs,
            networks,
        })
    }

    fn binary(&self, plugin: &str) -> Result<PathBuf> {
        self.plugin_dirs
            .iter()
            .map(|dir| dir.join(plugin))
            .find(|p| p.is_file())
            .ok_or_else(|| Error::plugin(plugin, "binary not found in plugin directories"))
    }

    async fn exec(
        &self,
        network: &Network,
        command: Command,
        netns: &Path,
        handle: &str,
        ifname: &str,
        config: &Value,
    ) -> Result<Vec<u8>> {
        let binary = self.binary(&network.plugin)?;
        let path = std::env::join_paths(&self.plugin_dirs)
            .map_err(|e| Error::Config(format!("invalid plugin directory: {e}")))?;
        let mut child = tokio::process::Command::new(&binary)
            .env("CNI_COMMAND", command.as_str())
            .env("CNI_CONTAINERID", handle)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", ifname)
            .env("CNI_PATH", path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::plugin(&network.plugin, e))?;

        let input = serde_json::to_vec(config).map_err(|e| Error::plugin(&network.plugin, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::plugin(&network.plugin, e))?;
        if !output.status.success() {
            let message = match serde_json::from_slice::<PluginError>(&output.stdout) {
                Ok(e) if !e.details.is_empty() => {
                    format!("{} (code {}): {}", e.msg, e.code, e.details)
                }
                Ok(e) => format!("{} (code {})", e.msg, e.code),
                Err(_) => format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            };
            return Err(Error::plugin(&network.plugin, message));
        }
        Ok(output.stdout)
    }
}

#[async_trait::async_trait]
impl PluginChain for CniChain {
    async fn add(&self, req: &AddRequest) -> Result<AddResult> {
        let mut prev = None::<Value>;
        for (i, network) in self.networks.iter().enumerate() {
            let ifname = format!("eth{i}");
            let config = network.add_config(req, prev.take());
            let stdout = self
                .exec(network, Command::Add, &req.netns, &req.handle, &ifname, &config)
                .await?;
            let result = serde_json::from_slice::<Value>(&stdout)
                .map_err(|e| Error::plugin(&network.plugin, format!("invalid result: {e}")))?;
            info!(handle = %req.handle, network = %network.name, %ifname, "Added network");
            prev = Some(result);
        }

        let result = prev.ok_or_else(|| Error::NoIPv4Allocated("no networks configured".into()))?;
        serde_json::from_value(result)
            .map_err(|e| Error::NoIPv4Allocated(format!("unreadable plugin result: {e}")))
    }

    async fn del(&self, netns: &Path, handle: &str) -> Result<()> {
        let mut failure = None;
        for (i, network) in self.networks.iter().enumerate().rev() {
            let ifname = format!("eth{i}");
            let config = Value::Object(network.config.clone());
            match self
                .exec(network, Command::Del, netns, handle, &ifname, &config)
                .await
            {
                Ok(_) => info!(%handle, network = %network.name, "Deleted network"),
                Err(error) => {
                    tracing::warn!(%handle, network = %network.name, %error, "Delete failed");
                    if failure.is_none() {
                        failure = Some(error);
                    }
                }
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// === impl Network ===

impl Network {
    fn parse(bytes: &[u8]) -> std::result::Result<Self, String> {
        let config = match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(config)) => config,
            Ok(_) => return Err("expected a JSON object".into()),
            Err(e) => return Err(e.to_string()),
        };
        let plugin = match config.get("type") {
            Some(Value::String(t)) if !t.is_empty() && !t.contains('/') => t.clone(),
            _ => return Err("missing plugin type".into()),
        };
        let name = match config.get("name") {
            Some(Value::String(n)) => n.clone(),
            _ => plugin.clone(),
        };
        Ok(Self {
            name,
            plugin,
            config,
        })
    }

    fn add_config(&self, req: &AddRequest, prev: Option<Value>) -> Value {
        let mut config = self.config.clone();
        config.insert(
            "runtimeConfig".into(),
            json!({
                "portMappings": req.port_mappings,
                "netOutRules": req.netout_rules,
            }),
        );
        config.insert("metadata".into(), json!(req.metadata));
        if let Some(prev) = prev {
            config.insert("prevResult".into(), prev);
        }
        Value::Object(config)
    }
}

// === impl Command ===

impl Command {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
        }
    }
}

#[cfg(all(test, unix))]
mod tests;
