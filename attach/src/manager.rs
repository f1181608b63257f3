//! Attaches containers to the network and detaches them again.

use crate::{
    mount::Mounter,
    plugin::{AddRequest, PluginChain},
    ports::PortAllocator,
    redirect::Redirect,
    Error, Result,
};
use netpol_cell::{Container, Datastore, PortMapping};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Reported to the runtime in place of a host address.
const HOST_IP: &str = "255.255.255.255";

pub struct Manager<M, P, R> {
    mounter: M,
    plugins: P,
    redirect: R,
    ports: PortAllocator,
    datastore: Option<Datastore>,
    bind_mount_dir: PathBuf,
    dns_servers: Vec<String>,
    search_domains: Vec<String>,
}

/// The runtime's description of a container being created.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpInputs {
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub netin: Vec<NetIn>,
    #[serde(default)]
    pub netout_rules: Vec<Value>,
}

#[derive(Copy, Clone, Debug, Default, Deserialize)]
pub struct NetIn {
    /// Zero requests a port from the pool.
    #[serde(default)]
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UpOutputs {
    pub properties: Properties,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_domains: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Properties {
    #[serde(rename = "garden.network.container-ip")]
    pub container_ip: String,
    #[serde(rename = "garden.network.host-ip")]
    pub host_ip: String,
    /// JSON-encoded list of port mappings.
    #[serde(rename = "garden.network.mapped-ports")]
    pub mapped_ports: String,
    #[serde(
        rename = "garden.network.interface",
        skip_serializing_if = "String::is_empty"
    )]
    pub interface: String,
}

/// Steps of a partial `up` that are reverted if a later step fails.
#[derive(Debug)]
enum Undo {
    Unmount(PathBuf),
    ReleasePorts(Vec<u16>),
    PluginDel(PathBuf),
}

// === impl Manager ===

impl<M: Mounter, P: PluginChain, R: Redirect> Manager<M, P, R> {
    pub fn new(mounter: M, plugins: P, redirect: R, ports: PortAllocator) -> Self {
        Self {
            mounter,
            plugins,
            redirect,
            ports,
            datastore: None,
            bind_mount_dir: PathBuf::from("/var/vcap/data/netns"),
            dns_servers: Vec::new(),
            search_domains: Vec::new(),
        }
    }

    pub fn with_datastore(mut self, datastore: Datastore) -> Self {
        self.datastore = Some(datastore);
        self
    }

    pub fn with_bind_mount_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bind_mount_dir = dir.into();
        self
    }

    /// DNS servers handed to containers instead of those the plugins report.
    pub fn with_dns_servers(mut self, servers: Vec<String>) -> Self {
        self.dns_servers = servers;
        self
    }

    pub fn with_search_domains(mut self, domains: Vec<String>) -> Self {
        self.search_domains = domains;
        self
    }

    pub fn bind_mount_path(&self, handle: &str) -> Result<PathBuf> {
        validate_handle(handle)?;
        Ok(self.bind_mount_dir.join(handle))
    }

    pub async fn up(&self, handle: &str, inputs: UpInputs) -> Result<UpOutputs> {
        let netns = self.bind_mount_path(handle)?;
        let mut undo = Vec::new();
        match self.try_up(handle, &netns, inputs, &mut undo).await {
            Ok(outputs) => Ok(outputs),
            Err(error) => {
                warn!(%handle, %error, "Attach failed; reverting");
                self.revert(handle, undo).await;
                Err(error)
            }
        }
    }

    async fn try_up(
        &self,
        handle: &str,
        netns: &Path,
        inputs: UpInputs,
        undo: &mut Vec<Undo>,
    ) -> Result<UpOutputs> {
        let source = namespace_source(inputs.pid);
        if self.mounter.mount(&source, netns)? {
            undo.push(Undo::Unmount(netns.to_path_buf()));
            debug!(%handle, source = %source.display(), netns = %netns.display(), "Mounted namespace");
        } else {
            debug!(%handle, netns = %netns.display(), "Namespace already mounted");
        }

        let mut port_mappings = Vec::with_capacity(inputs.netin.len());
        for netin in &inputs.netin {
            let host_port = match netin.host_port {
                0 => {
                    let port = self.ports.acquire(handle)?;
                    match undo.last_mut() {
                        Some(Undo::ReleasePorts(ports)) => ports.push(port),
                        _ => undo.push(Undo::ReleasePorts(vec![port])),
                    }
                    port
                }
                port => port,
            };
            port_mappings.push(PortMapping {
                host_port,
                container_port: netin.container_port,
            });
        }

        let req = AddRequest {
            netns: netns.to_path_buf(),
            handle: handle.to_string(),
            metadata: inputs.properties,
            port_mappings,
            netout_rules: inputs.netout_rules,
        };
        let result = self.plugins.add(&req).await?;
        undo.push(Undo::PluginDel(netns.to_path_buf()));

        let attached = result.ipv4()?;
        self.redirect.apply(netns).await?;

        let AddRequest {
            metadata,
            port_mappings,
            ..
        } = req;
        if let Some(datastore) = &self.datastore {
            datastore.add(Container::new(
                handle,
                attached.ip,
                netns,
                port_mappings.clone(),
                metadata,
            ))?;
        }

        let dns_servers = if self.dns_servers.is_empty() {
            result.dns.nameservers
        } else {
            self.dns_servers.clone()
        };
        info!(%handle, ip = %attached.ip, ports = port_mappings.len(), "Attached container");
        Ok(UpOutputs {
            properties: Properties {
                container_ip: attached.ip.to_string(),
                host_ip: HOST_IP.to_string(),
                mapped_ports: serde_json::to_string(&port_mappings)
                    .map_err(|e| Error::Io(e.into()))?,
                interface: attached.interface.unwrap_or_default(),
            },
            dns_servers,
            search_domains: self.search_domains.clone(),
        })
    }

    async fn revert(&self, handle: &str, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let result = match &step {
                Undo::PluginDel(netns) => self.plugins.del(netns, handle).await,
                Undo::ReleasePorts(ports) => self.ports.release(handle, ports).map(|_| ()),
                Undo::Unmount(netns) => self.mounter.unmount(netns),
            };
            if let Err(error) = result {
                warn!(%handle, ?step, %error, "Failed to revert");
            }
        }
    }

    /// Detaches `handle`. Plugin failures are returned; later cleanup
    /// failures are logged so that a retry can finish the job.
    pub async fn down(&self, handle: &str) -> Result<()> {
        let netns = self.bind_mount_path(handle)?;

        // Plugins tear down host-side state even when the namespace is gone.
        self.plugins.del(&netns, handle).await?;

        if let Err(error) = self.mounter.unmount(&netns) {
            warn!(%handle, %error, "Failed to remove bind mount");
        }
        match self.ports.release_all(handle) {
            Ok(ports) if !ports.is_empty() => debug!(%handle, ?ports, "Released ports"),
            Ok(_) => {}
            Err(error) => warn!(%handle, %error, "Failed to release ports"),
        }
        if let Some(datastore) = &self.datastore {
            if let Err(error) = datastore.remove(handle) {
                warn!(%handle, %error, "Failed to remove container record");
            }
        }
        info!(%handle, "Detached container");
        Ok(())
    }
}

/// The namespace of the container's init process. A zero pid means the
/// runtime passed the namespace as descriptor 3.
fn namespace_source(pid: u32) -> PathBuf {
    match pid {
        0 => PathBuf::from("/proc/self/fd/3"),
        pid => PathBuf::from(format!("/proc/{pid}/ns/net")),
    }
}

/// Handles name files under the bind-mount directory.
fn validate_handle(handle: &str) -> Result<()> {
    if handle.is_empty() || handle == "." || handle == ".." || handle.contains(['/', '\0']) {
        return Err(Error::Config(format!("invalid container handle {handle:?}")));
    }
    Ok(())
}
