//! The record of containers attached to this cell.
//!
//! The attachment driver adds and removes entries; the cell agent reads the
//! whole file each poll. All access holds an exclusive lock on a sibling
//! `.lock` file, and writes replace the file atomically so readers never see
//! a partial document.

use crate::{flock, Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::Write,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub handle: String,
    pub ip: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    #[serde(default)]
    pub netns: PathBuf,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Clone, Debug)]
pub struct Datastore {
    path: PathBuf,
    lock: PathBuf,
}

/// The metadata key naming a container's policy group.
pub const GROUP_KEY: &str = "policy_group_id";

// === impl Container ===

impl Container {
    /// Builds a record, taking the group key from `metadata`.
    pub fn new(
        handle: impl Into<String>,
        ip: Ipv4Addr,
        netns: impl Into<PathBuf>,
        ports: Vec<PortMapping>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let group_key = metadata
            .get(GROUP_KEY)
            .and_then(|v| v.as_str())
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        Self {
            handle: handle.into(),
            ip,
            group_key,
            netns: netns.into(),
            ports,
            metadata,
        }
    }
}

// === impl Datastore ===

impl Datastore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock = path.clone().into_os_string();
        lock.push(".lock");
        Self {
            path,
            lock: lock.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records `container`, replacing any entry with the same handle.
    pub fn add(&self, container: Container) -> Result<()> {
        flock::with_exclusive(&self.lock, || {
            let mut all = self.load()?;
            tracing::debug!(handle = %container.handle, ip = %container.ip, "Recording container");
            all.insert(container.handle.clone(), container);
            self.store(&all)
        })
    }

    /// Removes the entry for `handle`, returning it if it existed.
    pub fn remove(&self, handle: &str) -> Result<Option<Container>> {
        flock::with_exclusive(&self.lock, || {
            let mut all = self.load()?;
            let removed = all.remove(handle);
            if removed.is_some() {
                self.store(&all)?;
            }
            Ok(removed)
        })
    }

    pub fn read_all(&self) -> Result<BTreeMap<String, Container>> {
        flock::with_exclusive(&self.lock, || self.load())
    }

    fn load(&self) -> Result<BTreeMap<String, Container>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&bytes).map_err(|source| Error::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, all: &BTreeMap<String, Container>) -> Result<()> {
        write_atomic(&self.path, all)
    }
}

/// Serializes `value` to a temporary file beside `path` and renames it into
/// place.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, value).map_err(|source| Error::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
