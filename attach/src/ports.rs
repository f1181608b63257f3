//! Reserves host ports for container ingress mappings.
//!
//! The pool file lists every reserved port; a sibling `.handles` file records
//! which container holds each one. Both are read and rewritten under a single
//! exclusive lock, so concurrent driver invocations on a cell never hand out
//! the same port.

use crate::{Error, Result};
use netpol_cell::{datastore::write_atomic, flock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    ffi::OsString,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct PortAllocator {
    start: u16,
    capacity: u16,
    pool: PathBuf,
    handles: PathBuf,
    lock: PathBuf,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct Pool {
    #[serde(default)]
    acquired_ports: BTreeSet<u16>,
}

type Handles = BTreeMap<String, BTreeSet<u16>>;

// === impl PortAllocator ===

impl PortAllocator {
    pub fn new(start: u16, capacity: u16, pool: impl Into<PathBuf>) -> Self {
        let pool = pool.into();
        Self {
            start,
            capacity,
            handles: sibling(&pool, ".handles"),
            lock: sibling(&pool, ".lock"),
            pool,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        let port = u32::from(port);
        let start = u32::from(self.start);
        port >= start && port < start + u32::from(self.capacity)
    }

    /// Reserves the lowest free port in the pool for `handle`.
    pub fn acquire(&self, handle: &str) -> Result<u16> {
        flock::with_exclusive(&self.lock, || {
            let mut pool = read_or_default::<Pool>(&self.pool)?;
            let mut handles = read_or_default::<Handles>(&self.handles)?;

            let port = (0..self.capacity)
                .filter_map(|offset| self.start.checked_add(offset))
                .find(|port| !pool.acquired_ports.contains(port))
                .ok_or(Error::PoolExhausted {
                    start: self.start,
                    capacity: self.capacity,
                })?;

            pool.acquired_ports.insert(port);
            handles.entry(handle.to_string()).or_default().insert(port);
            write_atomic(&self.pool, &pool)?;
            write_atomic(&self.handles, &handles)?;
            debug!(%handle, port, "Acquired port");
            Ok(port)
        })
    }

    /// Returns every port held by `handle` to the pool.
    pub fn release_all(&self, handle: &str) -> Result<Vec<u16>> {
        self.release_where(handle, |_| true)
    }

    /// Returns those of `ports` held by `handle` to the pool, leaving its
    /// other reservations in place.
    pub fn release(&self, handle: &str, ports: &[u16]) -> Result<Vec<u16>> {
        self.release_where(handle, |port| ports.contains(&port))
    }

    fn release_where(&self, handle: &str, selected: impl Fn(u16) -> bool) -> Result<Vec<u16>> {
        flock::with_exclusive(&self.lock, || {
            let mut handles = read_or_default::<Handles>(&self.handles)?;
            let held = match handles.get_mut(handle) {
                Some(held) => held,
                None => return Ok(Vec::new()),
            };
            let freed = held
                .iter()
                .copied()
                .filter(|port| selected(*port))
                .collect::<Vec<_>>();
            held.retain(|port| !selected(*port));
            if held.is_empty() {
                handles.remove(handle);
            }

            let mut pool = read_or_default::<Pool>(&self.pool)?;
            let mut released = Vec::with_capacity(freed.len());
            for port in freed {
                if !self.contains(port) {
                    warn!(%handle, port, "Ignoring reserved port outside the pool");
                    continue;
                }
                if !pool.acquired_ports.remove(&port) {
                    warn!(%handle, port, "Port was already released");
                    continue;
                }
                released.push(port);
            }

            write_atomic(&self.pool, &pool)?;
            write_atomic(&self.handles, &handles)?;
            debug!(%handle, ports = ?released, "Released ports");
            Ok(released)
        })
    }

    /// Lists every reserved port in ascending order.
    pub fn acquired(&self) -> Result<Vec<u16>> {
        flock::with_exclusive(&self.lock, || {
            let pool = read_or_default::<Pool>(&self.pool)?;
            Ok(pool.acquired_ports.into_iter().collect())
        })
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    name.into()
}

fn read_or_default<T: Default + DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|source| {
        Error::Cell(netpol_cell::Error::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    })
}
