//! Host-side plumbing shared by the cell agent and the attachment driver:
//! packet-filter rules and commands, the host-wide lock that serializes
//! them, and the record of containers attached to this cell.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod datastore;
mod error;
pub mod flock;
pub mod iptables;
mod rule;

pub use self::{
    datastore::{Container, Datastore, PortMapping},
    error::{Error, Result},
    flock::FileLock,
    iptables::{IpTables, IpTablesCommand, LockedIpTables},
    rule::{canonical, Rule},
};
